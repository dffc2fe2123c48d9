pub mod audio;
pub mod srt;
