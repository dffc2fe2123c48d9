pub mod assembly;
pub mod captions;
pub mod embedding;
pub mod llm;
pub mod memory;
pub mod rewrite;
pub mod script;
pub mod synthesis;
pub mod transcribe;
pub mod tts;
pub mod voice;
pub mod workflow;
