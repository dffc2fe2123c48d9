pub mod cache;
pub mod config;
pub mod error;
pub mod io;
pub mod retry;
pub mod state;
