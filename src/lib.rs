pub mod api;
pub mod billing;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod providers;
pub mod storage;
pub mod text;
pub mod tools;
pub mod types;

pub use config::Config;
pub use types::*;
