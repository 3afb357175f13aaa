// Core modules
pub mod api;
pub mod cache;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod serving;
pub mod stop;
pub mod training;

// Re-export commonly used types
pub use error::Error;
pub use models::*;
pub use stop::StopSignal;

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
