// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::{load_config, TradingConfig, TradingMode};
pub use error::BotError;
pub use models::*;
pub use pipeline::{CycleOutcome, Pipeline};

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
