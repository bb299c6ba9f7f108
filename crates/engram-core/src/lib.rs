//! engram-core - Storage layer for the engram memory engine
//!
//! This crate provides the shared storage foundation the engine builds on:
//!
//! - **db**: SQLite connection wrapper and embedded migrations
//! - **types**: entity structs and closed enums for both memory tiers
//! - **config**: engine configuration with validation and TOML loading
//! - **text**: tokenization and keyword relevance scoring

pub mod config;
pub mod db;
pub mod error;
pub mod text;
pub mod types;

// Re-export commonly used types
pub use config::EngineConfig;
pub use db::Database;
pub use error::{Error, Result};
