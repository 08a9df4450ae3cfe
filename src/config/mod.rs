//! Configuration Module
//!
//! Handles configuration loading, layering, and validation.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
