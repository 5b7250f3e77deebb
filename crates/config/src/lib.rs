//! Configuration module for the ABR transcoding orchestrator
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
