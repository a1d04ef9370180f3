//! Core types for the oxidized-cell shader cache
//!
//! This crate provides the error handling, configuration, and logging
//! infrastructure shared by the shader cache crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, DebugConfig, LogLevel, ShaderCacheConfig};
pub use error::{FormatError, Result, ShaderCacheError};
