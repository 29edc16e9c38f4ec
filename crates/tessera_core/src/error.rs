//! # Storage Error Types
//!
//! Errors surfaced at the crate boundary. Broken invariants inside the
//! storage engine are programmer errors and panic instead.

use thiserror::Error;

/// Errors that can occur while setting up the storage engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TesseraError {
    /// The configuration source is not valid TOML or has the wrong shape.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    /// A configuration value is out of its allowed range.
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Result type for fallible storage setup.
pub type TesseraResult<T> = Result<T, TesseraError>;
