//! # Storage Configuration
//!
//! Sizes and thresholds of the storage engine. Loaded once at startup,
//! usually from a TOML file:
//!
//! ```toml
//! block_size = 16384
//! operation_data_node_size = 16384
//! operation_node_batch = 16
//! min_free_indices_before_reuse = 1024
//! ```

use serde::Deserialize;

use crate::error::{TesseraError, TesseraResult};
use crate::memory::BLOCK_ALIGNMENT;

/// Default size of a data block (16 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Default size of one data node of the operation arena (16 KiB).
pub const DEFAULT_OPERATION_DATA_NODE_SIZE: usize = 16 * 1024;

/// Default number of operation nodes allocated at once.
pub const DEFAULT_OPERATION_NODE_BATCH: usize = 16;

/// Default number of retired entity indices kept before any is reused.
pub const DEFAULT_MIN_FREE_INDICES_BEFORE_REUSE: usize = 1024;

/// Configuration of the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Size in bytes of blocks handed out by the default pool.
    pub block_size: usize,
    /// Size in bytes of a regular data node in the operation arena.
    pub operation_data_node_size: usize,
    /// Number of operation nodes allocated per growth step.
    pub operation_node_batch: usize,
    /// Retired entity indices are only reused once this many are queued.
    pub min_free_indices_before_reuse: usize,
    /// Upper bound of entity indices handed out by the entity index.
    pub max_entity_count: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            operation_data_node_size: DEFAULT_OPERATION_DATA_NODE_SIZE,
            operation_node_batch: DEFAULT_OPERATION_NODE_BATCH,
            min_free_indices_before_reuse: DEFAULT_MIN_FREE_INDICES_BEFORE_REUSE,
            max_entity_count: u32::MAX,
        }
    }
}

impl StorageConfig {
    /// Parses and validates a configuration from TOML source.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::ConfigParse`] if the source is malformed and
    /// [`TesseraError::InvalidConfig`] if a value is out of range.
    pub fn from_toml_str(source: &str) -> TesseraResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| TesseraError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> TesseraResult<()> {
        if self.block_size == 0 || self.block_size % BLOCK_ALIGNMENT != 0 {
            return Err(TesseraError::InvalidConfig {
                field: "block_size",
                reason: format!(
                    "{} is not a non-zero multiple of {BLOCK_ALIGNMENT}",
                    self.block_size
                ),
            });
        }
        if self.operation_data_node_size == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "operation_data_node_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.operation_node_batch == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "operation_node_batch",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_entity_count == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "max_entity_count",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
