//! Error types for latgen

use thiserror::Error;

/// Decoder error variants
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("invalid value for decoder option `{option}`: {value}")]
    InvalidConfig { option: &'static str, value: f64 },

    /// No tokens survived pruning on some frame; no lattice can be produced
    #[error("no tokens active on frame {frame}: search collapsed")]
    SearchCollapsed { frame: usize },
}

/// Result type alias for latgen operations
pub type Result<T> = std::result::Result<T, Error>;
