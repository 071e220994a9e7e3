//! Crate-wide error type.
//!
//! Hot-path failures are structured `Result` returns; nothing in the pipeline unwinds. The
//! variants mirror the failure kinds the binaries map to exit codes: configuration errors
//! fail fast with exit 1, transport initialisation failures with exit 2.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed configuration detected after argument parsing.
    #[error("configuration error: {0}")]
    Config(String),

    /// Endpoint creation or session setup failed.
    #[error("transport init failure: {0}")]
    TransportInit(String),

    /// A wire message could not be decoded (short buffer, bad tag).
    #[error("wire decode error: {0}")]
    Decode(String),

    /// Histogram or summary export failed.
    #[error("export error: {0}")]
    Export(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
