use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FoamError {
    #[error("Malformed scene file: {0}")]
    Format(String),

    #[error("Inconsistent data: {0}")]
    Consistency(String),

    #[error("Compute device unavailable: {0}")]
    Device(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Zstandard compression failed: {0}")]
    Compress(String),

    #[error("Zstandard decompression failed: {0}")]
    Decompress(String),

    #[error("Failed to encode diagnostic image: {0}")]
    Image(#[from] image::ImageError),

    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}

impl FoamError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        FoamError::Format(msg.into())
    }

    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        FoamError::Consistency(msg.into())
    }
}
