//! Proxy, policy API and CA errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The hudsucker engine failed to build or serve.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Flex router could not carry the request.
    #[error("Flex routing failed: {0}")]
    Flex(String),
}

/// Remote policy API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection failure or timeout.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-2xx status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum CaManagerError {
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// The stored certificate or key is not usable.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    #[error("Failed to write CA: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
