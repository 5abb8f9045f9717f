//! Internal daemon error type.
//!
//! Distinct from `protocol::ApiError`: this is the error type used inside
//! the daemon (config loading, adapter I/O, registry invariants); call
//! sites that convert a failure into a wire response build an `ApiError`
//! from it instead of serializing it directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("hypervisor adapter error: {0}")]
    Adapter(String),

    #[error("attachment registry error: {0}")]
    Registry(String),

    #[error("mailbox error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
