//! Error types for server setup and registry operations.
//!
//! Per-datagram failures never surface here: malformed or abusive input is
//! discarded where it is detected and the I/O loop keeps running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid bind address {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no free slot (capacity {capacity})")]
    Full { capacity: usize },

    #[error("a client with identity {0} is already registered")]
    DuplicateIdentity(String),

    #[error("no free network id")]
    NetIdsExhausted,
}
