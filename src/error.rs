//! Error types for the voucher-sw library.

use thiserror::Error;

/// Errors that can occur inside the worker or its host.
#[derive(Error, Debug)]
pub enum Error {
    /// Network-level failure (offline, DNS, connection reset, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error while reading or writing local state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A precache manifest entry could not be fetched or was not OK.
    #[error("Cache write failed for {url}: {reason}")]
    CacheWrite {
        /// URL of the manifest entry that failed.
        url: String,
        /// Why the entry could not be cached.
        reason: String,
    },

    /// A cache write would exceed the configured byte quota.
    #[error("Cache quota exceeded: {needed} bytes needed, {limit} allowed")]
    QuotaExceeded {
        /// Bytes the generation would hold after the write.
        needed: u64,
        /// Configured quota in bytes.
        limit: u64,
    },

    /// A queued mutation was rejected by the deferred-write endpoint.
    #[error("Delivery of {id} failed with status {status}")]
    Delivery {
        /// Identifier of the mutation.
        id: String,
        /// HTTP status returned by the endpoint.
        status: u16,
    },

    /// A lifecycle command was issued in a state that does not allow it.
    #[error("Invalid worker state: {0}")]
    InvalidState(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML decoding failed.
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML encoding failed.
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for voucher-sw operations.
pub type Result<T> = std::result::Result<T, Error>;
