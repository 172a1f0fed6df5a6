//! Error types for the security module

/// Credential store and TLS context errors
///
/// The public operations of this module report these errors through the log
/// and degrade to empty stores or absent results; the `try_*` variants hand
/// them to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed store: {0}")]
    MalformedStore(String),

    #[error("PKCS#12 store: {0}")]
    Pkcs12(String),

    #[error("Store integrity check failed (wrong password or tampered store)")]
    Integrity,

    #[error("Can't recover key for alias '{0}' (wrong password or corrupt key)")]
    UnrecoverableKey(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}
