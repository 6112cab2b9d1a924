//! Certificate management error types.

use thiserror::Error;

/// Result type for certificate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Certificate management error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// Key pair generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Building or signing a certificate failed.
    #[error("certificate signing failed: {0}")]
    Signing(String),

    /// Malformed PEM or DER input.
    #[error("parse error: {0}")]
    Parse(String),

    /// Missing required subject fields or usages.
    #[error("invalid certificate config: {0}")]
    InvalidConfig(String),

    /// The CA bundle is empty or holds no usable certificate.
    #[error("invalid trust store: {0}")]
    TrustStore(String),

    /// The certificate chain does not validate.
    #[error("certificate chain verification failed: {0}")]
    ChainVerification(String),

    /// The private key does not belong to the certificate.
    #[error("private key does not match certificate: {0}")]
    KeyMismatch(String),

    /// Reading or writing the resource store failed.
    #[error("resource store I/O failed: {0}")]
    StoreIo(String),

    /// Reading or writing the trust publisher failed.
    #[error("trust bundle publish failed: {0}")]
    PublishIo(String),

    /// Invalid manager configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
