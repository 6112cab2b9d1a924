//! Certificate lifecycle management for admission webhooks.
#![forbid(unsafe_code)]
//!
//! This crate mints a private self-signed CA, issues the webhook's serving
//! certificate from it, verifies TLS material against a CA bundle, and
//! rotates everything ahead of expiry on a jittered schedule.
//!
//! # Overview
//!
//! The `webhook-certs` crate provides:
//! - RSA signing keys and standalone P-256 keys
//! - PEM encoding and decoding of keys and certificates
//! - Self-signed CA and leaf certificate issuance
//! - Chain, hostname and key pairing verification
//! - A cancellable background rotation manager per webhook identity
//!
//! # Example
//!
//! ```
//! use chrono::Duration;
//! use webhook_certs::{
//!     encode_private_key, new_self_signed_ca_cert, new_signed_cert, new_signing_key_pair,
//!     verify_tls, Config,
//! };
//!
//! let ca_key = new_signing_key_pair().unwrap();
//! let ca = new_self_signed_ca_cert(&Config::new("webhook-ca"), &ca_key, Duration::days(1)).unwrap();
//!
//! let key = new_signing_key_pair().unwrap();
//! let cfg = Config::new("webhook.default.svc")
//!     .dns("webhook.default.svc")
//!     .server_auth();
//! let cert = new_signed_cert(&cfg, &key, &ca, &ca_key, Duration::days(1)).unwrap();
//!
//! let key_pem = encode_private_key(&key).unwrap();
//! verify_tls(cert.pem().as_bytes(), key_pem.as_bytes(), ca.pem().as_bytes()).unwrap();
//! ```
//!
//! # Modules
//!
//! - [`keys`] - Key generation
//! - [`codec`] - PEM encoding and decoding
//! - [`ca`] - Self-signed CA certificates
//! - [`issuer`] - Leaf certificate issuance
//! - [`validation`] - TLS material verification
//! - [`rotation`] - Background rotation manager
//! - [`store`] - Resource store and trust publisher interfaces
//! - [`fs_store`] - Directory-backed collaborators
//! - [`identity`] - Webhook identities
//! - [`config`] - Rotation configuration
//! - [`types`] - Core types (Certificate, Config, etc.)
//! - [`error`] - Error types

pub mod ca;
pub mod codec;
pub mod config;
pub mod error;
#[cfg(unix)]
pub mod fs_store;
pub mod identity;
pub mod issuer;
pub mod keys;
pub mod rotation;
pub mod store;
pub mod types;
pub mod validation;

// Re-export commonly used types at crate root
pub use ca::{new_self_signed_ca_cert, new_self_signed_ca_cert_at};
pub use codec::{
    decode_certificates, decode_private_key, encode_certificate, encode_certificates,
    encode_private_key,
};
pub use config::RotationConfig;
pub use error::{Error, Result};
#[cfg(unix)]
pub use fs_store::DirectoryStore;
pub use identity::{WebhookIdentity, WebhookKind};
pub use issuer::{new_signed_cert, new_signed_cert_at};
pub use keys::{
    make_elliptic_private_key_pem, new_signing_key_pair, new_standalone_private_key, KeyAlgorithm,
    PrivateKey,
};
pub use rotation::{default_jitter, rotation_deadline, CycleOutcome, JitterFn, NowFn, RotationManager};
pub use store::{MemoryResourceStore, MemoryTrustPublisher, ResourceStore, TlsMaterial, TrustPublisher};
pub use types::{
    AltNames, Certificate, Config, DistinguishedName, ExtendedKeyUsage, KeyUsagePurpose,
    SubjectAltName,
};
pub use validation::{
    is_expired_at, is_not_yet_valid_at, is_valid_at, remaining_validity_at, verify_key_pair,
    verify_tls, verify_tls_at, TrustPool, VerifyOptions,
};
