//! Collaborators that persist TLS material and advertise the CA bundle.

// Guards are held only for the duration of a map access.
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::WebhookIdentity;

/// A PEM-encoded private key and certificate chain stored together.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// PEM-encoded private key.
    pub key_pem: Vec<u8>,
    /// PEM-encoded certificate chain, leaf first.
    pub cert_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key_pem", &"[REDACTED]")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish()
    }
}

/// Durable owner of the serving key and certificate.
///
/// Implementations must make key and certificate visible together: a
/// reader never observes one without the other.
#[allow(async_fn_in_trait)]
pub trait ResourceStore: Send + Sync + 'static {
    /// Reads the stored material, `None` when nothing was stored yet.
    fn get(
        &self,
        identity: &WebhookIdentity,
    ) -> impl Future<Output = Result<Option<TlsMaterial>>> + Send;

    /// Replaces the stored material.
    fn put(
        &self,
        identity: &WebhookIdentity,
        material: &TlsMaterial,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Advertises the CA bundle clients use to trust the webhook.
#[allow(async_fn_in_trait)]
pub trait TrustPublisher: Send + Sync + 'static {
    /// Reads the advertised bundle, `None` when nothing was published yet.
    fn get_bundle(
        &self,
        identity: &WebhookIdentity,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Replaces the advertised bundle.
    fn put_bundle(
        &self,
        identity: &WebhookIdentity,
        ca_bundle: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// In-memory [`ResourceStore`]. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryResourceStore {
    entries: Arc<RwLock<HashMap<WebhookIdentity, TlsMaterial>>>,
}

impl MemoryResourceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of identities with stored material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::StoreIo(format!("failed to acquire read lock: {e}")))?;
        Ok(entries.len())
    }
}

impl ResourceStore for MemoryResourceStore {
    async fn get(&self, identity: &WebhookIdentity) -> Result<Option<TlsMaterial>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::StoreIo(format!("failed to acquire read lock: {e}")))?;
        Ok(entries.get(identity).cloned())
    }

    async fn put(&self, identity: &WebhookIdentity, material: &TlsMaterial) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| Error::StoreIo(format!("failed to acquire write lock: {e}")))?;
        entries.insert(identity.clone(), material.clone());
        debug!(identity = %identity, "stored TLS material");
        Ok(())
    }
}

/// In-memory [`TrustPublisher`]. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrustPublisher {
    bundles: Arc<RwLock<HashMap<WebhookIdentity, Vec<u8>>>>,
}

impl MemoryTrustPublisher {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustPublisher for MemoryTrustPublisher {
    async fn get_bundle(&self, identity: &WebhookIdentity) -> Result<Option<Vec<u8>>> {
        let bundles = self
            .bundles
            .read()
            .map_err(|e| Error::PublishIo(format!("failed to acquire read lock: {e}")))?;
        Ok(bundles.get(identity).cloned())
    }

    async fn put_bundle(&self, identity: &WebhookIdentity, ca_bundle: &[u8]) -> Result<()> {
        let mut bundles = self
            .bundles
            .write()
            .map_err(|e| Error::PublishIo(format!("failed to acquire write lock: {e}")))?;
        bundles.insert(identity.clone(), ca_bundle.to_vec());
        debug!(identity = %identity, "published CA bundle");
        Ok(())
    }
}
