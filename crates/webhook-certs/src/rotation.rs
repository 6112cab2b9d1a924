//! Certificate rotation manager.
//!
//! A [`RotationManager`] owns the CA and serving certificate of one webhook
//! identity. Each cycle computes a jittered deadline inside the cached CA's
//! validity window, sleeps until it passes (or until cancelled), then mints a
//! new CA and leaf, writes them to the [`ResourceStore`] and publishes the CA
//! bundle through the [`TrustPublisher`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ca::new_self_signed_ca_cert_at;
use crate::codec::encode_private_key;
use crate::config::RotationConfig;
use crate::error::{Error, Result};
use crate::identity::WebhookIdentity;
use crate::issuer::new_signed_cert_at;
use crate::keys::new_signing_key_pair;
use crate::store::{ResourceStore, TlsMaterial, TrustPublisher};
use crate::types::Certificate;
use crate::validation::{is_valid_at, verify_tls_at, verify_tls_chain};

/// Source of the current time.
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Maps a certificate validity window to the offset from NotBefore at which
/// rotation should happen.
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Result of a single [`RotationManager::wait_for_deadline_and_rotate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// New material was written and published.
    Rotated,
    /// The cancellation token fired before rotation; nothing was written.
    Cancelled,
}

/// Returns a jitter function picking a factor uniformly from
/// `[min_factor, max_factor]` on every call.
#[must_use]
pub fn default_jitter(min_factor: f64, max_factor: f64) -> JitterFn {
    Arc::new(move |base| {
        let factor = if min_factor < max_factor {
            rand::thread_rng().gen_range(min_factor..=max_factor)
        } else {
            min_factor
        };
        scale(base, factor)
    })
}

fn scale(base: Duration, factor: f64) -> Duration {
    let millis = (base.num_milliseconds() as f64 * factor).round();
    Duration::try_milliseconds(millis as i64).unwrap_or(base)
}

/// Computes `not_before + jitter(not_after - not_before)`.
///
/// The jittered offset is clamped to the validity window, so the deadline
/// never precedes `not_before` nor follows `not_after`.
#[must_use]
pub fn rotation_deadline(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    jitter: &dyn Fn(Duration) -> Duration,
) -> DateTime<Utc> {
    let base = (not_after - not_before).max(Duration::zero());
    let offset = jitter(base).clamp(Duration::zero(), base);
    not_before + offset
}

/// Generated material whose writes have not all succeeded yet.
struct PendingRotation {
    material: TlsMaterial,
    bundle: Vec<u8>,
    ca: Certificate,
}

/// Keeps the CA and serving certificate of one webhook fresh.
pub struct RotationManager<S, P> {
    identity: WebhookIdentity,
    store: S,
    publisher: P,
    cert_duration: Duration,
    organization: Vec<String>,
    retry_backoff: std::time::Duration,
    ca_cert: Option<Certificate>,
    pending: Option<PendingRotation>,
    now: NowFn,
    jitter: JitterFn,
    errors: Option<UnboundedSender<Error>>,
}

impl<S, P> std::fmt::Debug for RotationManager<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationManager")
            .field("identity", &self.identity)
            .field("cert_duration", &self.cert_duration)
            .field("ca_cert", &self.ca_cert.as_ref().map(|c| c.subject().to_string()))
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: ResourceStore, P: TrustPublisher> RotationManager<S, P> {
    /// Creates a manager with default jitter, clock and retry backoff.
    #[must_use]
    pub fn new(identity: WebhookIdentity, store: S, publisher: P, cert_duration: Duration) -> Self {
        let defaults = RotationConfig::default();
        let retry_backoff = defaults.retry_backoff();
        let jitter = default_jitter(defaults.jitter_min_factor, defaults.jitter_max_factor);
        Self {
            identity,
            store,
            publisher,
            cert_duration,
            organization: defaults.organization,
            retry_backoff,
            ca_cert: None,
            pending: None,
            now: Arc::new(Utc::now),
            jitter,
            errors: None,
        }
    }

    /// Creates a manager from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` or `identity` is invalid.
    pub fn from_config(
        identity: WebhookIdentity,
        store: S,
        publisher: P,
        config: &RotationConfig,
    ) -> Result<Self> {
        config.validate()?;
        identity.validate()?;

        let mut manager = Self::new(identity, store, publisher, config.cert_duration());
        manager.organization.clone_from(&config.organization);
        manager.retry_backoff = config.retry_backoff();
        manager.jitter = default_jitter(config.jitter_min_factor, config.jitter_max_factor);
        Ok(manager)
    }

    /// Replaces the clock.
    ///
    /// The clock decides whether a deadline has passed and stamps new
    /// certificates. Waiting for a future deadline still runs on the tokio
    /// timer, so a frozen clock does not stall the cycle.
    #[must_use]
    pub fn with_clock(mut self, now: NowFn) -> Self {
        self.now = now;
        self
    }

    /// Replaces the jitter function.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Forwards every failed cycle's error to `sink`.
    #[must_use]
    pub fn with_error_sink(mut self, sink: UnboundedSender<Error>) -> Self {
        self.errors = Some(sink);
        self
    }

    /// Sets the pause between a failed cycle and its retry.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: std::time::Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the Organization of generated subjects.
    #[must_use]
    pub fn with_organization(mut self, organization: Vec<String>) -> Self {
        self.organization = organization;
        self
    }

    /// Returns the managed identity.
    #[must_use]
    pub const fn identity(&self) -> &WebhookIdentity {
        &self.identity
    }

    /// Returns the cached CA certificate, if material was loaded or written.
    #[must_use]
    pub const fn ca_certificate(&self) -> Option<&Certificate> {
        self.ca_cert.as_ref()
    }

    /// Returns when the cached CA should be rotated, `None` before the first
    /// load.
    #[must_use]
    pub fn next_rotation_deadline(&self) -> Option<DateTime<Utc>> {
        self.ca_cert.as_ref().map(|ca| {
            rotation_deadline(ca.not_before(), ca.not_after(), self.jitter.as_ref())
        })
    }

    /// Returns whether rotation is due now. Always true before the first
    /// load.
    ///
    /// With a randomized jitter function, each call draws a new deadline.
    #[must_use]
    pub fn rotation_due(&self) -> bool {
        self.next_rotation_deadline()
            .is_none_or(|deadline| (self.now)() >= deadline)
    }

    /// Ensures a CA is cached, loading stored material or generating new.
    ///
    /// Stored material is reused only when the key, certificate and
    /// published bundle verify together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] or [`Error::PublishIo`] when a collaborator
    /// fails, or a generation error when new material cannot be minted.
    pub async fn load_or_generate(&mut self) -> Result<()> {
        if self.ca_cert.is_some() {
            return Ok(());
        }

        if let Some(ca) = self.load_existing().await? {
            info!(
                identity = %self.identity,
                not_after = %ca.not_after(),
                "loaded existing webhook certificates"
            );
            self.ca_cert = Some(ca);
            return Ok(());
        }

        info!(identity = %self.identity, "no usable webhook certificates, generating");
        self.rotate().await
    }

    async fn load_existing(&self) -> Result<Option<Certificate>> {
        let Some(material) = self.store.get(&self.identity).await? else {
            return Ok(None);
        };
        let Some(bundle) = self.publisher.get_bundle(&self.identity).await? else {
            return Ok(None);
        };

        match verify_tls_chain(&material.cert_pem, &material.key_pem, &bundle, (self.now)()) {
            Ok((_, ca)) => Ok(Some(ca)),
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "discarding stored webhook certificates");
                Ok(None)
            }
        }
    }

    /// Runs one cycle: load if needed, wait for the deadline, rotate.
    ///
    /// Material left over from a cycle whose writes failed is written again
    /// right away, without waiting for a new deadline.
    ///
    /// Returns [`CycleOutcome::Cancelled`] without writing anything if
    /// `cancel` fires before rotation starts.
    ///
    /// # Errors
    ///
    /// Returns the first collaborator or generation error; the cached CA is
    /// left untouched in that case.
    pub async fn wait_for_deadline_and_rotate(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        if self.pending.is_some() {
            self.rotate().await?;
            return Ok(CycleOutcome::Rotated);
        }
        self.load_or_generate().await?;

        let Some(deadline) = self.next_rotation_deadline() else {
            return Err(Error::StoreIo("no CA certificate cached after load".into()));
        };
        info!(identity = %self.identity, deadline = %deadline, "waiting for next certificate rotation");

        let now = (self.now)();
        if now < deadline {
            let remaining = (deadline - now).to_std().unwrap_or_default();
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
                () = tokio::time::sleep(remaining) => {}
            }
        }

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        self.rotate().await?;
        Ok(CycleOutcome::Rotated)
    }

    /// Writes and publishes new material, then updates the cache.
    ///
    /// Pending material from a failed attempt is reused while its CA is
    /// still valid, so the store and the published bundle converge on one
    /// generation.
    async fn rotate(&mut self) -> Result<()> {
        let now = (self.now)();
        let rotation = match self.pending.take() {
            Some(pending) if is_valid_at(&pending.ca, now) => {
                info!(identity = %self.identity, "retrying write of pending webhook certificates");
                pending
            }
            _ => self.generate(now)?,
        };

        if let Err(e) = self.commit(&rotation).await {
            self.pending = Some(rotation);
            return Err(e);
        }

        info!(
            identity = %self.identity,
            not_after = %rotation.ca.not_after(),
            "rotated webhook certificates"
        );
        self.ca_cert = Some(rotation.ca);
        Ok(())
    }

    async fn commit(&self, rotation: &PendingRotation) -> Result<()> {
        self.store.put(&self.identity, &rotation.material).await?;
        self.publisher
            .put_bundle(&self.identity, &rotation.bundle)
            .await
    }

    fn generate(&self, now: DateTime<Utc>) -> Result<PendingRotation> {
        let ca_key = new_signing_key_pair()?;
        let ca_cert = new_self_signed_ca_cert_at(
            &self.identity.ca_config(&self.organization),
            &ca_key,
            self.cert_duration,
            now,
        )?;

        let key = new_signing_key_pair()?;
        let cert = new_signed_cert_at(
            &self.identity.leaf_config(&self.organization),
            &key,
            &ca_cert,
            &ca_key,
            self.cert_duration,
            now,
        )?;

        let material = TlsMaterial {
            key_pem: encode_private_key(&key)?.into_bytes(),
            cert_pem: cert.pem().into_bytes(),
        };
        let bundle = ca_cert.pem().into_bytes();

        verify_tls_at(&material.cert_pem, &material.key_pem, &bundle, now)?;
        debug!(identity = %self.identity, "fresh webhook certificates verified");

        Ok(PendingRotation {
            material,
            bundle,
            ca: ca_cert,
        })
    }

    fn report(&self, err: Error) {
        error!(identity = %self.identity, error = %err, "certificate rotation cycle failed");
        if let Some(sink) = &self.errors {
            if sink.send(err).is_err() {
                debug!(identity = %self.identity, "error sink closed");
            }
        }
    }

    /// Rotates until `cancel` fires.
    ///
    /// Failed cycles are reported and retried after the retry backoff.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(identity = %self.identity, "starting certificate rotation manager");

        loop {
            match self.wait_for_deadline_and_rotate(&cancel).await {
                Ok(CycleOutcome::Rotated) => {}
                Ok(CycleOutcome::Cancelled) => break,
                Err(e) => {
                    self.report(e);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        info!(identity = %self.identity, "certificate rotation manager stopped");
    }

    /// Spawns [`run`](Self::run) on the current tokio runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::WebhookKind;
    use crate::store::{MemoryResourceStore, MemoryTrustPublisher};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use test_case::test_case;

    fn identity() -> WebhookIdentity {
        WebhookIdentity::new("foo-webhook", "foo-webhook", WebhookKind::Mutating)
    }

    fn fixed_jitter(factor: f64) -> JitterFn {
        Arc::new(move |base| scale(base, factor))
    }

    fn fixed_clock(at: DateTime<Utc>) -> NowFn {
        Arc::new(move || at)
    }

    fn manager_with_ca(
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RotationManager<MemoryResourceStore, MemoryTrustPublisher> {
        let mut manager = RotationManager::new(
            identity(),
            MemoryResourceStore::new(),
            MemoryTrustPublisher::new(),
            Duration::hours(1),
        )
        .with_clock(fixed_clock(now))
        .with_jitter(fixed_jitter(0.7));
        manager.ca_cert = Some(Certificate::new(
            Vec::new(),
            not_before,
            not_after,
            Default::default(),
            Default::default(),
        ));
        manager
    }

    #[test_case(-1, 99, false ; "just issued, still good")]
    #[test_case(-24, 24, false ; "half way expired, still good")]
    #[test_case(-69, 31, false ; "mostly expired, still good")]
    #[test_case(-91, 9, true ; "just about expired, should rotate")]
    #[test_case(-99, 1, true ; "nearly expired, should rotate")]
    #[test_case(-10, -1, true ; "already expired, should rotate")]
    #[test_case(-6 * 30 * 24, 6 * 30 * 24, false ; "long duration")]
    fn deadline_is_seventy_percent_into_window(before_h: i64, after_h: i64, due: bool) {
        let now = Utc::now();
        let not_before = now + Duration::hours(before_h);
        let not_after = now + Duration::hours(after_h);
        let manager = manager_with_ca(not_before, not_after, now);

        let expected = not_before + scale(not_after - not_before, 0.7);
        assert_eq!(manager.next_rotation_deadline(), Some(expected));
        assert_eq!(manager.rotation_due(), due);
    }

    #[test]
    fn concrete_deadlines() {
        let now = Utc::now();

        let fresh = manager_with_ca(now - Duration::hours(1), now + Duration::hours(99), now);
        assert_eq!(fresh.next_rotation_deadline(), Some(now + Duration::hours(69)));
        assert!(!fresh.rotation_due());

        let stale = manager_with_ca(now - Duration::hours(91), now + Duration::hours(9), now);
        assert_eq!(stale.next_rotation_deadline(), Some(now - Duration::hours(21)));
        assert!(stale.rotation_due());
    }

    #[test]
    fn no_deadline_before_load() {
        let manager = RotationManager::new(
            identity(),
            MemoryResourceStore::new(),
            MemoryTrustPublisher::new(),
            Duration::hours(1),
        );
        assert_eq!(manager.next_rotation_deadline(), None);
        assert!(manager.rotation_due());
    }

    #[test]
    fn jitter_is_clamped_to_window() {
        let now = Utc::now();
        let end = now + Duration::hours(10);
        assert_eq!(rotation_deadline(now, end, &|_| Duration::hours(50)), end);
        assert_eq!(rotation_deadline(now, end, &|_| -Duration::hours(1)), now);
        assert_eq!(rotation_deadline(end, now, &|base| base), end);
    }

    #[test]
    fn default_jitter_stays_in_range() {
        let jitter = default_jitter(0.7, 0.9);
        let base = Duration::hours(100);
        for _ in 0..100 {
            let offset = jitter(base);
            assert!(offset >= Duration::hours(70), "{offset}");
            assert!(offset <= Duration::hours(90), "{offset}");
        }
        assert_eq!(default_jitter(0.8, 0.8)(base), Duration::hours(80));
    }

    proptest! {
        #[test]
        fn deadline_shifts_linearly(
            start in -1_000_000i64..1_000_000,
            window in 1i64..10_000_000,
            shift in -1_000_000i64..1_000_000,
            factor in 0.01f64..0.99,
        ) {
            let origin = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
            let not_before = origin + Duration::seconds(start);
            let not_after = not_before + Duration::seconds(window);
            let jitter = |base: Duration| scale(base, factor);

            let deadline = rotation_deadline(not_before, not_after, &jitter);
            prop_assert_eq!(deadline, not_before + scale(Duration::seconds(window), factor));

            let shifted = rotation_deadline(
                not_before + Duration::seconds(shift),
                not_after + Duration::seconds(shift),
                &jitter,
            );
            prop_assert_eq!(shifted - deadline, Duration::seconds(shift));
        }
    }

    /// Store whose writes fail until `healthy` is set.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryResourceStore,
        healthy: Arc<Mutex<bool>>,
    }

    impl ResourceStore for FlakyStore {
        async fn get(&self, identity: &WebhookIdentity) -> Result<Option<TlsMaterial>> {
            self.inner.get(identity).await
        }

        async fn put(&self, identity: &WebhookIdentity, material: &TlsMaterial) -> Result<()> {
            let healthy = *self.healthy.lock().unwrap();
            if !healthy {
                return Err(Error::StoreIo("store unavailable".into()));
            }
            self.inner.put(identity, material).await
        }
    }

    /// Publisher whose writes fail until `healthy` is set.
    #[derive(Clone, Default)]
    struct FlakyPublisher {
        inner: MemoryTrustPublisher,
        healthy: Arc<Mutex<bool>>,
    }

    impl TrustPublisher for FlakyPublisher {
        async fn get_bundle(&self, identity: &WebhookIdentity) -> Result<Option<Vec<u8>>> {
            self.inner.get_bundle(identity).await
        }

        async fn put_bundle(&self, identity: &WebhookIdentity, ca_bundle: &[u8]) -> Result<()> {
            let healthy = *self.healthy.lock().unwrap();
            if !healthy {
                return Err(Error::PublishIo("publisher unavailable".into()));
            }
            self.inner.put_bundle(identity, ca_bundle).await
        }
    }

    #[tokio::test]
    async fn first_cycle_generates_material() {
        let store = MemoryResourceStore::new();
        let publisher = MemoryTrustPublisher::new();
        let mut manager = RotationManager::new(
            identity(),
            store.clone(),
            publisher.clone(),
            Duration::hours(1),
        );

        manager.load_or_generate().await.unwrap();

        let material = store.get(&identity()).await.unwrap().unwrap();
        let bundle = publisher.get_bundle(&identity()).await.unwrap().unwrap();
        assert!(verify_tls_at(&material.cert_pem, &material.key_pem, &bundle, Utc::now()).is_ok());
        assert!(manager.ca_certificate().unwrap().is_ca());
        assert!(!manager.rotation_due());
    }

    #[tokio::test]
    async fn existing_material_is_reused() {
        let store = MemoryResourceStore::new();
        let publisher = MemoryTrustPublisher::new();
        let mut first = RotationManager::new(
            identity(),
            store.clone(),
            publisher.clone(),
            Duration::hours(1),
        );
        first.load_or_generate().await.unwrap();
        let written = store.get(&identity()).await.unwrap();

        let mut second =
            RotationManager::new(identity(), store.clone(), publisher, Duration::hours(1));
        second.load_or_generate().await.unwrap();

        assert_eq!(store.get(&identity()).await.unwrap(), written);
        assert_eq!(
            second.ca_certificate().unwrap().der(),
            first.ca_certificate().unwrap().der()
        );
    }

    #[tokio::test]
    async fn corrupt_material_is_replaced() {
        let store = MemoryResourceStore::new();
        let publisher = MemoryTrustPublisher::new();
        let garbage = TlsMaterial {
            key_pem: b"garbage".to_vec(),
            cert_pem: b"garbage".to_vec(),
        };
        store.put(&identity(), &garbage).await.unwrap();
        publisher.put_bundle(&identity(), b"garbage").await.unwrap();

        let mut manager =
            RotationManager::new(identity(), store.clone(), publisher, Duration::hours(1));
        manager.load_or_generate().await.unwrap();

        assert_ne!(store.get(&identity()).await.unwrap(), Some(garbage));
        assert!(manager.ca_certificate().is_some());
    }

    #[tokio::test]
    async fn cancelled_wait_writes_nothing() {
        let store = MemoryResourceStore::new();
        let publisher = MemoryTrustPublisher::new();
        let mut manager = RotationManager::new(
            identity(),
            store.clone(),
            publisher.clone(),
            Duration::hours(1),
        );
        manager.load_or_generate().await.unwrap();
        let before = store.get(&identity()).await.unwrap();
        let bundle_before = publisher.get_bundle(&identity()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = manager.wait_for_deadline_and_rotate(&cancel).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(store.get(&identity()).await.unwrap(), before);
        assert_eq!(publisher.get_bundle(&identity()).await.unwrap(), bundle_before);
    }

    #[tokio::test]
    async fn failed_write_keeps_cached_ca() {
        let store = FlakyStore::default();
        *store.healthy.lock().unwrap() = true;
        let publisher = MemoryTrustPublisher::new();
        let mut manager = RotationManager::new(
            identity(),
            store.clone(),
            publisher.clone(),
            Duration::hours(1),
        )
        .with_jitter(Arc::new(|_| Duration::zero()));
        manager.load_or_generate().await.unwrap();
        let cached = manager.ca_certificate().unwrap().clone();
        let bundle = publisher.get_bundle(&identity()).await.unwrap();

        *store.healthy.lock().unwrap() = false;
        let err = manager
            .wait_for_deadline_and_rotate(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StoreIo(_)));
        assert_eq!(manager.ca_certificate().unwrap().der(), cached.der());
        assert_eq!(publisher.get_bundle(&identity()).await.unwrap(), bundle);
        assert!(manager.rotation_due());
    }

    #[tokio::test]
    async fn run_reports_errors_and_retries() {
        let store = FlakyStore::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = RotationManager::new(
            identity(),
            store.clone(),
            MemoryTrustPublisher::new(),
            Duration::hours(1),
        )
        .with_error_sink(tx)
        .with_retry_backoff(std::time::Duration::from_millis(10))
        .spawn(cancel.clone());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Error::StoreIo(_)));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Error::StoreIo(_)));

        *store.healthy.lock().unwrap() = true;
        while store.inner.len().unwrap() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_publish_republishes_same_material() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = MemoryResourceStore::new();
        let publisher = FlakyPublisher::default();
        *publisher.healthy.lock().unwrap() = true;

        let clock = Arc::new(Mutex::new(Utc::now()));
        let now: NowFn = {
            let clock = clock.clone();
            Arc::new(move || *clock.lock().unwrap())
        };
        // First deadline at 70% of the window, every later one at 90%.
        let draws = Arc::new(AtomicUsize::new(0));
        let jitter: JitterFn = Arc::new(move |base| {
            let factor = if draws.fetch_add(1, Ordering::SeqCst) == 0 { 0.7 } else { 0.9 };
            scale(base, factor)
        });

        let mut manager = RotationManager::new(
            identity(),
            store.clone(),
            publisher.clone(),
            Duration::hours(100),
        )
        .with_clock(now)
        .with_jitter(jitter);
        manager.load_or_generate().await.unwrap();
        let cached = manager.ca_certificate().unwrap().clone();
        let old_bundle = publisher.get_bundle(&identity()).await.unwrap().unwrap();

        let at = cached.not_before() + Duration::hours(80);
        *clock.lock().unwrap() = at;
        *publisher.healthy.lock().unwrap() = false;

        let cancel = CancellationToken::new();
        let err = manager.wait_for_deadline_and_rotate(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::PublishIo(_)));
        assert_eq!(manager.ca_certificate().unwrap().der(), cached.der());
        assert_eq!(
            publisher.get_bundle(&identity()).await.unwrap(),
            Some(old_bundle.clone())
        );
        let written = store.get(&identity()).await.unwrap().unwrap();
        assert!(verify_tls_at(&written.cert_pem, &written.key_pem, &old_bundle, at).is_err());

        *publisher.healthy.lock().unwrap() = true;
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            manager.wait_for_deadline_and_rotate(&cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome, CycleOutcome::Rotated);

        let bundle = publisher.get_bundle(&identity()).await.unwrap().unwrap();
        assert_eq!(store.get(&identity()).await.unwrap(), Some(written.clone()));
        assert!(verify_tls_at(&written.cert_pem, &written.key_pem, &bundle, at).is_ok());
        assert_eq!(manager.ca_certificate().unwrap().pem().into_bytes(), bundle);
        assert_ne!(manager.ca_certificate().unwrap().der(), cached.der());
    }

    #[tokio::test]
    async fn run_recovers_from_publish_failure() {
        let store = MemoryResourceStore::new();
        let publisher = FlakyPublisher::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = RotationManager::new(
            identity(),
            store.clone(),
            publisher.clone(),
            Duration::hours(1),
        )
        .with_error_sink(tx)
        .with_retry_backoff(std::time::Duration::from_millis(10))
        .spawn(cancel.clone());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Error::PublishIo(_)));
        let written = store.get(&identity()).await.unwrap().unwrap();

        *publisher.healthy.lock().unwrap() = true;
        let bundle = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(bundle) = publisher.get_bundle(&identity()).await.unwrap() {
                    break bundle;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(store.get(&identity()).await.unwrap(), Some(written.clone()));
        assert!(verify_tls_at(&written.cert_pem, &written.key_pem, &bundle, Utc::now()).is_ok());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn frozen_clock_still_reaches_deadline() {
        let now = Utc::now();
        let mut manager = manager_with_ca(now, now + Duration::milliseconds(100), now);

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            manager.wait_for_deadline_and_rotate(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome, CycleOutcome::Rotated);
        assert!(manager.ca_certificate().unwrap().is_ca());
    }

    #[tokio::test]
    async fn cancelled_token_stops_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let store = MemoryResourceStore::new();
        let mut manager = RotationManager::new(
            identity(),
            store.clone(),
            MemoryTrustPublisher::new(),
            Duration::hours(1),
        );

        let outcome = manager.wait_for_deadline_and_rotate(&cancel).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn from_config_validates() {
        let config = RotationConfig {
            jitter_min_factor: 1.5,
            ..Default::default()
        };
        let result = RotationManager::from_config(
            identity(),
            MemoryResourceStore::new(),
            MemoryTrustPublisher::new(),
            &config,
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let bad_identity = WebhookIdentity::new("", "ns", WebhookKind::Validating);
        let result = RotationManager::from_config(
            bad_identity,
            MemoryResourceStore::new(),
            MemoryTrustPublisher::new(),
            &RotationConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
