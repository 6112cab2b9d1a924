//! Leaf certificate issuance.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rcgen::{CertificateParams, IsCa, KeyUsagePurpose, SerialNumber};
use tracing::info;

use crate::ca::{ca_params, convert_alt_names, not_after, to_rcgen_name, to_rcgen_time};
use crate::error::{Error, Result};
use crate::keys::PrivateKey;
use crate::types::{Certificate, Config};

/// Issues a leaf certificate for `key`, signed by `ca_key`.
///
/// The leaf is valid from the CA's NotBefore until now plus `duration`.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] when `cfg` lacks a common name or usages,
/// and [`Error::Signing`] if building or signing fails.
pub fn new_signed_cert(
    cfg: &Config,
    key: &PrivateKey,
    ca_cert: &Certificate,
    ca_key: &PrivateKey,
    duration: Duration,
) -> Result<Certificate> {
    new_signed_cert_at(cfg, key, ca_cert, ca_key, duration, Utc::now())
}

/// Like [`new_signed_cert`], with NotAfter computed from `now`.
///
/// # Errors
///
/// See [`new_signed_cert`].
pub fn new_signed_cert_at(
    cfg: &Config,
    key: &PrivateKey,
    ca_cert: &Certificate,
    ca_key: &PrivateKey,
    duration: Duration,
    now: DateTime<Utc>,
) -> Result<Certificate> {
    cfg.validate_for_leaf()?;

    let serial = rand::thread_rng().gen_range(0..i64::MAX as u64);

    let mut params = CertificateParams::default();
    params.distinguished_name = to_rcgen_name(&cfg.subject());
    params.serial_number = Some(SerialNumber::from(serial));
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = cfg.usages.iter().map(|u| u.to_rcgen()).collect();
    params.subject_alt_names = convert_alt_names(&cfg.alt_names)?;
    params.not_before = to_rcgen_time(ca_cert.not_before())?;
    params.not_after = to_rcgen_time(not_after(now, duration)?)?;

    let leaf_key = key.to_rcgen()?;
    let signing_key = ca_key.to_rcgen()?;
    let issuer = create_issuer_cert(ca_cert, &signing_key)?;

    let cert = params
        .signed_by(&leaf_key, &issuer, &signing_key)
        .map_err(|e| Error::Signing(format!("failed to sign certificate: {e}")))?;
    let certificate = Certificate::from_der(cert.der())?;

    info!(
        subject = %certificate.subject(),
        issuer = %certificate.issuer(),
        serial,
        not_after = %certificate.not_after(),
        "issued leaf certificate"
    );
    Ok(certificate)
}

/// Rebuilds an rcgen view of the CA so it can act as the issuer.
///
/// Only the subject and key of the issuer end up in the leaf.
fn create_issuer_cert(
    ca_cert: &Certificate,
    signing_key: &rcgen::KeyPair,
) -> Result<rcgen::Certificate> {
    ca_params(ca_cert.subject(), ca_cert.not_before(), ca_cert.not_after())?
        .self_signed(signing_key)
        .map_err(|e| Error::Signing(format!("failed to create issuer cert: {e}")))
}
