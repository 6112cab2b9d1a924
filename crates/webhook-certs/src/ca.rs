//! Self-signed certificate authority.

use chrono::{DateTime, Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, Ia5String, IsCa, KeyUsagePurpose, SanType,
    SerialNumber,
};
use tracing::info;

use crate::error::{Error, Result};
use crate::keys::PrivateKey;
use crate::types::{AltNames, Certificate, Config, DistinguishedName};

/// Serial number of every CA certificate; each manager owns exactly one CA.
pub const CA_SERIAL_NUMBER: u64 = 0;

/// Creates a self-signed CA certificate valid from now for `duration`.
///
/// # Errors
///
/// Returns [`Error::Signing`] if the certificate cannot be built or signed.
pub fn new_self_signed_ca_cert(
    cfg: &Config,
    key: &PrivateKey,
    duration: Duration,
) -> Result<Certificate> {
    new_self_signed_ca_cert_at(cfg, key, duration, Utc::now())
}

/// Creates a self-signed CA certificate valid from `now` for `duration`.
///
/// # Errors
///
/// Returns [`Error::Signing`] if the certificate cannot be built or signed.
pub fn new_self_signed_ca_cert_at(
    cfg: &Config,
    key: &PrivateKey,
    duration: Duration,
    now: DateTime<Utc>,
) -> Result<Certificate> {
    let key_pair = key.to_rcgen()?;
    let params = ca_params(&cfg.subject(), now, not_after(now, duration)?)?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Signing(format!("failed to self-sign CA certificate: {e}")))?;
    let certificate = Certificate::from_der(cert.der())?;

    info!(
        subject = %certificate.subject(),
        not_after = %certificate.not_after(),
        "created self-signed CA certificate"
    );
    Ok(certificate)
}

/// Builds the template shared by new CA certificates and the issuer view
/// used when signing leaves.
pub(crate) fn ca_params(
    subject: &DistinguishedName,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = to_rcgen_name(subject);
    params.serial_number = Some(SerialNumber::from(CA_SERIAL_NUMBER));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.not_before = to_rcgen_time(not_before)?;
    params.not_after = to_rcgen_time(not_after)?;
    Ok(params)
}

/// Converts a subject into an rcgen name.
///
/// rcgen keeps a single value per attribute type, so several organizations
/// are stored as one comma-separated Organization attribute.
pub(crate) fn to_rcgen_name(subject: &DistinguishedName) -> rcgen::DistinguishedName {
    let mut name = rcgen::DistinguishedName::new();
    name.push(DnType::CommonName, subject.common_name.as_str());
    if !subject.organization.is_empty() {
        name.push(DnType::OrganizationName, subject.organization.join(", "));
    }
    name
}

/// Converts alternative names to rcgen `SanType`s, DNS names first.
pub(crate) fn convert_alt_names(alt_names: &AltNames) -> Result<Vec<SanType>> {
    let dns = alt_names.dns_names.iter().map(|dns| {
        Ia5String::try_from(dns.clone())
            .map(SanType::DnsName)
            .map_err(|e| Error::InvalidConfig(format!("invalid DNS name '{dns}': {e}")))
    });
    let ips = alt_names.ips.iter().map(|ip| Ok(SanType::IpAddress(*ip)));
    dns.chain(ips).collect()
}

/// Last year an X.509 GeneralizedTime can carry.
const MAX_CERT_YEAR: i32 = 9999;

/// Computes `now + duration`, rejecting values a certificate cannot carry.
pub(crate) fn not_after(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(duration)
        .filter(|t| t.year() <= MAX_CERT_YEAR)
        .ok_or_else(|| {
            Error::InvalidConfig(format!("certificate duration {duration} is out of range"))
        })
}

/// Converts a chrono `DateTime` to rcgen `OffsetDateTime`.
pub(crate) fn to_rcgen_time(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Signing(format!("invalid timestamp: {e}")))
}
