//! Certificate chain and TLS material verification.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::traits::PublicKeyParts;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::codec::{CERTIFICATE_BLOCK_TYPE, decode_certificates, decode_private_key};
use crate::error::{Error, Result};
use crate::keys::PrivateKey;
use crate::types::{Certificate, ExtendedKeyUsage};

/// A set of trusted root certificates parsed from a CA bundle.
#[derive(Debug, Clone)]
pub struct TrustPool {
    roots: Vec<Certificate>,
}

/// Parameters of a single chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Hostname (or IP literal) the leaf must be valid for.
    pub dns_name: String,
    /// Instant at which validity windows are evaluated.
    pub current_time: DateTime<Utc>,
}

impl TrustPool {
    /// Builds a pool from a PEM bundle.
    ///
    /// Blocks that are not certificates, or do not parse, are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrustStore`] if the bundle is malformed or holds no
    /// usable certificate.
    pub fn from_pem(bundle: &[u8]) -> Result<Self> {
        let blocks = ::pem::parse_many(bundle)
            .map_err(|e| Error::TrustStore(format!("failed to parse CA bundle: {e}")))?;

        let mut roots = Vec::new();
        for block in blocks.iter().filter(|b| b.tag() == CERTIFICATE_BLOCK_TYPE) {
            match Certificate::from_der(block.contents()) {
                Ok(cert) => roots.push(cert),
                Err(e) => debug!(error = %e, "skipping unparsable CA bundle entry"),
            }
        }

        if roots.is_empty() {
            return Err(Error::TrustStore(
                "CA bundle contains no valid certificates".into(),
            ));
        }
        Ok(Self { roots })
    }

    /// Returns the trusted roots in bundle order.
    #[must_use]
    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    /// Returns the number of trusted roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Returns whether the pool is empty. Never true for a constructed pool.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Verifies `leaf` against the pool and returns the root that issued it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainVerification`] if the leaf is outside its
    /// validity window, no trusted root signed it, it is not valid for
    /// `opts.dns_name`, or it is not authorized for server authentication.
    pub fn verify(&self, leaf: &Certificate, opts: &VerifyOptions) -> Result<&Certificate> {
        if !is_valid_at(leaf, opts.current_time) {
            return Err(Error::ChainVerification(format!(
                "certificate '{}' has expired or is not yet valid: current time {} is outside [{}, {}]",
                leaf.subject(),
                opts.current_time,
                leaf.not_before(),
                leaf.not_after()
            )));
        }

        let root = self.find_issuer(leaf, opts.current_time)?;
        verify_hostname(leaf, &opts.dns_name)?;
        verify_server_usage(leaf)?;

        debug!(subject = %leaf.subject(), root = %root.subject(), "certificate chain verified");
        Ok(root)
    }

    fn find_issuer(&self, leaf: &Certificate, at: DateTime<Utc>) -> Result<&Certificate> {
        let mut last_error = None;

        for root in self.roots.iter().filter(|r| r.subject() == leaf.issuer()) {
            if !root.is_ca() {
                last_error = Some(format!("'{}' is not a CA", root.subject()));
                continue;
            }
            if !is_valid_at(root, at) {
                last_error = Some(format!("CA '{}' has expired or is not yet valid", root.subject()));
                continue;
            }
            match verify_signature(leaf, root) {
                Ok(()) => return Ok(root),
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        Err(Error::ChainVerification(last_error.unwrap_or_else(|| {
            format!(
                "certificate signed by unknown authority '{}'",
                leaf.issuer()
            )
        })))
    }
}

/// Verifies that a certificate was signed by the given issuer.
fn verify_signature(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    let (_, parsed_cert) = X509Certificate::from_der(cert.der())
        .map_err(|e| Error::Parse(format!("failed to parse certificate: {e}")))?;
    let (_, parsed_issuer) = X509Certificate::from_der(issuer.der())
        .map_err(|e| Error::Parse(format!("failed to parse issuer certificate: {e}")))?;

    parsed_cert
        .verify_signature(Some(parsed_issuer.public_key()))
        .map_err(|e| {
            Error::ChainVerification(format!(
                "signature verification failed for '{}': {e:?}",
                cert.subject()
            ))
        })
}

fn verify_hostname(leaf: &Certificate, host: &str) -> Result<()> {
    let matched = match host.parse::<IpAddr>() {
        Ok(ip) => leaf.ip_addresses().any(|san| san == ip),
        Err(_) => leaf.dns_names().any(|pattern| hostname_matches(pattern, host)),
    };

    if matched {
        Ok(())
    } else {
        Err(Error::ChainVerification(format!(
            "certificate is valid for {:?}, not '{host}'",
            leaf.san()
        )))
    }
}

/// Matches `host` against a SAN pattern; a wildcard covers one leftmost label.
fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let host = host.trim_end_matches('.');

    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest.eq_ignore_ascii_case(suffix)),
        None => pattern.eq_ignore_ascii_case(host),
    }
}

fn verify_server_usage(leaf: &Certificate) -> Result<()> {
    let usages = leaf.extended_key_usages();
    if usages.is_empty()
        || usages.contains(&ExtendedKeyUsage::ServerAuth)
        || usages.contains(&ExtendedKeyUsage::Any)
    {
        return Ok(());
    }
    Err(Error::ChainVerification(format!(
        "certificate specifies an incompatible key usage: {usages:?}"
    )))
}

/// Checks that `key` is the private half of the key certified by `cert`.
///
/// # Errors
///
/// Returns [`Error::KeyMismatch`] if the keys differ and [`Error::Parse`] if
/// the certificate public key cannot be read.
pub fn verify_key_pair(cert: &Certificate, key: &PrivateKey) -> Result<()> {
    let (_, parsed) = X509Certificate::from_der(cert.der())
        .map_err(|e| Error::Parse(format!("failed to parse certificate: {e}")))?;
    let public = parsed
        .public_key()
        .parsed()
        .map_err(|e| Error::Parse(format!("failed to parse certificate public key: {e}")))?;

    let matches = match (key, public) {
        (PrivateKey::Rsa(rsa), PublicKey::RSA(cert_key)) => {
            strip_zeros(cert_key.modulus) == rsa.n().to_bytes_be().as_slice()
                && strip_zeros(cert_key.exponent) == rsa.e().to_bytes_be().as_slice()
        }
        (PrivateKey::EcdsaP256(ec), PublicKey::EC(point)) => {
            point.data() == ec.public_key().to_encoded_point(false).as_bytes()
        }
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(Error::KeyMismatch(format!(
            "{:?} key does not certify as '{}'",
            key.algorithm(),
            cert.subject()
        )))
    }
}

fn strip_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Verifies PEM-encoded TLS material as of now.
///
/// The key must parse and belong to the first certificate, which must chain
/// to a root in `ca_bundle` and be valid for its own first DNS name.
///
/// # Errors
///
/// [`Error::Parse`] for malformed key or certificates, [`Error::TrustStore`]
/// for an unusable bundle, [`Error::KeyMismatch`] for a foreign key and
/// [`Error::ChainVerification`] when the chain does not validate.
pub fn verify_tls(cert_pem: &[u8], key_pem: &[u8], ca_bundle: &[u8]) -> Result<()> {
    verify_tls_at(cert_pem, key_pem, ca_bundle, Utc::now())
}

/// Like [`verify_tls`], evaluated at `at`.
///
/// # Errors
///
/// See [`verify_tls`].
pub fn verify_tls_at(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_bundle: &[u8],
    at: DateTime<Utc>,
) -> Result<()> {
    verify_tls_chain(cert_pem, key_pem, ca_bundle, at).map(|_| ())
}

/// Verifies TLS material and returns the parsed leaf with its issuing root.
pub(crate) fn verify_tls_chain(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_bundle: &[u8],
    at: DateTime<Utc>,
) -> Result<(Certificate, Certificate)> {
    let key = decode_private_key(key_pem)?;
    let mut certs = decode_certificates(cert_pem)?;
    let pool = TrustPool::from_pem(ca_bundle)?;

    let leaf = certs.swap_remove(0);
    let dns_name = leaf
        .dns_names()
        .next()
        .ok_or_else(|| {
            Error::ChainVerification(format!(
                "certificate '{}' has no DNS subject alternative name",
                leaf.subject()
            ))
        })?
        .to_string();

    let opts = VerifyOptions {
        dns_name,
        current_time: at,
    };
    let root = pool.verify(&leaf, &opts)?.clone();
    verify_key_pair(&leaf, &key)?;

    debug!(subject = %leaf.subject(), "TLS certificates chain verified");
    Ok((leaf, root))
}

/// Returns whether `cert` has expired at `at`.
#[must_use]
pub fn is_expired_at(cert: &Certificate, at: DateTime<Utc>) -> bool {
    cert.not_after() < at
}

/// Returns whether `cert` is not yet valid at `at`.
#[must_use]
pub fn is_not_yet_valid_at(cert: &Certificate, at: DateTime<Utc>) -> bool {
    cert.not_before() > at
}

/// Returns whether `at` falls inside the validity window of `cert`.
#[must_use]
pub fn is_valid_at(cert: &Certificate, at: DateTime<Utc>) -> bool {
    !is_expired_at(cert, at) && !is_not_yet_valid_at(cert, at)
}

/// Time left until `cert` expires, or `None` once it has.
#[must_use]
pub fn remaining_validity_at(cert: &Certificate, at: DateTime<Utc>) -> Option<Duration> {
    (cert.not_after() > at).then(|| cert.not_after() - at)
}
