//! Core certificate types: issuance config, subjects and parsed certificates.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Extended key usages a leaf certificate can be authorized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtendedKeyUsage {
    /// Any purpose.
    Any,
    /// TLS server authentication.
    ServerAuth,
    /// TLS client authentication.
    ClientAuth,
    /// Code signing.
    CodeSigning,
    /// Email protection.
    EmailProtection,
}

impl ExtendedKeyUsage {
    /// Returns the OID string for this usage.
    #[must_use]
    pub const fn oid(self) -> &'static str {
        match self {
            Self::Any => "2.5.29.37.0",
            Self::ServerAuth => "1.3.6.1.5.5.7.3.1",
            Self::ClientAuth => "1.3.6.1.5.5.7.3.2",
            Self::CodeSigning => "1.3.6.1.5.5.7.3.3",
            Self::EmailProtection => "1.3.6.1.5.5.7.3.4",
        }
    }

    pub(crate) const fn to_rcgen(self) -> rcgen::ExtendedKeyUsagePurpose {
        match self {
            Self::Any => rcgen::ExtendedKeyUsagePurpose::Any,
            Self::ServerAuth => rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            Self::ClientAuth => rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            Self::CodeSigning => rcgen::ExtendedKeyUsagePurpose::CodeSigning,
            Self::EmailProtection => rcgen::ExtendedKeyUsagePurpose::EmailProtection,
        }
    }
}

/// Basic key usage bits carried by a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsagePurpose {
    /// Digital signature.
    DigitalSignature,
    /// Key encipherment.
    KeyEncipherment,
    /// Certificate signing (CA only).
    KeyCertSign,
    /// CRL signing.
    CrlSign,
}

/// Subject alternative names to put on a leaf certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltNames {
    /// DNS names.
    pub dns_names: Vec<String>,
    /// IP addresses.
    pub ips: Vec<IpAddr>,
}

/// Identity of a certificate subject plus what it may be used for.
///
/// Built once per issuance call; the issuing functions only read it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Subject common name.
    pub common_name: String,
    /// Subject organizations, in order.
    pub organization: Vec<String>,
    /// Subject alternative names.
    pub alt_names: AltNames,
    /// Extended key usages (leaf certificates only).
    pub usages: Vec<ExtendedKeyUsage>,
}

impl Config {
    /// Creates a config for the given common name.
    #[must_use]
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }

    /// Adds an organization.
    #[must_use]
    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization.push(org.into());
        self
    }

    /// Adds a DNS subject alternative name.
    #[must_use]
    pub fn dns(mut self, dns: impl Into<String>) -> Self {
        self.alt_names.dns_names.push(dns.into());
        self
    }

    /// Adds an IP subject alternative name.
    #[must_use]
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.alt_names.ips.push(ip);
        self
    }

    /// Adds an extended key usage.
    #[must_use]
    pub fn usage(mut self, usage: ExtendedKeyUsage) -> Self {
        self.usages.push(usage);
        self
    }

    /// Adds server authentication usage.
    #[must_use]
    pub fn server_auth(self) -> Self {
        self.usage(ExtendedKeyUsage::ServerAuth)
    }

    /// Adds client authentication usage.
    #[must_use]
    pub fn client_auth(self) -> Self {
        self.usage(ExtendedKeyUsage::ClientAuth)
    }

    /// Checks the fields a leaf certificate cannot be issued without.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the common name or the usage
    /// list is empty.
    pub fn validate_for_leaf(&self) -> Result<()> {
        if self.common_name.is_empty() {
            return Err(Error::InvalidConfig("must specify a CommonName".into()));
        }
        if self.usages.is_empty() {
            return Err(Error::InvalidConfig(
                "must specify at least one ExtKeyUsage".into(),
            ));
        }
        Ok(())
    }

    /// Builds the subject name described by this config.
    #[must_use]
    pub fn subject(&self) -> DistinguishedName {
        DistinguishedName {
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
        }
    }
}

/// Subject alternative name found on a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectAltName {
    /// DNS name.
    Dns(String),
    /// IP address.
    Ip(IpAddr),
}

/// The parts of an X.509 name this crate reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistinguishedName {
    /// Common name, empty when absent.
    pub common_name: String,
    /// Organization values in order of appearance.
    pub organization: Vec<String>,
}

impl DistinguishedName {
    fn from_x509(name: &x509_parser::x509::X509Name<'_>) -> Result<Self> {
        let common_name = match name.iter_common_name().next() {
            Some(attr) => attr
                .as_str()
                .map(String::from)
                .map_err(|e| Error::Parse(format!("failed to parse CN: {e}")))?,
            None => String::new(),
        };
        let organization = name
            .iter_organization()
            .filter_map(|attr| attr.as_str().ok().map(String::from))
            .collect();

        Ok(Self {
            common_name,
            organization,
        })
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", self.common_name)?;
        for org in &self.organization {
            write!(f, ",O={org}")?;
        }
        Ok(())
    }
}

/// A DER-encoded X.509 certificate with the fields this crate inspects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// DER-encoded certificate bytes.
    der: Vec<u8>,
    /// Big-endian serial number without leading zero bytes.
    serial: Vec<u8>,
    /// Certificate validity start time.
    not_before: DateTime<Utc>,
    /// Certificate validity end time.
    not_after: DateTime<Utc>,
    /// Subject name.
    subject: DistinguishedName,
    /// Issuer name.
    issuer: DistinguishedName,
    /// Subject alternative names.
    san: Vec<SubjectAltName>,
    /// Basic constraints CA flag.
    is_ca: bool,
    /// Key usage bits.
    key_usages: Vec<KeyUsagePurpose>,
    /// Extended key usages.
    extended_key_usages: Vec<ExtendedKeyUsage>,
}

impl Certificate {
    /// Creates a certificate record from raw DER bytes and a validity window.
    ///
    /// No parsing takes place; the remaining fields start out empty. Useful
    /// for scheduling decisions that only depend on the validity window.
    #[must_use]
    pub fn new(
        der: Vec<u8>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        subject: DistinguishedName,
        issuer: DistinguishedName,
    ) -> Self {
        Self {
            der,
            serial: Vec::new(),
            not_before,
            not_after,
            subject,
            issuer,
            san: Vec::new(),
            is_ca: false,
            key_usages: Vec::new(),
            extended_key_usages: Vec::new(),
        }
    }

    /// Parses a certificate from DER-encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the bytes are not a well-formed certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        use x509_parser::prelude::{FromDer, X509Certificate};

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Parse(format!("failed to parse certificate: {e}")))?;

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| Error::Parse("invalid not_before timestamp".into()))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::Parse("invalid not_after timestamp".into()))?;

        let serial = strip_leading_zeros(cert.raw_serial());
        let subject = DistinguishedName::from_x509(cert.subject())?;
        let issuer = DistinguishedName::from_x509(cert.issuer())?;
        let san = extract_san(&cert);

        let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

        let mut key_usages = Vec::new();
        if let Ok(Some(ku)) = cert.key_usage() {
            let ku = ku.value;
            if ku.digital_signature() {
                key_usages.push(KeyUsagePurpose::DigitalSignature);
            }
            if ku.key_encipherment() {
                key_usages.push(KeyUsagePurpose::KeyEncipherment);
            }
            if ku.key_cert_sign() {
                key_usages.push(KeyUsagePurpose::KeyCertSign);
            }
            if ku.crl_sign() {
                key_usages.push(KeyUsagePurpose::CrlSign);
            }
        }

        let mut extended_key_usages = Vec::new();
        if let Ok(Some(eku)) = cert.extended_key_usage() {
            let eku = eku.value;
            for (present, usage) in [
                (eku.any, ExtendedKeyUsage::Any),
                (eku.server_auth, ExtendedKeyUsage::ServerAuth),
                (eku.client_auth, ExtendedKeyUsage::ClientAuth),
                (eku.code_signing, ExtendedKeyUsage::CodeSigning),
                (eku.email_protection, ExtendedKeyUsage::EmailProtection),
            ] {
                if present {
                    extended_key_usages.push(usage);
                }
            }
        }

        Ok(Self {
            der: der.to_vec(),
            serial,
            not_before,
            not_after,
            subject,
            issuer,
            san,
            is_ca,
            key_usages,
            extended_key_usages,
        })
    }

    /// Returns the DER-encoded certificate bytes.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    #[must_use]
    pub fn pem(&self) -> String {
        crate::codec::encode_certificate(self)
    }

    /// Returns the big-endian serial number bytes.
    #[must_use]
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Returns the serial number if it fits in 64 bits.
    #[must_use]
    pub fn serial_u64(&self) -> Option<u64> {
        if self.serial.len() > 8 {
            return None;
        }
        Some(
            self.serial
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        )
    }

    /// Returns the certificate validity start time.
    #[must_use]
    pub const fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// Returns the certificate validity end time.
    #[must_use]
    pub const fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Returns the subject name.
    #[must_use]
    pub const fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    /// Returns the issuer name.
    #[must_use]
    pub const fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    /// Returns the subject alternative names.
    #[must_use]
    pub fn san(&self) -> &[SubjectAltName] {
        &self.san
    }

    /// Returns the DNS subject alternative names, in certificate order.
    pub fn dns_names(&self) -> impl Iterator<Item = &str> {
        self.san.iter().filter_map(|san| match san {
            SubjectAltName::Dns(dns) => Some(dns.as_str()),
            SubjectAltName::Ip(_) => None,
        })
    }

    /// Returns the IP subject alternative names, in certificate order.
    pub fn ip_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.san.iter().filter_map(|san| match san {
            SubjectAltName::Ip(ip) => Some(*ip),
            SubjectAltName::Dns(_) => None,
        })
    }

    /// Returns whether the basic constraints mark this certificate as a CA.
    #[must_use]
    pub const fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Returns the key usage bits.
    #[must_use]
    pub fn key_usages(&self) -> &[KeyUsagePurpose] {
        &self.key_usages
    }

    /// Returns the extended key usages.
    #[must_use]
    pub fn extended_key_usages(&self) -> &[ExtendedKeyUsage] {
        &self.extended_key_usages
    }

    /// Returns whether the certificate names itself as its issuer.
    #[must_use]
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

/// Extracts SANs from a certificate.
fn extract_san(cert: &x509_parser::certificate::X509Certificate<'_>) -> Vec<SubjectAltName> {
    let mut sans = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                x509_parser::extensions::GeneralName::DNSName(dns) => {
                    sans.push(SubjectAltName::Dns((*dns).to_string()));
                }
                x509_parser::extensions::GeneralName::IPAddress(ip_bytes) => {
                    if let Some(ip) = parse_ip_bytes(ip_bytes) {
                        sans.push(SubjectAltName::Ip(ip));
                    }
                }
                _ => {}
            }
        }
    }

    sans
}

/// Parses IP address bytes into an `IpAddr`.
fn parse_ip_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn name(cn: &str) -> DistinguishedName {
        DistinguishedName {
            common_name: cn.into(),
            organization: Vec::new(),
        }
    }

    #[test]
    fn config_builder_collects_fields() {
        let cfg = Config::new("webhook.default.svc")
            .organization("acme")
            .dns("webhook.default.svc")
            .ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .server_auth()
            .client_auth();

        assert_eq!(cfg.common_name, "webhook.default.svc");
        assert_eq!(cfg.organization, vec!["acme".to_string()]);
        assert_eq!(cfg.alt_names.dns_names, vec!["webhook.default.svc".to_string()]);
        assert_eq!(cfg.alt_names.ips.len(), 1);
        assert_eq!(
            cfg.usages,
            vec![ExtendedKeyUsage::ServerAuth, ExtendedKeyUsage::ClientAuth]
        );
    }

    #[test]
    fn leaf_validation_requires_common_name() {
        let err = Config::new("").server_auth().validate_for_leaf().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn leaf_validation_requires_usages() {
        let err = Config::new("svc").validate_for_leaf().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn leaf_validation_accepts_complete_config() {
        assert!(Config::new("svc").server_auth().validate_for_leaf().is_ok());
    }

    #[test]
    fn subject_copies_name_fields() {
        let cfg = Config::new("svc").organization("o1").organization("o2");
        let subject = cfg.subject();
        assert_eq!(subject.common_name, "svc");
        assert_eq!(subject.organization, vec!["o1".to_string(), "o2".to_string()]);
        assert_eq!(subject.to_string(), "CN=svc,O=o1,O=o2");
    }

    #[test]
    fn extended_key_usage_oids() {
        assert_eq!(ExtendedKeyUsage::ServerAuth.oid(), "1.3.6.1.5.5.7.3.1");
        assert_eq!(ExtendedKeyUsage::ClientAuth.oid(), "1.3.6.1.5.5.7.3.2");
        assert_eq!(ExtendedKeyUsage::Any.oid(), "2.5.29.37.0");
    }

    #[test]
    fn synthetic_certificate_accessors() {
        let now = Utc::now();
        let later = now + chrono::Duration::hours(100);
        let cert = Certificate::new(vec![1, 2, 3], now, later, name("leaf"), name("ca"));

        assert_eq!(cert.der(), &[1, 2, 3]);
        assert_eq!(cert.not_before(), now);
        assert_eq!(cert.not_after(), later);
        assert_eq!(cert.subject().common_name, "leaf");
        assert_eq!(cert.issuer().common_name, "ca");
        assert!(!cert.is_ca());
        assert!(!cert.is_self_issued());
        assert!(cert.san().is_empty());
        assert_eq!(cert.serial_u64(), Some(0));
    }

    #[test]
    fn serial_u64_rejects_wide_serials() {
        let mut cert = Certificate::new(vec![], Utc::now(), Utc::now(), name("a"), name("a"));
        cert.serial = vec![0x01, 0x02];
        assert_eq!(cert.serial_u64(), Some(0x0102));
        cert.serial = vec![0xff; 9];
        assert_eq!(cert.serial_u64(), None);
    }

    #[test]
    fn strip_leading_zeros_keeps_significant_bytes() {
        assert_eq!(strip_leading_zeros(&[0, 0, 1, 0]), vec![1, 0]);
        assert!(strip_leading_zeros(&[0, 0]).is_empty());
    }

    #[test]
    fn parse_ip_bytes_handles_both_families() {
        assert_eq!(
            parse_ip_bytes(&[127, 0, 0, 1]),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert!(parse_ip_bytes(&[0; 16]).is_some());
        assert_eq!(parse_ip_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn from_der_rejects_garbage() {
        let err = Certificate::from_der(&[0x30, 0x03, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn config_serialization() {
        let cfg = Config::new("svc").dns("svc.ns.svc").server_auth();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
