//! PEM encoding and decoding of keys and certificates.

use p256::pkcs8::DecodePrivateKey as _;
use pem::{EncodeConfig, LineEnding, Pem};
use rsa::pkcs1::{DecodeRsaPrivateKey as _, EncodeRsaPrivateKey as _};
use rsa::RsaPrivateKey;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::keys::PrivateKey;
use crate::types::Certificate;

/// PEM block type of a SEC1 elliptic-curve private key.
pub const EC_PRIVATE_KEY_BLOCK_TYPE: &str = "EC PRIVATE KEY";
/// PEM block type of a PKCS#1 RSA private key.
pub const RSA_PRIVATE_KEY_BLOCK_TYPE: &str = "RSA PRIVATE KEY";
/// PEM block type of a PKCS#8 private key.
pub const PRIVATE_KEY_BLOCK_TYPE: &str = "PRIVATE KEY";
/// PEM block type of an X.509 certificate.
pub const CERTIFICATE_BLOCK_TYPE: &str = "CERTIFICATE";

fn encode_config() -> EncodeConfig {
    EncodeConfig::new().set_line_ending(LineEnding::LF)
}

/// Encodes a private key as a PEM block.
///
/// P-256 keys become `EC PRIVATE KEY` blocks and RSA keys `RSA PRIVATE KEY`
/// blocks. The output is deterministic for a given key.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the key cannot be serialized.
pub fn encode_private_key(key: &PrivateKey) -> Result<String> {
    let (tag, der) = match key {
        PrivateKey::EcdsaP256(ec) => {
            let der = ec
                .to_sec1_der()
                .map_err(|e| Error::Parse(format!("failed to encode EC private key: {e}")))?;
            (EC_PRIVATE_KEY_BLOCK_TYPE, der)
        }
        PrivateKey::Rsa(rsa) => {
            let doc = rsa
                .to_pkcs1_der()
                .map_err(|e| Error::Parse(format!("failed to encode RSA private key: {e}")))?;
            (RSA_PRIVATE_KEY_BLOCK_TYPE, Zeroizing::new(doc.as_bytes().to_vec()))
        }
    };

    let block = Pem::new(tag, der.to_vec());
    Ok(pem::encode_config(&block, encode_config()))
}

/// Decodes the first private key found in `data`.
///
/// Accepts `EC PRIVATE KEY`, `RSA PRIVATE KEY` and `PRIVATE KEY` blocks and
/// skips any other block (such as `EC PARAMETERS`).
///
/// # Errors
///
/// Returns [`Error::Parse`] on malformed PEM, a malformed key, or input
/// without any private key block.
pub fn decode_private_key(data: &[u8]) -> Result<PrivateKey> {
    let blocks =
        pem::parse_many(data).map_err(|e| Error::Parse(format!("malformed PEM data: {e}")))?;

    for block in &blocks {
        match block.tag() {
            EC_PRIVATE_KEY_BLOCK_TYPE => {
                let key = p256::SecretKey::from_sec1_der(block.contents())
                    .map_err(|e| Error::Parse(format!("invalid EC private key: {e}")))?;
                return Ok(PrivateKey::from(key));
            }
            RSA_PRIVATE_KEY_BLOCK_TYPE => {
                let key = RsaPrivateKey::from_pkcs1_der(block.contents())
                    .map_err(|e| Error::Parse(format!("invalid RSA private key: {e}")))?;
                return Ok(PrivateKey::from(key));
            }
            PRIVATE_KEY_BLOCK_TYPE => return decode_pkcs8(block.contents()),
            other => debug!(block_type = other, "skipping non-key PEM block"),
        }
    }

    Err(Error::Parse(
        "data does not contain a valid RSA or ECDSA private key".into(),
    ))
}

fn decode_pkcs8(der: &[u8]) -> Result<PrivateKey> {
    if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
        return Ok(PrivateKey::from(key));
    }
    RsaPrivateKey::from_pkcs8_der(der)
        .map(PrivateKey::from)
        .map_err(|e| Error::Parse(format!("invalid PKCS#8 private key: {e}")))
}

/// Encodes a certificate as a `CERTIFICATE` PEM block.
#[must_use]
pub fn encode_certificate(cert: &Certificate) -> String {
    let block = Pem::new(CERTIFICATE_BLOCK_TYPE, cert.der().to_vec());
    pem::encode_config(&block, encode_config())
}

/// Encodes certificates as concatenated `CERTIFICATE` blocks, in order.
#[must_use]
pub fn encode_certificates(certs: &[Certificate]) -> String {
    certs.iter().map(encode_certificate).collect()
}

/// Decodes every `CERTIFICATE` block in `data`, preserving input order.
///
/// Blocks of other types are skipped.
///
/// # Errors
///
/// Returns [`Error::Parse`] on malformed PEM, when a certificate block does
/// not hold a well-formed certificate, or when no certificate block exists.
pub fn decode_certificates(data: &[u8]) -> Result<Vec<Certificate>> {
    let blocks =
        pem::parse_many(data).map_err(|e| Error::Parse(format!("malformed PEM data: {e}")))?;

    let certs = blocks
        .iter()
        .filter(|block| block.tag() == CERTIFICATE_BLOCK_TYPE)
        .map(|block| Certificate::from_der(block.contents()))
        .collect::<Result<Vec<_>>>()?;

    if certs.is_empty() {
        return Err(Error::Parse(
            "data does not contain any valid RSA or ECDSA certificates".into(),
        ));
    }

    Ok(certs)
}
