//! Private key generation.
//!
//! Certificates are signed with RSA keys; a standalone P-256 key can be
//! minted for consumers that only need a bare PEM private key.

use p256::pkcs8::EncodePrivateKey as _;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Modulus size of certificate signing keys, in bits.
pub const RSA_KEY_SIZE: usize = 2048;

/// Algorithm of a [`PrivateKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSA with a [`RSA_KEY_SIZE`]-bit modulus (or whatever was decoded).
    Rsa,
    /// ECDSA over NIST P-256.
    EcdsaP256,
}

/// A private key with secure memory handling.
///
/// The underlying key types wipe their secret material when dropped.
#[derive(Clone)]
pub enum PrivateKey {
    /// RSA private key.
    Rsa(Box<RsaPrivateKey>),
    /// NIST P-256 private key.
    EcdsaP256(p256::SecretKey),
}

impl PrivateKey {
    /// Returns the key algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Rsa(_) => KeyAlgorithm::Rsa,
            Self::EcdsaP256(_) => KeyAlgorithm::EcdsaP256,
        }
    }

    /// Serializes the key as a PKCS#8 document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] if the encoder fails.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let doc = match self {
            Self::Rsa(key) => key.to_pkcs8_der(),
            Self::EcdsaP256(key) => key.to_pkcs8_der(),
        }
        .map_err(|e| Error::Signing(format!("failed to encode private key as PKCS#8: {e}")))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// Converts the key into an rcgen signing key pair.
    pub(crate) fn to_rcgen(&self) -> Result<rcgen::KeyPair> {
        let der = self.to_pkcs8_der()?;
        rcgen::KeyPair::try_from(der.as_slice())
            .map_err(|e| Error::Signing(format!("failed to load signing key: {e}")))
    }

    /// Signs `message` with the key.
    ///
    /// RSA keys use PKCS#1 v1.5 with SHA-256 and P-256 keys use RFC 6979
    /// deterministic ECDSA, so the same key always yields the same
    /// signature for the same input.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Rsa(key) => {
                use rsa::signature::{SignatureEncoding, Signer};
                let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new((**key).clone());
                signer.sign(message).to_vec()
            }
            Self::EcdsaP256(key) => {
                use p256::ecdsa::signature::Signer;
                let signer = p256::ecdsa::SigningKey::from(key);
                let signature: p256::ecdsa::Signature = signer.sign(message);
                signature.to_der().as_bytes().to_vec()
            }
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl From<RsaPrivateKey> for PrivateKey {
    fn from(key: RsaPrivateKey) -> Self {
        Self::Rsa(Box::new(key))
    }
}

impl From<p256::SecretKey> for PrivateKey {
    fn from(key: p256::SecretKey) -> Self {
        Self::EcdsaP256(key)
    }
}

/// Generates an RSA key pair for signing certificates.
///
/// # Errors
///
/// Returns [`Error::KeyGeneration`] if the random source or the generator
/// fails.
pub fn new_signing_key_pair() -> Result<PrivateKey> {
    let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_SIZE)
        .map_err(|e| Error::KeyGeneration(format!("failed to generate RSA key: {e}")))?;
    debug!(bits = RSA_KEY_SIZE, "generated RSA signing key");
    Ok(PrivateKey::from(key))
}

/// Generates a P-256 private key meant to be exported on its own.
///
/// # Errors
///
/// Kept fallible to match [`new_signing_key_pair`]; P-256 generation itself
/// cannot fail once the OS random source is available.
pub fn new_standalone_private_key() -> Result<PrivateKey> {
    let key = p256::SecretKey::random(&mut OsRng);
    debug!("generated P-256 private key");
    Ok(PrivateKey::from(key))
}

/// Generates a P-256 private key and returns it as an `EC PRIVATE KEY` PEM block.
///
/// # Errors
///
/// Returns an error if generation or encoding fails.
pub fn make_elliptic_private_key_pem() -> Result<String> {
    let key = new_standalone_private_key()?;
    crate::codec::encode_private_key(&key)
}
