//! Directory-backed resource store and trust publisher.
//!
//! Layout per identity, under `<root>/<namespace>/<name>/<kind>/`:
//!
//! ```text
//! ..<uuid>/tls.key
//! ..<uuid>/tls.crt
//! ..data -> ..<uuid>
//! tls.key -> ..data/tls.key
//! tls.crt -> ..data/tls.crt
//! ca-bundle.crt
//! ```
//!
//! Key and certificate are switched together by renaming a new `..data`
//! symlink over the old one, so readers following `tls.key`/`tls.crt`
//! never see a key from one generation with a certificate from another.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::WebhookIdentity;
use crate::store::{ResourceStore, TlsMaterial, TrustPublisher};

/// File name of the private key.
pub const KEY_FILE: &str = "tls.key";
/// File name of the certificate chain.
pub const CERT_FILE: &str = "tls.crt";
/// File name of the CA bundle.
pub const CA_BUNDLE_FILE: &str = "ca-bundle.crt";

const DATA_LINK: &str = "..data";
const DATA_LINK_TMP: &str = "..data_tmp";

/// Stores TLS material and CA bundles as files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Creates a store rooted at `root`. Directories are created on write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding material for `identity`.
    #[must_use]
    pub fn identity_dir(&self, identity: &WebhookIdentity) -> PathBuf {
        self.root
            .join(&identity.namespace)
            .join(&identity.name)
            .join(identity.kind.to_string())
    }

    async fn write_version(dir: &Path, material: &TlsMaterial) -> Result<String> {
        let version = format!("..{}", Uuid::new_v4().simple());
        let version_dir = dir.join(&version);
        fs::create_dir_all(&version_dir)
            .await
            .map_err(|e| io_error("create", &version_dir, &e))?;

        let key_path = version_dir.join(KEY_FILE);
        fs::write(&key_path, &material.key_pem)
            .await
            .map_err(|e| io_error("write", &key_path, &e))?;
        fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| io_error("chmod", &key_path, &e))?;

        let cert_path = version_dir.join(CERT_FILE);
        fs::write(&cert_path, &material.cert_pem)
            .await
            .map_err(|e| io_error("write", &cert_path, &e))?;

        Ok(version)
    }

    async fn ensure_user_link(dir: &Path, file: &str) -> Result<()> {
        let link = dir.join(file);
        match fs::symlink_metadata(&link).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::symlink(Path::new(DATA_LINK).join(file), &link)
                    .await
                    .map_err(|e| io_error("link", &link, &e))
            }
            Err(e) => Err(io_error("stat", &link, &e)),
        }
    }
}

fn io_error(op: &str, path: &Path, err: &std::io::Error) -> Error {
    Error::StoreIo(format!("failed to {op} {}: {err}", path.display()))
}

async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl ResourceStore for DirectoryStore {
    async fn get(&self, identity: &WebhookIdentity) -> Result<Option<TlsMaterial>> {
        let dir = self.identity_dir(identity);
        let data_link = dir.join(DATA_LINK);

        // Resolve the link once so both files come from the same version.
        let version = match fs::read_link(&data_link).await {
            Ok(target) => dir.join(target),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read link", &data_link, &e)),
        };

        let key_path = version.join(KEY_FILE);
        let cert_path = version.join(CERT_FILE);
        let key_pem = read_optional(&key_path)
            .await
            .map_err(|e| io_error("read", &key_path, &e))?;
        let cert_pem = read_optional(&cert_path)
            .await
            .map_err(|e| io_error("read", &cert_path, &e))?;

        match (key_pem, cert_pem) {
            (Some(key_pem), Some(cert_pem)) => Ok(Some(TlsMaterial { key_pem, cert_pem })),
            _ => {
                warn!(identity = %identity, "incomplete TLS material on disk");
                Ok(None)
            }
        }
    }

    async fn put(&self, identity: &WebhookIdentity, material: &TlsMaterial) -> Result<()> {
        let dir = self.identity_dir(identity);
        let data_link = dir.join(DATA_LINK);
        let tmp_link = dir.join(DATA_LINK_TMP);

        let previous = fs::read_link(&data_link).await.ok();
        let version = Self::write_version(&dir, material).await?;

        match fs::remove_file(&tmp_link).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("remove", &tmp_link, &e)),
        }
        fs::symlink(&version, &tmp_link)
            .await
            .map_err(|e| io_error("link", &tmp_link, &e))?;
        fs::rename(&tmp_link, &data_link)
            .await
            .map_err(|e| io_error("rename", &tmp_link, &e))?;

        Self::ensure_user_link(&dir, KEY_FILE).await?;
        Self::ensure_user_link(&dir, CERT_FILE).await?;

        if let Some(old) = previous.filter(|old| old.as_os_str() != version.as_str()) {
            let old_dir = dir.join(old);
            if let Err(e) = fs::remove_dir_all(&old_dir).await {
                warn!(path = %old_dir.display(), error = %e, "failed to remove old TLS material");
            }
        }

        info!(identity = %identity, version = %version, "wrote TLS material");
        Ok(())
    }
}

impl TrustPublisher for DirectoryStore {
    async fn get_bundle(&self, identity: &WebhookIdentity) -> Result<Option<Vec<u8>>> {
        let path = self.identity_dir(identity).join(CA_BUNDLE_FILE);
        read_optional(&path)
            .await
            .map_err(|e| Error::PublishIo(format!("failed to read {}: {e}", path.display())))
    }

    async fn put_bundle(&self, identity: &WebhookIdentity, ca_bundle: &[u8]) -> Result<()> {
        let dir = self.identity_dir(identity);
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::PublishIo(format!("failed to create {}: {e}", dir.display()))
        })?;

        let path = dir.join(CA_BUNDLE_FILE);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, ca_bundle).await.map_err(|e| {
            Error::PublishIo(format!("failed to write {}: {e}", temp_path.display()))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            Error::PublishIo(format!(
                "failed to rename {} to {}: {e}",
                temp_path.display(),
                path.display()
            ))
        })?;

        debug!(identity = %identity, path = %path.display(), "published CA bundle");
        Ok(())
    }
}
