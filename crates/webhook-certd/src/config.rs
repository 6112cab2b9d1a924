//! Daemon configuration.
//!
//! A JSON document naming the output directory, the shared rotation
//! settings, and the webhooks whose certificates are managed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use webhook_certs::{Error, Result, RotationConfig, WebhookIdentity, WebhookKind};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Directory under which each webhook's key, certificate and bundle live.
    pub output_dir: PathBuf,
    /// Rotation settings applied to every webhook.
    #[serde(default)]
    pub rotation: RotationConfig,
    /// Webhooks to manage.
    pub webhooks: Vec<WebhookIdentity>,
}

impl DaemonConfig {
    /// Load and validate configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is invalid or validation fails.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!(
                    "failed to create config directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }

        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "failed to write config file '{}': {e}",
                path.display()
            ))
        })
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::Config("output_dir cannot be empty".to_string()));
        }

        if self.webhooks.is_empty() {
            return Err(Error::Config(
                "at least one webhook must be configured".to_string(),
            ));
        }

        self.rotation.validate()?;

        let mut seen = HashSet::new();
        for webhook in &self.webhooks {
            webhook.validate()?;
            if !seen.insert(webhook) {
                return Err(Error::Config(format!("duplicate webhook {webhook}")));
            }
        }

        Ok(())
    }

    /// A sample configuration managing a single mutating webhook.
    pub fn sample() -> Self {
        Self {
            output_dir: PathBuf::from("/var/lib/webhook-certd"),
            rotation: RotationConfig::default(),
            webhooks: vec![WebhookIdentity::new(
                "my-webhook",
                "default",
                WebhookKind::Mutating,
            )],
        }
    }
}
