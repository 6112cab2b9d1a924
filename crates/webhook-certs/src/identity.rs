//! Identity of a managed webhook.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Config;

/// Admission webhook configuration kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    /// A mutating admission webhook.
    Mutating,
    /// A validating admission webhook.
    Validating,
}

impl fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mutating => write!(f, "mutating"),
            Self::Validating => write!(f, "validating"),
        }
    }
}

/// The webhook a rotation manager owns certificates for.
///
/// Every collaborator call is keyed by this value, so managers for
/// different identities never touch each other's material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookIdentity {
    /// Service name of the webhook.
    pub name: String,
    /// Namespace the service lives in.
    pub namespace: String,
    /// Webhook configuration kind.
    pub kind: WebhookKind,
}

impl WebhookIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, kind: WebhookKind) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            kind,
        }
    }

    /// Checks that name and namespace are usable as DNS labels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty or non-DNS-label component.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("name", &self.name), ("namespace", &self.namespace)] {
            if value.is_empty() {
                return Err(Error::Config(format!("webhook {field} cannot be empty")));
            }
            let valid = value
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
                && !value.starts_with('-')
                && !value.ends_with('-');
            if !valid {
                return Err(Error::Config(format!(
                    "webhook {field} '{value}' is not a valid DNS label"
                )));
            }
        }
        Ok(())
    }

    /// Hostnames the webhook service answers on, most specific first.
    #[must_use]
    pub fn service_hostnames(&self) -> Vec<String> {
        let short = format!("{}.{}.svc", self.name, self.namespace);
        let full = format!("{short}.cluster.local");
        vec![short, full]
    }

    /// Subject config of the CA certificate.
    #[must_use]
    pub fn ca_config(&self, organization: &[String]) -> Config {
        Config {
            organization: organization.to_vec(),
            ..Config::new(format!("{}-ca", self.name))
        }
    }

    /// Subject config of the serving certificate.
    #[must_use]
    pub fn leaf_config(&self, organization: &[String]) -> Config {
        let hostnames = self.service_hostnames();
        let mut cfg = Config {
            organization: organization.to_vec(),
            ..Config::new(hostnames[0].clone())
        };
        cfg.alt_names.dns_names = hostnames;
        cfg.server_auth()
    }
}

impl fmt::Display for WebhookIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.kind)
    }
}
