//! Rotation configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings shared by every rotation manager in a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RotationConfig {
    /// Requested validity of CA and leaf certificates, in seconds.
    pub cert_duration_secs: u64,
    /// Lower bound of the fraction of the validity window after which
    /// rotation happens.
    pub jitter_min_factor: f64,
    /// Upper bound of that fraction.
    pub jitter_max_factor: f64,
    /// Pause after a failed cycle before retrying, in seconds.
    pub retry_backoff_secs: u64,
    /// Organization of CA and leaf subjects.
    pub organization: Vec<String>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            cert_duration_secs: 365 * 24 * 60 * 60,
            jitter_min_factor: 0.7,
            jitter_max_factor: 0.9,
            retry_backoff_secs: 10,
            organization: Vec::new(),
        }
    }
}

impl RotationConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero duration or jitter bounds
    /// outside `(0, 1)` or out of order.
    pub fn validate(&self) -> Result<()> {
        if self.cert_duration_secs == 0 {
            return Err(Error::Config("cert_duration_secs must be positive".into()));
        }
        let Some(duration) = self.checked_cert_duration() else {
            return Err(Error::Config("cert_duration_secs is too large".into()));
        };
        if crate::ca::not_after(chrono::Utc::now(), duration).is_err() {
            return Err(Error::Config(format!(
                "cert_duration_secs {} expires past year 9999",
                self.cert_duration_secs
            )));
        }

        for (name, factor) in [
            ("jitter_min_factor", self.jitter_min_factor),
            ("jitter_max_factor", self.jitter_max_factor),
        ] {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(Error::Config(format!(
                    "{name} must be between 0 and 1 (exclusive), got {factor}"
                )));
            }
        }
        if self.jitter_min_factor > self.jitter_max_factor {
            return Err(Error::Config(format!(
                "jitter_min_factor ({}) exceeds jitter_max_factor ({})",
                self.jitter_min_factor, self.jitter_max_factor
            )));
        }
        Ok(())
    }

    /// Requested certificate validity.
    #[must_use]
    pub fn cert_duration(&self) -> chrono::Duration {
        self.checked_cert_duration().unwrap_or(chrono::Duration::MAX)
    }

    fn checked_cert_duration(&self) -> Option<chrono::Duration> {
        i64::try_from(self.cert_duration_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    /// Pause after a failed cycle.
    #[must_use]
    pub const fn retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_backoff_secs)
    }
}
