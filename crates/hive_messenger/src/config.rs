//! Messenger configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MessengerError;
use crate::identity::PeerId;

/// Environment override for [`MessengerConfig::beacon_interval`].
pub const ENV_BEACON_INTERVAL_MS: &str = "HIVE_MESSENGER_BEACON_INTERVAL_MS";
/// Environment override for [`MessengerConfig::recovery_timeout`].
pub const ENV_RECOVERY_TIMEOUT_MS: &str = "HIVE_MESSENGER_RECOVERY_TIMEOUT_MS";
/// Environment override for [`MessengerConfig::debug`].
pub const ENV_DEBUG: &str = "HIVE_MESSENGER_DEBUG";

/// Construction-time configuration for a [`Messenger`](crate::Messenger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Logical role of this instance. Traffic from the same context is an
    /// echo and is ignored.
    pub context: String,

    /// Own identifier. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PeerId>,

    /// Interval between presence beacons.
    #[serde(
        rename = "beacon_interval_ms",
        with = "duration_ms",
        default = "default_beacon_interval"
    )]
    pub beacon_interval: Duration,

    /// How long a lost-events request may stay unanswered before the next
    /// gap is allowed to re-issue it.
    #[serde(
        rename = "recovery_timeout_ms",
        with = "duration_ms",
        default = "default_recovery_timeout"
    )]
    pub recovery_timeout: Duration,

    /// Verbose protocol logging (discovery, gaps, replays).
    #[serde(default)]
    pub debug: bool,
}

fn default_beacon_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_recovery_timeout() -> Duration {
    Duration::from_millis(5000)
}

impl MessengerConfig {
    /// Config for `context` with every other field at its default.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            id: None,
            beacon_interval: default_beacon_interval(),
            recovery_timeout: default_recovery_timeout(),
            debug: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<PeerId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_beacon_interval(mut self, interval: Duration) -> Self {
        self.beacon_interval = interval;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<(), MessengerError> {
        if self.context.trim().is_empty() {
            return Err(MessengerError::Config("context must not be empty".into()));
        }
        if self.id.as_ref().is_some_and(|id| id.as_str().is_empty()) {
            return Err(MessengerError::Config("id must not be empty".into()));
        }
        if self.beacon_interval.is_zero() {
            return Err(MessengerError::Config(
                "beacon interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Apply `HIVE_MESSENGER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup(ENV_BEACON_INTERVAL_MS).and_then(|s| s.parse::<u64>().ok()) {
            self.beacon_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup(ENV_RECOVERY_TIMEOUT_MS).and_then(|s| s.parse::<u64>().ok()) {
            self.recovery_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup(ENV_DEBUG) {
            match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.debug = true,
                "0" | "false" | "no" | "off" => self.debug = false,
                _ => {}
            }
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MessengerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, MessengerError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load config from a JSON file, or fall back to `new(context)` if the
    /// file is missing or unreadable.
    pub fn load_or(path: &Path, context: impl Into<String>) -> Self {
        if path.exists() {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("Unusable messenger config, using defaults: {e}"),
            }
        }
        Self::new(context)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
