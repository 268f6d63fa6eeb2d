//! Session context configuration.
//!
//! Defaults match the production app; every field can be overridden through
//! `GREENIFY_*` environment variables or by embedding [`SessionConfig`] in a
//! host config file (it derives `Deserialize` with per-field defaults).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use greenify_core::{DomainError, DomainResult};

/// Local storage key whose presence means "guest mode".
pub const GUEST_MARKER_KEY: &str = "greenify_guest_user";

/// Value written under [`GUEST_MARKER_KEY`].
pub const GUEST_MARKER_VALUE: &str = "true";

pub const DEFAULT_AVATAR_URL: &str = "https://images.pexels.com/photos/1542085/pexels-photo-1542085.jpeg?auto=compress&cs=tinysrgb&w=150&h=150&dpr=1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub guest_marker_key: String,
    pub guest_email: String,
    pub guest_name: String,
    pub guest_location: String,

    /// Avatar used for guests and for freshly created profile records.
    pub default_avatar_url: String,

    /// How often the background listener drains session-change pushes.
    pub notification_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            guest_marker_key: GUEST_MARKER_KEY.to_string(),
            guest_email: "guest@greenify.com".to_string(),
            guest_name: "Guest User".to_string(),
            guest_location: "Exploring Greenify".to_string(),
            default_avatar_url: DEFAULT_AVATAR_URL.to_string(),
            notification_poll_ms: 250,
        }
    }
}

impl SessionConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (env-like).
    ///
    /// Unset keys fall back to defaults. An unparseable poll interval is
    /// logged and replaced by the default rather than rejected.
    pub fn from_lookup<F>(lookup: F) -> DomainResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("GREENIFY_GUEST_MARKER_KEY") {
            config.guest_marker_key = v;
        }
        if let Some(v) = lookup("GREENIFY_GUEST_EMAIL") {
            config.guest_email = v;
        }
        if let Some(v) = lookup("GREENIFY_GUEST_NAME") {
            config.guest_name = v;
        }
        if let Some(v) = lookup("GREENIFY_GUEST_LOCATION") {
            config.guest_location = v;
        }
        if let Some(v) = lookup("GREENIFY_DEFAULT_AVATAR_URL") {
            config.default_avatar_url = v;
        }
        if let Some(v) = lookup("GREENIFY_NOTIFICATION_POLL_MS") {
            match v.trim().parse::<u64>() {
                Ok(ms) => config.notification_poll_ms = ms,
                Err(err) => tracing::warn!(
                    value = %v,
                    error = %err,
                    "GREENIFY_NOTIFICATION_POLL_MS is not a number; using default"
                ),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.guest_marker_key.trim().is_empty() {
            return Err(DomainError::validation("guest marker key must not be empty"));
        }
        if self.notification_poll_ms == 0 {
            return Err(DomainError::validation(
                "notification poll interval must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn notification_poll_interval(&self) -> Duration {
        Duration::from_millis(self.notification_poll_ms)
    }
}
