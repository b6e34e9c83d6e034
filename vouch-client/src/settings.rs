//! Settings / Configuration.
//!
//! Loaded in layers: the values of [`Settings::default`], then the config
//! file, then environment variables such as
//! `VOUCH_AUTHORITY__API_ENDPOINT=https://api.example.com`.

use crate::paths::{config_file, default_session_file};
use anyhow::Result;
use config::{Config, ConfigError, Environment, File, Map, Source, Value, ValueKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

/// All settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// How to reach the authority
    pub authority: Authority,
    /// Timing and limits of the verification flows
    pub verification: Verification,
    /// Where state is persisted
    pub storage: Storage,
}

/// Authority API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authority {
    /// Base URL of the authority's data API
    pub api_endpoint: Url,
    /// Timeout of a single HTTP request, in milliseconds
    pub request_timeout_ms: u64,
}

/// Timing and limits of the verification flows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verification {
    /// Seconds between ownership poll cycles
    pub poll_interval_secs: u64,
    /// Seconds between manual ownership checks of the same account
    pub manual_cooldown_secs: u64,
    /// Failed manual checks before a reset is required
    pub max_manual_attempts: u32,
    /// Hours after which a pending account challenge is discarded
    pub challenge_ttl_hours: u64,
    /// Milliseconds to wait after re-issuing an email code before
    /// re-reading the user record
    pub resend_propagation_ms: u64,
    /// Milliseconds a fatal error is shown before going back to the start
    pub fatal_redirect_ms: u64,
    /// Upper bound for any single call to the authority, in milliseconds
    pub external_call_timeout_ms: u64,
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storage {
    /// The JSON file holding the session
    pub session_file: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            authority: Authority {
                api_endpoint: Url::parse("http://localhost:3000")
                    .expect("Valid hardcoded server URL"),
                request_timeout_ms: 10_000,
            },
            verification: Verification::default(),
            storage: Storage {
                session_file: default_session_file(),
            },
        }
    }
}

impl Default for Verification {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            manual_cooldown_secs: 30,
            max_manual_attempts: 3,
            challenge_ttl_hours: 24,
            resend_propagation_ms: 3_000,
            fatal_redirect_ms: 3_000,
            external_call_timeout_ms: 10_000,
        }
    }
}

impl Verification {
    /// Time between ownership poll cycles
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Time between manual ownership checks of the same account
    pub fn manual_cooldown(&self) -> Duration {
        Duration::from_secs(self.manual_cooldown_secs)
    }

    /// Age after which a pending account challenge is discarded
    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_hours * 60 * 60)
    }

    /// Wait after re-issuing an email code
    pub fn resend_propagation(&self) -> Duration {
        Duration::from_millis(self.resend_propagation_ms)
    }

    /// How long a fatal error is shown
    pub fn fatal_redirect(&self) -> Duration {
        Duration::from_millis(self.fatal_redirect_ms)
    }

    /// Upper bound for any single call to the authority
    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_millis(self.external_call_timeout_ms)
    }
}

impl Authority {
    /// Timeout of a single HTTP request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Settings {
    /// Load settings from the default config file location and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(config_file().as_deref())
    }

    /// Load settings from the given config file (if any) and the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(DefaultImplSource::<Settings>::new());

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let s = builder
            .add_source(
                Environment::with_prefix("VOUCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(s.try_deserialize()?)
    }
}

// Settings are loadable without any config file: `Settings::default()` is
// serialized to a `toml::Value` and converted into config's own value type,
// so it can act as the lowest layer.

struct DefaultImplSource<T>(PhantomData<T>);

impl<T> Clone for DefaultImplSource<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for DefaultImplSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DefaultImplSource").finish()
    }
}

impl<T> DefaultImplSource<T> {
    fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Source for DefaultImplSource<T>
where
    T: Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let toml_value =
            toml::Value::try_from(T::default()).map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        match from_toml_value(&toml_value).kind {
            ValueKind::Table(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

fn from_toml_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(value) => Value::new(None, value.to_string()),
        toml::Value::Float(value) => Value::new(None, *value),
        toml::Value::Integer(value) => Value::new(None, *value),
        toml::Value::Boolean(value) => Value::new(None, *value),
        toml::Value::Table(table) => Value::new(
            None,
            table
                .iter()
                .map(|(key, value)| (key.clone(), from_toml_value(value)))
                .collect::<Map<_, _>>(),
        ),
        toml::Value::Array(array) => Value::new(
            None,
            array.iter().map(from_toml_value).collect::<Vec<_>>(),
        ),
        toml::Value::Datetime(datetime) => Value::new(None, datetime.to_string()),
    }
}
