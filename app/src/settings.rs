//! Reporter settings: TOML file, then command line and environment overrides.

use hub_actor::ActorIdentity;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::*;

pub const DEFAULT_ACTOR_PREFIX: &str = "reporter:";
pub const DEFAULT_NAME: &str = "reporter";
pub const DEFAULT_DESCRIPTION: &str = "Sends emergency reports to the hub";
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_SUFFIX_FILE: &str = ".reporter/actor_suffix";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("No hub address configured")]
    MissingServer,
    #[error("Actor suffix has not been resolved")]
    MissingSuffix,
    #[error(transparent)]
    Identity(#[from] hub_actor::Error),
}

pub trait Validate {
    fn validate(&self) -> Result<(), SettingsError>;
}

/// Fixed position attached to reports, `[latitude, longitude, altitude]` on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

impl Location {
    pub fn as_array(&self) -> [f64; 3] {
        [self.latitude, self.longitude, self.altitude]
    }
}

impl FromStr for Location {
    type Err = String;

    /// Parses `LAT,LON[,ALT]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid coordinate in {s:?}: {err}"))?;
        match parts[..] {
            [latitude, longitude] => Ok(Self {
                latitude,
                longitude,
                altitude: 0.0,
            }),
            [latitude, longitude, altitude] => Ok(Self {
                latitude,
                longitude,
                altitude,
            }),
            _ => Err(format!("expected LAT,LON[,ALT], got {s:?}")),
        }
    }
}

impl Validate for Location {
    fn validate(&self) -> Result<(), SettingsError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SettingsError::Invalid {
                field: "location.latitude",
                reason: format!("{} is outside [-90, 90]", self.latitude),
            });
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(SettingsError::Invalid {
                field: "location.longitude",
                reason: format!("{} is outside [-180, 180]", self.longitude),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: Option<String>,
    pub actor_prefix: String,
    pub actor_suffix: Option<String>,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub report_interval_secs: u64,
    pub phone_number: Option<String>,
    pub location: Option<Location>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: None,
            actor_prefix: DEFAULT_ACTOR_PREFIX.to_string(),
            actor_suffix: None,
            name: DEFAULT_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: Some(DEFAULT_DESCRIPTION.to_string()),
            report_interval_secs: DEFAULT_REPORT_INTERVAL_SECS,
            phone_number: None,
            location: None,
        }
    }
}

impl Settings {
    /// Reads `path` when given, otherwise starts from the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings = toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Fills in the actor suffix from `store` unless one is configured.
    pub fn resolve_suffix(&mut self, store: &SuffixStore) -> Result<(), SettingsError> {
        if self.actor_suffix.is_none() {
            self.actor_suffix = Some(store.load_or_create()?);
        }
        Ok(())
    }

    pub fn actor_key(&self) -> Result<String, SettingsError> {
        let suffix = self
            .actor_suffix
            .as_deref()
            .ok_or(SettingsError::MissingSuffix)?;
        Ok(format!("{}{}", self.actor_prefix, suffix))
    }

    /// The actor advertises its capabilities under its own name.
    pub fn identity(&self) -> Result<ActorIdentity, SettingsError> {
        let server = self
            .server
            .as_deref()
            .filter(|server| !server.trim().is_empty())
            .ok_or(SettingsError::MissingServer)?;
        let mut identity = ActorIdentity::new(
            server,
            self.actor_key()?,
            &self.name,
            &self.version,
            &self.name,
        );
        identity.description = self.description.clone();
        identity.validate()?;
        Ok(identity)
    }
}

impl Validate for Settings {
    fn validate(&self) -> Result<(), SettingsError> {
        if self.report_interval_secs == 0 {
            return Err(SettingsError::Invalid {
                field: "report_interval_secs",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.actor_prefix.is_empty() {
            return Err(SettingsError::Invalid {
                field: "actor_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(location) = &self.location {
            location.validate()?;
        }
        Ok(())
    }
}

/// Keeps the generated actor suffix across runs so the hub sees the same
/// actor key every time.
#[derive(Debug, Clone)]
pub struct SuffixStore {
    path: PathBuf,
}

impl SuffixStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_create(&self) -> Result<String, SettingsError> {
        let io_error = |source| SettingsError::Io {
            path: self.path.display().to_string(),
            source,
        };

        match fs::read_to_string(&self.path) {
            Ok(suffix) if !suffix.trim().is_empty() => return Ok(suffix.trim().to_string()),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(err)),
        }

        let suffix = rand::thread_rng().gen_range(0..=i32::MAX).to_string();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(&self.path, &suffix).map_err(io_error)?;
        info!(path = %self.path.display(), %suffix, "Generated actor suffix");
        Ok(suffix)
    }
}
