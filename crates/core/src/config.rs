//! TOML-based configuration for mapsync.
//!
//! Every section and key has a default, so an empty file (or no file at
//! all, via [`AppConfig::default`]) is a valid configuration.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflict::merger::UserFormatter;
use crate::conflict::reconciler::DEFAULT_CHUNK_SIZE;
use crate::conflict::resolver::ChoiceKind;
use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Save attempt behaviour.
    #[serde(default)]
    pub save: SaveConfig,

    /// Remote authority presentation settings.
    #[serde(default)]
    pub remote: RemoteConfig,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Settings for reload, conflict presentation, and the outgoing changeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    /// Ids per reload request.
    #[serde(default = "default_chunk_size")]
    pub reload_chunk_size: usize,

    /// Choice pre-selected on every new conflict.
    #[serde(default)]
    pub default_choice: ChoiceKind,

    /// Tag keys stripped from the outgoing change set.
    #[serde(default = "default_discardable_tags")]
    pub discardable_tags: Vec<String>,

    /// `created_by` value attached to every changeset.
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_discardable_tags() -> Vec<String> {
    [
        "created_by",
        "odbl",
        "odbl:note",
        "tiger:upload_uuid",
        "tiger:tlid",
        "tiger:source",
        "tiger:separated",
        "geobase:datasetName",
        "geobase:uuid",
        "sub_sea:type",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_created_by() -> String {
    format!("mapsync {}", env!("CARGO_PKG_VERSION"))
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            reload_chunk_size: default_chunk_size(),
            default_choice: ChoiceKind::default(),
            discardable_tags: default_discardable_tags(),
            created_by: default_created_by(),
        }
    }
}

impl SaveConfig {
    pub fn is_discardable(&self, key: &str) -> bool {
        self.discardable_tags.iter().any(|k| k == key)
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Template for rendering remote user names in conflict details; `{user}`
    /// is replaced with the name. Plain names are shown when unset.
    #[serde(default)]
    pub user_url_template: Option<String>,
}

impl RemoteConfig {
    pub fn user_formatter(&self) -> Option<UserFormatter> {
        let template = self.user_url_template.clone()?;
        Some(Arc::new(move |user: &str| {
            format!("{user} ({})", template.replace("{user}", user))
        }))
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save.reload_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "save.reload_chunk_size".into(),
                detail: "reload chunk size must be > 0".into(),
            });
        }
        if let Some(template) = &self.remote.user_url_template {
            if !template.contains("{user}") {
                return Err(ConfigError::InvalidValue {
                    field: "remote.user_url_template".into(),
                    detail: "template must contain a {user} placeholder".into(),
                });
            }
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
