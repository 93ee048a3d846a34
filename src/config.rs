//! Sequencer configuration
//!
//! Read from `deploy-scripts.toml`; every field has a default so a missing
//! file is not an error. `DEPLOY_SCRIPTS_DATABASE` overrides the database
//! path.

use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, ScriptError};
use crate::identity::IdentityParser;
use crate::storage::DEFAULT_TABLE;

pub const CONFIG_FILE: &str = "deploy-scripts.toml";
pub const DATABASE_ENV: &str = "DEPLOY_SCRIPTS_DATABASE";

/// How the next script version is chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Numbering {
    /// `last + 1`
    #[default]
    Sequential,
    /// UTC `YYYYMMDDHHMMSS`, or `last + 1` if that is larger
    Timestamp,
}

impl Numbering {
    /// Fails with [`ScriptError::VersionOverflow`] when `last` is `u64::MAX`
    pub fn next_version(&self, last: u64) -> Result<u64> {
        let next = last.checked_add(1).ok_or(ScriptError::VersionOverflow(last))?;
        Ok(match self {
            Numbering::Sequential => next,
            Numbering::Timestamp => {
                let now = Utc::now();
                let stamp = now.year() as u64 * 10_000_000_000
                    + now.month() as u64 * 100_000_000
                    + now.day() as u64 * 1_000_000
                    + now.hour() as u64 * 10_000
                    + now.minute() as u64 * 100
                    + now.second() as u64;
                stamp.max(next)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Script directories, scanned in order
    pub sources: Vec<PathBuf>,
    /// Script file extension, without the dot
    pub extension: String,
    /// SQLite database holding the tracking table
    pub database: PathBuf,
    pub table_name: String,
    pub numbering: Numbering,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: vec![PathBuf::from("post_deploy_scripts")],
            extension: "sql".to_string(),
            database: PathBuf::from("db/deploy_scripts.sqlite3"),
            table_name: DEFAULT_TABLE.to_string(),
            numbering: Numbering::Sequential,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ScriptError::io(format!("read {}", path.display()), e))?;
            Self::from_toml_str(&content)?
        } else {
            Self::default()
        };

        if let Ok(database) = std::env::var(DATABASE_ENV) {
            if !database.trim().is_empty() {
                config.database = PathBuf::from(database);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ScriptError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(ScriptError::Config("at least one script source is required".into()));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(ScriptError::Config("script extension must not be empty".into()));
        }
        if self.table_name.trim().is_empty() {
            return Err(ScriptError::Config("table_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn parser(&self) -> IdentityParser {
        IdentityParser::new(&self.extension)
    }

    /// Directory new scripts are written to
    pub fn primary_source(&self) -> Result<&Path> {
        self.sources
            .first()
            .map(PathBuf::as_path)
            .ok_or_else(|| ScriptError::Config("at least one script source is required".into()))
    }
}
