//! Script registry
//!
//! Scans source directories for script files and keeps the descriptors sorted
//! by version. Directory traversal order never matters: the version sort is
//! the only ordering guarantee.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Result, ScriptError};
use crate::identity::{IdentityParser, ScriptIdentity};

/// Identity and location of one change script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDescriptor {
    pub version: u64,
    pub name: String,
    pub slug: String,
    pub scope: Option<String>,
    pub path: PathBuf,
}

impl ScriptDescriptor {
    pub fn new(identity: ScriptIdentity, path: PathBuf) -> Self {
        Self {
            version: identity.version,
            name: identity.name,
            slug: identity.slug,
            scope: identity.scope,
            path,
        }
    }

    /// Sentinel standing in for "no scripts": version 0, no content
    pub fn null() -> Self {
        Self {
            version: 0,
            name: String::new(),
            slug: String::new(),
            scope: None,
            path: PathBuf::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.version == 0 && self.path.as_os_str().is_empty()
    }

    /// Modification time as unix seconds, 0 for the null descriptor
    pub fn mtime(&self) -> Result<i64> {
        if self.is_null() {
            return Ok(0);
        }
        let modified = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(|e| ScriptError::io(format!("stat {}", self.path.display()), e))?;
        Ok(DateTime::<Utc>::from(modified).timestamp())
    }
}

/// Ordered set of script descriptors
#[derive(Debug, Clone, Default)]
pub struct Registry {
    scripts: Vec<ScriptDescriptor>,
}

impl Registry {
    /// Scan every source recursively and collect the scripts it holds.
    ///
    /// A single malformed script file fails the whole build. Sources that do
    /// not exist contribute nothing.
    pub fn build(sources: &[PathBuf], parser: &IdentityParser) -> Result<Self> {
        let mut scripts = Vec::new();

        for source in sources {
            if !source.is_dir() {
                debug!(source = %source.display(), "script source missing, skipping");
                continue;
            }

            for entry in WalkDir::new(source).follow_links(true) {
                let entry = entry.map_err(|e| {
                    ScriptError::io(format!("scan {}", source.display()), e.into())
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(file_name) = entry.file_name().to_str() else {
                    continue;
                };
                if !parser.is_candidate(file_name) {
                    continue;
                }

                let identity = parser
                    .parse(file_name)
                    .map_err(|_| ScriptError::IllegalName(entry.path().display().to_string()))?;
                scripts.push(ScriptDescriptor::new(identity, entry.path().to_path_buf()));
            }
        }

        debug!(count = scripts.len(), "registry built");
        Ok(Self::from_descriptors(scripts))
    }

    pub fn from_descriptors(mut scripts: Vec<ScriptDescriptor>) -> Self {
        scripts.sort_by_key(|s| s.version);
        Self { scripts }
    }

    /// Fail on any shared name, then on any shared version
    pub fn validate(&self) -> Result<()> {
        validate(&self.scripts)
    }

    pub fn scripts(&self) -> &[ScriptDescriptor] {
        &self.scripts
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ScriptDescriptor> {
        self.scripts.iter()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn versions(&self) -> BTreeSet<u64> {
        self.scripts.iter().map(|s| s.version).collect()
    }

    pub fn find(&self, version: u64) -> Option<&ScriptDescriptor> {
        self.scripts.iter().find(|s| s.version == version)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ScriptDescriptor> {
        self.scripts.iter().find(|s| s.name == name)
    }

    /// Highest-version script, or the null descriptor
    pub fn last(&self) -> ScriptDescriptor {
        self.scripts.last().cloned().unwrap_or_else(ScriptDescriptor::null)
    }

    /// Most recent modification time across all scripts, 0 when empty
    pub fn latest_mtime(&self) -> Result<i64> {
        let mut latest = 0;
        for script in &self.scripts {
            latest = latest.max(script.mtime()?);
        }
        Ok(latest)
    }

    /// Add a descriptor, keeping version order
    pub fn push(&mut self, script: ScriptDescriptor) {
        let at = self.scripts.partition_point(|s| s.version <= script.version);
        self.scripts.insert(at, script);
    }

    pub fn into_scripts(self) -> Vec<ScriptDescriptor> {
        self.scripts
    }
}

/// Fail with [`ScriptError::DuplicateName`] or [`ScriptError::DuplicateVersion`]
pub fn validate(scripts: &[ScriptDescriptor]) -> Result<()> {
    let mut names = HashSet::new();
    if let Some(dup) = scripts.iter().find(|s| !names.insert(s.name.as_str())) {
        return Err(ScriptError::DuplicateName(dup.name.clone()));
    }

    let mut versions = HashSet::new();
    if let Some(dup) = scripts.iter().find(|s| !versions.insert(s.version)) {
        return Err(ScriptError::DuplicateVersion(dup.version));
    }

    Ok(())
}

/// Registry for a single directory
pub fn scan(source: &Path, parser: &IdentityParser) -> Result<Registry> {
    Registry::build(&[source.to_path_buf()], parser)
}
