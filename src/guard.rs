//! Pending-change guard
//!
//! Meant to sit in front of request handling: it fails while unapplied
//! scripts exist. The tracking store is only queried when some script file
//! is newer than the last successful check.

use std::path::PathBuf;

use tracing::debug;

use crate::config::Config;
use crate::error::{Result, ScriptError};
use crate::identity::IdentityParser;
use crate::registry::Registry;
use crate::storage::AppliedStore;
use crate::target::ExecutionTarget;

/// Fail with [`ScriptError::PendingScripts`] if any known script is unapplied
pub fn check_pending(target: &dyn ExecutionTarget, registry: &Registry, table: &str) -> Result<()> {
    if AppliedStore::new(target, table).needs_migration(registry.scripts())? {
        return Err(ScriptError::PendingScripts);
    }
    Ok(())
}

pub struct PendingGuard {
    sources: Vec<PathBuf>,
    parser: IdentityParser,
    table: String,
    last_checked: i64,
}

impl PendingGuard {
    pub fn new(config: &Config) -> Self {
        Self {
            sources: config.sources.clone(),
            parser: config.parser(),
            table: config.table_name.clone(),
            last_checked: 0,
        }
    }

    /// Unix seconds of the newest script seen by the last passing check
    pub fn last_checked(&self) -> i64 {
        self.last_checked
    }

    pub fn check(&mut self, target: &dyn ExecutionTarget) -> Result<()> {
        if !target.supports_sequencing() {
            return Ok(());
        }

        let registry = Registry::build(&self.sources, &self.parser)?;
        let mtime = registry.latest_mtime()?;
        if self.last_checked >= mtime {
            return Ok(());
        }

        debug!(mtime, last_checked = self.last_checked, "scripts changed, checking for pending");
        check_pending(target, &registry, &self.table)?;
        self.last_checked = mtime;
        Ok(())
    }
}
