use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::Result;
use crate::registry::ScriptDescriptor;
use crate::target::ExecutionTarget;

/// Durable record of which script versions have been applied
pub struct AppliedStore<'a> {
    target: &'a dyn ExecutionTarget,
    table: String,
}

impl<'a> AppliedStore<'a> {
    pub fn new(target: &'a dyn ExecutionTarget, table: impl Into<String>) -> Self {
        Self {
            target,
            table: table.into(),
        }
    }

    pub fn target(&self) -> &'a dyn ExecutionTarget {
        self.target
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Idempotent; safe to call on every sequencer construction
    pub fn ensure_table_exists(&self) -> Result<()> {
        if !self.target.table_exists(&self.table)? {
            debug!(table = %self.table, "creating tracking table");
            self.target.create_tracking_table(&self.table)?;
        }
        Ok(())
    }

    /// Every applied version, ascending. Empty when the table is missing.
    pub fn all_applied_versions(&self) -> Result<BTreeSet<u64>> {
        if !self.target.table_exists(&self.table)? {
            return Ok(BTreeSet::new());
        }

        let mut versions = BTreeSet::new();
        for raw in self.target.tracked_versions(&self.table)? {
            match raw.trim().parse::<u64>() {
                Ok(version) => {
                    versions.insert(version);
                }
                Err(_) => warn!(table = %self.table, version = %raw, "ignoring non-numeric applied version"),
            }
        }
        Ok(versions)
    }

    pub fn is_applied(&self, version: u64) -> Result<bool> {
        Ok(self.all_applied_versions()?.contains(&version))
    }

    pub fn record_applied(&self, version: u64) -> Result<()> {
        debug!(version, "recording applied");
        self.target.insert_version(&self.table, &version.to_string())
    }

    pub fn record_reverted(&self, version: u64) -> Result<()> {
        debug!(version, "recording reverted");
        self.target.delete_version(&self.table, &version.to_string())
    }

    /// True iff some known script has no applied record
    pub fn needs_migration(&self, known: &[ScriptDescriptor]) -> Result<bool> {
        if known.is_empty() {
            return Ok(false);
        }
        let applied = self.all_applied_versions()?;
        Ok(known.iter().any(|s| !applied.contains(&s.version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::path::PathBuf;

    fn known(versions: &[u64]) -> Vec<ScriptDescriptor> {
        versions
            .iter()
            .map(|&version| ScriptDescriptor {
                version,
                name: format!("Script{version}"),
                slug: format!("script{version}"),
                scope: None,
                path: PathBuf::from(format!("{version}_script{version}.sql")),
            })
            .collect()
    }

    #[test]
    fn missing_table_reads_as_empty() {
        let db = Database::open_in_memory().unwrap();
        let store = AppliedStore::new(&db, "post_deploy_scripts");
        assert!(store.all_applied_versions().unwrap().is_empty());
        assert!(store.needs_migration(&known(&[1])).unwrap());
        assert!(!store.needs_migration(&[]).unwrap());
    }

    #[test]
    fn records_and_sorts_versions() {
        let db = Database::open_in_memory().unwrap();
        let store = AppliedStore::new(&db, "post_deploy_scripts");
        store.ensure_table_exists().unwrap();
        store.ensure_table_exists().unwrap();

        store.record_applied(10).unwrap();
        store.record_applied(2).unwrap();
        store.record_applied(7).unwrap();
        let applied: Vec<u64> = store.all_applied_versions().unwrap().into_iter().collect();
        assert_eq!(applied, vec![2, 7, 10]);

        store.record_reverted(7).unwrap();
        assert!(!store.is_applied(7).unwrap());
        assert!(store.needs_migration(&known(&[2, 7])).unwrap());
        assert!(!store.needs_migration(&known(&[2, 10])).unwrap());
    }

    #[test]
    fn ignores_non_numeric_rows() {
        let db = Database::open_in_memory().unwrap();
        let store = AppliedStore::new(&db, "post_deploy_scripts");
        store.ensure_table_exists().unwrap();
        db.insert_version("post_deploy_scripts", "v2-beta").unwrap();
        store.record_applied(3).unwrap();
        assert_eq!(store.all_applied_versions().unwrap().len(), 1);
    }
}
