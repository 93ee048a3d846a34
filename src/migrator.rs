//! Sequencer
//!
//! Computes which scripts run for a direction and optional target version,
//! then hands them, strictly one after another, to the [`Executor`]. Nothing
//! is cached between calls: every operation recomputes the runnable set from
//! the registry and the applied-state store.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::info;

use crate::error::{Result, ScriptError};
use crate::executor::{ExecutionReport, Executor};
use crate::registry::{Registry, ScriptDescriptor};
use crate::script::{RunDirection, ScriptLoader};
use crate::storage::AppliedStore;

/// One row of `status()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptStatus {
    pub version: u64,
    pub name: String,
    pub scope: Option<String>,
    pub applied: bool,
    /// Applied version with no script file behind it
    pub orphaned: bool,
}

pub struct Migrator<'a> {
    registry: Registry,
    store: AppliedStore<'a>,
    loader: &'a dyn ScriptLoader,
}

impl<'a> Migrator<'a> {
    /// Validates the registry and makes sure the tracking table exists.
    pub fn new(registry: Registry, store: AppliedStore<'a>, loader: &'a dyn ScriptLoader) -> Result<Self> {
        registry.validate()?;
        store.ensure_table_exists()?;

        Ok(Self {
            registry,
            store,
            loader,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &AppliedStore<'a> {
        &self.store
    }

    pub fn applied_versions(&self) -> Result<BTreeSet<u64>> {
        self.store.all_applied_versions()
    }

    /// Highest applied version, 0 when nothing has run
    pub fn current_version(&self) -> Result<u64> {
        Ok(self.applied_versions()?.last().copied().unwrap_or(0))
    }

    /// Scripts that `migrate` would run, in execution order.
    ///
    /// Applying runs every unapplied script up to and including `target`.
    /// Reverting runs every applied script above `target`, newest first;
    /// a target of 0 reverts everything.
    pub fn runnable(&self, direction: RunDirection, target: Option<u64>) -> Result<Vec<&ScriptDescriptor>> {
        if let Some(version) = target {
            let known = self.registry.find(version).is_some();
            let reset = direction == RunDirection::Revert && version == 0;
            if !known && !reset {
                return Err(ScriptError::UnknownVersion(version));
            }
        }

        let applied = self.applied_versions()?;
        let runnable = match direction {
            RunDirection::Apply => self
                .registry
                .iter()
                .filter(|s| !applied.contains(&s.version))
                .filter(|s| target.map_or(true, |t| s.version <= t))
                .collect(),
            RunDirection::Revert => self
                .registry
                .iter()
                .rev()
                .filter(|s| applied.contains(&s.version))
                .filter(|s| target.map_or(true, |t| s.version > t))
                .collect(),
        };

        Ok(runnable)
    }

    /// Unapplied scripts, ascending
    pub fn pending(&self) -> Result<Vec<&ScriptDescriptor>> {
        self.runnable(RunDirection::Apply, None)
    }

    /// Run the runnable set, halting at the first failure
    pub fn migrate(&self, direction: RunDirection, target: Option<u64>) -> Result<Vec<ExecutionReport>> {
        let runnable = self.runnable(direction, target)?;
        self.run_batch(direction, &runnable)
    }

    fn run_batch(&self, direction: RunDirection, runnable: &[&ScriptDescriptor]) -> Result<Vec<ExecutionReport>> {
        if runnable.is_empty() {
            info!("nothing to {direction}");
            return Ok(Vec::new());
        }

        let executor = Executor::new(&self.store);
        let mut reports = Vec::with_capacity(runnable.len());

        for (index, descriptor) in runnable.iter().enumerate() {
            info!("Running scripts to {} ({})", descriptor.name, descriptor.version);

            let outcome = self
                .loader
                .load(descriptor)
                .and_then(|script| executor.execute(descriptor, script.as_ref(), direction));

            match outcome {
                Ok(report) => reports.push(report),
                Err(err) => {
                    return Err(ScriptError::BatchHalted {
                        version: descriptor.version,
                        name: descriptor.name.clone(),
                        rolled_back: err.rolled_back(),
                        skipped: runnable[index + 1..].iter().map(|s| s.version).collect(),
                        source: Box::new(err),
                    });
                }
            }
        }

        Ok(reports)
    }

    /// Move the applied set to `version`: revert when it is below the
    /// current version, apply otherwise. Version 0 always means revert all.
    pub fn migrate_to(&self, version: u64) -> Result<Vec<ExecutionReport>> {
        let direction = if version == 0 || version < self.current_version()? {
            RunDirection::Revert
        } else {
            RunDirection::Apply
        };
        self.migrate(direction, Some(version))
    }

    /// Run exactly one script; `None` when it is already in the desired state
    pub fn run(&self, direction: RunDirection, version: u64) -> Result<Option<ExecutionReport>> {
        let descriptor = self
            .registry
            .find(version)
            .ok_or(ScriptError::UnknownVersion(version))?;

        let applied = self.store.is_applied(version)?;
        let done = match direction {
            RunDirection::Apply => applied,
            RunDirection::Revert => !applied,
        };
        if done {
            info!(
                "{} ({}) is already {}",
                descriptor.name,
                descriptor.version,
                if applied { "applied" } else { "reverted" }
            );
            return Ok(None);
        }

        let executor = Executor::new(&self.store);
        self.loader
            .load(descriptor)
            .and_then(|script| executor.execute(descriptor, script.as_ref(), direction))
            .map(Some)
            .map_err(|err| ScriptError::ScriptFailed {
                version: descriptor.version,
                name: descriptor.name.clone(),
                rolled_back: err.rolled_back(),
                source: Box::new(err),
            })
    }

    /// Revert the `steps` most recently applied scripts
    pub fn rollback(&self, steps: usize) -> Result<Vec<ExecutionReport>> {
        if steps == 0 {
            return Ok(Vec::new());
        }
        let applied = self.applied_versions()?;
        let known_applied: Vec<u64> = self
            .registry
            .iter()
            .rev()
            .map(|s| s.version)
            .filter(|v| applied.contains(v))
            .collect();

        let target = known_applied.get(steps).copied().unwrap_or(0);
        self.migrate(RunDirection::Revert, Some(target))
    }

    /// Roll back `steps` scripts, then apply exactly those again.
    /// Scripts that were already pending stay pending.
    pub fn redo(&self, steps: usize) -> Result<Vec<ExecutionReport>> {
        let mut reports = self.rollback(steps)?;
        let reverted: BTreeSet<u64> = reports.iter().map(|r| r.version).collect();
        let reapply: Vec<&ScriptDescriptor> = self
            .registry
            .iter()
            .filter(|s| reverted.contains(&s.version))
            .collect();

        reports.extend(self.run_batch(RunDirection::Apply, &reapply)?);
        Ok(reports)
    }

    /// Revert every applied script
    pub fn reset(&self) -> Result<Vec<ExecutionReport>> {
        self.migrate(RunDirection::Revert, Some(0))
    }

    /// Every known script with its applied flag, plus orphaned versions
    pub fn status(&self) -> Result<Vec<ScriptStatus>> {
        let applied = self.applied_versions()?;
        let known = self.registry.versions();

        let mut rows: Vec<ScriptStatus> = self
            .registry
            .iter()
            .map(|s| ScriptStatus {
                version: s.version,
                name: s.name.clone(),
                scope: s.scope.clone(),
                applied: applied.contains(&s.version),
                orphaned: false,
            })
            .collect();

        rows.extend(applied.difference(&known).map(|&version| ScriptStatus {
            version,
            name: "********** NO FILE **********".to_string(),
            scope: None,
            applied: true,
            orphaned: true,
        }));
        rows.sort_by_key(|row| row.version);

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Script, ScriptContext, StaticLoader};
    use crate::storage::Database;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Journaled {
        name: &'static str,
        journal: Journal,
        fail_up: bool,
    }

    impl Script for Journaled {
        fn up(&self, ctx: &mut ScriptContext<'_>) -> Result<()> {
            self.journal.lock().push(format!("up {}", self.name));
            ctx.execute(&format!("CREATE TABLE {} (id INTEGER)", self.name))?;
            if self.fail_up {
                ctx.execute("INSERT INTO no_such_table VALUES (1)")?;
            }
            Ok(())
        }

        fn down(&self, ctx: &mut ScriptContext<'_>) -> Result<()> {
            self.journal.lock().push(format!("down {}", self.name));
            ctx.execute(&format!("DROP TABLE {}", self.name))
        }
    }

    fn registry(entries: &[(u64, &str)]) -> Registry {
        Registry::from_descriptors(
            entries
                .iter()
                .map(|&(version, name)| ScriptDescriptor {
                    version,
                    name: name.to_string(),
                    slug: crate::identity::underscore(name),
                    scope: None,
                    path: PathBuf::from(format!("{version}_{}.sql", crate::identity::underscore(name))),
                })
                .collect(),
        )
    }

    fn loader(names: &[&'static str], failing: &[&'static str], journal: &Journal) -> StaticLoader {
        let mut loader = StaticLoader::new();
        for &name in names {
            loader.register(
                name,
                Journaled {
                    name,
                    journal: journal.clone(),
                    fail_up: failing.contains(&name),
                },
            );
        }
        loader
    }

    fn versions(reports: &[ExecutionReport]) -> Vec<u64> {
        reports.iter().map(|r| r.version).collect()
    }

    #[test]
    fn migrate_runs_in_order_then_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let loader = loader(&["CreateA", "CreateB"], &[], &journal);
        let migrator = Migrator::new(
            registry(&[(2, "CreateB"), (1, "CreateA")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();

        let reports = migrator.migrate(RunDirection::Apply, None).unwrap();
        assert_eq!(versions(&reports), vec![1, 2]);
        assert_eq!(*journal.lock(), vec!["up CreateA", "up CreateB"]);
        assert_eq!(migrator.applied_versions().unwrap().into_iter().collect::<Vec<_>>(), vec![1, 2]);

        assert!(migrator.migrate(RunDirection::Apply, None).unwrap().is_empty());
        assert_eq!(journal.lock().len(), 2);
    }

    #[test]
    fn runnable_apply_is_exactly_the_unapplied_versions() {
        let db = Database::open_in_memory().unwrap();
        let store = AppliedStore::new(&db, "post_deploy_scripts");
        store.ensure_table_exists().unwrap();
        store.record_applied(3).unwrap();
        store.record_applied(10).unwrap();

        let loader = StaticLoader::new();
        let migrator = Migrator::new(
            registry(&[(1, "A"), (3, "C"), (7, "G"), (10, "J"), (12, "L")]),
            store,
            &loader,
        )
        .unwrap();

        let runnable: Vec<u64> = migrator
            .runnable(RunDirection::Apply, None)
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(runnable, vec![1, 7, 12]);

        let upto: Vec<u64> = migrator
            .runnable(RunDirection::Apply, Some(7))
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(upto, vec![1, 7]);

        let down: Vec<u64> = migrator
            .runnable(RunDirection::Revert, Some(3))
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(down, vec![10]);

        let all_down: Vec<u64> = migrator
            .runnable(RunDirection::Revert, Some(0))
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(all_down, vec![10, 3]);
    }

    #[test]
    fn unknown_target_versions_fail() {
        let db = Database::open_in_memory().unwrap();
        let loader = StaticLoader::new();
        let migrator = Migrator::new(
            registry(&[(1, "A")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();

        assert!(matches!(
            migrator.runnable(RunDirection::Apply, Some(5)),
            Err(ScriptError::UnknownVersion(5))
        ));
        assert!(matches!(
            migrator.runnable(RunDirection::Revert, Some(5)),
            Err(ScriptError::UnknownVersion(5))
        ));
        assert!(matches!(migrator.run(RunDirection::Apply, 9), Err(ScriptError::UnknownVersion(9))));
    }

    #[test]
    fn invalid_registry_cannot_build_a_migrator() {
        let db = Database::open_in_memory().unwrap();
        let loader = StaticLoader::new();
        let result = Migrator::new(
            registry(&[(1, "A"), (2, "A")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        );
        assert!(matches!(result, Err(ScriptError::DuplicateName(_))));
        assert!(!crate::target::ExecutionTarget::table_exists(&db, "post_deploy_scripts").unwrap());
    }

    #[test]
    fn run_single_revert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let loader = loader(&["CreateA", "CreateB"], &[], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "CreateA"), (2, "CreateB")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();
        migrator.migrate(RunDirection::Apply, None).unwrap();

        let report = migrator.run(RunDirection::Revert, 2).unwrap();
        assert_eq!(report.map(|r| r.version), Some(2));
        assert_eq!(migrator.applied_versions().unwrap().into_iter().collect::<Vec<_>>(), vec![1]);

        assert!(migrator.run(RunDirection::Revert, 2).unwrap().is_none());
        assert_eq!(journal.lock().last().map(String::as_str), Some("down CreateB"));
        assert_eq!(journal.lock().len(), 3);

        migrator.run(RunDirection::Apply, 2).unwrap();
        assert_eq!(migrator.applied_versions().unwrap().len(), 2);
    }

    #[test]
    fn failure_halts_batch_and_retry_resumes_there() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let failing = loader(&["A", "B", "C", "D"], &["B"], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "A"), (2, "B"), (3, "C"), (4, "D")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &failing,
        )
        .unwrap();

        let err = migrator.migrate(RunDirection::Apply, None).unwrap_err();
        match &err {
            ScriptError::BatchHalted {
                version,
                rolled_back,
                skipped,
                ..
            } => {
                assert_eq!(*version, 2);
                assert!(*rolled_back);
                assert_eq!(skipped, &vec![3, 4]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("this and all later scripts canceled"));
        assert_eq!(*journal.lock(), vec!["up A", "up B"]);
        assert_eq!(migrator.applied_versions().unwrap().into_iter().collect::<Vec<_>>(), vec![1]);

        let fixed = loader(&["A", "B", "C", "D"], &[], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "A"), (2, "B"), (3, "C"), (4, "D")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &fixed,
        )
        .unwrap();
        let reports = migrator.migrate(RunDirection::Apply, None).unwrap();
        assert_eq!(versions(&reports), vec![2, 3, 4]);
    }

    #[test]
    fn single_run_failure_reports_cancellation() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let loader = loader(&["A"], &["A"], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "A")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();

        let err = migrator.run(RunDirection::Apply, 1).unwrap_err();
        assert!(matches!(err, ScriptError::ScriptFailed { version: 1, rolled_back: true, .. }));
        assert!(err.to_string().contains("this script was canceled"));
    }

    #[test]
    fn apply_then_revert_round_trips_applied_set() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let loader = loader(&["A", "B", "C"], &[], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "A"), (2, "B"), (3, "C")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();
        migrator.migrate(RunDirection::Apply, Some(2)).unwrap();
        let before = migrator.applied_versions().unwrap();

        migrator.run(RunDirection::Apply, 3).unwrap();
        migrator.run(RunDirection::Revert, 3).unwrap();
        assert_eq!(migrator.applied_versions().unwrap(), before);
    }

    #[test]
    fn rollback_redo_reset_and_status() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let loader = loader(&["A", "B", "C"], &[], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "A"), (2, "B"), (3, "C")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();
        migrator.migrate(RunDirection::Apply, None).unwrap();
        migrator.store().record_applied(99).unwrap();

        assert_eq!(versions(&migrator.rollback(2).unwrap()), vec![3, 2]);
        assert_eq!(migrator.current_version().unwrap(), 99);

        let redo = migrator.redo(1).unwrap();
        assert_eq!(versions(&redo), vec![1, 1]);

        let status = migrator.status().unwrap();
        let applied: Vec<(u64, bool, bool)> = status.iter().map(|s| (s.version, s.applied, s.orphaned)).collect();
        assert_eq!(
            applied,
            vec![(1, true, false), (2, false, false), (3, false, false), (99, true, true)]
        );

        assert_eq!(versions(&migrator.reset().unwrap()), vec![1]);
        assert_eq!(migrator.applied_versions().unwrap().into_iter().collect::<Vec<_>>(), vec![99]);
    }

    #[test]
    fn migrate_to_picks_direction_from_current_version() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let loader = loader(&["A", "B", "C"], &[], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "A"), (2, "B"), (3, "C")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();

        assert!(migrator.migrate_to(0).unwrap().is_empty());
        assert_eq!(versions(&migrator.migrate_to(2).unwrap()), vec![1, 2]);
        assert_eq!(versions(&migrator.migrate_to(3).unwrap()), vec![3]);
        assert_eq!(versions(&migrator.migrate_to(1).unwrap()), vec![3, 2]);
        assert_eq!(versions(&migrator.migrate_to(0).unwrap()), vec![1]);
        assert!(matches!(migrator.migrate_to(7), Err(ScriptError::UnknownVersion(7))));
    }

    #[test]
    fn redo_leaves_earlier_pending_scripts_alone() {
        let db = Database::open_in_memory().unwrap();
        let journal = Journal::default();
        let loader = loader(&["A", "B", "C"], &[], &journal);
        let migrator = Migrator::new(
            registry(&[(1, "A"), (2, "B"), (3, "C")]),
            AppliedStore::new(&db, "post_deploy_scripts"),
            &loader,
        )
        .unwrap();
        migrator.run(RunDirection::Apply, 1).unwrap();
        migrator.run(RunDirection::Apply, 3).unwrap();
        journal.lock().clear();

        let redo = migrator.redo(1).unwrap();
        let runs: Vec<(u64, RunDirection)> = redo.iter().map(|r| (r.version, r.direction)).collect();
        assert_eq!(runs, vec![(3, RunDirection::Revert), (3, RunDirection::Apply)]);
        assert_eq!(*journal.lock(), vec!["down C", "up C"]);
        assert_eq!(
            migrator.applied_versions().unwrap().into_iter().collect::<Vec<_>>(),
            vec![1, 3]
        );
    }
}
