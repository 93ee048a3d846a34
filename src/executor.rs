//! Execution engine
//!
//! Runs one script's hook for a direction, inside a transaction when both
//! the script and the target allow it, and updates the applied-state store
//! only when the hook succeeded.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, ScriptError};
use crate::registry::ScriptDescriptor;
use crate::script::{RunDirection, Script, ScriptContext};
use crate::storage::AppliedStore;
use crate::target::TransactionScope;

/// Outcome of one successful script execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub version: u64,
    pub name: String,
    pub direction: RunDirection,
    pub duration_ms: u64,
    pub transactional: bool,
    pub operations: usize,
}

pub struct Executor<'s, 'a> {
    store: &'s AppliedStore<'a>,
}

impl<'s, 'a> Executor<'s, 'a> {
    pub fn new(store: &'s AppliedStore<'a>) -> Self {
        Self { store }
    }

    pub fn use_transaction(&self, script: &dyn Script) -> bool {
        !script.disable_transaction() && self.store.target().supports_transactional_changes()
    }

    pub fn execute(
        &self,
        descriptor: &ScriptDescriptor,
        script: &dyn Script,
        direction: RunDirection,
    ) -> Result<ExecutionReport> {
        announce(descriptor, direction.announce_start());

        let transactional = self.use_transaction(script);
        let start = Instant::now();

        let outcome = if transactional {
            self.execute_in_transaction(descriptor, script, direction)
        } else {
            self.invoke(descriptor, script, direction)
                .map_err(|e| (e, false))
        };

        let elapsed = start.elapsed();
        match outcome {
            Ok(operations) => {
                announce(
                    descriptor,
                    &format!("{} ({:.4}s)", direction.announce_done(), elapsed.as_secs_f64()),
                );
                Ok(ExecutionReport {
                    version: descriptor.version,
                    name: descriptor.name.clone(),
                    direction,
                    duration_ms: duration_ms(elapsed),
                    transactional,
                    operations,
                })
            }
            Err((source, rolled_back)) => {
                warn!(
                    version = descriptor.version,
                    name = %descriptor.name,
                    rolled_back,
                    "script failed after {:.4}s",
                    elapsed.as_secs_f64()
                );
                Err(ScriptError::Execution {
                    version: descriptor.version,
                    name: descriptor.name.clone(),
                    direction,
                    elapsed,
                    rolled_back,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Errors carry whether the rollback went through
    fn execute_in_transaction(
        &self,
        descriptor: &ScriptDescriptor,
        script: &dyn Script,
        direction: RunDirection,
    ) -> std::result::Result<usize, (ScriptError, bool)> {
        let scope = TransactionScope::begin(self.store.target()).map_err(|e| (e, false))?;

        match self.invoke(descriptor, script, direction) {
            Ok(operations) => {
                // a failed COMMIT drops the scope, which rolls back
                scope.commit().map_err(|e| (e, true))?;
                Ok(operations)
            }
            Err(err) => match scope.rollback() {
                Ok(()) => Err((err, true)),
                Err(rollback_err) => {
                    warn!("rollback failed: {rollback_err}");
                    Err((err, false))
                }
            },
        }
    }

    fn invoke(
        &self,
        descriptor: &ScriptDescriptor,
        script: &dyn Script,
        direction: RunDirection,
    ) -> Result<usize> {
        let mut ctx = ScriptContext::for_script(self.store.target(), direction);
        script.run(direction, &mut ctx)?;

        match direction {
            RunDirection::Apply => self.store.record_applied(descriptor.version)?,
            RunDirection::Revert => self.store.record_reverted(descriptor.version)?,
        }
        Ok(ctx.issued())
    }
}

fn announce(descriptor: &ScriptDescriptor, message: &str) {
    info!("== {} {}: {}", descriptor.version, descriptor.name, message);
}

fn duration_ms(elapsed: Duration) -> u64 {
    elapsed.as_millis().min(u64::MAX as u128) as u64
}
