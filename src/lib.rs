//! # deploy-scripts - Versioned Post-Deploy Script Sequencer
//!
//! Discovers ordered, uniquely versioned change scripts, works out which of
//! them a target has already applied, and runs the rest (or reverts applied
//! ones) one at a time with transactional safety and durable bookkeeping.
//!
//! ## Features
//!
//! - **Deterministic ordering**: apply ascending, revert descending, by version only
//! - **Transactional execution**: each script runs in its own scoped transaction when the target supports it
//! - **Explicit change discipline**: structural changes are refused outside sequenced scripts
//! - **Multi-source merge**: copy scripts from named sources with renumbering and provenance
//! - **Pending guard**: cheap request-time check for unapplied scripts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deploy_scripts::{
//!     AppliedStore, Config, Database, FileLoader, Migrator, Registry, RunDirection,
//! };
//!
//! fn main() -> deploy_scripts::Result<()> {
//!     let config = Config::default();
//!     let db = Database::new(&config.database)?;
//!     let registry = Registry::build(&config.sources, &config.parser())?;
//!     let loader = FileLoader;
//!
//!     let migrator = Migrator::new(registry, AppliedStore::new(&db, &config.table_name), &loader)?;
//!     for report in migrator.migrate(RunDirection::Apply, None)? {
//!         println!("✅ {} ({}) in {}ms", report.name, report.version, report.duration_ms);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod copy;
pub mod error;
pub mod executor;
pub mod generate;
pub mod guard;
pub mod identity;
pub mod migrator;
pub mod registry;
pub mod script;
pub mod storage;
pub mod target;

// Re-export main types for library consumers
pub use config::{Config, Numbering};
pub use copy::{copy, CopyObserver};
pub use error::{EnhancedError, Result, ScriptError};
pub use executor::{ExecutionReport, Executor};
pub use generate::new_script;
pub use guard::{check_pending, PendingGuard};
pub use identity::{IdentityParser, ScriptIdentity};
pub use migrator::{Migrator, ScriptStatus};
pub use registry::{Registry, ScriptDescriptor};
pub use script::{FileLoader, RunDirection, Script, ScriptContext, ScriptLoader, SqlScript, StaticLoader};
pub use storage::{AppliedStore, Database};
pub use target::{ChangeOp, ColumnDef, ExecutionTarget, OpKind, TransactionScope};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
