//! Script lifecycle hooks
//!
//! A [`Script`] is a stateless pair of `up`/`down` hooks. Hooks receive a
//! [`ScriptContext`] that forwards change operations to the execution
//! target, refusing structural changes unless the context belongs to a
//! sequenced script invocation.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::error::{Result, ScriptError};
use crate::registry::ScriptDescriptor;
use crate::target::{ChangeOp, ExecutionTarget, OpKind};

/// Direction of a sequencer run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunDirection {
    Apply,
    Revert,
}

impl RunDirection {
    pub fn hook_name(&self) -> &'static str {
        match self {
            RunDirection::Apply => "up",
            RunDirection::Revert => "down",
        }
    }

    pub(crate) fn announce_start(&self) -> &'static str {
        match self {
            RunDirection::Apply => "running",
            RunDirection::Revert => "reverting",
        }
    }

    pub(crate) fn announce_done(&self) -> &'static str {
        match self {
            RunDirection::Apply => "ran",
            RunDirection::Revert => "reverted",
        }
    }
}

impl fmt::Display for RunDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunDirection::Apply => f.write_str("apply"),
            RunDirection::Revert => f.write_str("revert"),
        }
    }
}

/// Where a change request comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Inside a sequenced script hook
    Script,
    /// Direct call outside the sequencer
    AdHoc,
}

/// Gated access to the execution target
pub struct ScriptContext<'a> {
    target: &'a dyn ExecutionTarget,
    origin: Origin,
    direction: RunDirection,
    issued: usize,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn for_script(target: &'a dyn ExecutionTarget, direction: RunDirection) -> Self {
        Self {
            target,
            origin: Origin::Script,
            direction,
            issued: 0,
        }
    }

    /// Context for changes issued outside any script; structural
    /// operations are refused.
    pub fn ad_hoc(target: &'a dyn ExecutionTarget) -> Self {
        Self {
            target,
            origin: Origin::AdHoc,
            direction: RunDirection::Apply,
            issued: 0,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn direction(&self) -> RunDirection {
        self.direction
    }

    pub fn reverting(&self) -> bool {
        self.direction == RunDirection::Revert
    }

    /// Operations issued through this context so far
    pub fn issued(&self) -> usize {
        self.issued
    }

    /// Whether `kind` may be issued from this context
    pub fn permits(&self, kind: OpKind) -> bool {
        !kind.is_schema_change() || self.origin == Origin::Script
    }

    pub fn apply(&mut self, op: ChangeOp) -> Result<()> {
        let kind = op.kind();
        if !self.permits(kind) {
            return Err(ScriptError::ExplicitChangeNotPermitted {
                operation: op.to_string(),
            });
        }
        if !self.target.supported_operations().contains(&kind) {
            return Err(ScriptError::UnsupportedOperation(kind.to_string()));
        }

        let start = Instant::now();
        self.target.apply(&op)?;
        self.issued += 1;
        info!("-- {} -> {:.4}s", op, start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Dispatch an operation by name with positional arguments
    pub fn call(&mut self, name: &str, args: &[&str]) -> Result<()> {
        let op = ChangeOp::from_call(name, args)?;
        self.apply(op)
    }

    pub fn execute(&mut self, sql: &str) -> Result<()> {
        self.apply(ChangeOp::Execute(sql.to_string()))
    }

    pub fn execute_block(&mut self, sql: &str) -> Result<()> {
        self.apply(ChangeOp::ExecuteBlock(sql.to_string()))
    }
}

/// One versioned unit of change
pub trait Script {
    fn up(&self, ctx: &mut ScriptContext<'_>) -> Result<()>;

    /// Scripts without a revert step do nothing when reverted
    fn down(&self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Run outside a transaction even when the target supports one
    fn disable_transaction(&self) -> bool {
        false
    }

    fn run(&self, direction: RunDirection, ctx: &mut ScriptContext<'_>) -> Result<()> {
        match direction {
            RunDirection::Apply => self.up(ctx),
            RunDirection::Revert => self.down(ctx),
        }
    }
}

/// Resolves a descriptor to its executable hooks
pub trait ScriptLoader {
    fn load(&self, descriptor: &ScriptDescriptor) -> Result<Arc<dyn Script>>;
}

/// Plain-text script with `-- up` and `-- down` sections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlScript {
    pub up: String,
    pub down: Option<String>,
    pub disable_transaction: bool,
}

#[derive(Clone, Copy)]
enum Section {
    Preamble,
    Up,
    Down,
}

impl SqlScript {
    /// Parse script text.
    ///
    /// Without any section marker the whole file is the `up` body. With
    /// markers, only comments may precede the first one.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut script = SqlScript::default();
        let mut section = Section::Preamble;
        let mut preamble = String::new();
        let mut up = String::new();
        let mut down: Option<String> = None;
        let mut saw_marker = false;
        let mut saw_up = false;

        for line in text.lines() {
            match directive(line) {
                Some("up") => {
                    if saw_up {
                        return Err(invalid(path, "duplicate `-- up` section"));
                    }
                    section = Section::Up;
                    saw_up = true;
                    saw_marker = true;
                    continue;
                }
                Some("down") => {
                    if down.is_some() {
                        return Err(invalid(path, "duplicate `-- down` section"));
                    }
                    section = Section::Down;
                    down = Some(String::new());
                    saw_marker = true;
                    continue;
                }
                Some("disable_transaction") => {
                    script.disable_transaction = true;
                    continue;
                }
                _ => {}
            }

            let buffer = match section {
                Section::Preamble => &mut preamble,
                Section::Up => &mut up,
                Section::Down => down.get_or_insert_with(String::new),
            };
            buffer.push_str(line);
            buffer.push('\n');
        }

        if saw_marker {
            if !is_blank(&preamble) {
                return Err(invalid(path, "statements before the first section marker"));
            }
            script.up = up;
        } else {
            script.up = preamble;
        }
        script.down = down;

        Ok(script)
    }
}

fn directive(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("--")?.trim();
    match rest.to_ascii_lowercase().as_str() {
        "up" => Some("up"),
        "down" => Some("down"),
        "disable_transaction" | "disable-transaction" => Some("disable_transaction"),
        _ => None,
    }
}

/// Nothing but whitespace and `--` comments
fn is_blank(body: &str) -> bool {
    body.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

fn invalid(path: &Path, reason: &str) -> ScriptError {
    ScriptError::InvalidScript {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

impl Script for SqlScript {
    fn up(&self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        if is_blank(&self.up) {
            return Ok(());
        }
        ctx.execute_block(&self.up)
    }

    fn down(&self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        match &self.down {
            Some(body) if !is_blank(body) => ctx.execute_block(body),
            _ => Ok(()),
        }
    }

    fn disable_transaction(&self) -> bool {
        self.disable_transaction
    }
}

/// Loads [`SqlScript`]s from the descriptor's file
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLoader;

impl ScriptLoader for FileLoader {
    fn load(&self, descriptor: &ScriptDescriptor) -> Result<Arc<dyn Script>> {
        let text = std::fs::read_to_string(&descriptor.path)
            .map_err(|e| ScriptError::io(format!("read {}", descriptor.path.display()), e))?;
        Ok(Arc::new(SqlScript::parse(&descriptor.path, &text)?))
    }
}

/// In-process scripts keyed by canonical name
#[derive(Default, Clone)]
pub struct StaticLoader {
    scripts: HashMap<String, Arc<dyn Script>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, script: impl Script + 'static) -> &mut Self {
        self.scripts.insert(name.into(), Arc::new(script));
        self
    }

    pub fn with(mut self, name: impl Into<String>, script: impl Script + 'static) -> Self {
        self.register(name, script);
        self
    }
}

impl ScriptLoader for StaticLoader {
    fn load(&self, descriptor: &ScriptDescriptor) -> Result<Arc<dyn Script>> {
        self.scripts
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| ScriptError::MissingScript {
                name: descriptor.name.clone(),
                version: descriptor.version,
            })
    }
}
