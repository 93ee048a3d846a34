//! Execution target capabilities
//!
//! The sequencer never talks to a database directly. Everything it needs,
//! from the tracking table to transactions and change operations, goes
//! through [`ExecutionTarget`].

use std::fmt;
use std::str::FromStr;

use tracing::error;

use crate::error::{Result, ScriptError};

/// Every change operation a script can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    CreateTable,
    DropTable,
    RenameTable,
    AddColumn,
    RemoveColumn,
    RenameColumn,
    AddIndex,
    RemoveIndex,
    Execute,
    ExecuteBlock,
    EnableExtension,
    DisableExtension,
}

impl OpKind {
    pub const ALL: &'static [OpKind] = &[
        OpKind::CreateTable,
        OpKind::DropTable,
        OpKind::RenameTable,
        OpKind::AddColumn,
        OpKind::RemoveColumn,
        OpKind::RenameColumn,
        OpKind::AddIndex,
        OpKind::RemoveIndex,
        OpKind::Execute,
        OpKind::ExecuteBlock,
        OpKind::EnableExtension,
        OpKind::DisableExtension,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::CreateTable => "create_table",
            OpKind::DropTable => "drop_table",
            OpKind::RenameTable => "rename_table",
            OpKind::AddColumn => "add_column",
            OpKind::RemoveColumn => "remove_column",
            OpKind::RenameColumn => "rename_column",
            OpKind::AddIndex => "add_index",
            OpKind::RemoveIndex => "remove_index",
            OpKind::Execute => "execute",
            OpKind::ExecuteBlock => "execute_block",
            OpKind::EnableExtension => "enable_extension",
            OpKind::DisableExtension => "disable_extension",
        }
    }

    /// Structural changes go through the explicit change gate; index
    /// maintenance, raw execution and extension toggles do not.
    pub fn is_schema_change(&self) -> bool {
        !matches!(
            self,
            OpKind::AddIndex
                | OpKind::RemoveIndex
                | OpKind::Execute
                | OpKind::ExecuteBlock
                | OpKind::EnableExtension
                | OpKind::DisableExtension
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self> {
        OpKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ScriptError::UnsupportedOperation(s.to_string()))
    }
}

/// Column name and declared type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

impl FromStr for ColumnDef {
    type Err = ScriptError;

    /// `name:type`, e.g. `email:TEXT NOT NULL`
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((name, ty)) if !name.trim().is_empty() && !ty.trim().is_empty() => {
                Ok(Self::new(name.trim(), ty.trim()))
            }
            _ => Err(ScriptError::InvalidArguments {
                operation: format!("column `{s}`"),
                expected: "name:type".to_string(),
                got: 1,
            }),
        }
    }
}

/// One change operation with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    CreateTable { table: String, columns: Vec<ColumnDef> },
    DropTable { table: String },
    RenameTable { from: String, to: String },
    AddColumn { table: String, column: ColumnDef },
    RemoveColumn { table: String, column: String },
    RenameColumn { table: String, from: String, to: String },
    AddIndex { table: String, columns: Vec<String>, unique: bool },
    RemoveIndex { table: String, columns: Vec<String> },
    /// Raw pass-through of a single statement
    Execute(String),
    /// Raw pass-through of a statement batch
    ExecuteBlock(String),
    EnableExtension(String),
    DisableExtension(String),
}

impl ChangeOp {
    pub fn kind(&self) -> OpKind {
        match self {
            ChangeOp::CreateTable { .. } => OpKind::CreateTable,
            ChangeOp::DropTable { .. } => OpKind::DropTable,
            ChangeOp::RenameTable { .. } => OpKind::RenameTable,
            ChangeOp::AddColumn { .. } => OpKind::AddColumn,
            ChangeOp::RemoveColumn { .. } => OpKind::RemoveColumn,
            ChangeOp::RenameColumn { .. } => OpKind::RenameColumn,
            ChangeOp::AddIndex { .. } => OpKind::AddIndex,
            ChangeOp::RemoveIndex { .. } => OpKind::RemoveIndex,
            ChangeOp::Execute(_) => OpKind::Execute,
            ChangeOp::ExecuteBlock(_) => OpKind::ExecuteBlock,
            ChangeOp::EnableExtension(_) => OpKind::EnableExtension,
            ChangeOp::DisableExtension(_) => OpKind::DisableExtension,
        }
    }

    /// Build an operation from its name and positional arguments
    pub fn from_call(name: &str, args: &[&str]) -> Result<Self> {
        let kind: OpKind = name.parse()?;
        let owned = |i: usize| args[i].to_string();

        let op = match kind {
            OpKind::CreateTable => {
                arity(kind, args, 2, true)?;
                ChangeOp::CreateTable {
                    table: owned(0),
                    columns: args[1..]
                        .iter()
                        .map(|c| c.parse())
                        .collect::<Result<Vec<ColumnDef>>>()?,
                }
            }
            OpKind::DropTable => {
                arity(kind, args, 1, false)?;
                ChangeOp::DropTable { table: owned(0) }
            }
            OpKind::RenameTable => {
                arity(kind, args, 2, false)?;
                ChangeOp::RenameTable {
                    from: owned(0),
                    to: owned(1),
                }
            }
            OpKind::AddColumn => {
                arity(kind, args, 3, false)?;
                ChangeOp::AddColumn {
                    table: owned(0),
                    column: ColumnDef::new(args[1], args[2]),
                }
            }
            OpKind::RemoveColumn => {
                arity(kind, args, 2, false)?;
                ChangeOp::RemoveColumn {
                    table: owned(0),
                    column: owned(1),
                }
            }
            OpKind::RenameColumn => {
                arity(kind, args, 3, false)?;
                ChangeOp::RenameColumn {
                    table: owned(0),
                    from: owned(1),
                    to: owned(2),
                }
            }
            OpKind::AddIndex => {
                arity(kind, args, 2, true)?;
                ChangeOp::AddIndex {
                    table: owned(0),
                    columns: args[1..].iter().map(|c| c.to_string()).collect(),
                    unique: false,
                }
            }
            OpKind::RemoveIndex => {
                arity(kind, args, 2, true)?;
                ChangeOp::RemoveIndex {
                    table: owned(0),
                    columns: args[1..].iter().map(|c| c.to_string()).collect(),
                }
            }
            OpKind::Execute => {
                arity(kind, args, 1, false)?;
                ChangeOp::Execute(owned(0))
            }
            OpKind::ExecuteBlock => {
                arity(kind, args, 1, false)?;
                ChangeOp::ExecuteBlock(owned(0))
            }
            OpKind::EnableExtension => {
                arity(kind, args, 1, false)?;
                ChangeOp::EnableExtension(owned(0))
            }
            OpKind::DisableExtension => {
                arity(kind, args, 1, false)?;
                ChangeOp::DisableExtension(owned(0))
            }
        };

        Ok(op)
    }

    /// Conventional index name: `index_users_on_email_and_name`
    pub fn index_name(table: &str, columns: &[String]) -> String {
        format!("index_{}_on_{}", table, columns.join("_and_"))
    }
}

fn arity(kind: OpKind, args: &[&str], expected: usize, variadic: bool) -> Result<()> {
    let ok = if variadic {
        args.len() >= expected
    } else {
        args.len() == expected
    };
    if ok {
        return Ok(());
    }
    Err(ScriptError::InvalidArguments {
        operation: kind.name().to_string(),
        expected: if variadic {
            format!("at least {expected}")
        } else {
            expected.to_string()
        },
        got: args.len(),
    })
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = match self {
            ChangeOp::CreateTable { table, columns } => std::iter::once(table.clone())
                .chain(columns.iter().map(|c| format!("{}:{}", c.name, c.sql_type)))
                .collect(),
            ChangeOp::DropTable { table } => vec![table.clone()],
            ChangeOp::RenameTable { from, to } => vec![from.clone(), to.clone()],
            ChangeOp::AddColumn { table, column } => {
                vec![table.clone(), column.name.clone(), column.sql_type.clone()]
            }
            ChangeOp::RemoveColumn { table, column } => vec![table.clone(), column.clone()],
            ChangeOp::RenameColumn { table, from, to } => {
                vec![table.clone(), from.clone(), to.clone()]
            }
            ChangeOp::AddIndex { table, columns, .. } | ChangeOp::RemoveIndex { table, columns } => {
                std::iter::once(table.clone()).chain(columns.iter().cloned()).collect()
            }
            ChangeOp::Execute(sql) | ChangeOp::ExecuteBlock(sql) => vec![sql.clone()],
            ChangeOp::EnableExtension(ext) | ChangeOp::DisableExtension(ext) => vec![ext.clone()],
        };
        let args: Vec<String> = args.iter().map(|a| format!("{a:?}")).collect();
        write!(f, "{}({})", self.kind(), args.join(", "))
    }
}

/// Capability set the sequencer requires of the system it changes
pub trait ExecutionTarget {
    /// Whether this target can track sequenced scripts at all
    fn supports_sequencing(&self) -> bool {
        true
    }

    /// Whether structural changes can be rolled back
    fn supports_transactional_changes(&self) -> bool;

    /// Operations [`ExecutionTarget::apply`] accepts
    fn supported_operations(&self) -> &[OpKind] {
        OpKind::ALL
    }

    fn table_exists(&self, name: &str) -> Result<bool>;
    fn create_tracking_table(&self, name: &str) -> Result<()>;
    fn tracked_versions(&self, table: &str) -> Result<Vec<String>>;
    fn insert_version(&self, table: &str, version: &str) -> Result<()>;
    fn delete_version(&self, table: &str, version: &str) -> Result<()>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;

    fn apply(&self, op: &ChangeOp) -> Result<()>;
}

/// Open transaction that rolls back unless committed
pub struct TransactionScope<'a> {
    target: &'a dyn ExecutionTarget,
    finished: bool,
}

impl<'a> TransactionScope<'a> {
    pub fn begin(target: &'a dyn ExecutionTarget) -> Result<Self> {
        target.begin()?;
        Ok(Self {
            target,
            finished: false,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.target.commit()?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.target.rollback()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.target.rollback() {
                error!("rollback of abandoned transaction failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_kind_names_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(kind.name().parse::<OpKind>().unwrap(), *kind);
        }
        assert!(matches!(
            "drop_database".parse::<OpKind>(),
            Err(ScriptError::UnsupportedOperation(name)) if name == "drop_database"
        ));
    }

    #[test]
    fn non_schema_set() {
        let free: Vec<_> = OpKind::ALL.iter().filter(|k| !k.is_schema_change()).collect();
        assert_eq!(free.len(), 6);
        assert!(OpKind::CreateTable.is_schema_change());
        assert!(!OpKind::Execute.is_schema_change());
    }

    #[test]
    fn from_call_parses_positional_arguments() {
        let op = ChangeOp::from_call("create_table", &["users", "id:INTEGER PRIMARY KEY", "email:TEXT"]).unwrap();
        assert_eq!(
            op,
            ChangeOp::CreateTable {
                table: "users".into(),
                columns: vec![
                    ColumnDef::new("id", "INTEGER PRIMARY KEY"),
                    ColumnDef::new("email", "TEXT")
                ],
            }
        );

        let op = ChangeOp::from_call("add_index", &["users", "email"]).unwrap();
        assert_eq!(op.to_string(), r#"add_index("users", "email")"#);
    }

    #[test]
    fn from_call_checks_arity() {
        let err = ChangeOp::from_call("rename_table", &["a"]).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidArguments { got: 1, .. }));

        let err = ChangeOp::from_call("add_index", &["users"]).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidArguments { expected, .. } if expected == "at least 2"));
    }

    #[test]
    fn index_name_convention() {
        let cols = vec!["email".to_string(), "name".to_string()];
        assert_eq!(ChangeOp::index_name("users", &cols), "index_users_on_email_and_name");
    }
}
