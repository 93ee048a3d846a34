use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, ScriptError};
use crate::target::{ChangeOp, ExecutionTarget, OpKind};

/// SQLite has no `CREATE EXTENSION`, so extension toggles are left out
const SQLITE_OPERATIONS: &[OpKind] = &[
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
];

/// SQLite execution target
pub struct Database {
    pub conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScriptError::io(format!("create {}", parent.display()), e))?;
        }
        let conn = Connection::open(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Self::new(Path::new(db_path))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    fn render(op: &ChangeOp) -> String {
        match op {
            ChangeOp::CreateTable { table, columns } => {
                let columns: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{} {}", quote(&c.name), c.sql_type))
                    .collect();
                format!("CREATE TABLE {} ({})", quote(table), columns.join(", "))
            }
            ChangeOp::DropTable { table } => format!("DROP TABLE {}", quote(table)),
            ChangeOp::RenameTable { from, to } => {
                format!("ALTER TABLE {} RENAME TO {}", quote(from), quote(to))
            }
            ChangeOp::AddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote(table),
                quote(&column.name),
                column.sql_type
            ),
            ChangeOp::RemoveColumn { table, column } => {
                format!("ALTER TABLE {} DROP COLUMN {}", quote(table), quote(column))
            }
            ChangeOp::RenameColumn { table, from, to } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote(table),
                quote(from),
                quote(to)
            ),
            ChangeOp::AddIndex {
                table,
                columns,
                unique,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| quote(c)).collect();
                format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote(&ChangeOp::index_name(table, columns)),
                    quote(table),
                    cols.join(", ")
                )
            }
            ChangeOp::RemoveIndex { table, columns } => {
                format!("DROP INDEX {}", quote(&ChangeOp::index_name(table, columns)))
            }
            ChangeOp::Execute(sql) | ChangeOp::ExecuteBlock(sql) => sql.clone(),
            ChangeOp::EnableExtension(_) | ChangeOp::DisableExtension(_) => String::new(),
        }
    }
}

/// Quote an identifier, doubling embedded quotes
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl ExecutionTarget for Database {
    fn supports_transactional_changes(&self) -> bool {
        true
    }

    fn supported_operations(&self) -> &[OpKind] {
        SQLITE_OPERATIONS
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_tracking_table(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (version TEXT PRIMARY KEY NOT NULL)",
                quote(name)
            ),
            [],
        )?;
        Ok(())
    }

    fn tracked_versions(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT version FROM {}", quote(table)))?;
        let versions = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(versions.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_version(&self, table: &str, version: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("INSERT INTO {} (version) VALUES (?1)", quote(table)),
            params![version],
        )?;
        Ok(())
    }

    fn delete_version(&self, table: &str, version: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("DELETE FROM {} WHERE version = ?1", quote(table)),
            params![version],
        )?;
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        self.conn.lock().execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            warn!("rollback requested with no open transaction");
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn apply(&self, op: &ChangeOp) -> Result<()> {
        if !SQLITE_OPERATIONS.contains(&op.kind()) {
            return Err(ScriptError::UnsupportedOperation(op.kind().to_string()));
        }
        let sql = Self::render(op);
        debug!(%sql, "apply");
        self.conn.lock().execute_batch(&sql)?;
        Ok(())
    }
}
