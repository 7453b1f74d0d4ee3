//! SQLite-backed store for operations and plans.
//!
//! One instance backs the node-local replica under the state directory;
//! another, pointed at the shared state volume, serves as the cluster
//! backend in single-store deployments. Phase trees are stored as one JSON
//! document per plan; the CAS transition runs inside an immediate
//! transaction so concurrent writers serialize on the database lock.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, params};

use super::Backend;

use crate::errors::{GravityError, Result};
use crate::ops::{OpKey, Operation, OperationState};
use crate::plan::phase::{PhaseId, PhaseState};
use crate::plan::plan::OperationPlan;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.init()?;
        Ok(backend)
    }

    /// In-memory database, used by tests and by the installer store shim.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.init()?;
        Ok(backend)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS operations (
                cluster_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                op_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                state TEXT NOT NULL,
                vars TEXT NOT NULL DEFAULT 'null',
                PRIMARY KEY (cluster_id, operation_id)
            );

            CREATE TABLE IF NOT EXISTS plans (
                cluster_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                gravity_package TEXT NOT NULL,
                servers TEXT NOT NULL,
                root TEXT NOT NULL,
                PRIMARY KEY (cluster_id, operation_id)
            );

            CREATE INDEX IF NOT EXISTS idx_operations_created
                ON operations(cluster_id, created_at DESC);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; propagating the
        // poison here would wedge every later store call.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn create_plan(&self, plan: &OperationPlan) -> Result<()> {
        let servers = serde_json::to_string(&plan.servers)?;
        let root = serde_json::to_string(&plan.root)?;
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO plans (cluster_id, operation_id, gravity_package, servers, root)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                plan.op_key.cluster_id,
                plan.op_key.operation_id.to_string(),
                plan.gravity_package.to_string(),
                servers,
                root
            ],
        )?;
        if inserted == 0 {
            return Err(GravityError::AlreadyExists(format!(
                "plan for operation {}",
                plan.op_key
            )));
        }
        Ok(())
    }

    async fn get_plan(&self, key: &OpKey) -> Result<OperationPlan> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT gravity_package, servers, root FROM plans
                 WHERE cluster_id = ?1 AND operation_id = ?2",
                params![key.cluster_id, key.operation_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    GravityError::NotFound(format!("plan for operation {key}"))
                }
                other => other.into(),
            })?;
        Ok(OperationPlan {
            op_key: key.clone(),
            gravity_package: crate::ops::Locator::parse(&row.0)?,
            servers: serde_json::from_str(&row.1)?,
            root: serde_json::from_str(&row.2)?,
        })
    }

    async fn change_phase_state(
        &self,
        key: &OpKey,
        phase_id: &PhaseId,
        from: PhaseState,
        to: PhaseState,
        error: Option<String>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let root: String = tx
            .query_row(
                "SELECT root FROM plans WHERE cluster_id = ?1 AND operation_id = ?2",
                params![key.cluster_id, key.operation_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    GravityError::NotFound(format!("plan for operation {key}"))
                }
                other => other.into(),
            })?;
        let mut root: crate::plan::phase::Phase = serde_json::from_str(&root)?;

        let current = find_state(&root, phase_id)
            .ok_or_else(|| GravityError::NotFound(format!("phase {phase_id}")))?;
        if current != from {
            return Err(GravityError::CompareFailed(format!(
                "phase {phase_id} is {current}, expected {from}"
            )));
        }
        apply_state(&mut root, phase_id, to, error);

        let encoded = serde_json::to_string(&root)?;
        tx.execute(
            "UPDATE plans SET root = ?3 WHERE cluster_id = ?1 AND operation_id = ?2",
            params![key.cluster_id, key.operation_id.to_string(), encoded],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn list_operations(&self, cluster_id: &str) -> Result<Vec<Operation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT cluster_id, operation_id, op_type, created_at, state, vars
             FROM operations WHERE cluster_id = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![cluster_id], row_to_operation)?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row??);
        }
        Ok(ops)
    }

    async fn create_operation(&self, op: &Operation) -> Result<()> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO operations
                 (cluster_id, operation_id, op_type, created_at, state, vars)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                op.key.cluster_id,
                op.key.operation_id.to_string(),
                serde_json::to_string(&op.op_type)?,
                op.created_at.to_rfc3339(),
                serde_json::to_string(&op.state)?,
                serde_json::to_string(&op.vars)?,
            ],
        )?;
        if inserted == 0 {
            return Err(GravityError::AlreadyExists(format!("operation {}", op.key)));
        }
        Ok(())
    }

    async fn get_operation(&self, key: &OpKey) -> Result<Operation> {
        let conn = self.lock();
        let op = conn
            .query_row(
                "SELECT cluster_id, operation_id, op_type, created_at, state, vars
                 FROM operations WHERE cluster_id = ?1 AND operation_id = ?2",
                params![key.cluster_id, key.operation_id.to_string()],
                row_to_operation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    GravityError::NotFound(format!("operation {key}"))
                }
                other => other.into(),
            })??;
        Ok(op)
    }

    async fn update_operation_state(&self, key: &OpKey, state: OperationState) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE operations SET state = ?3 WHERE cluster_id = ?1 AND operation_id = ?2",
            params![
                key.cluster_id,
                key.operation_id.to_string(),
                serde_json::to_string(&state)?
            ],
        )?;
        if updated == 0 {
            return Err(GravityError::NotFound(format!("operation {key}")));
        }
        Ok(())
    }
}

type RowResult = std::result::Result<Result<Operation>, rusqlite::Error>;

fn row_to_operation(row: &rusqlite::Row<'_>) -> RowResult {
    let cluster_id: String = row.get(0)?;
    let operation_id: String = row.get(1)?;
    let op_type: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let state: String = row.get(4)?;
    let vars: String = row.get(5)?;
    Ok(decode_operation(
        cluster_id,
        operation_id,
        op_type,
        created_at,
        state,
        vars,
    ))
}

fn decode_operation(
    cluster_id: String,
    operation_id: String,
    op_type: String,
    created_at: String,
    state: String,
    vars: String,
) -> Result<Operation> {
    let operation_id = uuid::Uuid::parse_str(&operation_id)
        .map_err(|e| GravityError::BadParameter(format!("malformed operation id: {e}")))?;
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| GravityError::BadParameter(format!("malformed timestamp: {e}")))?
        .with_timezone(&chrono::Utc);
    Ok(Operation {
        key: OpKey::new(&cluster_id, operation_id),
        op_type: serde_json::from_str(&op_type)?,
        created_at,
        state: serde_json::from_str(&state)?,
        vars: serde_json::from_str(&vars)?,
    })
}

fn find_state(root: &crate::plan::phase::Phase, id: &str) -> Option<PhaseState> {
    if root.id == id {
        return Some(root.state);
    }
    root.children.iter().find_map(|c| find_state(c, id))
}

fn apply_state(root: &mut crate::plan::phase::Phase, id: &str, state: PhaseState, error: Option<String>) {
    if root.id == id {
        root.state = state;
        root.error = error;
        root.updated_at = chrono::Utc::now();
        return;
    }
    for child in &mut root.children {
        apply_state(child, id, state, error.clone());
    }
}
