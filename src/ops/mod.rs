//! Operation records: the durable identity of a cluster-level action.
//!
//! An operation is created by the updater for its type, mutated only by the
//! plan engine or explicit coordinator calls, and terminal once Completed or
//! Failed.

pub mod locator;
pub mod server;

pub use locator::Locator;
pub use server::{Server, ServerRole};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique key of an operation across all stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpKey {
    pub cluster_id: String,
    pub operation_id: Uuid,
}

impl OpKey {
    pub fn new(cluster_id: &str, operation_id: Uuid) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            operation_id,
        }
    }
}

impl std::fmt::Display for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cluster_id, self.operation_id)
    }
}

/// Kind of cluster lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Install,
    Expand,
    Update,
    UpdateRuntimeEnviron,
    UpdateConfig,
    GarbageCollect,
    Reconfigure,
    Shrink,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Expand => "expand",
            Self::Update => "update",
            Self::UpdateRuntimeEnviron => "update_runtime_environ",
            Self::UpdateConfig => "update_config",
            Self::GarbageCollect => "garbage_collect",
            Self::Reconfigure => "reconfigure",
            Self::Shrink => "shrink",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Initialized,
    Active,
    Completed,
    Failed,
}

impl OperationState {
    /// Completed and Failed are terminal; the record never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A durable cluster-level action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub key: OpKey,
    pub op_type: OperationType,
    pub created_at: DateTime<Utc>,
    pub state: OperationState,
    /// Free-form operation input recorded at creation time.
    #[serde(default)]
    pub vars: serde_json::Value,
}

impl Operation {
    pub fn new(cluster_id: &str, op_type: OperationType) -> Self {
        Self {
            key: OpKey::new(cluster_id, Uuid::new_v4()),
            op_type,
            created_at: Utc::now(),
            state: OperationState::Initialized,
            vars: serde_json::Value::Null,
        }
    }

    pub fn with_vars(mut self, vars: serde_json::Value) -> Self {
        self.vars = vars;
        self
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_starts_initialized_and_active() {
        let op = Operation::new("prod", OperationType::Update);
        assert_eq!(op.state, OperationState::Initialized);
        assert!(op.is_active());
    }

    #[test]
    fn terminal_states() {
        assert!(!OperationState::Initialized.is_terminal());
        assert!(!OperationState::Active.is_terminal());
        assert!(OperationState::Completed.is_terminal());
        assert!(OperationState::Failed.is_terminal());
    }

    #[test]
    fn operation_type_serde_is_snake_case() {
        let json = serde_json::to_string(&OperationType::UpdateRuntimeEnviron).unwrap();
        assert_eq!(json, "\"update_runtime_environ\"");
    }
}
