//! Durable record of plans and phase transitions.
//!
//! The store is layered: a cluster-wide strongly-consistent backend is
//! primary, and a node-local on-disk backend replicates the plan so nodes
//! can make progress while the cluster backend restarts mid-upgrade.

pub mod layered;
pub mod sqlite;

pub use layered::LayeredStore;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;

use crate::errors::Result;
use crate::ops::{OpKey, Operation, OperationState};
use crate::plan::phase::{PhaseId, PhaseState};
use crate::plan::plan::OperationPlan;

/// Storage backend for operations and their plans.
///
/// `change_phase_state` is the only mutation of a plan after creation and is
/// a compare-and-swap: it fails with `CompareFailed` when the stored state
/// does not match `from`. Two racing drivers resolve through this: exactly
/// one CAS wins.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist a new plan. Fails with `AlreadyExists` when the operation
    /// already has one.
    async fn create_plan(&self, plan: &OperationPlan) -> Result<()>;

    /// Load the plan for an operation. Fails with `NotFound`.
    async fn get_plan(&self, key: &OpKey) -> Result<OperationPlan>;

    /// Atomically transition one phase from `from` to `to`, preserving the
    /// error text verbatim.
    async fn change_phase_state(
        &self,
        key: &OpKey,
        phase_id: &PhaseId,
        from: PhaseState,
        to: PhaseState,
        error: Option<String>,
    ) -> Result<()>;

    /// All operations for a cluster, newest first by creation time.
    async fn list_operations(&self, cluster_id: &str) -> Result<Vec<Operation>>;

    /// Persist a new operation record.
    async fn create_operation(&self, op: &Operation) -> Result<()>;

    /// Load one operation record. Fails with `NotFound`.
    async fn get_operation(&self, key: &OpKey) -> Result<Operation>;

    /// Move an operation to a new lifecycle state.
    async fn update_operation_state(&self, key: &OpKey, state: OperationState) -> Result<()>;
}
