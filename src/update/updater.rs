//! The updater seam: per-operation-type plan construction and lifecycle.
//!
//! Each operation type registers one updater. The coordinator routes to it;
//! the updater validates preconditions, creates the operation record,
//! builds the deterministic phase tree, and may adjust the agent deploy
//! request (e.g. to select the unattended-upgrade leader handler).

use std::sync::Arc;

use futures::FutureExt;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::deploy::DeployRequest;
use crate::errors::Result;
use crate::ops::{Locator, OpKey, Operation, OperationState, OperationType, Server};
use crate::pack::PackageStore;
use crate::plan::plan::OperationPlan;
use crate::storage::Backend;

/// Cluster context handed to updaters.
#[derive(Clone)]
pub struct ClusterEnv {
    pub cluster_id: String,
    pub store: Arc<dyn Backend>,
    pub packages: Arc<PackageStore>,
    /// Current cluster roster.
    pub servers: Vec<Server>,
    /// Installed base runtime version, when known.
    pub runtime_version: Option<Version>,
}

impl ClusterEnv {
    pub fn masters(&self) -> Vec<&Server> {
        self.servers.iter().filter(|s| s.is_master()).collect()
    }

    pub fn workers(&self) -> Vec<&Server> {
        self.servers.iter().filter(|s| !s.is_master()).collect()
    }
}

/// Per-invocation user configuration, as parsed from the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Target application or runtime package.
    pub package: Option<Locator>,
    /// New advertise address for reconfigure.
    pub advertise_addr: Option<String>,
    /// Identity token of the node leaving the cluster, for shrink.
    pub server: Option<String>,
    /// Nodes joining the cluster, for expand.
    #[serde(default)]
    pub joining: Vec<Server>,
    /// Runtime environment variables for environ updates.
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    /// Cluster configuration payload for config updates.
    pub config: Option<serde_json::Value>,
    /// Manual mode: create the plan, let the operator drive it.
    #[serde(default)]
    pub manual: bool,
}

/// Version of the running binary.
pub fn binary_version() -> Version {
    Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version is valid semver")
}

/// Locator every new plan pins as the binary required to execute it.
pub fn gravity_package() -> Locator {
    Locator::new("gravitational.io", "gravity", binary_version())
}

pub trait Updater: Send + Sync {
    fn op_type(&self) -> OperationType;

    /// Reject the operation before any record is created.
    fn validate_preconditions(&self, _cluster: &ClusterEnv, _config: &OperationConfig) -> Result<()> {
        Ok(())
    }

    /// Build the phase tree. Deterministic given its inputs.
    fn build_plan(
        &self,
        cluster: &ClusterEnv,
        operation: &Operation,
        config: &OperationConfig,
    ) -> Result<OperationPlan>;

    /// Adjust the agent deploy request for this operation type.
    fn update_deploy_request(&self, request: DeployRequest) -> DeployRequest {
        request
    }
}

impl std::fmt::Debug for dyn Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Updater>")
    }
}

/// Create the operation record and its plan, marking the operation Failed
/// on any error or panic between record creation and a usable plan. The
/// record must never be left dangling in Initialized with no plan and no
/// terminal state.
pub async fn create_operation(
    updater: &dyn Updater,
    cluster: &ClusterEnv,
    config: &OperationConfig,
) -> Result<(Operation, OperationPlan)> {
    updater.validate_preconditions(cluster, config)?;

    let operation = Operation::new(&cluster.cluster_id, updater.op_type())
        .with_vars(serde_json::to_value(config)?);
    cluster.store.create_operation(&operation).await?;

    let key = operation.key.clone();
    let work = async {
        let plan = updater.build_plan(cluster, &operation, config)?;
        plan.validate()?;
        cluster.store.create_plan(&plan).await?;
        cluster
            .store
            .update_operation_state(&operation.key, OperationState::Active)
            .await?;
        Ok(plan)
    };

    match std::panic::AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(plan)) => {
            let mut operation = operation;
            operation.state = OperationState::Active;
            Ok((operation, plan))
        }
        Ok(Err(err)) => {
            mark_failed(cluster.store.as_ref(), &key).await;
            Err(err)
        }
        Err(panic) => {
            mark_failed(cluster.store.as_ref(), &key).await;
            std::panic::resume_unwind(panic)
        }
    }
}

async fn mark_failed(store: &dyn Backend, key: &OpKey) {
    if let Err(err) = store.update_operation_state(key, OperationState::Failed).await {
        tracing::warn!(op = %key, %err, "could not mark failed operation");
    }
}
