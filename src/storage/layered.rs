//! Dual-store layering: cluster backend primary, local replica secondary.
//!
//! Writes land on the cluster backend first (it is authoritative), then on
//! the local replica; a replica write failure is logged and does not fail
//! the call. Reads prefer the cluster backend under a short timeout and
//! fall back to the replica, which is what keeps a node making progress
//! while the cluster backend itself restarts during an upgrade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::Backend;
use crate::errors::{GravityError, Result};
use crate::ops::{OpKey, Operation, OperationState};
use crate::plan::phase::{PhaseId, PhaseState};
use crate::plan::plan::OperationPlan;

/// How long a cluster-backend read may take before the replica answers.
const READ_FALLBACK_TIMEOUT: Duration = Duration::from_secs(1);

pub struct LayeredStore {
    cluster: Arc<dyn Backend>,
    local: Arc<dyn Backend>,
}

impl LayeredStore {
    pub fn new(cluster: Arc<dyn Backend>, local: Arc<dyn Backend>) -> Self {
        Self { cluster, local }
    }

    /// Run a read against the cluster backend with the fallback timeout,
    /// answering from the replica when the cluster store is slow or down.
    async fn read_preferring_cluster<T, F, G>(&self, cluster_read: F, local_read: G) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
        G: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(READ_FALLBACK_TIMEOUT, cluster_read).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_not_found() || err.is_bad_parameter() => Err(err),
            Ok(Err(err)) => {
                warn!(%err, "cluster backend read failed, falling back to local replica");
                local_read.await
            }
            Err(_elapsed) => {
                warn!("cluster backend read timed out, falling back to local replica");
                local_read.await
            }
        }
    }

    /// Replicate a successful cluster write to the local store, downgrading
    /// replica failures to warnings.
    fn note_replica_error(err: GravityError) {
        if !err.is_already_exists() {
            warn!(%err, "local replica write failed");
        }
    }
}

#[async_trait]
impl Backend for LayeredStore {
    async fn create_plan(&self, plan: &OperationPlan) -> Result<()> {
        self.cluster.create_plan(plan).await?;
        if let Err(err) = self.local.create_plan(plan).await {
            Self::note_replica_error(err);
        }
        Ok(())
    }

    async fn get_plan(&self, key: &OpKey) -> Result<OperationPlan> {
        self.read_preferring_cluster(self.cluster.get_plan(key), self.local.get_plan(key))
            .await
    }

    async fn change_phase_state(
        &self,
        key: &OpKey,
        phase_id: &PhaseId,
        from: PhaseState,
        to: PhaseState,
        error: Option<String>,
    ) -> Result<()> {
        self.cluster
            .change_phase_state(key, phase_id, from, to, error.clone())
            .await?;
        if let Err(err) = self
            .local
            .change_phase_state(key, phase_id, from, to, error)
            .await
        {
            // The replica may trail the cluster view; reconcile by copying
            // the authoritative plan over.
            if err.is_compare_failed() || err.is_not_found() {
                match self.cluster.get_plan(key).await {
                    Ok(plan) => {
                        if let Err(err) = self.local.create_plan(&plan).await {
                            Self::note_replica_error(err);
                        }
                    }
                    Err(err) => Self::note_replica_error(err),
                }
            } else {
                Self::note_replica_error(err);
            }
        }
        Ok(())
    }

    async fn list_operations(&self, cluster_id: &str) -> Result<Vec<Operation>> {
        self.read_preferring_cluster(
            self.cluster.list_operations(cluster_id),
            self.local.list_operations(cluster_id),
        )
        .await
    }

    async fn create_operation(&self, op: &Operation) -> Result<()> {
        self.cluster.create_operation(op).await?;
        if let Err(err) = self.local.create_operation(op).await {
            Self::note_replica_error(err);
        }
        Ok(())
    }

    async fn get_operation(&self, key: &OpKey) -> Result<Operation> {
        self.read_preferring_cluster(self.cluster.get_operation(key), self.local.get_operation(key))
            .await
    }

    async fn update_operation_state(&self, key: &OpKey, state: OperationState) -> Result<()> {
        self.cluster.update_operation_state(key, state).await?;
        if let Err(err) = self.local.update_operation_state(key, state).await {
            Self::note_replica_error(err);
        }
        Ok(())
    }
}
