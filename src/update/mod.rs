//! Operation coordinator: finds the active operation across stores and
//! routes lifecycle calls to the updater registered for its type.

pub mod configupd;
pub mod environ;
pub mod expand;
pub mod gc;
pub mod handlers;
pub mod install;
pub mod reconfigure;
pub mod shrink;
pub mod updater;
pub mod upgrade;

pub use updater::{ClusterEnv, OperationConfig, Updater, create_operation};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::errors::{GravityError, Result};
use crate::ops::{Operation, OperationType};
use crate::storage::Backend;

/// The stores consulted during operation discovery.
pub struct DiscoveryStores {
    /// Cluster-wide backend, authoritative when it answers.
    pub cluster: Arc<dyn Backend>,
    /// Node-local update store.
    pub local_update: Arc<dyn Backend>,
    /// Node-local join store.
    pub local_join: Arc<dyn Backend>,
    /// Remote installer store, consulted only while an install may still
    /// be running.
    pub installer: Option<Arc<dyn Backend>>,
}

pub struct Coordinator {
    stores: DiscoveryStores,
    updaters: HashMap<OperationType, Arc<dyn Updater>>,
}

impl Coordinator {
    pub fn new(stores: DiscoveryStores) -> Self {
        Self {
            stores,
            updaters: HashMap::new(),
        }
    }

    /// Coordinator with every built-in updater registered.
    pub fn with_default_updaters(stores: DiscoveryStores) -> Self {
        let mut coordinator = Self::new(stores);
        coordinator
            .register(Arc::new(install::InstallUpdater))
            .register(Arc::new(expand::ExpandUpdater))
            .register(Arc::new(upgrade::UpgradeUpdater))
            .register(Arc::new(environ::EnvironUpdater))
            .register(Arc::new(configupd::ConfigUpdater))
            .register(Arc::new(gc::GarbageCollectUpdater))
            .register(Arc::new(reconfigure::ReconfigureUpdater))
            .register(Arc::new(shrink::ShrinkUpdater));
        coordinator
    }

    pub fn register(&mut self, updater: Arc<dyn Updater>) -> &mut Self {
        self.updaters.insert(updater.op_type(), updater);
        self
    }

    /// Route to the updater for an operation type. The coordinator holds
    /// no type-specific logic itself.
    pub fn updater_for(&self, op_type: OperationType) -> Result<Arc<dyn Updater>> {
        self.updaters.get(&op_type).cloned().ok_or_else(|| {
            GravityError::NotImplemented(format!("no updater registered for {op_type} operations"))
        })
    }

    /// Collect operations from every relevant store, newest first,
    /// de-duplicated by id with the cluster-resident record preferred.
    pub async fn discover(&self, cluster_id: &str) -> Result<Vec<Operation>> {
        let cluster_ops = match self.stores.cluster.list_operations(cluster_id).await {
            Ok(ops) => ops,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };

        let mut merged: Vec<Operation> = cluster_ops.clone();
        let push_unless_known = |op: Operation, merged: &mut Vec<Operation>| {
            if !merged.iter().any(|known| known.key == op.key) {
                merged.push(op);
            }
        };

        for local in [&self.stores.local_update, &self.stores.local_join] {
            if let Ok(ops) = local.list_operations(cluster_id).await {
                if let Some(newest) = ops.into_iter().next() {
                    push_unless_known(newest, &mut merged);
                }
            }
        }

        // The installer store only matters while an install may still be
        // in flight: no active cluster operation, or the newest one is an
        // unfinished install.
        let installer_relevant = match cluster_ops.iter().find(|op| op.is_active()) {
            None => true,
            Some(op) => op.op_type == OperationType::Install,
        };
        if installer_relevant {
            if let Some(installer) = &self.stores.installer {
                if let Ok(ops) = installer.list_operations(cluster_id).await {
                    for op in ops {
                        push_unless_known(op, &mut merged);
                    }
                }
            }
        }

        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(count = merged.len(), "discovered operations");
        Ok(merged)
    }

    /// Select the single active operation, optionally narrowed by id.
    pub async fn active_operation(
        &self,
        cluster_id: &str,
        operation_id: Option<Uuid>,
    ) -> Result<Operation> {
        let mut candidates: Vec<Operation> = self
            .discover(cluster_id)
            .await?
            .into_iter()
            .filter(|op| op.is_active())
            .collect();
        if let Some(id) = operation_id {
            candidates.retain(|op| op.key.operation_id == id);
        }
        match candidates.len() {
            0 => Err(GravityError::NotFound(
                "no operation in progress".to_string(),
            )),
            1 => Ok(candidates.remove(0)),
            _ => Err(GravityError::AmbiguousOperation {
                ids: candidates
                    .iter()
                    .map(|op| op.key.operation_id.to_string())
                    .collect(),
            }),
        }
    }
}
