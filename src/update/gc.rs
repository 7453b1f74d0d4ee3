//! Garbage collection: prune stale artifacts on every node. The gc
//! handler is parallel-safe, so the per-node phases run concurrently.

use serde_json::json;

use crate::errors::Result;
use crate::ops::{Operation, OperationType};
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

pub struct GarbageCollectUpdater;

impl Updater for GarbageCollectUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::GarbageCollect
    }

    fn build_plan(
        &self,
        cluster: &ClusterEnv,
        operation: &Operation,
        _config: &OperationConfig,
    ) -> Result<OperationPlan> {
        let mut sorted = cluster.servers.clone();
        sorted.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let leaves = sorted
            .iter()
            .map(|server| {
                Phase::leaf(&format!("/gc/{}", server.hostname), "gc")
                    .on_node(&server.advertise_ip)
                    .with_data(json!({ "server": server.hostname }))
            })
            .collect();

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            cluster.servers.clone(),
            Phase::group("/", vec![Phase::group("/gc", leaves)]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Server, ServerRole};
    use crate::pack::PackageStore;
    use crate::storage::SqliteBackend;
    use std::sync::Arc;

    #[test]
    fn gc_phases_have_no_ordering_between_nodes() {
        let dir = std::env::temp_dir().join(format!("gravity-test-{}", uuid::Uuid::new_v4()));
        let cluster = ClusterEnv {
            cluster_id: "prod".into(),
            store: Arc::new(SqliteBackend::in_memory().unwrap()),
            packages: Arc::new(PackageStore::open(&dir).unwrap()),
            servers: vec![
                Server::new("10.0.0.5", "m1", ServerRole::Master),
                Server::new("10.0.0.6", "w1", ServerRole::Node),
            ],
            runtime_version: None,
        };
        let op = Operation::new("prod", OperationType::GarbageCollect);
        let plan = GarbageCollectUpdater
            .build_plan(&cluster, &op, &OperationConfig::default())
            .unwrap();
        plan.validate().unwrap();

        // No requires between the per-node phases: the handler is
        // parallel-safe and the engine may fan out.
        assert!(plan.find("/gc/m1").unwrap().requires.is_empty());
        assert!(plan.find("/gc/w1").unwrap().requires.is_empty());
    }
}
