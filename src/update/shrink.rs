//! Shrink: drain a node and remove it from the cluster.

use serde_json::json;

use crate::errors::{GravityError, Result};
use crate::ops::server::find_server;
use crate::ops::{Operation, OperationType};
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

pub struct ShrinkUpdater;

impl ShrinkUpdater {
    fn leaving<'a>(cluster: &'a ClusterEnv, config: &OperationConfig) -> Result<&'a crate::ops::Server> {
        let token = config.server.as_deref().ok_or_else(|| {
            GravityError::BadParameter("a shrink requires the node to remove".into())
        })?;
        find_server(&cluster.servers, token)
            .ok_or_else(|| GravityError::NotFound(format!("no cluster node matches {token:?}")))
    }
}

impl Updater for ShrinkUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::Shrink
    }

    fn validate_preconditions(&self, cluster: &ClusterEnv, config: &OperationConfig) -> Result<()> {
        let leaving = Self::leaving(cluster, config)?;
        if cluster.servers.len() == 1 {
            return Err(GravityError::BadParameter(
                "cannot shrink a single-node cluster".into(),
            ));
        }
        if leaving.is_master() && cluster.masters().len() == 1 {
            return Err(GravityError::BadParameter(format!(
                "{} is the only master and cannot be removed",
                leaving.hostname
            )));
        }
        Ok(())
    }

    fn build_plan(
        &self,
        cluster: &ClusterEnv,
        operation: &Operation,
        config: &OperationConfig,
    ) -> Result<OperationPlan> {
        let leaving = Self::leaving(cluster, config)?;
        let data = json!({ "server": leaving.hostname });

        let drain = Phase::leaf("/drain", "drain")
            .on_node(&leaving.advertise_ip)
            .with_data(data.clone());
        // Removal runs on the leader, after the node is empty.
        let remove = Phase::leaf("/remove", "remove_node")
            .with_data(data)
            .requires(&["/drain"]);

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            cluster.servers.clone(),
            Phase::group("/", vec![drain, remove]),
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

    fn cluster() -> ClusterEnv {
        let dir = std::env::temp_dir().join(format!("gravity-test-{}", uuid::Uuid::new_v4()));
        ClusterEnv {
            cluster_id: "prod".into(),
            store: Arc::new(SqliteBackend::in_memory().unwrap()),
            packages: Arc::new(PackageStore::open(&dir).unwrap()),
            servers: vec![
                Server::new("10.0.0.5", "m1", ServerRole::Master),
                Server::new("10.0.0.6", "w1", ServerRole::Node),
            ],
            runtime_version: None,
        }
    }

    #[test]
    fn unknown_node_is_not_found() {
        let config = OperationConfig {
            server: Some("w9".into()),
            ..Default::default()
        };
        let err = ShrinkUpdater
            .validate_preconditions(&cluster(), &config)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn last_master_cannot_leave() {
        let config = OperationConfig {
            server: Some("m1".into()),
            ..Default::default()
        };
        let err = ShrinkUpdater
            .validate_preconditions(&cluster(), &config)
            .unwrap_err();
        assert!(err.is_bad_parameter());
        assert!(err.to_string().contains("only master"));
    }

    #[test]
    fn drain_precedes_removal() {
        let config = OperationConfig {
            server: Some("w1".into()),
            ..Default::default()
        };
        let op = Operation::new("prod", OperationType::Shrink);
        let plan = ShrinkUpdater.build_plan(&cluster(), &op, &config).unwrap();
        plan.validate().unwrap();
        assert_eq!(plan.find("/remove").unwrap().requires, vec!["/drain"]);
        assert_eq!(plan.find("/drain").unwrap().node.as_deref(), Some("10.0.0.6"));
        // Removal itself runs on the leader.
        assert!(plan.find("/remove").unwrap().node.is_none());
    }
}
