//! Expand operations: join new nodes to a running cluster.

use serde_json::json;

use crate::errors::{GravityError, Result};
use crate::ops::{Operation, OperationType};
use crate::ops::server::find_server;
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

pub struct ExpandUpdater;

impl Updater for ExpandUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::Expand
    }

    fn validate_preconditions(&self, cluster: &ClusterEnv, config: &OperationConfig) -> Result<()> {
        if config.joining.is_empty() {
            return Err(GravityError::BadParameter(
                "an expand requires at least one joining node".into(),
            ));
        }
        for joining in &config.joining {
            if find_server(&cluster.servers, &joining.advertise_ip).is_some()
                || find_server(&cluster.servers, &joining.hostname).is_some()
            {
                return Err(GravityError::BadParameter(format!(
                    "node {} is already part of the cluster",
                    joining.hostname
                )));
            }
        }
        Ok(())
    }

    fn build_plan(
        &self,
        cluster: &ClusterEnv,
        operation: &Operation,
        config: &OperationConfig,
    ) -> Result<OperationPlan> {
        let mut joining = config.joining.clone();
        joining.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let init = Phase::leaf("/init", "init");

        let checks = Phase::group(
            "/checks",
            joining
                .iter()
                .map(|server| {
                    Phase::leaf(&format!("/checks/{}", server.hostname), "checks")
                        .on_node(&server.advertise_ip)
                        .with_data(json!({ "server": server.hostname }))
                })
                .collect(),
        )
        .requires(&["/init"]);

        let system = Phase::group(
            "/system",
            joining
                .iter()
                .map(|server| {
                    Phase::leaf(&format!("/system/{}", server.hostname), "system")
                        .on_node(&server.advertise_ip)
                        .with_data(json!({
                            "server": server.hostname,
                            "role": server.role,
                        }))
                        .requires(&[&format!("/checks/{}", server.hostname)])
                })
                .collect(),
        )
        .requires(&["/checks"]);

        let post = Phase::leaf("/post", "post").requires(&["/system"]);

        let mut servers = cluster.servers.clone();
        servers.extend(joining);

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            servers,
            Phase::group("/", vec![init, checks, system, post]),
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
            servers: vec![Server::new("10.0.0.5", "m1", ServerRole::Master)],
            runtime_version: None,
        }
    }

    #[test]
    fn joining_node_flows_through_checks_then_system() {
        let cluster = cluster();
        let config = OperationConfig {
            joining: vec![Server::new("10.0.0.8", "n4", ServerRole::Node)],
            ..Default::default()
        };
        let op = Operation::new("prod", OperationType::Expand);
        let plan = ExpandUpdater.build_plan(&cluster, &op, &config).unwrap();
        plan.validate().unwrap();

        let system = plan.find("/system/n4").unwrap();
        assert_eq!(system.requires, vec!["/checks/n4"]);
        assert_eq!(system.node.as_deref(), Some("10.0.0.8"));
        // The plan roster includes the joining node.
        assert!(plan.servers.iter().any(|s| s.hostname == "n4"));
    }

    #[test]
    fn already_joined_node_is_rejected() {
        let cluster = cluster();
        let config = OperationConfig {
            joining: vec![Server::new("10.0.0.5", "m1", ServerRole::Node)],
            ..Default::default()
        };
        let err = ExpandUpdater
            .validate_preconditions(&cluster, &config)
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
