//! Cluster configuration updates: push a new configuration document to
//! every node.

use serde_json::json;

use crate::errors::{GravityError, Result};
use crate::ops::{Operation, OperationType};
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

pub struct ConfigUpdater;

impl Updater for ConfigUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::UpdateConfig
    }

    fn validate_preconditions(&self, _cluster: &ClusterEnv, config: &OperationConfig) -> Result<()> {
        if config.config.is_none() {
            return Err(GravityError::BadParameter(
                "a configuration update requires the new configuration".into(),
            ));
        }
        Ok(())
    }

    fn build_plan(
        &self,
        cluster: &ClusterEnv,
        operation: &Operation,
        config: &OperationConfig,
    ) -> Result<OperationPlan> {
        let payload = config.config.clone().ok_or_else(|| {
            GravityError::BadParameter("a configuration update requires the new configuration".into())
        })?;

        let mut sorted = cluster.servers.clone();
        sorted.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let mut leaves: Vec<Phase> = Vec::new();
        let mut previous: Option<String> = None;
        for server in &sorted {
            let id = format!("/update-config/{}", server.hostname);
            let mut leaf = Phase::leaf(&id, "update_config")
                .on_node(&server.advertise_ip)
                .with_data(json!({ "server": server.hostname, "config": payload }));
            if let Some(prev) = &previous {
                leaf = leaf.requires(&[prev.as_str()]);
            }
            previous = Some(id);
            leaves.push(leaf);
        }

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            cluster.servers.clone(),
            Phase::group("/", vec![Phase::group("/update-config", leaves)]),
        ))
    }
}
