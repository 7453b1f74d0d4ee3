//! Reconfigure: change the advertise address of a single-node cluster.

use serde_json::json;

use crate::errors::{GravityError, Result};
use crate::ops::{Operation, OperationType};
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

pub struct ReconfigureUpdater;

impl Updater for ReconfigureUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::Reconfigure
    }

    fn validate_preconditions(&self, cluster: &ClusterEnv, config: &OperationConfig) -> Result<()> {
        let new_addr = config.advertise_addr.as_deref().ok_or_else(|| {
            GravityError::BadParameter("a reconfigure requires --advertise-addr".into())
        })?;
        if cluster.servers.len() != 1 {
            return Err(GravityError::BadParameter(
                "Only single-node clusters can be reconfigured.".into(),
            ));
        }
        let server = &cluster.servers[0];
        if server.advertise_ip == new_addr {
            return Err(GravityError::BadParameter(format!(
                "the cluster is already using {new_addr}"
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
        let new_addr = config.advertise_addr.as_deref().ok_or_else(|| {
            GravityError::BadParameter("a reconfigure requires --advertise-addr".into())
        })?;
        let server = cluster.servers.first().ok_or_else(|| {
            GravityError::BadParameter("the cluster has no servers".into())
        })?;
        let data = json!({
            "server": server.hostname,
            "old_addr": server.advertise_ip,
            "new_addr": new_addr,
        });

        let network = Phase::leaf("/network", "advertise_addr")
            .on_node(&server.advertise_ip)
            .with_data(data.clone());
        let agent = Phase::leaf("/agent", "restart_agent")
            .on_node(&server.advertise_ip)
            .with_data(data)
            .requires(&["/network"]);

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            cluster.servers.clone(),
            Phase::group("/", vec![network, agent]),
        ))
    }
}
