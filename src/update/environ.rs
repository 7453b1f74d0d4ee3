//! Runtime environment updates: roll new environment variables across the
//! fleet, one node at a time, masters first.

use serde_json::json;

use crate::errors::{GravityError, Result};
use crate::ops::{Operation, OperationType, Server};
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

pub struct EnvironUpdater;

impl EnvironUpdater {
    fn node_group(server: &Server, env: &serde_json::Value, drain: bool) -> Phase {
        let base = format!("/update-environ/{}", server.hostname);
        let mut children = Vec::new();
        let mut previous: Option<String> = None;
        if drain {
            children.push(
                Phase::leaf(&format!("{base}/drain"), "drain")
                    .on_node(&server.advertise_ip)
                    .with_data(json!({ "server": server.hostname })),
            );
            previous = Some(format!("{base}/drain"));
        }
        let mut environ = Phase::leaf(&format!("{base}/environ"), "environ")
            .on_node(&server.advertise_ip)
            .with_data(json!({ "server": server.hostname, "env": env }));
        if let Some(prev) = &previous {
            environ = environ.requires(&[prev.as_str()]);
        }
        children.push(environ);
        if drain {
            children.push(
                Phase::leaf(&format!("{base}/uncordon"), "uncordon")
                    .on_node(&server.advertise_ip)
                    .with_data(json!({ "server": server.hostname }))
                    .requires(&[&format!("{base}/environ")]),
            );
        }
        Phase::group(&base, children)
    }
}

impl Updater for EnvironUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::UpdateRuntimeEnviron
    }

    fn validate_preconditions(&self, _cluster: &ClusterEnv, config: &OperationConfig) -> Result<()> {
        if config.env.is_empty() {
            return Err(GravityError::BadParameter(
                "a runtime environment update requires at least one variable".into(),
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
        let env = serde_json::to_value(&config.env)?;
        // Draining a single-node cluster would evict everything with
        // nowhere to go.
        let drain = cluster.servers.len() > 1;

        let mut ordered: Vec<Server> = cluster.masters().into_iter().cloned().collect();
        ordered.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        let mut workers: Vec<Server> = cluster.workers().into_iter().cloned().collect();
        workers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        ordered.extend(workers);

        let mut groups: Vec<Phase> = Vec::new();
        let mut previous: Option<String> = None;
        for server in &ordered {
            let mut group = Self::node_group(server, &env, drain);
            if let Some(prev) = &previous {
                group = group.requires(&[prev.as_str()]);
            }
            previous = Some(group.id.clone());
            groups.push(group);
        }

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            cluster.servers.clone(),
            Phase::group("/", vec![Phase::group("/update-environ", groups)]),
        ))
    }
}
