//! Update operations: upgrade the application and the underlying runtime.
//!
//! The plan rolls masters one at a time (drain, apply, uncordon), then the
//! workers, then finalizes. Unattended upgrades install the
//! `automatic_upgrade` handler on the leader agent so the fleet drives the
//! plan without an operator at the terminal.

use semver::Version;
use serde_json::json;

use crate::deploy::DeployRequest;
use crate::errors::{GravityError, Result};
use crate::ops::{Operation, OperationType, Server};
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

/// Oldest installed runtime an upgrade can start from.
const MIN_RUNTIME: (u64, u64, u64) = (5, 0, 0);

pub struct UpgradeUpdater;

impl UpgradeUpdater {
    fn node_phases(parent: &str, server: &Server, package: &serde_json::Value) -> Phase {
        let base = format!("{parent}/{}", server.hostname);
        let drain = Phase::leaf(&format!("{base}/drain"), "drain")
            .on_node(&server.advertise_ip)
            .with_data(json!({ "server": server.hostname }));
        let apply = Phase::leaf(&format!("{base}/apply"), "apply")
            .on_node(&server.advertise_ip)
            .with_data(json!({ "server": server.hostname, "package": package }))
            .requires(&[&format!("{base}/drain")]);
        let uncordon = Phase::leaf(&format!("{base}/uncordon"), "uncordon")
            .on_node(&server.advertise_ip)
            .with_data(json!({ "server": server.hostname }))
            .requires(&[&format!("{base}/apply")]);
        Phase::group(&base, vec![drain, apply, uncordon])
    }
}

impl Updater for UpgradeUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::Update
    }

    fn validate_preconditions(&self, cluster: &ClusterEnv, config: &OperationConfig) -> Result<()> {
        if config.package.is_none() {
            return Err(GravityError::BadParameter(
                "an update requires a target package".into(),
            ));
        }
        let minimum = Version::new(MIN_RUNTIME.0, MIN_RUNTIME.1, MIN_RUNTIME.2);
        match &cluster.runtime_version {
            Some(installed) if *installed < minimum => Err(GravityError::BadParameter(format!(
                "installed runtime {installed} is too old to upgrade from, {minimum} or newer \
                 is required"
            ))),
            Some(_) => Ok(()),
            None => Err(GravityError::PreconditionFailed(
                "cannot determine the installed runtime version".into(),
            )),
        }
    }

    fn build_plan(
        &self,
        cluster: &ClusterEnv,
        operation: &Operation,
        config: &OperationConfig,
    ) -> Result<OperationPlan> {
        let target = config.package.as_ref().ok_or_else(|| {
            GravityError::BadParameter("an update requires a target package".into())
        })?;
        let package = serde_json::to_value(target)?;

        let init = Phase::leaf("/init", "init").with_data(json!({ "package": package }));

        let mut masters: Vec<Phase> = Vec::new();
        let mut previous: Option<String> = None;
        for server in sorted(cluster.masters()) {
            let mut group = Self::node_phases("/masters", &server, &package);
            if let Some(prev) = &previous {
                group = group.requires(&[prev.as_str()]);
            }
            previous = Some(group.id.clone());
            masters.push(group);
        }
        let masters = Phase::group("/masters", masters).requires(&["/init"]);

        let workers = sorted(cluster.workers());
        let mut children = vec![init, masters];
        let mut finalize_requires = vec!["/masters".to_string()];
        if !workers.is_empty() {
            let mut nodes: Vec<Phase> = Vec::new();
            let mut previous: Option<String> = None;
            for server in workers {
                let mut group = Self::node_phases("/nodes", &server, &package);
                if let Some(prev) = &previous {
                    group = group.requires(&[prev.as_str()]);
                }
                previous = Some(group.id.clone());
                nodes.push(group);
            }
            children.push(Phase::group("/nodes", nodes).requires(&["/masters"]));
            finalize_requires.push("/nodes".to_string());
        }

        let requires: Vec<&str> = finalize_requires.iter().map(String::as_str).collect();
        children.push(
            Phase::leaf("/finalize", "finalize")
                .with_data(json!({ "package": package }))
                .requires(&requires),
        );

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            cluster.servers.clone(),
            Phase::group("/", children),
        ))
    }

    fn update_deploy_request(&self, mut request: DeployRequest) -> DeployRequest {
        request
            .leader_args
            .push("--handler=automatic_upgrade".to_string());
        request
    }
}

fn sorted(servers: Vec<&Server>) -> Vec<Server> {
    let mut servers: Vec<Server> = servers.into_iter().cloned().collect();
    servers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    servers
}
