//! Install operations: bring a cluster up from an image.

use serde_json::json;

use crate::errors::{GravityError, Result};
use crate::ops::{Operation, OperationType};
use crate::plan::phase::Phase;
use crate::plan::plan::OperationPlan;
use crate::update::updater::{ClusterEnv, OperationConfig, Updater, gravity_package};

pub struct InstallUpdater;

impl Updater for InstallUpdater {
    fn op_type(&self) -> OperationType {
        OperationType::Install
    }

    fn validate_preconditions(&self, cluster: &ClusterEnv, config: &OperationConfig) -> Result<()> {
        if config.package.is_none() {
            return Err(GravityError::BadParameter(
                "an install requires the application package to install".into(),
            ));
        }
        if cluster.servers.is_empty() {
            return Err(GravityError::BadParameter(
                "an install requires at least one server".into(),
            ));
        }
        if cluster.masters().is_empty() {
            return Err(GravityError::BadParameter(
                "an install requires at least one master".into(),
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
        let target = config.package.as_ref().ok_or_else(|| {
            GravityError::BadParameter("an install requires the application package".into())
        })?;
        let package = serde_json::to_value(target)?;

        let configure =
            Phase::leaf("/configure", "configure").with_data(json!({ "package": package }));

        let mut sorted = cluster.servers.clone();
        sorted.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let bootstrap = Phase::group(
            "/bootstrap",
            sorted
                .iter()
                .map(|server| {
                    Phase::leaf(&format!("/bootstrap/{}", server.hostname), "bootstrap")
                        .on_node(&server.advertise_ip)
                        .with_data(json!({ "server": server.hostname }))
                })
                .collect(),
        )
        .requires(&["/configure"]);

        let pull = Phase::group(
            "/pull",
            sorted
                .iter()
                .map(|server| {
                    Phase::leaf(&format!("/pull/{}", server.hostname), "pull")
                        .on_node(&server.advertise_ip)
                        .with_data(json!({ "server": server.hostname, "package": package }))
                })
                .collect(),
        )
        .requires(&["/bootstrap"]);

        let masters = Phase::group(
            "/masters",
            sorted
                .iter()
                .filter(|s| s.is_master())
                .map(|server| {
                    Phase::leaf(&format!("/masters/{}", server.hostname), "system")
                        .on_node(&server.advertise_ip)
                        .with_data(json!({ "server": server.hostname }))
                })
                .collect(),
        )
        .requires(&["/pull"]);

        let mut children = vec![configure, bootstrap, pull, masters];
        let mut app_requires = vec!["/masters"];

        let workers: Vec<_> = sorted.iter().filter(|s| !s.is_master()).collect();
        if !workers.is_empty() {
            children.push(
                Phase::group(
                    "/nodes",
                    workers
                        .iter()
                        .map(|server| {
                            Phase::leaf(&format!("/nodes/{}", server.hostname), "system")
                                .on_node(&server.advertise_ip)
                                .with_data(json!({ "server": server.hostname }))
                        })
                        .collect(),
                )
                .requires(&["/masters"]),
            );
            app_requires.push("/nodes");
        }

        children.push(
            Phase::leaf("/app", "app")
                .with_data(json!({ "package": package }))
                .requires(&app_requires),
        );
        children.push(Phase::leaf("/finalize", "finalize").requires(&["/app"]));

        Ok(OperationPlan::new(
            operation.key.clone(),
            gravity_package(),
            cluster.servers.clone(),
            Phase::group("/", children),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Locator, Server, ServerRole};
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

    fn config() -> OperationConfig {
        OperationConfig {
            package: Some(Locator::parse("gravitational.io/app:1.0.0").unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn plan_orders_bootstrap_pull_system_app() {
        let cluster = cluster();
        let op = Operation::new("prod", OperationType::Install);
        let plan = InstallUpdater.build_plan(&cluster, &op, &config()).unwrap();
        plan.validate().unwrap();

        assert_eq!(plan.find("/bootstrap").unwrap().requires, vec!["/configure"]);
        assert_eq!(plan.find("/pull").unwrap().requires, vec!["/bootstrap"]);
        assert_eq!(plan.find("/masters").unwrap().requires, vec!["/pull"]);
        assert_eq!(plan.find("/nodes").unwrap().requires, vec!["/masters"]);
        let app = plan.find("/app").unwrap();
        assert!(app.requires.contains(&"/nodes".to_string()));
        assert_eq!(plan.find("/finalize").unwrap().requires, vec!["/app"]);
    }

    #[test]
    fn masterless_roster_is_rejected() {
        let mut cluster = cluster();
        cluster.servers = vec![Server::new("10.0.0.6", "w1", ServerRole::Node)];
        let err = InstallUpdater
            .validate_preconditions(&cluster, &config())
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
