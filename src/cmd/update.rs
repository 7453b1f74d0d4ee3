//! Update commands: `gravity upgrade`, `gravity update download`,
//! `gravity update trigger`.

use console::style;
use futures::StreamExt;

use super::{App, plan};
use crate::errors::{GravityError, Result};
use crate::ops::{Locator, OperationType};
use crate::update::updater::OperationConfig;
use crate::update::create_operation;

/// Create an Update operation and, unless manual, drive it to completion.
pub async fn upgrade(app: &App, package: Option<String>, manual: bool) -> Result<()> {
    let package = match package {
        Some(raw) => Locator::parse(&raw)?,
        None => {
            // Default to the newest application in the store.
            let latest = Locator::latest("gravitational.io", "app");
            app.packages.resolve(&latest)?
        }
    };

    let coordinator = app.coordinator()?;
    let updater = coordinator.updater_for(OperationType::Update)?;
    let cluster = app.cluster_env();
    let config = OperationConfig {
        package: Some(package.clone()),
        manual,
        ..Default::default()
    };
    let (operation, _plan) = create_operation(updater.as_ref(), &cluster, &config).await?;
    println!(
        "update operation {} created for {}",
        operation.key.operation_id, package
    );

    // Fleet bootstrap: unattended upgrades get the leader handler.
    let leader_args = if manual {
        Vec::new()
    } else {
        let request = updater.update_deploy_request(crate::deploy::DeployRequest {
            cluster_id: cluster.cluster_id.clone(),
            servers: cluster.servers.clone(),
            leader: app
                .profile
                .advertise_ip
                .clone()
                .unwrap_or_default(),
            version: crate::update::updater::gravity_package(),
            base_runtime: app.profile.runtime_version.clone(),
            leader_args: Vec::new(),
        });
        request.leader_args
    };
    super::agent::deploy(app, None, leader_args).await?;

    if manual {
        println!(
            "manual mode: drive the plan with {}",
            style("gravity plan execute").bold()
        );
        return Ok(());
    }
    plan::resume(app, Some(operation.key.operation_id), false, false).await
}

/// Download a package from the distribution endpoint into the local
/// package store.
pub async fn download(app: &App, package: &str) -> Result<()> {
    let locator = Locator::parse(package)?;
    let base = app.profile.ops_url.as_deref().ok_or_else(|| {
        GravityError::BadParameter(
            "this cluster has no distribution endpoint on record".into(),
        )
    })?;
    let url = format!(
        "{}/packages/{}/{}/{}",
        base.trim_end_matches('/'),
        locator.repository,
        locator.name,
        locator.version
    );

    let response = reqwest::get(&url)
        .await
        .map_err(|e| GravityError::ConnectionProblem(format!("download failed: {e}")))?;
    if !response.status().is_success() {
        return Err(GravityError::ConnectionProblem(format!(
            "download of {locator} failed with {}",
            response.status()
        )));
    }

    let mut payload = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| GravityError::ConnectionProblem(format!("download failed: {e}")))?;
        payload.extend_from_slice(&chunk);
    }
    app.packages.upsert(&locator, &payload)?;
    println!("downloaded {locator} ({} bytes)", payload.len());
    Ok(())
}

/// Initiate an unattended update: create the operation and deploy agents
/// with the automatic upgrade handler; the leader agent drives the rest.
pub async fn trigger(app: &App, package: Option<String>) -> Result<()> {
    let package = match package {
        Some(raw) => Locator::parse(&raw)?,
        None => app
            .packages
            .resolve(&Locator::latest("gravitational.io", "app"))?,
    };

    let coordinator = app.coordinator()?;
    let updater = coordinator.updater_for(OperationType::Update)?;
    let cluster = app.cluster_env();
    let config = OperationConfig {
        package: Some(package.clone()),
        manual: false,
        ..Default::default()
    };
    let (operation, _plan) = create_operation(updater.as_ref(), &cluster, &config).await?;

    let request = updater.update_deploy_request(crate::deploy::DeployRequest {
        cluster_id: cluster.cluster_id.clone(),
        servers: cluster.servers.clone(),
        leader: app.profile.advertise_ip.clone().unwrap_or_default(),
        version: crate::update::updater::gravity_package(),
        base_runtime: app.profile.runtime_version.clone(),
        leader_args: Vec::new(),
    });
    super::agent::deploy(app, None, request.leader_args).await?;

    println!(
        "update operation {} triggered; the leader agent drives it to completion",
        operation.key.operation_id
    );
    Ok(())
}
