//! Lifecycle commands outside the update family: reconfigure, shrink,
//! garbage collection, and cluster status.

use console::style;
use uuid::Uuid;

use super::{App, plan};
use crate::errors::Result;
use crate::ops::OperationType;
use crate::update::create_operation;
use crate::update::updater::OperationConfig;

/// Change the advertise address of a single-node cluster.
pub async fn reconfigure(app: &App, advertise_addr: String, manual: bool) -> Result<()> {
    run_operation(
        app,
        OperationType::Reconfigure,
        OperationConfig {
            advertise_addr: Some(advertise_addr),
            manual,
            ..Default::default()
        },
    )
    .await
}

/// Remove a node from the cluster.
pub async fn shrink(app: &App, server: String, manual: bool) -> Result<()> {
    run_operation(
        app,
        OperationType::Shrink,
        OperationConfig {
            server: Some(server),
            manual,
            ..Default::default()
        },
    )
    .await
}

/// Garbage-collect stale artifacts across the fleet.
pub async fn garbage_collect(app: &App, manual: bool) -> Result<()> {
    run_operation(
        app,
        OperationType::GarbageCollect,
        OperationConfig {
            manual,
            ..Default::default()
        },
    )
    .await
}

async fn run_operation(app: &App, op_type: OperationType, config: OperationConfig) -> Result<()> {
    let coordinator = app.coordinator()?;
    let updater = coordinator.updater_for(op_type)?;
    let cluster = app.cluster_env();
    let (operation, _plan) = create_operation(updater.as_ref(), &cluster, &config).await?;
    println!("{op_type} operation {} created", operation.key.operation_id);

    if config.manual {
        println!(
            "manual mode: drive the plan with {}",
            style("gravity plan execute").bold()
        );
        return Ok(());
    }
    plan::resume(app, Some(operation.key.operation_id), false, false).await
}

/// Cluster status: active operations plus agent fleet health. Returns the
/// process exit code (0 healthy, 3 degraded).
pub async fn status(app: &App, operation_id: Option<Uuid>) -> Result<i32> {
    let coordinator = app.coordinator()?;
    let operations = coordinator.discover(&app.profile.cluster_id).await?;

    if operations.is_empty() {
        println!("no operations recorded");
    }
    for op in &operations {
        if let Some(id) = operation_id {
            if op.key.operation_id != id {
                continue;
            }
        }
        println!(
            "{} {} {} ({:?})",
            op.created_at.format("%Y-%m-%d %H:%M:%S"),
            op.key.operation_id,
            op.op_type,
            op.state
        );
    }

    // Fleet health only when agents have been deployed.
    if app.credentials()?.is_some() && !app.profile.servers.is_empty() {
        let healthy = super::agent::status(app).await?;
        if !healthy {
            return Ok(3);
        }
    }
    Ok(0)
}
