//! `gravity agent` subcommands: run the per-node agent, deploy the fleet,
//! collect status, shut the fleet down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use console::style;

use super::App;
use crate::config::agent_status_timeout;
use crate::deploy::{AgentDeployer, DeployRequest, SshTransport};
use crate::errors::{GravityError, Result};
use crate::plan::engine::AgentDispatch;
use crate::rpc::{AGENT_PORT, AgentServer, AgentServerConfig};
use crate::update::handlers::default_registry;
use crate::update::updater::gravity_package;

/// Deadline granted to each agent at fleet shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Long-running agent entry point, launched by the service unit. A
/// leader agent started with an explicit handler (unattended upgrades)
/// kicks that handler off once it is serving.
pub async fn run(
    app: &App,
    leader: bool,
    listen: Option<SocketAddr>,
    startup_handler: Option<String>,
) -> Result<()> {
    let archive = app.credentials()?.ok_or_else(|| {
        GravityError::AccessDenied(format!(
            "no agent credentials at {}; deploy agents first",
            app.state.credentials_path().display()
        ))
    })?;

    let registry = default_registry(&app.handler_env()?);
    if let Some(tag) = &startup_handler {
        let handler = registry.get(tag)?;
        let coordinator = app.coordinator()?;
        let cluster_id = app.profile.cluster_id.clone();
        let cancel = app.cancel.clone();
        let tag = tag.clone();
        tokio::spawn(async move {
            // Let the listener come up before driving the operation.
            tokio::time::sleep(Duration::from_secs(2)).await;
            let operation = match coordinator.active_operation(&cluster_id, None).await {
                Ok(op) => op,
                Err(err) => {
                    tracing::warn!(%err, "startup handler has no operation to drive");
                    return;
                }
            };
            let ctx = crate::plan::registry::HandlerContext::new(operation.key, cancel);
            let phase = crate::plan::phase::Phase::leaf("/", &tag);
            if let Err(err) = handler.execute(&ctx, &phase).await {
                tracing::warn!(%err, handler = %tag, "startup handler failed");
            }
        });
    }

    let addr = listen.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], AGENT_PORT)));
    let server = AgentServer::new(AgentServerConfig {
        addr,
        archive,
        registry,
        leader,
    })?;

    // A signal drains the agent the same way a Shutdown RPC does.
    let stop = server.stop_token();
    let cancel = app.cancel.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        stop.cancel();
    });

    server.run().await
}

/// Install and start agents on every node of the roster.
pub async fn deploy(app: &App, version: Option<String>, leader_args: Vec<String>) -> Result<()> {
    let profile = &app.profile;
    if profile.servers.is_empty() {
        return Err(GravityError::BadParameter(
            "the cluster roster is empty; nothing to deploy to".into(),
        ));
    }
    let leader = profile
        .advertise_ip
        .clone()
        .or_else(|| profile.servers.first().map(|s| s.advertise_ip.clone()))
        .ok_or_else(|| {
            GravityError::PreconditionFailed("cannot determine the deployment leader".into())
        })?;
    let version = match version {
        Some(raw) => crate::ops::Locator::parse(&raw)?,
        None => gravity_package(),
    };

    let transport = Arc::new(SshTransport::new("root", profile.proxy.clone()));
    let deployer = AgentDeployer::new(transport, app.packages.clone());
    let request = DeployRequest {
        cluster_id: profile.cluster_id.clone(),
        servers: profile.servers.clone(),
        leader,
        version,
        base_runtime: profile.runtime_version.clone(),
        leader_args,
    };
    let archive = deployer.deploy(&app.cancel, &request).await?;

    // Keep the driver's own copy current for the runner.
    std::fs::write(app.state.credentials_path(), archive.to_bytes()?)?;
    println!("agents deployed to {} nodes", request.servers.len());
    Ok(())
}

/// Fleet health summary over the Version RPC. Returns true when every
/// agent answered.
pub async fn status(app: &App) -> Result<bool> {
    let runner = app.runner()?.ok_or_else(|| {
        GravityError::AccessDenied("no agent credentials on this node; deploy agents first".into())
    })?;
    let timeout = agent_status_timeout();

    let mut healthy = true;
    for server in &app.profile.servers {
        let answer =
            tokio::time::timeout(timeout, runner.version(&server.advertise_ip)).await;
        match answer {
            Ok(Ok((version, state))) => {
                println!(
                    "{} {} agent {} ({})",
                    style("✓").green(),
                    server.hostname,
                    version,
                    state
                );
            }
            Ok(Err(err)) => {
                healthy = false;
                println!("{} {} {}", style("✗").red(), server.hostname, err);
            }
            Err(_) => {
                healthy = false;
                println!(
                    "{} {} no answer within {}s",
                    style("✗").red(),
                    server.hostname,
                    timeout.as_secs()
                );
            }
        }
    }
    Ok(healthy)
}

/// Ask every agent to drain and stop.
pub async fn shutdown(app: &App) -> Result<()> {
    let runner = app.runner()?.ok_or_else(|| {
        GravityError::AccessDenied("no agent credentials on this node; deploy agents first".into())
    })?;
    for server in &app.profile.servers {
        match runner
            .shutdown_agent(&server.advertise_ip, SHUTDOWN_DEADLINE)
            .await
        {
            Ok(()) => println!("{} {} stopped", style("✓").green(), server.hostname),
            Err(err) => println!("{} {} {}", style("✗").red(), server.hostname, err),
        }
    }
    Ok(())
}
