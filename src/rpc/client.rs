//! Driver-side agent runner: resolves a node to a connected agent and
//! dispatches phase work over mutually authenticated RPC.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::creds::CredentialsArchive;
use crate::errors::{GravityError, Result};
use crate::ops::OpKey;
use crate::plan::engine::{AgentDispatch, Direction};
use crate::plan::phase::Phase;
use crate::rpc::AGENT_PORT;
use crate::rpc::proto::agent::{
    self as proto, agent_service_client::AgentServiceClient, command_event::Payload,
};

/// Connects to per-node agents with cached channels and client
/// credentials. Channels are re-dialed opportunistically after a break.
pub struct AgentRunner {
    archive: CredentialsArchive,
    clients: Mutex<HashMap<String, AgentServiceClient<Channel>>>,
    port: u16,
}

impl AgentRunner {
    pub fn new(archive: CredentialsArchive) -> Self {
        Self {
            archive,
            clients: Mutex::new(HashMap::new()),
            port: AGENT_PORT,
        }
    }

    /// Override the agent port, used by tests that bind ephemeral ports.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn client(&self, node: &str) -> Result<AgentServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(node) {
            return Ok(client.clone());
        }
        let endpoint = Channel::from_shared(format!("https://{}:{}", node, self.port))
            .map_err(|e| GravityError::BadParameter(format!("invalid agent address {node}: {e}")))?
            .tls_config(self.archive.client_tls(node))?
            .connect_timeout(Duration::from_secs(5));
        let channel = endpoint.connect().await.map_err(|e| {
            GravityError::ConnectionProblem(format!("failed to connect to agent on {node}: {e}"))
        })?;
        let client = AgentServiceClient::new(channel);
        clients.insert(node.to_string(), client.clone());
        debug!(%node, "connected to agent");
        Ok(client)
    }

    /// Drop a cached channel so the next call re-dials.
    async fn evict(&self, node: &str) {
        self.clients.lock().await.remove(node);
    }

    /// Send a command and consume the event stream until the final status.
    async fn command(
        &self,
        node: &str,
        request: proto::CommandRequest,
    ) -> Result<()> {
        let mut client = self.client(node).await?;
        let mut stream = match client.command(request.clone()).await {
            Ok(response) => response.into_inner(),
            Err(_) => {
                // One reconnect attempt for a broken cached channel.
                self.evict(node).await;
                let mut client = self.client(node).await?;
                client
                    .command(request)
                    .await
                    .map_err(GravityError::from)?
                    .into_inner()
            }
        };

        loop {
            let event = match stream.message().await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(GravityError::ConnectionProblem(format!(
                        "agent on {node} closed the stream without a final status"
                    )));
                }
                Err(status) => {
                    self.evict(node).await;
                    return Err(status.into());
                }
            };
            match event.payload {
                Some(Payload::Progress(progress)) => {
                    info!(%node, percent = progress.percent, "{}", progress.message);
                }
                Some(Payload::Status(status)) => {
                    if status.success {
                        return Ok(());
                    }
                    return Err(GravityError::ConnectionProblem(format!(
                        "agent on {node} reported failure: {}",
                        status.error
                    )));
                }
                None => {}
            }
        }
    }

    /// Agent version and serving state, for `gravity agent status`.
    pub async fn version(&self, node: &str) -> Result<(String, String)> {
        let mut client = self.client(node).await?;
        let response = client
            .version(proto::VersionRequest {})
            .await
            .map_err(GravityError::from)?
            .into_inner();
        Ok((response.version, response.state))
    }

    /// Abort whatever the agent is running.
    pub async fn abort(&self, node: &str) -> Result<()> {
        let mut client = self.client(node).await?;
        client
            .abort(proto::AbortRequest {})
            .await
            .map_err(GravityError::from)?;
        Ok(())
    }
}

#[async_trait]
impl AgentDispatch for AgentRunner {
    async fn dispatch(
        &self,
        node: &str,
        op_key: &OpKey,
        phase: &Phase,
        direction: Direction,
        force: bool,
    ) -> Result<()> {
        let request = proto::CommandRequest {
            cluster_id: op_key.cluster_id.clone(),
            operation_id: op_key.operation_id.to_string(),
            phase_id: phase.id.clone(),
            executor: phase.executor.clone(),
            direction: match direction {
                Direction::Exec => proto::Direction::Exec as i32,
                Direction::Rollback => proto::Direction::Rollback as i32,
            },
            params: serde_json::to_vec(&phase.data)?,
            force,
        };
        info!(%node, phase = %phase.id, ?direction, "dispatching phase to agent");
        self.command(node, request).await
    }

    async fn shutdown_agent(&self, node: &str, deadline: Duration) -> Result<()> {
        let mut client = self.client(node).await?;
        let response = tokio::time::timeout(
            deadline,
            client.shutdown(proto::ShutdownRequest {
                deadline_seconds: deadline.as_secs(),
            }),
        )
        .await
        .map_err(|_| {
            GravityError::Timeout(format!("agent on {node} did not acknowledge shutdown"))
        })?
        .map_err(GravityError::from)?;
        if !response.into_inner().acknowledged {
            warn!(%node, "agent declined shutdown");
        }
        self.evict(node).await;
        Ok(())
    }
}
