//! Per-node agent: a long-running service executing phase handlers on
//! behalf of the driver.
//!
//! Handler execution is serialized by an async mutex so concurrent
//! commands cannot interfere on the node. The agent moves through
//! Stopped -> Serving -> Draining -> Stopped; a Shutdown request lets the
//! in-flight handler finish within the deadline before the listener goes
//! down.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::creds::CredentialsArchive;
use crate::errors::Result;
use crate::ops::OpKey;
use crate::plan::phase::Phase;
use crate::plan::registry::{HandlerContext, HandlerRegistry};
use crate::rpc::proto::agent::{
    AbortRequest, AbortResponse, CommandEvent, CommandRequest, Progress, ShutdownRequest,
    ShutdownResponse, VersionRequest, VersionResponse, command_event::Payload,
    agent_service_server::{AgentService, AgentServiceServer},
};

/// Lifecycle of the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Stopped = 0,
    Serving = 1,
    Draining = 2,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Serving,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Serving => "serving",
            Self::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Agent construction parameters.
pub struct AgentServerConfig {
    pub addr: SocketAddr,
    pub archive: CredentialsArchive,
    pub registry: HandlerRegistry,
    /// Whether this agent runs on the operation leader.
    pub leader: bool,
}

struct AgentInner {
    registry: HandlerRegistry,
    /// Serializes handler execution within the agent.
    exec: Mutex<()>,
    state: AtomicU8,
    /// Cancels the in-flight handler on Abort.
    current: Mutex<Option<CancellationToken>>,
    /// Cancels the listener on Shutdown.
    stop: CancellationToken,
}

impl AgentInner {
    fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

pub struct AgentServer {
    inner: Arc<AgentInner>,
    config: AgentServerConfig,
}

impl std::fmt::Debug for AgentServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AgentServer")
    }
}

impl AgentServer {
    /// Build an agent, verifying the credential validity window first. An
    /// expired archive refuses to serve so the operator sees the failure
    /// through the status path instead of TLS handshake noise.
    pub fn new(config: AgentServerConfig) -> Result<Self> {
        config.archive.check_validity(chrono::Utc::now())?;
        Ok(Self {
            inner: Arc::new(AgentInner {
                registry: config.registry.clone(),
                exec: Mutex::new(()),
                state: AtomicU8::new(AgentState::Stopped as u8),
                current: Mutex::new(None),
                stop: CancellationToken::new(),
            }),
            config,
        })
    }

    /// Token that stops the listener when cancelled; exposed so the signal
    /// handler can also trigger a drain.
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Bind and serve until shut down.
    pub async fn run(self) -> Result<()> {
        let service = AgentServiceImpl {
            inner: self.inner.clone(),
        };
        self.inner.set_state(AgentState::Serving);
        info!(addr = %self.config.addr, leader = self.config.leader, "agent serving");

        let stop = self.inner.stop.clone();
        Server::builder()
            .tls_config(self.config.archive.server_tls())?
            .add_service(AgentServiceServer::new(service))
            .serve_with_shutdown(self.config.addr, async move {
                stop.cancelled().await;
            })
            .await?;

        self.inner.set_state(AgentState::Stopped);
        info!("agent stopped");
        Ok(())
    }
}

struct AgentServiceImpl {
    inner: Arc<AgentInner>,
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    type CommandStream = Pin<Box<dyn Stream<Item = std::result::Result<CommandEvent, Status>> + Send>>;

    async fn command(
        &self,
        request: Request<CommandRequest>,
    ) -> std::result::Result<Response<Self::CommandStream>, Status> {
        let req = request.into_inner();
        if self.inner.state() != AgentState::Serving {
            return Err(Status::unavailable("agent is draining"));
        }

        let operation_id = uuid::Uuid::parse_str(&req.operation_id)
            .map_err(|e| Status::invalid_argument(format!("malformed operation id: {e}")))?;
        let op_key = OpKey::new(&req.cluster_id, operation_id);
        let data: serde_json::Value = serde_json::from_slice(&req.params)
            .map_err(|e| Status::invalid_argument(format!("malformed phase params: {e}")))?;
        let mut phase = Phase::leaf(&req.phase_id, &req.executor);
        phase.data = data;

        let handler = self
            .inner
            .registry
            .get(&req.executor)
            .map_err(Status::from)?;

        let rollback = req.direction == crate::rpc::proto::agent::Direction::Rollback as i32;
        let inner = self.inner.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            // One handler at a time within the agent.
            let _guard = inner.exec.lock().await;

            let cancel = CancellationToken::new();
            *inner.current.lock().await = Some(cancel.clone());
            let ctx = HandlerContext::new(op_key, cancel);

            let verb = if rollback { "rolling back" } else { "executing" };
            let _ = tx
                .send(Ok(CommandEvent {
                    payload: Some(Payload::Progress(Progress {
                        message: format!("{verb} phase {}", phase.id),
                        percent: 0,
                    })),
                }))
                .await;

            let outcome = if rollback {
                handler.rollback(&ctx, &phase).await
            } else {
                handler.execute(&ctx, &phase).await
            };
            *inner.current.lock().await = None;

            match outcome {
                Ok(()) => {
                    let _ = tx
                        .send(Ok(CommandEvent {
                            payload: Some(Payload::Status(
                                crate::rpc::proto::agent::Status {
                                    success: true,
                                    error: String::new(),
                                },
                            )),
                        }))
                        .await;
                }
                Err(err) => {
                    warn!(phase = %phase.id, %err, "handler failed");
                    // Kind survives the wire through the status code.
                    let _ = tx.send(Err(Status::from(err))).await;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn abort(
        &self,
        _request: Request<AbortRequest>,
    ) -> std::result::Result<Response<AbortResponse>, Status> {
        let aborted = match self.inner.current.lock().await.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        info!(aborted, "abort requested");
        Ok(Response::new(AbortResponse { acknowledged: aborted }))
    }

    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> std::result::Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: self.inner.state().to_string(),
        }))
    }

    async fn shutdown(
        &self,
        request: Request<ShutdownRequest>,
    ) -> std::result::Result<Response<ShutdownResponse>, Status> {
        let deadline = Duration::from_secs(request.into_inner().deadline_seconds.max(1));
        self.inner.set_state(AgentState::Draining);
        info!(?deadline, "shutdown requested, draining");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            // Wait for the in-flight handler, bounded by the deadline.
            if tokio::time::timeout(deadline, inner.exec.lock()).await.is_err() {
                warn!("drain deadline elapsed with handler still running");
                if let Some(token) = inner.current.lock().await.take() {
                    token.cancel();
                }
            }
            inner.stop.cancel();
        });

        Ok(Response::new(ShutdownResponse { acknowledged: true }))
    }
}
