//! End-to-end tests over the public API: a full upgrade drive, the CAS
//! race guarantee, and the mutually authenticated agent fabric.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gravity::creds::CredentialsArchive;
use gravity::errors::{GravityError, Result};
use gravity::ops::{Locator, OpKey, Operation, OperationState, OperationType, Server, ServerRole};
use gravity::pack::PackageStore;
use gravity::plan::engine::{AgentDispatch, Direction, EngineConfig, PlanEngine};
use gravity::plan::executor::{PhaseExecutor, PhaseOptions};
use gravity::plan::phase::{Phase, PhaseState};
use gravity::plan::registry::{HandlerContext, HandlerRegistry, PhaseHandler};
use gravity::rpc::{AgentRunner, AgentServer, AgentServerConfig};
use gravity::storage::{Backend, LayeredStore, SqliteBackend};
use gravity::update::updater::{ClusterEnv, OperationConfig};
use gravity::update::{Coordinator, DiscoveryStores, create_operation, upgrade::UpgradeUpdater};

/// Records calls; fails phases listed in `fail_on`.
#[derive(Default)]
struct FakeHandler {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Vec<String>>,
}

impl FakeHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseHandler for FakeHandler {
    async fn execute(&self, _ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        self.calls.lock().unwrap().push(phase.id.clone());
        if self.fail_on.lock().unwrap().contains(&phase.id) {
            return Err(GravityError::AccessDenied(format!(
                "credentials rejected in {}",
                phase.id
            )));
        }
        Ok(())
    }

    async fn rollback(&self, _ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        self.calls.lock().unwrap().push(format!("undo {}", phase.id));
        Ok(())
    }
}

fn registry_with(handler: Arc<FakeHandler>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for tag in ["init", "drain", "apply", "uncordon", "finalize"] {
        registry.register(tag, handler.clone());
    }
    registry
}

fn single_node_cluster(store: Arc<dyn Backend>, packages: Arc<PackageStore>) -> ClusterEnv {
    ClusterEnv {
        cluster_id: "prod".into(),
        store,
        packages,
        servers: vec![Server::new("10.0.0.5", "m1", ServerRole::Master)],
        runtime_version: Some(semver::Version::new(6, 0, 0)),
    }
}

#[tokio::test]
async fn upgrade_drives_to_completion_and_goes_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let cluster_store: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().unwrap());
    let local_store: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().unwrap());
    let store: Arc<dyn Backend> =
        Arc::new(LayeredStore::new(cluster_store.clone(), local_store.clone()));
    let packages = Arc::new(PackageStore::open(dir.path()).unwrap());

    // Create the operation through the updater.
    let cluster = single_node_cluster(store.clone(), packages);
    let config = OperationConfig {
        package: Some(Locator::parse("gravitational.io/app:2.0.0").unwrap()),
        ..Default::default()
    };
    let (operation, plan) = create_operation(&UpgradeUpdater, &cluster, &config)
        .await
        .unwrap();
    assert_eq!(operation.state, OperationState::Active);

    // Drive it with a fake handler set. The single node is local, so no
    // agent fabric is needed.
    let handler = FakeHandler::new();
    let engine = PlanEngine::new(
        store.clone(),
        Arc::new(PhaseExecutor::new(store.clone(), registry_with(handler.clone()))),
        None,
        EngineConfig {
            binary_version: plan.gravity_package.version.clone(),
            skip_version_check: false,
            local_node: Some("10.0.0.5".into()),
        },
    );
    let ctx = HandlerContext::new(operation.key.clone(), CancellationToken::new());
    engine.resume(&ctx, PhaseOptions::default()).await.unwrap();
    engine.complete(&ctx, None).await.unwrap();

    // Phase order: init first, finalize last.
    let calls = handler.calls();
    assert_eq!(calls.first().map(String::as_str), Some("/init"));
    assert_eq!(calls.last().map(String::as_str), Some("/finalize"));

    // The operation reached its terminal state on both store layers.
    let finished = store.get_operation(&operation.key).await.unwrap();
    assert_eq!(finished.state, OperationState::Completed);

    // With the operation complete, the coordinator has nothing to drive.
    let coordinator = Coordinator::with_default_updaters(DiscoveryStores {
        cluster: cluster_store,
        local_update: local_store,
        local_join: Arc::new(SqliteBackend::in_memory().unwrap()),
        installer: None,
    });
    let err = coordinator
        .active_operation("prod", None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("no operation in progress"));
}

#[tokio::test]
async fn concurrent_phase_claims_have_one_winner() {
    let store = Arc::new(SqliteBackend::in_memory().unwrap());
    let key = OpKey::new("prod", uuid::Uuid::new_v4());
    let plan = gravity::plan::plan::OperationPlan::new(
        key.clone(),
        Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
        vec![],
        Phase::group("/", vec![Phase::leaf("/contended", "work")]),
    );
    store.create_plan(&plan).await.unwrap();

    let mut winners = 0;
    let mut losers = 0;
    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .change_phase_state(
                        &key,
                        &"/contended".to_string(),
                        PhaseState::Unstarted,
                        PhaseState::InProgress,
                        None,
                    )
                    .await
            })
        })
        .collect();
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => winners += 1,
            Err(err) => {
                assert!(err.is_compare_failed());
                losers += 1;
            }
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(losers, 1);
}

async fn start_agent(registry: HandlerRegistry) -> (CredentialsArchive, u16, CancellationToken) {
    let archive = CredentialsArchive::mint("prod", &["127.0.0.1".to_string()]).unwrap();
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let server = AgentServer::new(AgentServerConfig {
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        archive: archive.clone(),
        registry,
        leader: false,
    })
    .unwrap();
    let stop = server.stop_token();
    tokio::spawn(server.run());
    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(200)).await;
    (archive, port, stop)
}

#[tokio::test]
async fn agent_round_trip_over_mutual_tls() {
    let handler = FakeHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("work", handler.clone());
    let (archive, port, stop) = start_agent(registry).await;

    let runner = AgentRunner::new(archive).with_port(port);
    let key = OpKey::new("prod", uuid::Uuid::new_v4());
    let phase = Phase::leaf("/remote", "work").on_node("127.0.0.1");

    runner
        .dispatch("127.0.0.1", &key, &phase, Direction::Exec, false)
        .await
        .unwrap();
    assert_eq!(handler.calls(), vec!["/remote".to_string()]);

    let (version, state) = runner.version("127.0.0.1").await.unwrap();
    assert!(!version.is_empty());
    assert_eq!(state, "serving");

    // Handler failures keep their kind across the wire.
    handler.fail_on.lock().unwrap().push("/remote".to_string());
    let err = runner
        .dispatch("127.0.0.1", &key, &phase, Direction::Exec, false)
        .await
        .unwrap_err();
    assert!(err.is_access_denied());

    runner
        .shutdown_agent("127.0.0.1", Duration::from_secs(5))
        .await
        .unwrap();
    stop.cancelled().await;
}

#[tokio::test]
async fn agent_rejects_clients_from_another_cluster() {
    let (archive, port, stop) = start_agent(HandlerRegistry::new()).await;

    // A runner carrying credentials from a different CA cannot talk to
    // the agent: the client certificate does not chain to the agent's CA,
    // and the foreign CA does not vouch for the agent's server cert.
    let foreign = CredentialsArchive::mint("staging", &["127.0.0.1".to_string()]).unwrap();
    let runner = AgentRunner::new(foreign).with_port(port);
    let err = runner.version("127.0.0.1").await.unwrap_err();
    assert!(err.is_connection_problem() || err.is_access_denied());

    // The right archive still works.
    let runner = AgentRunner::new(archive).with_port(port);
    runner.version("127.0.0.1").await.unwrap();

    runner
        .shutdown_agent("127.0.0.1", Duration::from_secs(5))
        .await
        .unwrap();
    stop.cancelled().await;
}

#[tokio::test]
async fn expired_credentials_refuse_to_serve() {
    let mut archive = CredentialsArchive::mint("prod", &["127.0.0.1".to_string()]).unwrap();
    archive.expires_at = archive.issued_at - chrono::Duration::hours(1);
    let err = AgentServer::new(AgentServerConfig {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        archive,
        registry: HandlerRegistry::new(),
        leader: false,
    })
    .unwrap_err();
    assert!(err.is_access_denied());
}

#[tokio::test]
async fn completed_operations_do_not_resurface() {
    let cluster_store: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().unwrap());
    let mut op = Operation::new("prod", OperationType::Update);
    op.state = OperationState::Completed;
    cluster_store.create_operation(&op).await.unwrap();

    let coordinator = Coordinator::with_default_updaters(DiscoveryStores {
        cluster: cluster_store,
        local_update: Arc::new(SqliteBackend::in_memory().unwrap()),
        local_join: Arc::new(SqliteBackend::in_memory().unwrap()),
        installer: None,
    });
    let err = coordinator
        .active_operation("prod", None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
