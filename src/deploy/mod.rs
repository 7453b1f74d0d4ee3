//! Agent deployer: brings the per-node agent fleet up for an operation.
//!
//! Runs once per operation (or per credential rotation): probe every node,
//! mint or reuse the credentials archive, push the agent binary, install
//! the service unit, then verify connectivity. A fatal failure after the
//! mint removes a freshly created archive version so a healthy old package
//! is never shadowed by an orphan.

pub mod transport;

pub use transport::{NodeTransport, SshTransport};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::creds::CredentialsArchive;
use crate::errors::{GravityError, Result};
use crate::ops::{Locator, Server};
use crate::pack::PackageStore;
use crate::rpc::AgentRunner;

/// Service unit installed on every node.
pub const AGENT_SERVICE_UNIT: &str = "gravity-agent.service";

/// Canonical path of the agent binary on each node.
pub const AGENT_BINARY_PATH: &str = "/usr/local/bin/gravity-agent";

/// Well-known archive path the agent loads its credentials from.
pub const AGENT_CREDENTIALS_PATH: &str = "/var/lib/gravity/agent-credentials.json";

/// Base runtime release with the known bad join token regression.
const BAD_JOIN_TOKEN_RUNTIME: (u64, u64, u64) = (5, 2, 0);

/// Concurrent node sessions during fan-out.
const DEFAULT_FANOUT: usize = 5;

/// Verification backoff: attempts and cap.
const VERIFY_ATTEMPTS: u32 = 8;
const VERIFY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Inputs for one deployment.
#[derive(Clone)]
pub struct DeployRequest {
    pub cluster_id: String,
    pub servers: Vec<Server>,
    /// Advertise IP of the designated leader.
    pub leader: String,
    /// Agent binary version to install.
    pub version: Locator,
    /// Base runtime version currently installed, used to tell the known
    /// bad-join-token failure mode apart from a generic unreachable node.
    pub base_runtime: Option<Version>,
    /// Extra arguments appended to the leader's service unit, e.g. the
    /// unattended-upgrade handler selection.
    pub leader_args: Vec<String>,
}

impl DeployRequest {
    /// Host identities every deployed certificate must cover.
    fn hosts(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|s| s.advertise_ip.clone())
            .collect()
    }

    fn is_bad_join_token_runtime(&self) -> bool {
        self.base_runtime.as_ref().is_some_and(|v| {
            (v.major, v.minor, v.patch) == BAD_JOIN_TOKEN_RUNTIME
        })
    }
}

pub struct AgentDeployer {
    transport: Arc<dyn NodeTransport>,
    packages: Arc<PackageStore>,
    fanout: usize,
}

impl AgentDeployer {
    pub fn new(transport: Arc<dyn NodeTransport>, packages: Arc<PackageStore>) -> Self {
        Self {
            transport,
            packages,
            fanout: DEFAULT_FANOUT,
        }
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    /// Run the full deployment sequence. Returns the archive the fleet now
    /// serves with.
    pub async fn deploy(
        &self,
        cancel: &CancellationToken,
        request: &DeployRequest,
    ) -> Result<CredentialsArchive> {
        self.probe(cancel, request).await?;

        let (archive, minted) = self.ensure_credentials(request)?;

        let result = self.finish_deploy(cancel, request, &archive).await;
        if let Err(err) = result {
            if let Some(locator) = minted {
                warn!(%locator, "deployment failed after mint, removing orphan credentials");
                if let Err(remove_err) = self.packages.remove(&locator) {
                    warn!(%remove_err, "could not remove orphaned credentials package");
                }
            }
            return Err(err);
        }
        Ok(archive)
    }

    async fn finish_deploy(
        &self,
        cancel: &CancellationToken,
        request: &DeployRequest,
        archive: &CredentialsArchive,
    ) -> Result<()> {
        self.distribute_binary(cancel, request).await?;
        self.distribute_credentials(cancel, request, archive).await?;
        self.install_service(cancel, request).await?;
        self.verify_connections(cancel, request, archive).await?;
        Ok(())
    }

    /// Place the archive at the well-known path each agent loads on
    /// startup.
    async fn distribute_credentials(
        &self,
        cancel: &CancellationToken,
        request: &DeployRequest,
        archive: &CredentialsArchive,
    ) -> Result<()> {
        let staging = staging_path();
        tokio::fs::write(&staging, archive.to_bytes()?).await?;

        let staging_for_tasks = staging.clone();
        let failures = self
            .for_each_node(cancel, request, move |transport, node| {
                let staging = staging_for_tasks.clone();
                async move {
                    let dir = Path::new(AGENT_CREDENTIALS_PATH)
                        .parent()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "/".to_string());
                    transport.run(&node, &format!("mkdir -p {dir}")).await?;
                    transport
                        .copy(&node, &staging, AGENT_CREDENTIALS_PATH)
                        .await?;
                    transport
                        .run(&node, &format!("chmod 0600 {AGENT_CREDENTIALS_PATH}"))
                        .await?;
                    Ok(())
                }
            })
            .await;

        let _ = tokio::fs::remove_file(&staging).await;
        first_failure(failures, "credentials distribution")
    }

    /// Step 1: reachability probe with bounded fan-out. All failures are
    /// accumulated so the operator sees the whole set at once.
    async fn probe(&self, cancel: &CancellationToken, request: &DeployRequest) -> Result<()> {
        let unreachable = self
            .for_each_node(cancel, request, |transport, node| async move {
                transport.check(&node).await
            })
            .await;
        if unreachable.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = unreachable.into_iter().map(|(node, _)| node).collect();
        if request.is_bad_join_token_runtime() {
            return Err(GravityError::ConnectionProblem(format!(
                "nodes {} are not reachable; the installed base runtime issues join \
                 tokens that agents cannot redeem, re-join the affected nodes before \
                 deploying agents (expected service: {AGENT_SERVICE_UNIT})",
                names.join(", ")
            )));
        }
        Err(GravityError::ConnectionProblem(format!(
            "nodes {} are not reachable over the admin endpoint; verify that \
             {AGENT_SERVICE_UNIT} can be installed and the nodes are up",
            names.join(", ")
        )))
    }

    /// Step 2: mint a fresh archive, or reuse a stored one that already
    /// covers this cluster and host set. Returns the locator when a new
    /// version was written, for cancellation cleanup.
    fn ensure_credentials(
        &self,
        request: &DeployRequest,
    ) -> Result<(CredentialsArchive, Option<Locator>)> {
        let hosts = request.hosts();
        let versions = self
            .packages
            .versions(&request.cluster_id, crate::creds::CREDENTIALS_PACKAGE)?;

        if let Some(current) = versions.last() {
            let locator = CredentialsArchive::locator(&request.cluster_id, current.clone());
            let archive = CredentialsArchive::from_bytes(&self.packages.read(&locator)?)?;
            if archive.covers(&request.cluster_id, &hosts)
                && archive.check_validity(chrono::Utc::now()).is_ok()
            {
                info!(%locator, "reusing existing agent credentials");
                return Ok((archive, None));
            }
        }

        let next = match versions.last() {
            Some(version) => Version::new(version.major, version.minor, version.patch + 1),
            None => Version::new(1, 0, 0),
        };
        let locator = CredentialsArchive::locator(&request.cluster_id, next);
        let archive = CredentialsArchive::mint(&request.cluster_id, &hosts)?;
        self.packages.upsert(&locator, &archive.to_bytes()?)?;
        info!(%locator, hosts = hosts.len(), "minted agent credentials");
        Ok((archive, Some(locator)))
    }

    /// Step 3: copy the requested agent binary to its canonical path.
    async fn distribute_binary(
        &self,
        cancel: &CancellationToken,
        request: &DeployRequest,
    ) -> Result<()> {
        let payload = self.packages.read(&request.version)?;
        let staging = staging_path();
        tokio::fs::write(&staging, &payload).await?;

        let staging_for_tasks = staging.clone();
        let failures = self
            .for_each_node(cancel, request, move |transport, node| {
                let staging = staging_for_tasks.clone();
                async move {
                    transport.copy(&node, &staging, AGENT_BINARY_PATH).await?;
                    transport
                        .run(&node, &format!("chmod 0755 {AGENT_BINARY_PATH}"))
                        .await?;
                    Ok(())
                }
            })
            .await;

        let _ = tokio::fs::remove_file(&staging).await;
        first_failure(failures, "binary distribution")
    }

    /// Step 4: install (or reinstall) the persistent service unit. The
    /// leader launches with its extra arguments.
    async fn install_service(
        &self,
        cancel: &CancellationToken,
        request: &DeployRequest,
    ) -> Result<()> {
        let leader = request.leader.clone();
        let leader_args = request.leader_args.join(" ");
        let failures = self
            .for_each_node(cancel, request, move |transport, node| {
                let role_args = if node.advertise_ip == leader {
                    format!("--leader {leader_args}")
                } else {
                    String::new()
                };
                async move {
                    let unit = service_unit(&role_args);
                    let install = format!(
                        "cat > /etc/systemd/system/{AGENT_SERVICE_UNIT} <<'EOF'\n{unit}EOF\n\
                         systemctl daemon-reload && systemctl reenable --now {AGENT_SERVICE_UNIT}"
                    );
                    transport.run(&node, &install).await?;
                    Ok(())
                }
            })
            .await;
        first_failure(failures, "service installation")
    }

    /// Step 5: dial every agent with the minted client credentials,
    /// backing off while the credentials package replicates.
    async fn verify_connections(
        &self,
        cancel: &CancellationToken,
        request: &DeployRequest,
        archive: &CredentialsArchive,
    ) -> Result<()> {
        let runner = AgentRunner::new(archive.clone());
        for server in &request.servers {
            let mut delay = Duration::from_secs(1);
            let mut last_err = None;
            let mut connected = false;
            for _ in 0..VERIFY_ATTEMPTS {
                if cancel.is_cancelled() {
                    return Err(GravityError::Aborted("deployment cancelled".into()));
                }
                match runner.version(&server.advertise_ip).await {
                    Ok((version, state)) => {
                        info!(node = %server.advertise_ip, %version, %state, "agent is up");
                        connected = true;
                        break;
                    }
                    Err(err) => {
                        last_err = Some(err);
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(VERIFY_BACKOFF_CAP);
                    }
                }
            }
            if !connected {
                return Err(GravityError::ConnectionProblem(format!(
                    "agent on {} did not come up: {}",
                    server.advertise_ip,
                    last_err.map(|e| e.to_string()).unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    /// Bounded-concurrency fan-out over every node. Returns the failures
    /// as (hostname, error) pairs; cancellation aborts promptly.
    async fn for_each_node<F, Fut>(
        &self,
        cancel: &CancellationToken,
        request: &DeployRequest,
        work: F,
    ) -> Vec<(String, GravityError)>
    where
        F: Fn(Arc<dyn NodeTransport>, Server) -> Fut + Clone,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let semaphore = Arc::new(Semaphore::new(self.fanout));
        let tasks = request.servers.iter().map(|server| {
            let semaphore = semaphore.clone();
            let transport = self.transport.clone();
            let server = server.clone();
            let work = work.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let outcome = tokio::select! {
                    outcome = work(transport, server.clone()) => outcome,
                    _ = cancel.cancelled() => {
                        Err(GravityError::Aborted("deployment cancelled".into()))
                    }
                };
                match outcome {
                    Ok(()) => None,
                    Err(err) => Some((server.hostname.clone(), err)),
                }
            }
        });
        futures::future::join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

fn first_failure(failures: Vec<(String, GravityError)>, step: &str) -> Result<()> {
    match failures.into_iter().next() {
        None => Ok(()),
        Some((node, err)) => Err(GravityError::ConnectionProblem(format!(
            "{step} failed on {node}: {err}"
        ))),
    }
}

fn staging_path() -> PathBuf {
    std::env::temp_dir().join(format!("gravity-agent-{}", uuid::Uuid::new_v4()))
}

fn service_unit(role_args: &str) -> String {
    format!(
        "[Unit]\n\
         Description=Gravity agent\n\
         After=network.target\n\n\
         [Service]\n\
         ExecStart={AGENT_BINARY_PATH} agent run {role_args}\n\
         Restart=always\n\
         RestartSec=5\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ServerRole;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory fleet: tracks commands and can be told which nodes are
    /// unreachable.
    struct FakeTransport {
        unreachable: HashSet<String>,
        commands: Mutex<Vec<(String, String)>>,
        copies: Mutex<Vec<(String, String)>>,
    }

    impl FakeTransport {
        fn reachable() -> Arc<Self> {
            Arc::new(Self {
                unreachable: HashSet::new(),
                commands: Mutex::new(Vec::new()),
                copies: Mutex::new(Vec::new()),
            })
        }

        fn with_unreachable(nodes: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                unreachable: nodes.iter().map(|s| s.to_string()).collect(),
                commands: Mutex::new(Vec::new()),
                copies: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl NodeTransport for FakeTransport {
        async fn check(&self, node: &Server) -> Result<()> {
            if self.unreachable.contains(&node.hostname) {
                return Err(GravityError::ConnectionProblem(format!(
                    "no route to {}",
                    node.hostname
                )));
            }
            Ok(())
        }

        async fn run(&self, node: &Server, command: &str) -> Result<String> {
            self.commands
                .lock()
                .unwrap()
                .push((node.hostname.clone(), command.to_string()));
            Ok(String::new())
        }

        async fn copy(&self, node: &Server, _source: &std::path::Path, dest: &str) -> Result<()> {
            self.copies
                .lock()
                .unwrap()
                .push((node.hostname.clone(), dest.to_string()));
            Ok(())
        }
    }

    fn request(cluster: &str) -> DeployRequest {
        DeployRequest {
            cluster_id: cluster.to_string(),
            servers: vec![
                Server::new("10.0.0.5", "n1", ServerRole::Master),
                Server::new("10.0.0.6", "n2", ServerRole::Node),
                Server::new("10.0.0.7", "n3", ServerRole::Node),
            ],
            leader: "10.0.0.5".to_string(),
            version: Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
            base_runtime: None,
            leader_args: Vec::new(),
        }
    }

    fn packages() -> (tempfile::TempDir, Arc<PackageStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PackageStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn unreachable_node_fails_probe_and_names_it() {
        let (_dir, packages) = packages();
        let deployer = AgentDeployer::new(FakeTransport::with_unreachable(&["n3"]), packages.clone());

        let err = deployer
            .deploy(&CancellationToken::new(), &request("prod"))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("n3"));
        assert!(text.contains(AGENT_SERVICE_UNIT));

        // No credential rotation happened.
        assert!(packages
            .versions("prod", crate::creds::CREDENTIALS_PACKAGE)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn bad_join_token_runtime_gets_specific_message() {
        let (_dir, packages) = packages();
        let deployer = AgentDeployer::new(FakeTransport::with_unreachable(&["n2"]), packages);

        let mut req = request("prod");
        req.base_runtime = Some(Version::new(5, 2, 0));
        let err = deployer
            .deploy(&CancellationToken::new(), &req)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("join"));
    }

    #[tokio::test]
    async fn credentials_reused_on_second_deploy() {
        let (_dir, packages) = packages();
        let transport = FakeTransport::reachable();
        let deployer = AgentDeployer::new(transport, packages.clone());
        let req = request("prod");

        let (first, minted) = deployer.ensure_credentials(&req).unwrap();
        assert!(minted.is_some());
        let (second, minted) = deployer.ensure_credentials(&req).unwrap();
        assert!(minted.is_none());
        assert_eq!(first, second);
        assert_eq!(
            packages
                .versions("prod", crate::creds::CREDENTIALS_PACKAGE)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn changed_host_set_rotates_credentials() {
        let (_dir, packages) = packages();
        let deployer = AgentDeployer::new(FakeTransport::reachable(), packages.clone());

        let req = request("prod");
        deployer.ensure_credentials(&req).unwrap();

        let mut grown = req.clone();
        grown
            .servers
            .push(Server::new("10.0.0.8", "n4", ServerRole::Node));
        let (_, minted) = deployer.ensure_credentials(&grown).unwrap();
        assert!(minted.is_some());
        assert_eq!(
            packages
                .versions("prod", crate::creds::CREDENTIALS_PACKAGE)
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn service_install_differs_for_leader() {
        let (_dir, packages) = packages();
        let transport = FakeTransport::reachable();
        let deployer = AgentDeployer::new(transport.clone(), packages);

        let mut req = request("prod");
        req.leader_args = vec!["--handler=automatic_upgrade".to_string()];
        deployer
            .install_service(&CancellationToken::new(), &req)
            .await
            .unwrap();

        let commands = transport.commands.lock().unwrap().clone();
        let leader_cmd = commands.iter().find(|(node, _)| node == "n1").unwrap();
        assert!(leader_cmd.1.contains("--leader"));
        assert!(leader_cmd.1.contains("--handler=automatic_upgrade"));
        let node_cmd = commands.iter().find(|(node, _)| node == "n2").unwrap();
        assert!(!node_cmd.1.contains("--leader"));
    }

    #[tokio::test]
    async fn failed_distribution_removes_fresh_credentials() {
        let (_dir, packages) = packages();
        // Probe succeeds, but the binary package is missing, so the step
        // after the mint fails.
        let deployer = AgentDeployer::new(FakeTransport::reachable(), packages.clone());
        let err = deployer
            .deploy(&CancellationToken::new(), &request("prod"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // The minted archive did not survive as an orphan.
        assert!(packages
            .versions("prod", crate::creds::CREDENTIALS_PACKAGE)
            .unwrap()
            .is_empty());
    }
}
