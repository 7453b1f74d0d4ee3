//! Command implementations behind the CLI surface.

pub mod agent;
pub mod ops;
pub mod plan;
pub mod update;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::StateDir;
use crate::creds::CredentialsArchive;
use crate::errors::Result;
use crate::ops::Server;
use crate::pack::PackageStore;
use crate::plan::engine::{AgentDispatch, EngineConfig, PlanEngine};
use crate::plan::executor::PhaseExecutor;
use crate::rpc::AgentRunner;
use crate::storage::{Backend, LayeredStore, SqliteBackend};
use crate::update::handlers::{HandlerEnv, default_registry};
use crate::update::updater::binary_version;
use crate::update::{ClusterEnv, Coordinator, DiscoveryStores};

/// Runtime container control binary.
const RUNTIME_CTL: &str = "/usr/local/bin/planet";

/// Scheduler CLI for drain and cordon operations.
const KUBECTL: &str = "/usr/bin/kubectl";

/// Node membership snapshot persisted next to the local databases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeProfile {
    pub cluster_id: String,
    /// This node's advertise IP.
    pub advertise_ip: Option<String>,
    /// Cluster roster as last observed.
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Installed base runtime version.
    pub runtime_version: Option<Version>,
    /// SSH proxy entry point for agent deployment.
    pub proxy: Option<String>,
    /// Distribution endpoint for update downloads.
    pub ops_url: Option<String>,
}

impl NodeProfile {
    fn path(state: &StateDir) -> PathBuf {
        state.root().join("cluster.json")
    }

    pub fn load(state: &StateDir) -> Result<Self> {
        let path = Self::path(state);
        if !path.exists() {
            return Ok(Self {
                cluster_id: "local".to_string(),
                ..Default::default()
            });
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, state: &StateDir) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(state), raw)?;
        Ok(())
    }
}

/// Everything a command needs: stores, packages, profile, cancellation.
pub struct App {
    pub state: StateDir,
    pub profile: NodeProfile,
    pub cluster_store: Arc<dyn Backend>,
    pub local_store: Arc<dyn Backend>,
    /// Layered view: cluster primary, local replica.
    pub store: Arc<dyn Backend>,
    pub packages: Arc<PackageStore>,
    pub cancel: CancellationToken,
}

impl App {
    pub fn open(state_dir: &Path, cancel: CancellationToken) -> Result<Self> {
        let state = StateDir::open(state_dir)?;
        let profile = NodeProfile::load(&state)?;
        let cluster_store: Arc<dyn Backend> = Arc::new(SqliteBackend::open(&state.cluster_db())?);
        let local_store: Arc<dyn Backend> = Arc::new(SqliteBackend::open(&state.local_db())?);
        let store: Arc<dyn Backend> = Arc::new(LayeredStore::new(
            cluster_store.clone(),
            local_store.clone(),
        ));
        let packages = Arc::new(PackageStore::open(&state.packages_dir())?);
        Ok(Self {
            state,
            profile,
            cluster_store,
            local_store,
            store,
            packages,
            cancel,
        })
    }

    pub fn coordinator(&self) -> Result<Coordinator> {
        let join_store: Arc<dyn Backend> =
            Arc::new(SqliteBackend::open(&self.state.root().join("join.db"))?);
        Ok(Coordinator::with_default_updaters(DiscoveryStores {
            cluster: self.cluster_store.clone(),
            local_update: self.local_store.clone(),
            local_join: join_store,
            // The remote installer store is attached by the installer
            // itself; a standing cluster does not carry one.
            installer: None,
        }))
    }

    pub fn cluster_env(&self) -> ClusterEnv {
        ClusterEnv {
            cluster_id: self.profile.cluster_id.clone(),
            store: self.store.clone(),
            packages: self.packages.clone(),
            servers: self.profile.servers.clone(),
            runtime_version: self.profile.runtime_version.clone(),
        }
    }

    pub fn handler_env(&self) -> Result<HandlerEnv> {
        Ok(HandlerEnv {
            runtime_ctl: PathBuf::from(RUNTIME_CTL),
            kubectl: PathBuf::from(KUBECTL),
            state_dir: self.state.root().to_path_buf(),
            packages: self.packages.clone(),
            cluster_store: self.cluster_store.clone(),
            local_store: self.local_store.clone(),
            gravity_binary: std::env::current_exe()?,
        })
    }

    /// The credentials archive deployed to this node, when present.
    pub fn credentials(&self) -> Result<Option<CredentialsArchive>> {
        let path = self.state.credentials_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        Ok(Some(CredentialsArchive::from_bytes(&raw)?))
    }

    /// Agent runner over the deployed credentials.
    pub fn runner(&self) -> Result<Option<Arc<AgentRunner>>> {
        Ok(self
            .credentials()?
            .map(|archive| Arc::new(AgentRunner::new(archive))))
    }

    /// Assemble the plan engine for the current node.
    pub fn engine(&self, skip_version_check: bool) -> Result<PlanEngine> {
        let registry = default_registry(&self.handler_env()?);
        let executor = Arc::new(PhaseExecutor::new(self.store.clone(), registry));
        let runner = self
            .runner()?
            .map(|runner| runner as Arc<dyn AgentDispatch>);
        Ok(PlanEngine::new(
            self.store.clone(),
            executor,
            runner,
            EngineConfig {
                binary_version: binary_version(),
                skip_version_check,
                local_node: self.profile.advertise_ip.clone(),
            },
        ))
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();

        let fresh = NodeProfile::load(&state).unwrap();
        assert_eq!(fresh.cluster_id, "local");

        let profile = NodeProfile {
            cluster_id: "prod".into(),
            advertise_ip: Some("10.0.0.5".into()),
            ..Default::default()
        };
        profile.save(&state).unwrap();
        let loaded = NodeProfile::load(&state).unwrap();
        assert_eq!(loaded.cluster_id, "prod");
        assert_eq!(loaded.advertise_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn app_opens_with_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(dir.path(), CancellationToken::new()).unwrap();
        assert!(app.credentials().unwrap().is_none());
        assert!(app.runner().unwrap().is_none());
        app.engine(false).unwrap();
    }
}
