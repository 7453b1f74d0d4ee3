//! Built-in phase handlers.
//!
//! System-touching tags (drain, apply, bootstrap, ...) shell out to the
//! runtime control binaries; state-touching tags (environ, update_config,
//! gc, sync_plan) work against the node's state directory and stores.
//! Transient failures are retried here with bounded exponential backoff,
//! because only the handler knows whether its action is safe to repeat;
//! the engine itself never retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{GravityError, Result};
use crate::ops::Locator;
use crate::pack::PackageStore;
use crate::plan::phase::Phase;
use crate::plan::registry::{HandlerContext, HandlerRegistry, PhaseHandler};
use crate::storage::Backend;

/// Spawn retries for transient command failures.
const COMMAND_ATTEMPTS: u32 = 3;
const COMMAND_BACKOFF: Duration = Duration::from_secs(1);

/// Everything the built-in handlers need from the node.
#[derive(Clone)]
pub struct HandlerEnv {
    /// Runtime container control binary.
    pub runtime_ctl: PathBuf,
    /// Workload scheduler CLI used for drain and cordon operations.
    pub kubectl: PathBuf,
    /// Node-local state directory.
    pub state_dir: PathBuf,
    pub packages: Arc<PackageStore>,
    pub cluster_store: Arc<dyn Backend>,
    pub local_store: Arc<dyn Backend>,
    /// Path of the running gravity binary, re-executed by the unattended
    /// upgrade handler.
    pub gravity_binary: PathBuf,
}

/// The full built-in registry, including the agent-critical
/// `automatic_upgrade` and `sync_plan` handlers.
pub fn default_registry(env: &HandlerEnv) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for tag in [
        "init", "configure", "bootstrap", "pull", "system", "checks", "post", "app", "finalize",
        "remove_node", "advertise_addr", "restart_agent",
    ] {
        registry.register(
            tag,
            Arc::new(RuntimeCommandHandler::for_tag(&env.runtime_ctl, tag)),
        );
    }
    registry.register("drain", Arc::new(DrainHandler::new(&env.kubectl, false)));
    registry.register("uncordon", Arc::new(DrainHandler::new(&env.kubectl, true)));
    registry.register(
        "apply",
        Arc::new(RuntimeCommandHandler::new(
            &env.runtime_ctl,
            &["upgrade"],
            Some(&["rollback"]),
        )),
    );
    registry.register(
        "environ",
        Arc::new(FileWriteHandler::environment(&env.state_dir)),
    );
    registry.register(
        "update_config",
        Arc::new(FileWriteHandler::cluster_config(&env.state_dir)),
    );
    registry.register(
        "gc",
        Arc::new(GcHandler {
            state_dir: env.state_dir.clone(),
            packages: env.packages.clone(),
        }),
    );
    registry.register(
        "sync_plan",
        Arc::new(SyncPlanHandler {
            cluster: env.cluster_store.clone(),
            local: env.local_store.clone(),
        }),
    );
    registry.register(
        "automatic_upgrade",
        Arc::new(AutomaticUpgradeHandler {
            binary: env.gravity_binary.clone(),
        }),
    );
    registry
}

/// Runs a subcommand of a control binary, appending the server and package
/// arguments the phase carries.
pub struct RuntimeCommandHandler {
    program: PathBuf,
    action: Vec<String>,
    undo: Option<Vec<String>>,
}

impl RuntimeCommandHandler {
    pub fn new(program: &Path, action: &[&str], undo: Option<&[&str]>) -> Self {
        Self {
            program: program.to_path_buf(),
            action: action.iter().map(|s| s.to_string()).collect(),
            undo: undo.map(|args| args.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Handler whose action is the executor tag itself, undone with
    /// `--undo`.
    pub fn for_tag(program: &Path, tag: &str) -> Self {
        Self {
            program: program.to_path_buf(),
            action: vec![tag.to_string()],
            undo: Some(vec![tag.to_string(), "--undo".to_string()]),
        }
    }

    fn args_for(&self, base: &[String], phase: &Phase) -> Vec<String> {
        let mut args = base.to_vec();
        if let Some(server) = phase.data.get("server").and_then(|v| v.as_str()) {
            args.push(server.to_string());
        }
        if let Some(package) = phase.data.get("package") {
            if let Ok(locator) = serde_json::from_value::<Locator>(package.clone()) {
                args.push(locator.to_string());
            }
        }
        args
    }
}

#[async_trait]
impl PhaseHandler for RuntimeCommandHandler {
    async fn execute(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        run_command(ctx, &self.program, &self.args_for(&self.action, phase)).await
    }

    async fn rollback(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        match &self.undo {
            Some(undo) => run_command(ctx, &self.program, &self.args_for(undo, phase)).await,
            None => {
                debug!(phase = %phase.id, "no undo action, rollback is a no-op");
                Ok(())
            }
        }
    }
}

/// drain/uncordon pair over the scheduler CLI. The same handler serves
/// both tags with the directions swapped.
pub struct DrainHandler {
    kubectl: PathBuf,
    /// When set, execute uncordons and rollback cordons.
    inverted: bool,
}

impl DrainHandler {
    pub fn new(kubectl: &Path, inverted: bool) -> Self {
        Self {
            kubectl: kubectl.to_path_buf(),
            inverted,
        }
    }

    fn server(phase: &Phase) -> Result<String> {
        phase
            .data
            .get("server")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                GravityError::BadParameter(format!("phase {} carries no server", phase.id))
            })
    }
}

#[async_trait]
impl PhaseHandler for DrainHandler {
    async fn execute(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        let server = Self::server(phase)?;
        let args: Vec<String> = if self.inverted {
            vec!["uncordon".into(), server]
        } else {
            vec![
                "drain".into(),
                server,
                "--ignore-daemonsets".into(),
                "--delete-emptydir-data".into(),
            ]
        };
        run_command(ctx, &self.kubectl, &args).await
    }

    async fn rollback(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        let server = Self::server(phase)?;
        let args: Vec<String> = if self.inverted {
            vec!["cordon".into(), server]
        } else {
            vec!["uncordon".into(), server]
        };
        run_command(ctx, &self.kubectl, &args).await
    }
}

/// Writes a state file from the phase payload, keeping a backup for
/// rollback.
pub struct FileWriteHandler {
    path: PathBuf,
    /// Key of the payload inside phase data.
    key: &'static str,
    /// Render the payload as KEY=VALUE lines instead of JSON.
    env_format: bool,
}

impl FileWriteHandler {
    pub fn environment(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("environment"),
            key: "env",
            env_format: true,
        }
    }

    pub fn cluster_config(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("cluster-config.json"),
            key: "config",
            env_format: false,
        }
    }

    fn backup_path(&self) -> PathBuf {
        self.path.with_extension("prev")
    }
}

#[async_trait]
impl PhaseHandler for FileWriteHandler {
    async fn execute(&self, _ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        let payload = phase.data.get(self.key).ok_or_else(|| {
            GravityError::BadParameter(format!(
                "phase {} carries no {:?} payload",
                phase.id, self.key
            ))
        })?;

        let rendered = if self.env_format {
            let map: std::collections::BTreeMap<String, String> =
                serde_json::from_value(payload.clone())?;
            let mut out = String::new();
            for (key, value) in map {
                out.push_str(&format!("{key}={value}\n"));
            }
            out
        } else {
            serde_json::to_string_pretty(payload)?
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // First write preserves the running file for rollback.
        if self.path.exists() && !self.backup_path().exists() {
            tokio::fs::copy(&self.path, self.backup_path()).await?;
        }
        tokio::fs::write(&self.path, rendered).await?;
        info!(path = %self.path.display(), "state file updated");
        Ok(())
    }

    async fn rollback(&self, _ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
        let backup = self.backup_path();
        if backup.exists() {
            tokio::fs::rename(&backup, &self.path).await?;
            info!(path = %self.path.display(), "state file restored");
        } else if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

/// Prunes stale artifacts: scratch files under the state directory and
/// superseded package versions. Safe to run on every node at once.
pub struct GcHandler {
    state_dir: PathBuf,
    packages: Arc<PackageStore>,
}

#[async_trait]
impl PhaseHandler for GcHandler {
    async fn execute(&self, ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
        ctx.check_cancelled()?;

        let tmp = self.state_dir.join("tmp");
        if tmp.is_dir() {
            let mut removed = 0usize;
            for entry in WalkDir::new(&tmp).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| {
                    GravityError::ConnectionProblem(format!("cannot scan {}: {e}", tmp.display()))
                })?;
                let path = entry.path();
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(path)
                } else {
                    std::fs::remove_file(path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(path = %path.display(), %err, "could not remove"),
                }
            }
            info!(removed, "pruned scratch files");
        }

        // Keep only the newest version of every stored package.
        let packages_dir = self.state_dir.join("packages");
        if packages_dir.is_dir() {
            for entry in WalkDir::new(&packages_dir).min_depth(2).max_depth(2) {
                let entry = entry.map_err(|e| {
                    GravityError::ConnectionProblem(format!(
                        "cannot scan {}: {e}",
                        packages_dir.display()
                    ))
                })?;
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let repository = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let versions = self.packages.versions(&repository, &name)?;
                if let Some(newest) = versions.last() {
                    let keep = Locator::new(&repository, &name, newest.clone());
                    for stale in self.packages.prune_older(&keep)? {
                        info!(%stale, "pruned stale package");
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, _ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
        // Collected garbage stays collected.
        Ok(())
    }

    fn parallel_safe(&self) -> bool {
        true
    }
}

/// Replicates the authoritative plan from the cluster store into the
/// node-local replica, replaying phase states when the replica already has
/// an older copy.
pub struct SyncPlanHandler {
    pub cluster: Arc<dyn Backend>,
    pub local: Arc<dyn Backend>,
}

#[async_trait]
impl PhaseHandler for SyncPlanHandler {
    async fn execute(&self, ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
        let plan = self.cluster.get_plan(&ctx.op_key).await?;
        match self.local.create_plan(&plan).await {
            Ok(()) => {
                info!(op = %ctx.op_key, "plan replicated to local store");
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                let local = self.local.get_plan(&ctx.op_key).await?;
                for phase in plan.phases() {
                    let Some(mine) = local.find(&phase.id) else {
                        continue;
                    };
                    if mine.state != phase.state {
                        self.local
                            .change_phase_state(
                                &ctx.op_key,
                                &phase.id,
                                mine.state,
                                phase.state,
                                phase.error.clone(),
                            )
                            .await?;
                    }
                }
                info!(op = %ctx.op_key, "plan states reconciled");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn rollback(&self, _ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
        Ok(())
    }
}

/// Unattended upgrade entry point on the leader agent: re-executes the
/// gravity binary to drive the plan to completion.
pub struct AutomaticUpgradeHandler {
    pub binary: PathBuf,
}

#[async_trait]
impl PhaseHandler for AutomaticUpgradeHandler {
    async fn execute(&self, ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
        let args = vec![
            "plan".to_string(),
            "resume".to_string(),
            format!("--operation-id={}", ctx.op_key.operation_id),
        ];
        run_command(ctx, &self.binary, &args).await
    }

    async fn rollback(&self, _ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
        Ok(())
    }
}

/// Run a local command, retrying spawn-level failures with bounded
/// exponential backoff. A non-zero exit is final: repeating a command the
/// system rejected will not change the answer.
async fn run_command(ctx: &HandlerContext, program: &Path, args: &[String]) -> Result<()> {
    let mut delay = COMMAND_BACKOFF;
    let mut last_err = None;
    for attempt in 1..=COMMAND_ATTEMPTS {
        ctx.check_cancelled()?;
        debug!(program = %program.display(), ?args, attempt, "running command");
        match Command::new(program).args(args).output().await {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(GravityError::ConnectionProblem(format!(
                    "{} {} exited with {}: {}",
                    program.display(),
                    args.join(" "),
                    output.status,
                    stderr.trim()
                )));
            }
            Err(err) => {
                last_err = Some(err);
                if attempt < COMMAND_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(GravityError::ConnectionProblem(format!(
        "could not run {}: {}",
        program.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpKey;
    use crate::plan::phase::{Phase, PhaseState};
    use crate::plan::plan::OperationPlan;
    use crate::storage::SqliteBackend;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> HandlerContext {
        HandlerContext::new(OpKey::new("prod", uuid::Uuid::new_v4()), CancellationToken::new())
    }

    #[tokio::test]
    async fn file_write_and_rollback_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileWriteHandler::environment(dir.path());
        let path = dir.path().join("environment");
        std::fs::write(&path, "OLD=1\n").unwrap();

        let phase = Phase::leaf("/environ", "environ")
            .with_data(serde_json::json!({"env": {"HTTP_PROXY": "http://proxy:3128"}}));
        handler.execute(&ctx(), &phase).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "HTTP_PROXY=http://proxy:3128\n");

        handler.rollback(&ctx(), &phase).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "OLD=1\n");
    }

    #[tokio::test]
    async fn file_write_without_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileWriteHandler::cluster_config(dir.path());
        let phase = Phase::leaf("/update-config", "update_config");
        let err = handler.execute(&ctx(), &phase).await.unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn gc_prunes_scratch_and_old_packages() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path();
        std::fs::create_dir_all(state_dir.join("tmp")).unwrap();
        std::fs::write(state_dir.join("tmp/leftover"), "x").unwrap();

        let packages = Arc::new(PackageStore::open(&state_dir.join("packages")).unwrap());
        for version in ["1.0.0", "2.0.0"] {
            let locator = Locator::parse(&format!("gravitational.io/gravity:{version}")).unwrap();
            packages.upsert(&locator, b"bin").unwrap();
        }

        let handler = GcHandler {
            state_dir: state_dir.to_path_buf(),
            packages: packages.clone(),
        };
        handler
            .execute(&ctx(), &Phase::leaf("/gc/n1", "gc"))
            .await
            .unwrap();

        assert!(!state_dir.join("tmp/leftover").exists());
        let versions = packages.versions("gravitational.io", "gravity").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0], semver::Version::new(2, 0, 0));
    }

    #[tokio::test]
    async fn sync_plan_replicates_and_reconciles() {
        let cluster: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let local: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let ctx = ctx();

        let plan = OperationPlan::new(
            ctx.op_key.clone(),
            Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
            vec![],
            Phase::group("/", vec![Phase::leaf("/init", "init")]),
        );
        cluster.create_plan(&plan).await.unwrap();

        let handler = SyncPlanHandler {
            cluster: cluster.clone(),
            local: local.clone(),
        };
        let phase = Phase::leaf("/sync", "sync_plan");

        // First run replicates the whole plan.
        handler.execute(&ctx, &phase).await.unwrap();
        assert!(local.get_plan(&ctx.op_key).await.is_ok());

        // The cluster copy advances; a second sync replays the state.
        cluster
            .change_phase_state(
                &ctx.op_key,
                &"/init".to_string(),
                PhaseState::Unstarted,
                PhaseState::Completed,
                None,
            )
            .await
            .unwrap();
        handler.execute(&ctx, &phase).await.unwrap();
        let replica = local.get_plan(&ctx.op_key).await.unwrap();
        assert_eq!(replica.find("/init").unwrap().state, PhaseState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_program_is_a_connection_problem() {
        let handler = RuntimeCommandHandler::for_tag(Path::new("/nonexistent/planet"), "init");
        let phase = Phase::leaf("/init", "init");
        let err = handler.execute(&ctx(), &phase).await.unwrap_err();
        assert!(err.is_connection_problem());
    }
}
