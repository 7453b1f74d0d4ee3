//! The plan engine: traversal, resume, and completion of an operation plan.
//!
//! The engine owns the tree discipline. Internal phases enter InProgress
//! when first visited and Completed when their subtree is done; leaves are
//! delegated to the phase executor, locally or through the agent runner
//! when the phase names a node. The engine never advances past a Failed
//! phase unless the operator rolled it back, re-executed it, or forced it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use tracing::{info, warn};

use crate::errors::{GravityError, Result};
use crate::ops::{OpKey, OperationState, Server};
use crate::plan::executor::{PhaseExecutor, PhaseOptions};
use crate::plan::phase::{Phase, PhaseState};
use crate::plan::plan::{OperationPlan, requires_satisfied};
use crate::plan::registry::{HandlerContext, PhaseHandler};
use crate::storage::Backend;

/// Direction of a dispatched phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Exec,
    Rollback,
}

/// Remote dispatch seam. The RPC agent runner implements this; engine
/// tests install a fake.
#[async_trait]
pub trait AgentDispatch: Send + Sync {
    /// Run a phase handler on the named node and wait for its verdict.
    async fn dispatch(
        &self,
        node: &str,
        op_key: &OpKey,
        phase: &Phase,
        direction: Direction,
        force: bool,
    ) -> Result<()>;

    /// Ask the agent on the named node to shut down within the deadline.
    async fn shutdown_agent(&self, node: &str, deadline: Duration) -> Result<()>;
}

/// Deadline granted to each agent during complete-plan shutdown.
const AGENT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Engine construction parameters.
pub struct EngineConfig {
    /// Version of the running binary, compared against the plan pin.
    pub binary_version: Version,
    /// Skip the pin comparison. Explicit operator flag.
    pub skip_version_check: bool,
    /// Advertise IP of the node this driver runs on. Phases bound to it
    /// execute locally instead of through the runner.
    pub local_node: Option<String>,
}

pub struct PlanEngine {
    store: Arc<dyn Backend>,
    executor: Arc<PhaseExecutor>,
    runner: Option<Arc<dyn AgentDispatch>>,
    config: EngineConfig,
}

/// Adapter running a phase on a remote agent through the executor's CAS
/// discipline.
struct RemoteHandler {
    runner: Arc<dyn AgentDispatch>,
    node: String,
    force: bool,
}

#[async_trait]
impl PhaseHandler for RemoteHandler {
    async fn execute(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        self.runner
            .dispatch(&self.node, &ctx.op_key, phase, Direction::Exec, self.force)
            .await
    }

    async fn rollback(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()> {
        self.runner
            .dispatch(&self.node, &ctx.op_key, phase, Direction::Rollback, self.force)
            .await
    }
}

impl PlanEngine {
    pub fn new(
        store: Arc<dyn Backend>,
        executor: Arc<PhaseExecutor>,
        runner: Option<Arc<dyn AgentDispatch>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            runner,
            config,
        }
    }

    /// Verify the running binary matches the plan's pinned version.
    fn check_binary_version(&self, plan: &OperationPlan) -> Result<()> {
        if self.config.skip_version_check {
            return Ok(());
        }
        let pinned = &plan.gravity_package.version;
        if *pinned != self.config.binary_version {
            return Err(GravityError::BadParameter(format!(
                "this binary is version {}, but the operation plan requires {}; \
                 switch to the pinned binary or pass --skip-version-check",
                self.config.binary_version, pinned
            )));
        }
        Ok(())
    }

    /// Drive the plan until the root is Completed or a phase fails.
    pub async fn resume(&self, ctx: &HandlerContext, opts: PhaseOptions) -> Result<()> {
        loop {
            let mut plan = self.store.get_plan(&ctx.op_key).await?;
            self.check_binary_version(&plan)?;

            if plan.root.state.is_completed() {
                info!(op = %ctx.op_key, "plan is complete");
                return Ok(());
            }
            if let Some(failed) = plan.first_failed() {
                if !opts.force {
                    return Err(GravityError::BadParameter(format!(
                        "phase {} failed: {}; roll it back or re-execute it before resuming \
                         (see `gravity plan`)",
                        failed.id,
                        failed.error.as_deref().unwrap_or("no error recorded")
                    )));
                }
            }

            let mut progressed = self.advance_groups(&mut plan).await?;

            let eligible = self.eligible_leaves(&plan, opts.force);
            if !eligible.is_empty() {
                self.run_leaves(ctx, &plan, eligible, opts).await?;
                progressed = true;
            }

            if !progressed {
                let stuck: Vec<String> = plan
                    .leaves()
                    .iter()
                    .filter(|p| !p.state.is_completed())
                    .map(|p| p.id.clone())
                    .collect();
                return Err(GravityError::BadParameter(format!(
                    "plan cannot make progress; unfinished phases: {}",
                    stuck.join(", ")
                )));
            }
        }
    }

    /// Transition internal phases: open groups whose preconditions hold,
    /// close groups whose subtree is done. Returns whether anything moved.
    async fn advance_groups(&self, plan: &mut OperationPlan) -> Result<bool> {
        let mut progressed = false;
        // Repeated sweeps settle nested groups in one call.
        loop {
            let mut changed = false;
            let snapshot = plan.clone();
            for phase in snapshot.phases() {
                if phase.is_leaf() && phase.id != "/" {
                    continue;
                }
                match phase.state {
                    PhaseState::Unstarted => {
                        let parent_open = match snapshot.ancestors(&phase.id).last() {
                            Some(parent) => parent.state == PhaseState::InProgress,
                            None => true,
                        };
                        if parent_open && requires_satisfied(&snapshot, phase) {
                            self.change_state(plan, &phase.id, phase.state, PhaseState::InProgress)
                                .await?;
                            changed = true;
                        }
                    }
                    PhaseState::InProgress => {
                        let done = phase
                            .children
                            .iter()
                            .all(|c| subtree_completed(c));
                        if done && !phase.children.is_empty() {
                            self.change_state(plan, &phase.id, phase.state, PhaseState::Completed)
                                .await?;
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }
            if !changed {
                return Ok(progressed);
            }
            progressed = true;
        }
    }

    async fn change_state(
        &self,
        plan: &mut OperationPlan,
        phase_id: &str,
        from: PhaseState,
        to: PhaseState,
    ) -> Result<()> {
        self.store
            .change_phase_state(&plan.op_key, &phase_id.to_string(), from, to, None)
            .await?;
        plan.set_state(phase_id, to, None)
    }

    /// Leaves ready to run right now, in preorder.
    fn eligible_leaves<'a>(&self, plan: &'a OperationPlan, force: bool) -> Vec<&'a Phase> {
        plan.leaves()
            .into_iter()
            .filter(|phase| {
                let runnable = match phase.state {
                    PhaseState::Unstarted => true,
                    PhaseState::Failed | PhaseState::RolledBack => force,
                    _ => false,
                };
                runnable
                    && plan
                        .ancestors(&phase.id)
                        .iter()
                        .all(|a| a.state == PhaseState::InProgress)
                    && (force || requires_satisfied(plan, phase))
            })
            .collect()
    }

    /// Run a batch of eligible leaves. Concurrent only when every executor
    /// in the batch declares itself parallel-safe; sequential otherwise.
    async fn run_leaves(
        &self,
        ctx: &HandlerContext,
        plan: &OperationPlan,
        leaves: Vec<&Phase>,
        opts: PhaseOptions,
    ) -> Result<()> {
        let tags: Vec<&str> = leaves.iter().map(|p| p.executor.as_str()).collect();
        let parallel = leaves.len() > 1 && self.executor.registry().all_parallel_safe(tags);

        if parallel {
            let tasks = leaves.iter().map(|phase| {
                let mut local = plan.clone();
                let id = phase.id.clone();
                async move { self.run_one(ctx, &mut local, &id, opts).await }
            });
            let results = futures::future::join_all(tasks).await;
            for result in results {
                result?;
            }
            Ok(())
        } else {
            // Sequential: run the first leaf only, then recompute
            // eligibility from a fresh store read.
            let mut local = plan.clone();
            let id = leaves[0].id.clone();
            self.run_one(ctx, &mut local, &id, opts).await
        }
    }

    /// Execute one leaf, locally or on its node.
    async fn run_one(
        &self,
        ctx: &HandlerContext,
        plan: &mut OperationPlan,
        phase_id: &str,
        opts: PhaseOptions,
    ) -> Result<()> {
        match self.remote_handler(plan, phase_id, opts.force)? {
            Some(handler) => {
                self.executor
                    .execute_with(ctx, plan, phase_id, opts, handler)
                    .await
            }
            None => self.executor.execute(ctx, plan, phase_id, opts).await,
        }
    }

    /// Resolve the remote handler for a phase bound to another node.
    fn remote_handler(
        &self,
        plan: &OperationPlan,
        phase_id: &str,
        force: bool,
    ) -> Result<Option<Arc<dyn PhaseHandler>>> {
        let phase = plan.get(phase_id)?;
        let Some(node) = &phase.node else {
            return Ok(None);
        };
        if self.config.local_node.as_deref() == Some(node.as_str()) {
            return Ok(None);
        }
        let Some(runner) = &self.runner else {
            return Err(GravityError::PreconditionFailed(format!(
                "phase {phase_id} must run on node {node} but no agent runner is connected; \
                 run `gravity agent deploy` first"
            )));
        };
        Ok(Some(Arc::new(RemoteHandler {
            runner: runner.clone(),
            node: node.clone(),
            force,
        })))
    }

    /// Execute exactly one phase. An internal phase executes its whole
    /// subtree in preorder.
    pub async fn execute_phase(
        &self,
        ctx: &HandlerContext,
        phase_id: &str,
        opts: PhaseOptions,
    ) -> Result<()> {
        let mut plan = self.store.get_plan(&ctx.op_key).await?;
        self.check_binary_version(&plan)?;

        let phase = plan.get(phase_id)?.clone();
        self.open_ancestors(&mut plan, phase_id).await?;

        if phase.is_leaf() {
            self.run_one(ctx, &mut plan, phase_id, opts).await?;
        } else {
            self.change_state(&mut plan, &phase.id, phase.state, PhaseState::InProgress)
                .await
                .or_else(ignore_compare_failed)?;
            let subtree: Vec<String> = collect_leaves(&phase)
                .into_iter()
                .map(|p| p.id.clone())
                .collect();
            for leaf_id in subtree {
                let state = plan.get(&leaf_id)?.state;
                if state.is_completed() {
                    continue;
                }
                self.run_one(ctx, &mut plan, &leaf_id, opts).await?;
            }
        }
        self.advance_groups(&mut plan).await?;
        Ok(())
    }

    /// Roll back exactly one phase. A phase may be rolled back only after
    /// every phase that requires it has been rolled back, unless forced.
    pub async fn rollback_phase(
        &self,
        ctx: &HandlerContext,
        phase_id: &str,
        opts: PhaseOptions,
    ) -> Result<()> {
        let mut plan = self.store.get_plan(&ctx.op_key).await?;
        self.check_binary_version(&plan)?;

        let phase = plan.get(phase_id)?.clone();
        if !opts.force {
            let blocking: Vec<String> = plan
                .dependents(&phase.id)
                .into_iter()
                .filter(|d| {
                    !matches!(d.state, PhaseState::Unstarted | PhaseState::RolledBack)
                })
                .map(|d| d.id.clone())
                .collect();
            if !blocking.is_empty() {
                return Err(GravityError::BadParameter(format!(
                    "phase {phase_id} is required by {}; roll those back first",
                    blocking.join(", ")
                )));
            }
        }

        if phase.is_leaf() {
            match self.remote_handler(&plan, phase_id, opts.force)? {
                Some(handler) => {
                    self.executor
                        .rollback_with(ctx, &mut plan, phase_id, opts, handler)
                        .await?
                }
                None => self.executor.rollback(ctx, &mut plan, phase_id, opts).await?,
            }
        } else {
            // Mirror traversal: the whole subtree in reverse preorder, so
            // leaves unwind before the groups that contain them.
            let mut subtree: Vec<(String, bool)> = Vec::new();
            fn walk(phase: &Phase, out: &mut Vec<(String, bool)>) {
                out.push((phase.id.clone(), phase.is_leaf()));
                for child in &phase.children {
                    walk(child, out);
                }
            }
            walk(&phase, &mut subtree);
            subtree.reverse();

            for (id, is_leaf) in subtree {
                let state = plan.get(&id)?.state;
                if matches!(state, PhaseState::Unstarted | PhaseState::RolledBack) {
                    continue;
                }
                if is_leaf {
                    match self.remote_handler(&plan, &id, opts.force)? {
                        Some(handler) => {
                            self.executor
                                .rollback_with(ctx, &mut plan, &id, opts, handler)
                                .await?
                        }
                        None => self.executor.rollback(ctx, &mut plan, &id, opts).await?,
                    }
                } else {
                    // Groups have no handler; record the unwound state.
                    self.change_state(&mut plan, &id, state, PhaseState::RolledBack)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Mark the operation Completed or Failed. Idempotent; shuts down
    /// agents on success.
    pub async fn complete(&self, ctx: &HandlerContext, error: Option<String>) -> Result<()> {
        let op = self.store.get_operation(&ctx.op_key).await?;
        if op.state.is_terminal() {
            info!(op = %ctx.op_key, state = ?op.state, "operation already finished");
            return Ok(());
        }

        let plan = self.store.get_plan(&ctx.op_key).await?;
        let target = if error.is_none() && plan.is_completed() {
            OperationState::Completed
        } else {
            OperationState::Failed
        };
        self.store
            .update_operation_state(&ctx.op_key, target)
            .await?;
        info!(op = %ctx.op_key, state = ?target, "operation finished");

        if target == OperationState::Completed {
            self.shutdown_agents(&plan.servers).await;
        }
        Ok(())
    }

    /// Administrative phase-state override.
    pub async fn set_phase_state(
        &self,
        ctx: &HandlerContext,
        phase_id: &str,
        state: PhaseState,
    ) -> Result<()> {
        let mut plan = self.store.get_plan(&ctx.op_key).await?;
        self.executor.set_state(&mut plan, phase_id, state).await
    }

    /// Best-effort fleet shutdown with a bounded deadline per agent.
    async fn shutdown_agents(&self, servers: &[Server]) {
        let Some(runner) = &self.runner else {
            return;
        };
        for server in servers {
            if let Err(err) = runner
                .shutdown_agent(&server.advertise_ip, AGENT_SHUTDOWN_DEADLINE)
                .await
            {
                warn!(node = %server.advertise_ip, %err, "agent did not acknowledge shutdown");
            }
        }
    }

    /// Open every ancestor of a phase so it becomes eligible. A Completed
    /// ancestor is reopened; re-executing a child un-completes its group.
    async fn open_ancestors(&self, plan: &mut OperationPlan, phase_id: &str) -> Result<()> {
        let chain: Vec<(String, PhaseState)> = plan
            .ancestors(phase_id)
            .into_iter()
            .map(|a| (a.id.clone(), a.state))
            .collect();
        for (id, state) in chain {
            match state {
                PhaseState::InProgress => {}
                PhaseState::Unstarted | PhaseState::Completed | PhaseState::RolledBack
                | PhaseState::Failed => {
                    self.change_state(plan, &id, state, PhaseState::InProgress)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

fn subtree_completed(phase: &Phase) -> bool {
    phase.state.is_completed() && phase.children.iter().all(subtree_completed)
}

fn collect_leaves(phase: &Phase) -> Vec<&Phase> {
    let mut out = Vec::new();
    fn walk<'a>(phase: &'a Phase, out: &mut Vec<&'a Phase>) {
        if phase.is_leaf() {
            out.push(phase);
        }
        for child in &phase.children {
            walk(child, out);
        }
    }
    walk(phase, &mut out);
    out
}

fn ignore_compare_failed(err: GravityError) -> Result<()> {
    if err.is_compare_failed() {
        Ok(())
    } else {
        Err(err)
    }
}
