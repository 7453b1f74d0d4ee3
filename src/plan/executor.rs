//! Single-phase execution: drives one leaf phase through its handler and
//! records the outcome in the plan store.
//!
//! The executor owns the state discipline for one phase: the CAS into
//! InProgress is what serializes racing drivers, and the terminal CAS
//! records the handler verdict with the error text verbatim.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::{GravityError, Result};
use crate::plan::phase::PhaseState;
use crate::plan::plan::{OperationPlan, requires_satisfied};
use crate::plan::registry::{HandlerContext, HandlerRegistry};
use crate::storage::Backend;

/// Options for a single execute or rollback invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseOptions {
    /// Bypass the `requires` discipline. Operator escape hatch.
    pub force: bool,
    /// Per-invocation deadline for the handler.
    pub timeout: Option<Duration>,
}

/// Bounded retries for administrative set-state races.
const SET_STATE_ATTEMPTS: usize = 3;

pub struct PhaseExecutor {
    store: Arc<dyn Backend>,
    registry: HandlerRegistry,
}

impl PhaseExecutor {
    pub fn new(store: Arc<dyn Backend>, registry: HandlerRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Backend> {
        &self.store
    }

    /// Execute one leaf phase through its registered handler. A phase
    /// already Completed is a no-op; a phase held InProgress by another
    /// driver surfaces as CompareFailed.
    pub async fn execute(
        &self,
        ctx: &HandlerContext,
        plan: &mut OperationPlan,
        phase_id: &str,
        opts: PhaseOptions,
    ) -> Result<()> {
        let phase = plan.get(phase_id)?;
        if phase.state.is_completed() {
            info!(%phase_id, "phase already completed, nothing to do");
            return Ok(());
        }
        let handler = self.registry.get(&phase.executor)?;
        self.execute_with(ctx, plan, phase_id, opts, handler).await
    }

    /// Execute one leaf phase through an explicit handler. The agent runner
    /// goes through here so remote phases share the same CAS discipline.
    pub async fn execute_with(
        &self,
        ctx: &HandlerContext,
        plan: &mut OperationPlan,
        phase_id: &str,
        opts: PhaseOptions,
        handler: Arc<dyn crate::plan::registry::PhaseHandler>,
    ) -> Result<()> {
        let phase = plan.get(phase_id)?.clone();
        match phase.state {
            PhaseState::Completed => {
                info!(%phase_id, "phase already completed, nothing to do");
                return Ok(());
            }
            PhaseState::InProgress => {
                return Err(GravityError::CompareFailed(format!(
                    "phase {phase_id} is in progress, another driver may hold it"
                )));
            }
            PhaseState::Unstarted | PhaseState::Failed | PhaseState::RolledBack => {}
        }
        if !opts.force && !requires_satisfied(plan, &phase) {
            let missing: Vec<&str> = phase
                .requires
                .iter()
                .filter(|req| !plan.find(req).is_some_and(|p| p.state.is_completed()))
                .map(|s| s.as_str())
                .collect();
            return Err(GravityError::BadParameter(format!(
                "phase {phase_id} requires {} to complete first",
                missing.join(", ")
            )));
        }

        self.store
            .change_phase_state(&plan.op_key, &phase.id, phase.state, PhaseState::InProgress, None)
            .await?;
        plan.set_state(phase_id, PhaseState::InProgress, None)?;
        info!(%phase_id, executor = %phase.executor, "executing phase");

        let outcome = self
            .run_with_deadline(ctx, opts.timeout, handler.execute(ctx, &phase))
            .await;

        match outcome {
            Ok(()) => {
                self.store
                    .change_phase_state(
                        &plan.op_key,
                        &phase.id,
                        PhaseState::InProgress,
                        PhaseState::Completed,
                        None,
                    )
                    .await?;
                plan.set_state(phase_id, PhaseState::Completed, None)?;
                info!(%phase_id, "phase completed");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.store
                    .change_phase_state(
                        &plan.op_key,
                        &phase.id,
                        PhaseState::InProgress,
                        PhaseState::Failed,
                        Some(message.clone()),
                    )
                    .await?;
                plan.set_state(phase_id, PhaseState::Failed, Some(message))?;
                warn!(%phase_id, %err, "phase failed");
                Err(err)
            }
        }
    }

    /// Roll back one leaf phase through its paired undo handler.
    pub async fn rollback(
        &self,
        ctx: &HandlerContext,
        plan: &mut OperationPlan,
        phase_id: &str,
        opts: PhaseOptions,
    ) -> Result<()> {
        let tag = plan.get(phase_id)?.executor.clone();
        let handler = self.registry.get(&tag)?;
        self.rollback_with(ctx, plan, phase_id, opts, handler).await
    }

    /// Roll back one leaf phase through an explicit handler.
    pub async fn rollback_with(
        &self,
        ctx: &HandlerContext,
        plan: &mut OperationPlan,
        phase_id: &str,
        opts: PhaseOptions,
        handler: Arc<dyn crate::plan::registry::PhaseHandler>,
    ) -> Result<()> {
        let phase = plan.get(phase_id)?.clone();
        match phase.state {
            PhaseState::RolledBack => {
                info!(%phase_id, "phase already rolled back, nothing to do");
                return Ok(());
            }
            PhaseState::Unstarted => {
                if !opts.force {
                    return Err(GravityError::BadParameter(format!(
                        "phase {phase_id} is unstarted, nothing to roll back"
                    )));
                }
                return Ok(());
            }
            PhaseState::InProgress => {
                return Err(GravityError::CompareFailed(format!(
                    "phase {phase_id} is in progress, another driver may hold it"
                )));
            }
            PhaseState::Completed | PhaseState::Failed => {}
        }

        info!(%phase_id, executor = %phase.executor, "rolling back phase");

        let outcome = self
            .run_with_deadline(ctx, opts.timeout, handler.rollback(ctx, &phase))
            .await;
        match outcome {
            Ok(()) => {
                self.store
                    .change_phase_state(
                        &plan.op_key,
                        &phase.id,
                        phase.state,
                        PhaseState::RolledBack,
                        None,
                    )
                    .await?;
                plan.set_state(phase_id, PhaseState::RolledBack, None)?;
                Ok(())
            }
            Err(err) => {
                warn!(%phase_id, %err, "rollback failed, phase state unchanged");
                Err(err)
            }
        }
    }

    /// Administrative override: persist a new state without invoking any
    /// handler. Retries a lost CAS against a fresh read, bounded.
    pub async fn set_state(
        &self,
        plan: &mut OperationPlan,
        phase_id: &str,
        new_state: PhaseState,
    ) -> Result<()> {
        for attempt in 0..SET_STATE_ATTEMPTS {
            let current = self.store.get_plan(&plan.op_key).await?;
            let phase = current.get(phase_id)?;
            match self
                .store
                .change_phase_state(&plan.op_key, &phase.id, phase.state, new_state, None)
                .await
            {
                Ok(()) => {
                    plan.set_state(phase_id, new_state, None)?;
                    info!(%phase_id, state = %new_state, "phase state set");
                    return Ok(());
                }
                Err(err) if err.is_compare_failed() && attempt + 1 < SET_STATE_ATTEMPTS => {
                    warn!(%phase_id, "set-state raced with another writer, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop returns on last attempt")
    }

    async fn run_with_deadline(
        &self,
        ctx: &HandlerContext,
        timeout: Option<Duration>,
        work: impl std::future::Future<Output = Result<()>>,
    ) -> Result<()> {
        let cancelled = ctx.cancel.cancelled();
        match timeout {
            Some(deadline) => {
                tokio::select! {
                    outcome = work => outcome,
                    _ = cancelled => Err(GravityError::Aborted("operation cancelled".into())),
                    _ = tokio::time::sleep(deadline) => Err(GravityError::Timeout(format!(
                        "phase handler exceeded {}s deadline",
                        deadline.as_secs()
                    ))),
                }
            }
            None => {
                tokio::select! {
                    outcome = work => outcome,
                    _ = cancelled => Err(GravityError::Aborted("operation cancelled".into())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Locator, OpKey, Server, ServerRole};
    use crate::plan::phase::Phase;
    use crate::plan::registry::testing::RecordingHandler;
    use crate::storage::SqliteBackend;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn setup(
        fail_on: &[&str],
    ) -> (PhaseExecutor, HandlerContext, OperationPlan, Arc<RecordingHandler>) {
        let handler = RecordingHandler::failing(fail_on);
        let mut registry = HandlerRegistry::new();
        registry.register("work", handler.clone());

        let store: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let key = OpKey::new("prod", Uuid::new_v4());
        let plan = OperationPlan::new(
            key.clone(),
            Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
            vec![Server::new("10.0.0.5", "node-1", ServerRole::Master)],
            Phase::group(
                "/",
                vec![
                    Phase::leaf("/first", "work"),
                    Phase::leaf("/second", "work").requires(&["/first"]),
                ],
            ),
        );
        store.create_plan(&plan).await.unwrap();

        let executor = PhaseExecutor::new(store, registry);
        let ctx = HandlerContext::new(key, CancellationToken::new());
        (executor, ctx, plan, handler)
    }

    #[tokio::test]
    async fn execute_transitions_to_completed() {
        let (executor, ctx, mut plan, handler) = setup(&[]).await;
        executor
            .execute(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.find("/first").unwrap().state, PhaseState::Completed);
        assert_eq!(handler.calls(), vec![("/first".to_string(), "execute")]);

        // Durable too.
        let stored = executor.store().get_plan(&plan.op_key).await.unwrap();
        assert_eq!(stored.find("/first").unwrap().state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn execute_completed_phase_is_noop() {
        let (executor, ctx, mut plan, handler) = setup(&[]).await;
        executor
            .execute(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await
            .unwrap();
        executor
            .execute(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await
            .unwrap();
        // Handler ran exactly once.
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn execute_respects_requires() {
        let (executor, ctx, mut plan, _) = setup(&[]).await;
        let err = executor
            .execute(&ctx, &mut plan, "/second", PhaseOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
        assert!(err.to_string().contains("/first"));
    }

    #[tokio::test]
    async fn force_bypasses_requires() {
        let (executor, ctx, mut plan, _) = setup(&[]).await;
        executor
            .execute(
                &ctx,
                &mut plan,
                "/second",
                PhaseOptions {
                    force: true,
                    timeout: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.find("/second").unwrap().state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn handler_failure_marks_failed_with_message() {
        let (executor, ctx, mut plan, _) = setup(&["/first"]).await;
        let err = executor
            .execute(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_connection_problem());

        let stored = executor.store().get_plan(&plan.op_key).await.unwrap();
        let phase = stored.find("/first").unwrap();
        assert_eq!(phase.state, PhaseState::Failed);
        assert_eq!(
            phase.error.as_deref(),
            Some("connection problem: injected failure in /first")
        );
    }

    #[tokio::test]
    async fn failed_phase_can_be_rolled_back_and_reexecuted() {
        let (executor, ctx, mut plan, handler) = setup(&["/first"]).await;
        let _ = executor
            .execute(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await;
        executor
            .rollback(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.find("/first").unwrap().state, PhaseState::RolledBack);

        handler.clear_failures();
        executor
            .execute(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.find("/first").unwrap().state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn rollback_unstarted_is_rejected() {
        let (executor, ctx, mut plan, _) = setup(&[]).await;
        let err = executor
            .rollback(&ctx, &mut plan, "/first", PhaseOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn timeout_marks_phase_failed() {
        struct SlowHandler;

        #[async_trait::async_trait]
        impl crate::plan::registry::PhaseHandler for SlowHandler {
            async fn execute(
                &self,
                _ctx: &HandlerContext,
                _phase: &Phase,
            ) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            async fn rollback(&self, _ctx: &HandlerContext, _phase: &Phase) -> Result<()> {
                Ok(())
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register("slow", Arc::new(SlowHandler));
        let store: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let key = OpKey::new("prod", Uuid::new_v4());
        let mut plan = OperationPlan::new(
            key.clone(),
            Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
            vec![],
            Phase::group("/", vec![Phase::leaf("/slow", "slow")]),
        );
        store.create_plan(&plan).await.unwrap();
        let executor = PhaseExecutor::new(store, registry);
        let ctx = HandlerContext::new(key, CancellationToken::new());

        let err = executor
            .execute(
                &ctx,
                &mut plan,
                "/slow",
                PhaseOptions {
                    force: false,
                    timeout: Some(Duration::from_millis(20)),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(plan.find("/slow").unwrap().state, PhaseState::Failed);
    }

    #[tokio::test]
    async fn set_state_overrides_without_handler() {
        let (executor, _ctx, mut plan, handler) = setup(&[]).await;
        executor
            .set_state(&mut plan, "/first", PhaseState::Completed)
            .await
            .unwrap();
        assert!(handler.calls().is_empty());
        assert_eq!(plan.find("/first").unwrap().state, PhaseState::Completed);
    }
}
