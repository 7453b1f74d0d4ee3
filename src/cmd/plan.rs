//! `gravity plan` and its subcommands: show, execute, rollback, set,
//! resume, complete.

use std::time::Duration;

use console::style;
use uuid::Uuid;

use super::App;
use crate::errors::{GravityError, Result};
use crate::ops::Operation;
use crate::plan::executor::PhaseOptions;
use crate::plan::phase::{Phase, PhaseState};
use crate::plan::plan::OperationPlan;
use crate::plan::registry::HandlerContext;

/// Output format for `gravity plan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Default)]
pub enum PlanFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

async fn active(app: &App, operation_id: Option<Uuid>) -> Result<Operation> {
    app.coordinator()?
        .active_operation(&app.profile.cluster_id, operation_id)
        .await
}

fn context(app: &App, op: &Operation) -> HandlerContext {
    HandlerContext::new(op.key.clone(), app.cancel.clone())
}

/// Print the current plan.
pub async fn show(app: &App, operation_id: Option<Uuid>, format: PlanFormat) -> Result<()> {
    let op = active(app, operation_id).await?;
    let plan = app.store.get_plan(&op.key).await?;
    match format {
        PlanFormat::Text => render_text(&op, &plan),
        PlanFormat::Json => {
            let doc = serde_json::json!({ "operation": op, "plan": plan });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        PlanFormat::Yaml => print!("{}", serde_yaml::to_string(&plan)?),
    }
    Ok(())
}

/// Execute one phase, or resume the whole plan when the root is named.
pub async fn execute(
    app: &App,
    operation_id: Option<Uuid>,
    phase_id: &str,
    force: bool,
    timeout: Option<Duration>,
    skip_version_check: bool,
) -> Result<()> {
    if phase_id == "/" {
        return resume(app, operation_id, force, skip_version_check).await;
    }
    let op = active(app, operation_id).await?;
    let engine = app.engine(skip_version_check)?;
    engine
        .execute_phase(&context(app, &op), phase_id, PhaseOptions { force, timeout })
        .await
}

/// Roll back one phase.
pub async fn rollback(
    app: &App,
    operation_id: Option<Uuid>,
    phase_id: &str,
    force: bool,
    timeout: Option<Duration>,
    skip_version_check: bool,
) -> Result<()> {
    let op = active(app, operation_id).await?;
    let engine = app.engine(skip_version_check)?;
    engine
        .rollback_phase(&context(app, &op), phase_id, PhaseOptions { force, timeout })
        .await
}

/// Administrative phase-state override.
pub async fn set_state(
    app: &App,
    operation_id: Option<Uuid>,
    phase_id: &str,
    state: &str,
) -> Result<()> {
    let state = PhaseState::parse(state).ok_or_else(|| {
        GravityError::BadParameter(format!(
            "unknown phase state {state:?}; one of unstarted, in_progress, completed, \
             failed, rolled_back"
        ))
    })?;
    let op = active(app, operation_id).await?;
    let engine = app.engine(true)?;
    engine
        .set_phase_state(&context(app, &op), phase_id, state)
        .await
}

/// Drive the plan to completion.
pub async fn resume(
    app: &App,
    operation_id: Option<Uuid>,
    force: bool,
    skip_version_check: bool,
) -> Result<()> {
    let op = active(app, operation_id).await?;
    let engine = app.engine(skip_version_check)?;
    let ctx = context(app, &op);

    let spinner = indicatif::ProgressBar::new_spinner()
        .with_message(format!("resuming operation {}", op.key.operation_id));
    spinner.enable_steady_tick(Duration::from_millis(120));
    let outcome = engine
        .resume(
            &ctx,
            PhaseOptions {
                force,
                timeout: None,
            },
        )
        .await;
    spinner.finish_and_clear();
    outcome?;
    engine.complete(&ctx, None).await?;
    println!(
        "operation {} is {}",
        op.key.operation_id,
        style("completed").green()
    );
    Ok(())
}

/// Mark the operation complete or failed, according to the plan.
pub async fn complete(app: &App, operation_id: Option<Uuid>) -> Result<()> {
    let op = active(app, operation_id).await?;
    let engine = app.engine(true)?;
    engine.complete(&context(app, &op), None).await
}

fn render_text(op: &Operation, plan: &OperationPlan) {
    println!(
        "operation {} ({}) on cluster {}",
        op.key.operation_id, op.op_type, op.key.cluster_id
    );
    println!(
        "binary: {}   servers: {}",
        plan.gravity_package,
        plan.servers.len()
    );
    render_phase(&plan.root, 0);
}

fn render_phase(phase: &Phase, depth: usize) {
    if phase.id != "/" {
        let indent = "  ".repeat(depth.saturating_sub(1));
        let glyph = match phase.state {
            PhaseState::Unstarted => style("·").dim(),
            PhaseState::InProgress => style("→").yellow(),
            PhaseState::Completed => style("✓").green(),
            PhaseState::Failed => style("✗").red(),
            PhaseState::RolledBack => style("↺").cyan(),
        };
        let mut line = format!("{indent}{glyph} {} [{}]", phase.name(), phase.state);
        if !phase.requires.is_empty() {
            line.push_str(&format!(" requires {}", phase.requires.join(", ")));
        }
        if let Some(error) = &phase.error {
            line.push_str(&format!(": {}", crate::redact::redact(error)));
        }
        println!("{line}");
    }
    for child in &phase.children {
        render_phase(child, depth + 1);
    }
}
