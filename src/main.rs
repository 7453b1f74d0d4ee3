use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use gravity::cmd::plan::PlanFormat;
use gravity::cmd::{App, agent, ops, plan, update};
use gravity::config::DEFAULT_STATE_DIR;
use gravity::errors::Result;
use gravity::redact::redact;

#[derive(Parser)]
#[command(name = "gravity")]
#[command(version, about = "Cluster lifecycle orchestrator")]
pub struct Cli {
    /// Node state directory.
    #[arg(long, default_value = DEFAULT_STATE_DIR, global = true)]
    pub state_dir: PathBuf,

    /// Verbose logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect or drive the current operation plan
    Plan {
        #[command(subcommand)]
        command: Option<PlanCommands>,
        #[arg(long, global = true)]
        operation_id: Option<Uuid>,
        #[arg(long, value_enum, default_value = "text", global = true)]
        format: PlanFormat,
    },
    /// Create and optionally drive an update operation
    Upgrade {
        package: Option<String>,
        /// Create the plan but let the operator drive it
        #[arg(long)]
        manual: bool,
    },
    /// Fetch and initiate updates
    Update {
        #[command(subcommand)]
        command: UpdateCommands,
    },
    /// Fleet control for the per-node agents
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Change the advertise address of a single-node cluster
    Reconfigure {
        #[arg(long)]
        advertise_addr: String,
        #[arg(long)]
        manual: bool,
    },
    /// Remove a node from the cluster
    Shrink {
        /// Node identity: advertise IP, hostname, node id, or instance id
        server: String,
        #[arg(long)]
        manual: bool,
    },
    /// Garbage-collect stale artifacts across the fleet
    Gc {
        #[arg(long)]
        manual: bool,
    },
    /// Cluster and operation status
    Status {
        #[arg(long)]
        operation_id: Option<Uuid>,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Execute one phase, or resume with --phase=/
    Execute {
        #[arg(long)]
        phase: String,
        #[arg(long)]
        force: bool,
        /// Per-phase deadline, e.g. 90s or 5m
        #[arg(long)]
        timeout: Option<String>,
        #[arg(long)]
        skip_version_check: bool,
    },
    /// Roll back one phase
    Rollback {
        #[arg(long)]
        phase: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        timeout: Option<String>,
        #[arg(long)]
        skip_version_check: bool,
    },
    /// Administrative phase-state override
    Set {
        #[arg(long)]
        phase: String,
        #[arg(long)]
        state: String,
    },
    /// Drive the plan to completion
    Resume {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_version_check: bool,
    },
    /// Mark the operation complete or failed
    Complete,
}

#[derive(Subcommand)]
pub enum UpdateCommands {
    /// Download a package from the distribution endpoint
    Download { package: String },
    /// Initiate an unattended update
    Trigger { package: Option<String> },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Install and start agents on every node
    Deploy {
        /// Agent binary package to install
        #[arg(long)]
        version: Option<String>,
        /// Extra arguments for the leader's service unit
        #[arg(long)]
        leader_args: Vec<String>,
    },
    /// Ask every agent to drain and stop
    Shutdown,
    /// Fleet health summary
    Status,
    /// Run the per-node agent (launched by the service unit)
    Run {
        #[arg(long)]
        leader: bool,
        /// Handler to start once serving (unattended upgrades)
        #[arg(long)]
        handler: Option<String>,
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("ERROR: {}", redact(&err.to_string()));
            if !err.is_bad_parameter() {
                eprintln!("run `gravity plan` to inspect the operation and recover");
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    if gravity::config::selinux_bootstrapped() {
        // Already re-executed under the right security context; the
        // bootstrap adapter must not recurse.
        tracing::debug!("security context bootstrap sentinel present");
    }
    let cancel = gravity::signals::install();
    let app = App::open(&cli.state_dir, cancel)?;

    match cli.command {
        Commands::Plan {
            command,
            operation_id,
            format,
        } => {
            match command {
                None => plan::show(&app, operation_id, format).await?,
                Some(PlanCommands::Execute {
                    phase,
                    force,
                    timeout,
                    skip_version_check,
                }) => {
                    plan::execute(
                        &app,
                        operation_id,
                        &phase,
                        force,
                        parse_timeout(timeout)?,
                        skip_version_check,
                    )
                    .await?
                }
                Some(PlanCommands::Rollback {
                    phase,
                    force,
                    timeout,
                    skip_version_check,
                }) => {
                    plan::rollback(
                        &app,
                        operation_id,
                        &phase,
                        force,
                        parse_timeout(timeout)?,
                        skip_version_check,
                    )
                    .await?
                }
                Some(PlanCommands::Set { phase, state }) => {
                    plan::set_state(&app, operation_id, &phase, &state).await?
                }
                Some(PlanCommands::Resume {
                    force,
                    skip_version_check,
                }) => plan::resume(&app, operation_id, force, skip_version_check).await?,
                Some(PlanCommands::Complete) => plan::complete(&app, operation_id).await?,
            }
            Ok(0)
        }
        Commands::Upgrade { package, manual } => {
            update::upgrade(&app, package, manual).await?;
            Ok(0)
        }
        Commands::Update { command } => {
            match command {
                UpdateCommands::Download { package } => update::download(&app, &package).await?,
                UpdateCommands::Trigger { package } => update::trigger(&app, package).await?,
            }
            Ok(0)
        }
        Commands::Agent { command } => {
            match command {
                AgentCommands::Deploy {
                    version,
                    leader_args,
                } => agent::deploy(&app, version, leader_args).await?,
                AgentCommands::Shutdown => agent::shutdown(&app).await?,
                AgentCommands::Status => {
                    let healthy = agent::status(&app).await?;
                    return Ok(if healthy { 0 } else { 3 });
                }
                AgentCommands::Run {
                    leader,
                    handler,
                    listen,
                } => agent::run(&app, leader, listen, handler).await?,
            }
            Ok(0)
        }
        Commands::Reconfigure {
            advertise_addr,
            manual,
        } => {
            ops::reconfigure(&app, advertise_addr, manual).await?;
            Ok(0)
        }
        Commands::Shrink { server, manual } => {
            ops::shrink(&app, server, manual).await?;
            Ok(0)
        }
        Commands::Gc { manual } => {
            ops::garbage_collect(&app, manual).await?;
            Ok(0)
        }
        Commands::Status { operation_id } => ops::status(&app, operation_id).await,
    }
}

fn parse_timeout(raw: Option<String>) -> Result<Option<Duration>> {
    match raw {
        None => Ok(None),
        Some(raw) => gravity::config::parse_duration(&raw)
            .map(Some)
            .ok_or_else(|| {
                gravity::GravityError::BadParameter(format!(
                    "invalid timeout {raw:?}; use forms like 90s or 5m"
                ))
            }),
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if debug { "gravity=debug" } else { "gravity=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
