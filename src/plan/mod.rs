//! Operation plans: the durable, resumable phase tree and its engine.

pub mod engine;
pub mod executor;
pub mod phase;
#[allow(clippy::module_inception)]
pub mod plan;
pub mod registry;

pub use engine::{AgentDispatch, Direction, EngineConfig, PlanEngine};
pub use executor::{PhaseExecutor, PhaseOptions};
pub use phase::{Phase, PhaseId, PhaseState};
pub use plan::OperationPlan;
pub use registry::{HandlerContext, HandlerRegistry, PhaseHandler};
