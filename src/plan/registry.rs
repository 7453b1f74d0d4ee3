//! Handler registry: maps a phase's executor tag to the (do, undo) pair
//! that realizes it.
//!
//! The registry is an explicit configuration struct handed to the engine
//! constructor, so tests can install fakes. Handlers are expected to be
//! idempotent under retries at the same state transition; retry policy for
//! transient failures lives inside the handler, not in the engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::{GravityError, Result};
use crate::ops::OpKey;
use crate::plan::phase::Phase;

/// Cancellation-aware context passed to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    pub op_key: OpKey,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn new(op_key: OpKey, cancel: CancellationToken) -> Self {
        Self { op_key, cancel }
    }

    /// Fail fast when the operator has cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(GravityError::Aborted("operation cancelled".into()))
        } else {
            Ok(())
        }
    }
}

/// The (do, undo) pair for one executor tag.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Run the phase forward.
    async fn execute(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()>;

    /// Undo a previous (possibly partial) execution.
    async fn rollback(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()>;

    /// Whether sibling phases with this executor may run concurrently.
    /// Sequential unless the handler opts in.
    fn parallel_safe(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn PhaseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn PhaseHandler>")
    }
}

/// Executor-tag keyed handler set.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn PhaseHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: &str, handler: Arc<dyn PhaseHandler>) -> &mut Self {
        self.handlers.insert(tag.to_string(), handler);
        self
    }

    /// Resolve a tag, failing with `NotImplemented` for unknown executors.
    pub fn get(&self, tag: &str) -> Result<Arc<dyn PhaseHandler>> {
        self.handlers
            .get(tag)
            .cloned()
            .ok_or_else(|| GravityError::NotImplemented(format!("no handler for executor {tag:?}")))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// True only when every tag is known and declares itself parallel-safe.
    pub fn all_parallel_safe<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> bool {
        tags.into_iter().all(|tag| {
            self.handlers
                .get(tag)
                .is_some_and(|handler| handler.parallel_safe())
        })
    }

    pub fn tags(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fakes shared by engine and executor tests.

    use std::sync::Mutex;

    use super::*;

    /// Records every invocation; optionally fails configured phase ids.
    #[derive(Default)]
    pub struct RecordingHandler {
        pub calls: Mutex<Vec<(String, &'static str)>>,
        pub fail_on: Mutex<Vec<String>>,
        pub parallel: bool,
    }

    impl RecordingHandler {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing(ids: &[&str]) -> Arc<Self> {
            let handler = Self::default();
            *handler.fail_on.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
            Arc::new(handler)
        }

        pub fn calls(&self) -> Vec<(String, &'static str)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn clear_failures(&self) {
            self.fail_on.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl PhaseHandler for RecordingHandler {
        async fn execute(&self, ctx: &HandlerContext, phase: &Phase) -> Result<()> {
            ctx.check_cancelled()?;
            self.calls.lock().unwrap().push((phase.id.clone(), "execute"));
            if self.fail_on.lock().unwrap().contains(&phase.id) {
                return Err(GravityError::ConnectionProblem(format!(
                    "injected failure in {}",
                    phase.id
                )));
            }
            Ok(())
        }

        async fn rollback(&self, _ctx: &HandlerContext, phase: &Phase) -> Result<()> {
            self.calls.lock().unwrap().push((phase.id.clone(), "rollback"));
            Ok(())
        }

        fn parallel_safe(&self) -> bool {
            self.parallel
        }
    }
}
