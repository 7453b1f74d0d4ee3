//! Phase envelope: the atomic, resumable unit of work in an operation plan.
//!
//! A phase is identified by a `/`-separated path (e.g. `/masters/node-1/drain`).
//! The `executor` tag selects the handler pair; `requires` lists sibling
//! paths that must be Completed before this phase may start.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Path-like phase identifier. The root phase is `/`.
pub type PhaseId = String;

/// Lifecycle state of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    /// Failed and RolledBack end the current attempt; the phase may still be
    /// re-executed.
    pub fn is_terminal_attempt(&self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// States from which Execute may start.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Unstarted | Self::Failed)
    }

    /// States from which Rollback may start.
    pub fn is_rollbackable(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Parse the operator-facing state name used by `plan set --state`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unstarted" => Some(Self::Unstarted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// A node in the operation plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Full path id, e.g. `/masters/node-1/drain`.
    pub id: PhaseId,
    /// Handler registry tag. Internal phases carry an empty tag.
    #[serde(default)]
    pub executor: String,
    #[serde(default)]
    pub state: PhaseState,
    /// Advertise IP of the node this phase runs on; local when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Sibling phase ids that must be Completed before this phase starts.
    #[serde(default)]
    pub requires: Vec<PhaseId>,
    /// Opaque handler input.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Recorded error text of the last failed attempt, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub children: Vec<Phase>,
}

impl Phase {
    /// Create a leaf phase.
    pub fn leaf(id: &str, executor: &str) -> Self {
        Self {
            id: id.to_string(),
            executor: executor.to_string(),
            state: PhaseState::Unstarted,
            node: None,
            requires: Vec::new(),
            data: serde_json::Value::Null,
            error: None,
            updated_at: Utc::now(),
            children: Vec::new(),
        }
    }

    /// Create an internal phase grouping the given children.
    pub fn group(id: &str, children: Vec<Phase>) -> Self {
        Self {
            children,
            ..Self::leaf(id, "")
        }
    }

    pub fn on_node(mut self, advertise_ip: &str) -> Self {
        self.node = Some(advertise_ip.to_string());
        self
    }

    pub fn requires(mut self, ids: &[&str]) -> Self {
        self.requires = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Last path segment, used for display.
    pub fn name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    /// Parent path of this phase; `None` for the root.
    pub fn parent_id(&self) -> Option<&str> {
        parent_of(&self.id)
    }
}

/// Parent path of a phase id; `None` for the root.
pub fn parent_of(id: &str) -> Option<&str> {
    if id == "/" {
        return None;
    }
    match id.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&id[..idx]),
        None => None,
    }
}
