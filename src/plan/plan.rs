//! The operation plan: a rooted tree of phases plus the participating
//! servers and the binary version pinned to execute it.
//!
//! The tree is immutable in structure once created; only phase states
//! change, and those changes flow through the plan store.

use serde::{Deserialize, Serialize};

use crate::errors::{GravityError, Result};
use crate::ops::{Locator, OpKey, Server};
use crate::plan::phase::{Phase, PhaseId, PhaseState};

/// A rooted tree of phases realizing one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPlan {
    pub op_key: OpKey,
    /// Binary required to execute this plan.
    pub gravity_package: Locator,
    pub servers: Vec<Server>,
    pub root: Phase,
}

impl OperationPlan {
    pub fn new(op_key: OpKey, gravity_package: Locator, servers: Vec<Server>, root: Phase) -> Self {
        Self {
            op_key,
            gravity_package,
            servers,
            root,
        }
    }

    /// Depth-first preorder visit of every phase.
    pub fn visit<'a>(&'a self, visit: &mut dyn FnMut(&'a Phase)) {
        fn walk<'a>(phase: &'a Phase, visit: &mut dyn FnMut(&'a Phase)) {
            visit(phase);
            for child in &phase.children {
                walk(child, visit);
            }
        }
        walk(&self.root, visit);
    }

    /// All phases in preorder.
    pub fn phases(&self) -> Vec<&Phase> {
        let mut out = Vec::new();
        self.visit(&mut |p| out.push(p));
        out
    }

    /// All leaf phases in preorder, the executable units of the plan.
    pub fn leaves(&self) -> Vec<&Phase> {
        self.phases().into_iter().filter(|p| p.is_leaf()).collect()
    }

    /// Find a phase by its path id.
    pub fn find(&self, id: &str) -> Option<&Phase> {
        self.phases().into_iter().find(|p| p.id == id)
    }

    /// Find a phase, failing with NotFound.
    pub fn get(&self, id: &str) -> Result<&Phase> {
        self.find(id)
            .ok_or_else(|| GravityError::NotFound(format!("phase {id} in plan for {}", self.op_key)))
    }

    /// Mutate the state of a phase in this in-memory copy. The durable
    /// transition happens in the plan store; this keeps the loaded tree in
    /// sync without a re-read.
    pub fn set_state(&mut self, id: &str, state: PhaseState, error: Option<String>) -> Result<()> {
        fn walk(phase: &mut Phase, id: &str, state: PhaseState, error: &Option<String>) -> bool {
            if phase.id == id {
                phase.state = state;
                phase.error = error.clone();
                phase.updated_at = chrono::Utc::now();
                return true;
            }
            phase.children.iter_mut().any(|c| walk(c, id, state, error))
        }
        if walk(&mut self.root, id, state, &error) {
            Ok(())
        } else {
            Err(GravityError::NotFound(format!("phase {id}")))
        }
    }

    /// Phases that list `id` in their `requires`.
    pub fn dependents(&self, id: &str) -> Vec<&Phase> {
        self.phases()
            .into_iter()
            .filter(|p| p.requires.iter().any(|r| r == id))
            .collect()
    }

    /// All ancestors of a phase, outermost first, excluding the phase itself.
    pub fn ancestors(&self, id: &str) -> Vec<&Phase> {
        let mut out = Vec::new();
        let mut current = id;
        while let Some(parent) = crate::plan::phase::parent_of(current) {
            if let Some(phase) = self.find(parent) {
                out.push(phase);
            }
            current = parent;
        }
        out.reverse();
        out
    }

    /// True when every phase in the tree is Completed.
    pub fn is_completed(&self) -> bool {
        self.phases().iter().all(|p| p.state.is_completed())
    }

    /// The first Failed phase in preorder, if any.
    pub fn first_failed(&self) -> Option<&Phase> {
        self.phases()
            .into_iter()
            .find(|p| p.state == PhaseState::Failed)
    }

    /// Validate the structural invariants of a freshly built plan: unique
    /// ids, `requires` referencing existing phases, child paths nested under
    /// their parent.
    pub fn validate(&self) -> Result<()> {
        let phases = self.phases();
        let mut seen = std::collections::HashSet::new();
        for phase in &phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(GravityError::BadParameter(format!(
                    "duplicate phase id {}",
                    phase.id
                )));
            }
        }
        for phase in &phases {
            for req in &phase.requires {
                if !seen.contains(req.as_str()) {
                    return Err(GravityError::BadParameter(format!(
                        "phase {} requires unknown phase {}",
                        phase.id, req
                    )));
                }
            }
            for child in &phase.children {
                let prefix = if phase.id == "/" {
                    "/".to_string()
                } else {
                    format!("{}/", phase.id)
                };
                if !child.id.starts_with(&prefix) {
                    return Err(GravityError::BadParameter(format!(
                        "phase {} is not nested under {}",
                        child.id, phase.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Eligibility of a phase for execution: every ancestor InProgress and every
/// required sibling Completed.
pub fn is_eligible(plan: &OperationPlan, id: &PhaseId) -> bool {
    let Some(phase) = plan.find(id) else {
        return false;
    };
    for ancestor in plan.ancestors(id) {
        if ancestor.state != PhaseState::InProgress {
            return false;
        }
    }
    requires_satisfied(plan, phase)
}

/// True when all `requires` of the phase are Completed.
pub fn requires_satisfied(plan: &OperationPlan, phase: &Phase) -> bool {
    phase
        .requires
        .iter()
        .all(|req| plan.find(req).is_some_and(|p| p.state.is_completed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ServerRole;
    use uuid::Uuid;

    fn sample_plan() -> OperationPlan {
        let root = Phase::group(
            "/",
            vec![
                Phase::leaf("/init", "init"),
                Phase::group(
                    "/masters",
                    vec![
                        Phase::leaf("/masters/drain", "drain").requires(&["/init"]),
                        Phase::leaf("/masters/apply", "apply").requires(&["/masters/drain"]),
                    ],
                )
                .requires(&["/init"]),
            ],
        );
        OperationPlan::new(
            OpKey::new("prod", Uuid::new_v4()),
            Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
            vec![Server::new("10.0.0.5", "node-1", ServerRole::Master)],
            root,
        )
    }

    #[test]
    fn preorder_traversal() {
        let plan = sample_plan();
        let ids: Vec<&str> = plan.phases().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["/", "/init", "/masters", "/masters/drain", "/masters/apply"]
        );
    }

    #[test]
    fn find_and_get() {
        let plan = sample_plan();
        assert!(plan.find("/masters/drain").is_some());
        assert!(plan.get("/missing").unwrap_err().is_not_found());
    }

    #[test]
    fn set_state_updates_tree() {
        let mut plan = sample_plan();
        plan.set_state("/init", PhaseState::Completed, None).unwrap();
        assert_eq!(plan.find("/init").unwrap().state, PhaseState::Completed);
        assert!(plan
            .set_state("/missing", PhaseState::Completed, None)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn eligibility_requires_ancestors_in_progress() {
        let mut plan = sample_plan();
        plan.set_state("/", PhaseState::InProgress, None).unwrap();
        plan.set_state("/init", PhaseState::Completed, None).unwrap();

        // /masters is not yet InProgress, so its children are not eligible.
        assert!(!is_eligible(&plan, &"/masters/drain".to_string()));

        plan.set_state("/masters", PhaseState::InProgress, None).unwrap();
        assert!(is_eligible(&plan, &"/masters/drain".to_string()));
        // apply still waits on drain.
        assert!(!is_eligible(&plan, &"/masters/apply".to_string()));
    }

    #[test]
    fn dependents_mirror_requires() {
        let plan = sample_plan();
        let deps = plan.dependents("/init");
        let ids: Vec<&str> = deps.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&"/masters"));
        assert!(ids.contains(&"/masters/drain"));
    }

    #[test]
    fn validate_rejects_unknown_requires() {
        let root = Phase::group("/", vec![Phase::leaf("/a", "x").requires(&["/nope"])]);
        let plan = OperationPlan::new(
            OpKey::new("prod", Uuid::new_v4()),
            Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
            vec![],
            root,
        );
        assert!(plan.validate().unwrap_err().is_bad_parameter());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let root = Phase::group("/", vec![Phase::leaf("/a", "x"), Phase::leaf("/a", "y")]);
        let plan = OperationPlan::new(
            OpKey::new("prod", Uuid::new_v4()),
            Locator::parse("gravitational.io/gravity:6.0.0").unwrap(),
            vec![],
            root,
        );
        assert!(plan.validate().unwrap_err().is_bad_parameter());
    }
}
