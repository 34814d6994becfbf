use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::role::{Role, RoleUpdate};
use super::state::RoleState;
use crate::error::Result;
use crate::store::DocumentStore;

/// Who is asking for a transition, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionRequest {
    pub actor_id: Option<String>,
    pub reason: Option<String>,
}

impl TransitionRequest {
    pub fn by(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Everything a guard or side effect may look at while a transition runs.
///
/// `role` is the state loaded under the role's lock, before the transition.
pub struct TransitionContext<'a> {
    pub role: &'a Role,
    pub from: RoleState,
    pub to: RoleState,
    pub request: &'a TransitionRequest,
    pub transaction_id: &'a str,
    pub store: &'a dyn DocumentStore,
    pub now_ms: i64,
}

/// A guard that must hold for a transition to proceed.
#[async_trait]
pub trait Condition: Send + Sync {
    /// Reported verbatim when the condition does not hold.
    fn description(&self) -> &str;

    async fn holds(&self, ctx: &TransitionContext<'_>) -> Result<bool>;
}

/// A compensable action run as part of a transition.
///
/// `rollback` is only ever called after a successful `execute` in the same
/// transition, at most once.
#[async_trait]
pub trait SideEffect: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &TransitionContext<'_>) -> Result<()>;

    async fn rollback(&self, ctx: &TransitionContext<'_>) -> Result<()>;
}

type RolePredicate = dyn Fn(&Role, &TransitionRequest) -> bool + Send + Sync;

/// A synchronous guard over the role and the request.
pub struct RoleCondition {
    description: String,
    predicate: Box<RolePredicate>,
}

impl RoleCondition {
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Role, &TransitionRequest) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl Condition for RoleCondition {
    fn description(&self) -> &str {
        &self.description
    }

    async fn holds(&self, ctx: &TransitionContext<'_>) -> Result<bool> {
        Ok((self.predicate)(ctx.role, ctx.request))
    }
}

/// Field changes written together with the new status.
pub type RolePatch = fn(&Role, &TransitionRequest) -> RoleUpdate;

/// One edge of the lifecycle graph.
pub struct StateTransition {
    pub from: RoleState,
    pub to: RoleState,
    pub conditions: Vec<Arc<dyn Condition>>,
    pub side_effects: Vec<Arc<dyn SideEffect>>,
    pub patch: Option<RolePatch>,
}

impl StateTransition {
    pub fn new(from: RoleState, to: RoleState) -> Self {
        Self {
            from,
            to,
            conditions: Vec::new(),
            side_effects: Vec::new(),
            patch: None,
        }
    }

    /// Add a guard. Guards are checked in the order they are added.
    pub fn when(mut self, condition: impl Condition + 'static) -> Self {
        self.conditions.push(Arc::new(condition));
        self
    }

    /// Add a side effect. Effects run in the order they are added.
    pub fn then(mut self, effect: Arc<dyn SideEffect>) -> Self {
        self.side_effects.push(effect);
        self
    }

    pub fn patch(mut self, patch: RolePatch) -> Self {
        self.patch = Some(patch);
        self
    }
}

/// The registered transitions, keyed by `(from, to)`. Read-only once built.
pub struct TransitionTable {
    transitions: BTreeMap<(RoleState, RoleState), StateTransition>,
}

impl TransitionTable {
    pub fn builder() -> TransitionTableBuilder {
        TransitionTableBuilder::default()
    }

    pub fn get(&self, from: RoleState, to: RoleState) -> Option<&StateTransition> {
        self.transitions.get(&(from, to))
    }

    /// Targets reachable from `from` in one step, in lifecycle order.
    pub fn available_transitions(&self, from: RoleState) -> Vec<RoleState> {
        self.transitions
            .keys()
            .filter(|(f, _)| *f == from)
            .map(|(_, to)| *to)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

#[derive(Default)]
pub struct TransitionTableBuilder {
    transitions: BTreeMap<(RoleState, RoleState), StateTransition>,
}

impl TransitionTableBuilder {
    /// Register an edge. Registering the same edge again replaces it.
    pub fn transition(mut self, transition: StateTransition) -> Self {
        self.transitions
            .insert((transition.from, transition.to), transition);
        self
    }

    pub fn build(self) -> TransitionTable {
        TransitionTable {
            transitions: self.transitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn table_lookup_and_targets() {
        let table = TransitionTable::builder()
            .transition(StateTransition::new(RoleState::Abandoned, RoleState::Unneeded))
            .transition(StateTransition::new(RoleState::Abandoned, RoleState::Open))
            .transition(StateTransition::new(RoleState::Draft, RoleState::Open))
            .build();

        assert_eq!(table.len(), 3);
        assert!(table.get(RoleState::Draft, RoleState::Open).is_some());
        assert!(table.get(RoleState::Open, RoleState::Draft).is_none());
        assert_eq!(
            table.available_transitions(RoleState::Abandoned),
            vec![RoleState::Open, RoleState::Unneeded]
        );
        assert!(table.available_transitions(RoleState::Completed).is_empty());
    }

    #[test]
    fn re_registering_an_edge_replaces_it() {
        let table = TransitionTable::builder()
            .transition(
                StateTransition::new(RoleState::Draft, RoleState::Open)
                    .when(RoleCondition::new("first", |_, _| true)),
            )
            .transition(StateTransition::new(RoleState::Draft, RoleState::Open))
            .build();
        let edge = table.get(RoleState::Draft, RoleState::Open).unwrap();
        assert!(edge.conditions.is_empty());
    }

    #[tokio::test]
    async fn role_condition_sees_role_and_request() {
        let condition = RoleCondition::new("needs a reason", |role, req| {
            role.id == "r1" && req.reason.is_some()
        });
        let role = Role::new("r1", "Writer");
        let store = MemoryStore::new();
        let request = TransitionRequest::by("u1").with_reason("moved on");
        let ctx = TransitionContext {
            role: &role,
            from: RoleState::Assigned,
            to: RoleState::Abandoned,
            request: &request,
            transaction_id: "tx",
            store: &store,
            now_ms: 0,
        };
        assert!(condition.holds(&ctx).await.unwrap());
        assert_eq!(condition.description(), "needs a reason");

        let bare = TransitionRequest::default();
        let ctx = TransitionContext {
            request: &bare,
            ..ctx
        };
        assert!(!condition.holds(&ctx).await.unwrap());
    }
}
