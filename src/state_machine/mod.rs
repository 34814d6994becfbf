mod guards;
mod machine;
mod notify;
mod role;
mod state;
mod transition;

pub use guards::{
    CompletionApproved, CompletionSubmitted, HasApplications, InsertProgressRecord,
    IsCollaborationOwner, MAX_ABANDONMENT_REASON,
};
pub use machine::RoleStateMachine;
pub use notify::{LogNotifier, NoopNotifier, Notifier, NotifyEffect, Recipients, RoleEvent};
pub use role::{Collaboration, CompletionRequest, Role, RoleApplication, RoleUpdate};
pub use state::RoleState;
pub use transition::{
    Condition, RoleCondition, RolePatch, SideEffect, StateTransition, TransitionContext,
    TransitionRequest, TransitionTable, TransitionTableBuilder,
};
