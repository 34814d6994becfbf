use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a collaboration role.
///
/// The main line runs DRAFT → OPEN → IN_REVIEW → ASSIGNED → IN_PROGRESS →
/// COMPLETION_REQUESTED → COMPLETED. ABANDONED and UNNEEDED are side
/// branches; COMPLETED and UNNEEDED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleState {
    Draft,
    Open,
    InReview,
    Assigned,
    InProgress,
    CompletionRequested,
    Completed,
    Abandoned,
    Unneeded,
}

impl RoleState {
    pub const ALL: [RoleState; 9] = [
        RoleState::Draft,
        RoleState::Open,
        RoleState::InReview,
        RoleState::Assigned,
        RoleState::InProgress,
        RoleState::CompletionRequested,
        RoleState::Completed,
        RoleState::Abandoned,
        RoleState::Unneeded,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RoleState::Completed | RoleState::Unneeded)
    }

    /// States from which a role may be abandoned.
    pub fn is_active_assignment(self) -> bool {
        matches!(
            self,
            RoleState::Assigned | RoleState::InProgress | RoleState::CompletionRequested
        )
    }

    /// The stored (snake_case) name.
    pub fn as_str(self) -> &'static str {
        match self {
            RoleState::Draft => "draft",
            RoleState::Open => "open",
            RoleState::InReview => "in_review",
            RoleState::Assigned => "assigned",
            RoleState::InProgress => "in_progress",
            RoleState::CompletionRequested => "completion_requested",
            RoleState::Completed => "completed",
            RoleState::Abandoned => "abandoned",
            RoleState::Unneeded => "unneeded",
        }
    }
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleState::Draft => write!(f, "DRAFT"),
            RoleState::Open => write!(f, "OPEN"),
            RoleState::InReview => write!(f, "IN_REVIEW"),
            RoleState::Assigned => write!(f, "ASSIGNED"),
            RoleState::InProgress => write!(f, "IN_PROGRESS"),
            RoleState::CompletionRequested => write!(f, "COMPLETION_REQUESTED"),
            RoleState::Completed => write!(f, "COMPLETED"),
            RoleState::Abandoned => write!(f, "ABANDONED"),
            RoleState::Unneeded => write!(f, "UNNEEDED"),
        }
    }
}

impl FromStr for RoleState {
    type Err = String;

    /// Accepts the stored name or the display name, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        RoleState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("unknown role status '{s}'"))
    }
}
