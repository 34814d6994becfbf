use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::RoleState;

/// Field updates applied to a role document, keyed by stored (camelCase) name.
pub type RoleUpdate = Map<String, Value>;

/// A role within a collaboration: the entity whose mutations are coordinated.
///
/// Only `status` is gated by the state machine. Unknown fields are carried
/// through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaboration_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default = "initial_status")]
    pub status: RoleState,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub max_participants: u32,
    #[serde(default)]
    pub assigned_user_ids: Vec<String>,
    #[serde(default)]
    pub accepted_user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandonment_reason: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transaction_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn initial_status() -> RoleState {
    RoleState::Draft
}

impl Role {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collaboration_id: None,
            title: title.into(),
            status: RoleState::Draft,
            required_skills: Vec::new(),
            max_participants: 1,
            assigned_user_ids: Vec::new(),
            accepted_user_ids: Vec::new(),
            participant_id: None,
            previous_participant_id: None,
            abandonment_reason: None,
            created_at: 0,
            updated_at: 0,
            last_transaction_id: None,
            extra: Map::new(),
        }
    }

    pub fn from_document(doc: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(doc.clone())
    }

    /// Every assigned user has accepted.
    pub fn all_assigned_accepted(&self) -> bool {
        !self.assigned_user_ids.is_empty()
            && self
                .assigned_user_ids
                .iter()
                .all(|u| self.accepted_user_ids.contains(u))
    }
}

/// The collaboration a role belongs to. Only the owner may abandon, reopen,
/// or retire its roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaboration {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A user's application to fill a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleApplication {
    pub id: String,
    pub role_id: String,
    pub user_id: String,
    #[serde(default)]
    pub created_at: i64,
}

/// Completion request for a role in progress, stored under the role's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub role_id: String,
    pub requested_by: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub approved: bool,
}
