use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller identity and correlation id carried through every operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub project_id: String,
    pub user_id: String,
    pub is_admin: bool,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            request_id: format!("req-{}", Uuid::new_v4()),
            project_id: project_id.into(),
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    /// Context used by startup recovery and other host-internal work.
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Self::new("admin", "admin")
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::admin()
    }
}
