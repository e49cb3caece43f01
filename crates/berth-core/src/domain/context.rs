//! Explicit caller context threaded through every collaborator call.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who is calling, with which credential, under which correlation id.
///
/// There is no ambient session: every engine and collaborator call takes a
/// `&CallContext`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub principal: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    token: Option<String>,
    pub correlation_id: Uuid,
}

impl CallContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            token: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Context for internal, unauthenticated calls (tests, local simulation).
    pub fn system() -> Self {
        Self::new("system")
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Bearer token for outbound calls, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("principal", &self.principal)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}
