//! Authenticated session model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Credentials issued by the remote service at login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub full_name: String,
    /// Linked responder record, when the account has one
    #[serde(default)]
    pub responder_id: Option<String>,
}

impl Session {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.token.trim().is_empty() && !self.user_id.trim().is_empty()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Session")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("full_name", &self.full_name)
            .field("responder_id", &self.responder_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_debug_redacts_token() {
        let session = Session {
            token: "secret".to_string(),
            user_id: "user1".to_string(),
            full_name: "Ana Cruz".to_string(),
            responder_id: None,
        };
        let debug = format!("{session:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn session_requires_token_and_user() {
        let mut session = Session {
            token: "t".to_string(),
            user_id: "u".to_string(),
            full_name: String::new(),
            responder_id: None,
        };
        assert!(session.is_valid());
        session.token = "  ".to_string();
        assert!(!session.is_valid());
    }
}
