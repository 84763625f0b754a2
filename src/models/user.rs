//! User identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered user.
///
/// Either `password_hash` (local signup) or `google_subject` (federated
/// identity) is present; an account can hold both after linking. Users
/// are never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Bcrypt/argon hash produced by the auth adapter; opaque here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Stable subject id from the federated identity provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Returns true if this account uses password authentication.
    pub fn has_password_auth(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Returns true if this account is linked to a federated identity.
    pub fn is_federated(&self) -> bool {
        self.google_subject.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_kind_flags() {
        let user = User {
            id: "u1".into(),
            email: "a@b.c".into(),
            password_hash: Some("$2b$...".into()),
            google_subject: None,
            display_name: None,
            created_at: Utc::now(),
        };
        assert!(user.has_password_auth());
        assert!(!user.is_federated());
    }
}
