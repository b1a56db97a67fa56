//! Authentication: credentials, sessions, users
//!
//! Three collaborating pieces:
//!
//! - [`credentials`] mints and verifies signed bearer credentials (C1)
//! - [`sessions`] persists refresh-credential identifiers for revocation (C2)
//! - [`users`] stores users, password hashes, and role assignments (C3)

pub mod credentials;
pub mod sessions;
pub mod users;

use serde::{Deserialize, Serialize};

/// Built-in role granted to administrators.
pub const ROLE_ADMIN: &str = "admin";
/// Built-in default role assigned at registration.
pub const ROLE_USER: &str = "user";
/// Built-in restricted role.
pub const ROLE_GUEST: &str = "guest";

/// Authenticated identity attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// No credential presented (or a public method bypassed auth)
    Anonymous,
    /// A verified end user
    User(UserPrincipal),
    /// An internal service hop (trust token without principal headers)
    Service,
}

impl Principal {
    /// Return the user principal, if any.
    #[must_use]
    pub fn user(&self) -> Option<&UserPrincipal> {
        match self {
            Self::User(u) => Some(u),
            Self::Anonymous | Self::Service => None,
        }
    }

    /// Identity string used for rate limiting and decision caching.
    ///
    /// Anonymous principals have no stable identity; callers fall back to
    /// the client network address.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::User(u) => Some(&u.id),
            Self::Service => Some("internal"),
            Self::Anonymous => None,
        }
    }
}

/// Verified user identity (subject id, email, role names).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPrincipal {
    /// User id (`sub` claim)
    pub id: String,
    /// Email, when the credential carries one
    pub email: Option<String>,
    /// Role names
    pub roles: Vec<String>,
}

impl UserPrincipal {
    /// Return `true` when the principal holds the admin role.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ROLE_ADMIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_identity() {
        let user = Principal::User(UserPrincipal {
            id: "u1".to_string(),
            email: None,
            roles: vec![ROLE_USER.to_string()],
        });
        assert_eq!(user.identity(), Some("u1"));
        assert_eq!(Principal::Anonymous.identity(), None);
        assert_eq!(Principal::Service.identity(), Some("internal"));
    }

    #[test]
    fn admin_detection() {
        let admin = UserPrincipal {
            id: "a".to_string(),
            email: None,
            roles: vec![ROLE_ADMIN.to_string(), ROLE_USER.to_string()],
        };
        assert!(admin.is_admin());

        let user = UserPrincipal {
            id: "u".to_string(),
            email: None,
            roles: vec![ROLE_USER.to_string()],
        };
        assert!(!user.is_admin());
    }
}
