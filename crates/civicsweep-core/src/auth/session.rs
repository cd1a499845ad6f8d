use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who the signed-in identity is acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Vendor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Vendor => "vendor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" | "citizen" => Ok(Role::User),
            "vendor" => Ok(Role::Vendor),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Identity of the signed-in user as returned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub role: Role,
    /// Remote identifier for this user, vendor or admin
    pub id: String,
    /// Login identifier (email or phone) if the service echoes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_id: Option<String>,
    #[serde(default)]
    pub name: String,
}

/// A session plus the bearer token it was issued with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub session: Session,
    pub token: String,
}

/// A previously authenticated identity kept for offline login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub key: String,
    pub role: Role,
    pub login_id: String,
    pub name: String,
    pub session: Session,
    pub token: String,
    pub last_login_at: DateTime<Utc>,
}

impl Account {
    pub fn into_active(self) -> ActiveSession {
        ActiveSession {
            session: self.session,
            token: self.token,
        }
    }
}

/// Login ids compare trimmed and case-insensitively.
pub fn normalize_login_id(login_id: &str) -> String {
    login_id.trim().to_lowercase()
}

/// Composite account key, e.g. `vendor:ops@example.org`.
pub fn account_key(role: Role, login_id: &str) -> String {
    format!("{}:{}", role, normalize_login_id(login_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("Vendor".parse::<Role>().unwrap(), Role::Vendor);
        assert_eq!(" admin ".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("citizen".parse::<Role>().unwrap(), Role::User);
        assert!("janitor".parse::<Role>().is_err());
        assert_eq!(Role::User.to_string(), "user");
    }

    #[test]
    fn test_account_key_normalizes_login_id() {
        assert_eq!(account_key(Role::Vendor, "  Ops@Example.ORG "), "vendor:ops@example.org");
        assert_eq!(account_key(Role::User, "5551234"), "user:5551234");
    }

    #[test]
    fn test_session_wire_format() {
        let json = r#"{"role":"vendor","id":"v-17","loginId":"ops@example.org","name":"Green Crew"}"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.role, Role::Vendor);
        assert_eq!(session.login_id.as_deref(), Some("ops@example.org"));

        // Optional fields may be missing
        let minimal: Session = serde_json::from_str(r#"{"role":"user","id":"u1"}"#).unwrap();
        assert_eq!(minimal.login_id, None);
        assert_eq!(minimal.name, "");
    }
}
