use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const UNKNOWN_NAME: &str = "Unknown User";
pub const UNKNOWN_EMAIL: &str = "unknown@example.com";

/// The three role-tagged profile kinds. Stored and serialized in their
/// canonical capitalized forms; parsing is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "profile_role")]
pub enum Role {
    Admin,
    #[sqlx(rename = "HR")]
    #[serde(rename = "HR")]
    Hr,
    Employee,
}

impl Role {
    /// Fixed ordering used when deriving cross-role pair keys.
    pub fn rank(&self) -> u8 {
        match self {
            Role::Admin => 0,
            Role::Hr => 1,
            Role::Employee => 2,
        }
    }

    pub fn room_name(&self) -> &'static str {
        match self {
            Role::Admin => "admin_room",
            Role::Hr => "hr_room",
            Role::Employee => "employee_room",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Hr => "HR",
            Role::Employee => "Employee",
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
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "hr" => Ok(Role::Hr),
            "employee" => Ok(Role::Employee),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A role-scoped profile reference. Downstream code pattern-matches on this
/// instead of comparing role strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "profile_id")]
pub enum ProfileRef {
    Admin(Uuid),
    #[serde(rename = "HR")]
    Hr(Uuid),
    Employee(Uuid),
}

impl ProfileRef {
    pub fn new(role: Role, id: Uuid) -> Self {
        match role {
            Role::Admin => ProfileRef::Admin(id),
            Role::Hr => ProfileRef::Hr(id),
            Role::Employee => ProfileRef::Employee(id),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            ProfileRef::Admin(_) => Role::Admin,
            ProfileRef::Hr(_) => Role::Hr,
            ProfileRef::Employee(_) => Role::Employee,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ProfileRef::Admin(id) | ProfileRef::Hr(id) | ProfileRef::Employee(id) => *id,
        }
    }

    /// Name of the personal delivery room for this profile.
    pub fn personal_room(&self) -> String {
        format!("user_{}", self.id())
    }
}

/// Canonical identity produced by the resolver. `department` is only ever
/// present for employees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    #[serde(flatten)]
    pub profile: ProfileRef,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

impl ResolvedProfile {
    /// Sentinel identity for IDs no collection knows about. Enrichment code
    /// must tolerate these without failing.
    pub fn unknown(id: Uuid, claimed_role: Role) -> Self {
        Self {
            profile: ProfileRef::new(claimed_role, id),
            name: UNKNOWN_NAME.to_string(),
            email: UNKNOWN_EMAIL.to_string(),
            department: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.email == UNKNOWN_EMAIL && self.name == UNKNOWN_NAME
    }

    pub fn role(&self) -> Role {
        self.profile.role()
    }

    pub fn id(&self) -> Uuid {
        self.profile.id()
    }
}

/// Row shape shared by the three profile collections. The messaging service
/// reads these; it never writes them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProfileRow {
    pub id: Uuid,
    pub auth_id: Uuid,
    pub name: String,
    pub email: String,
    pub department: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("hr".parse::<Role>().unwrap(), Role::Hr);
        assert_eq!("Employee".parse::<Role>().unwrap(), Role::Employee);
        assert!("manager".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_to_canonical_form() {
        assert_eq!(serde_json::to_string(&Role::Hr).unwrap(), "\"HR\"");
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"Admin\"");
    }

    #[test]
    fn unknown_profile_is_detectable_and_keeps_claimed_role() {
        let id = Uuid::new_v4();
        let p = ResolvedProfile::unknown(id, Role::Hr);
        assert!(p.is_unknown());
        assert_eq!(p.role(), Role::Hr);
        assert_eq!(p.id(), id);
    }
}
