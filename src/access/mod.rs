// ABOUTME: Access-control provisioning: service roles, table grants, row level security
// ABOUTME: Typed privilege and access-level vocabulary shared by the manager and config

pub mod manager;
pub mod policy;

use crate::error::ProvisionError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

pub use manager::{service_policy, AccessControlManager, RoleOutcome};
pub use policy::{PolicyCommand, PolicyConfig};

/// A table privilege applied as its own GRANT/REVOKE statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    References,
    Trigger,
    All,
}

impl Privilege {
    pub fn as_sql(self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
            Privilege::Truncate => "TRUNCATE",
            Privilege::References => "REFERENCES",
            Privilege::Trigger => "TRIGGER",
            Privilege::All => "ALL",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Privilege {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SELECT" => Ok(Privilege::Select),
            "INSERT" => Ok(Privilege::Insert),
            "UPDATE" => Ok(Privilege::Update),
            "DELETE" => Ok(Privilege::Delete),
            "TRUNCATE" => Ok(Privilege::Truncate),
            "REFERENCES" => Ok(Privilege::References),
            "TRIGGER" => Ok(Privilege::Trigger),
            "ALL" | "ALL PRIVILEGES" => Ok(Privilege::All),
            other => Err(ProvisionError::Config(format!(
                "unknown table privilege '{}'",
                other
            ))),
        }
    }
}

/// The two access shapes a service can have on a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum AccessLevel {
    /// Full CRUD: `ALL` policy, SELECT/INSERT/UPDATE/DELETE grants
    #[serde(rename = "full")]
    FullAccess,
    /// `SELECT` policy and grant only
    #[serde(rename = "read")]
    ReadOnly,
}

impl AccessLevel {
    pub fn from_full_access(full_access: bool) -> Self {
        if full_access {
            AccessLevel::FullAccess
        } else {
            AccessLevel::ReadOnly
        }
    }

    pub fn policy_command(self) -> PolicyCommand {
        match self {
            AccessLevel::FullAccess => PolicyCommand::All,
            AccessLevel::ReadOnly => PolicyCommand::Select,
        }
    }

    pub fn privileges(self) -> &'static [Privilege] {
        match self {
            AccessLevel::FullAccess => &[
                Privilege::Select,
                Privilege::Insert,
                Privilege::Update,
                Privilege::Delete,
            ],
            AccessLevel::ReadOnly => &[Privilege::Select],
        }
    }

    /// Policy name fragment: `all` or `select`
    pub fn policy_suffix(self) -> &'static str {
        match self {
            AccessLevel::FullAccess => "all",
            AccessLevel::ReadOnly => "select",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::FullAccess => f.write_str("full"),
            AccessLevel::ReadOnly => f.write_str("read"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_parse() {
        assert_eq!("select".parse::<Privilege>().unwrap(), Privilege::Select);
        assert_eq!(" Delete ".parse::<Privilege>().unwrap(), Privilege::Delete);
        assert_eq!("ALL PRIVILEGES".parse::<Privilege>().unwrap(), Privilege::All);
        assert!("DROP".parse::<Privilege>().is_err());
        assert!("SELECT; DROP TABLE users".parse::<Privilege>().is_err());
    }

    #[test]
    fn test_access_level_mapping() {
        assert_eq!(AccessLevel::FullAccess.policy_command(), PolicyCommand::All);
        assert_eq!(AccessLevel::ReadOnly.policy_command(), PolicyCommand::Select);
        assert_eq!(AccessLevel::ReadOnly.privileges(), &[Privilege::Select]);
        assert_eq!(AccessLevel::FullAccess.privileges().len(), 4);
        assert_eq!(AccessLevel::from_full_access(true), AccessLevel::FullAccess);
        assert_eq!(AccessLevel::from_full_access(false), AccessLevel::ReadOnly);
    }

    #[test]
    fn test_access_level_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            access: AccessLevel,
        }
        let w: Wrapper = toml::from_str("access = \"read\"").unwrap();
        assert_eq!(w.access, AccessLevel::ReadOnly);
        assert!(toml::from_str::<Wrapper>("access = \"write\"").is_err());
    }
}
