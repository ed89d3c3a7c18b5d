// ABOUTME: Row level security policy definitions and their SQL
// ABOUTME: Validates command/predicate combinations before anything reaches the database

use crate::error::ProvisionError;
use crate::utils::{quote_ident, quote_qualified};
use std::fmt;
use std::str::FromStr;

/// Command class a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyCommand {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub fn as_sql(self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }
}

impl fmt::Display for PolicyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for PolicyCommand {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(PolicyCommand::All),
            "SELECT" => Ok(PolicyCommand::Select),
            "INSERT" => Ok(PolicyCommand::Insert),
            "UPDATE" => Ok(PolicyCommand::Update),
            "DELETE" => Ok(PolicyCommand::Delete),
            other => Err(ProvisionError::Config(format!(
                "unknown policy command '{}'",
                other
            ))),
        }
    }
}

/// A named policy binding a command class and a role to predicates on one table
///
/// Predicates are raw SQL expressions supplied by the caller and are not escaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub name: String,
    pub table: String,
    pub command: PolicyCommand,
    pub role: String,
    /// Row visibility predicate (`USING`)
    pub using: String,
    /// Write validation predicate (`WITH CHECK`)
    pub with_check: Option<String>,
}

impl PolicyConfig {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        command: PolicyCommand,
        role: impl Into<String>,
        using: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            command,
            role: role.into(),
            using: using.into(),
            with_check: None,
        }
    }

    pub fn with_check(mut self, predicate: impl Into<String>) -> Self {
        self.with_check = Some(predicate.into());
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> ProvisionError {
        ProvisionError::InvalidPolicy {
            policy: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("policy name is empty"));
        }
        if self.table.trim().is_empty() {
            return Err(self.invalid("table is empty"));
        }
        if self.role.trim().is_empty() {
            return Err(self.invalid("role is empty"));
        }

        let using = !self.using.trim().is_empty();
        let check = self
            .with_check
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());

        match self.command {
            PolicyCommand::Select | PolicyCommand::Delete if check => Err(self.invalid(format!(
                "{} policies cannot have a WITH CHECK predicate",
                self.command
            ))),
            PolicyCommand::Insert if using && check => Err(self.invalid(
                "INSERT policies take a single WITH CHECK predicate, not USING",
            )),
            PolicyCommand::Insert if !using && !check => {
                Err(self.invalid("INSERT policy needs a WITH CHECK predicate"))
            }
            PolicyCommand::All | PolicyCommand::Select | PolicyCommand::Update | PolicyCommand::Delete
                if !using =>
            {
                Err(self.invalid("USING predicate is empty"))
            }
            _ => Ok(()),
        }
    }

    /// `CREATE POLICY` statement; call [`PolicyConfig::validate`] first
    pub fn create_sql(&self) -> String {
        let mut sql = format!(
            "CREATE POLICY {} ON {} FOR {} TO {}",
            quote_ident(&self.name),
            quote_qualified(&self.table),
            self.command,
            quote_ident(&self.role)
        );

        if self.command == PolicyCommand::Insert {
            // INSERT has no visibility predicate; a lone `using` is the write check
            let check = self
                .with_check
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(&self.using);
            sql.push_str(&format!(" WITH CHECK ({})", check));
            return sql;
        }

        sql.push_str(&format!(" USING ({})", self.using));
        if let Some(check) = self.with_check.as_deref().filter(|c| !c.trim().is_empty()) {
            sql.push_str(&format!(" WITH CHECK ({})", check));
        }
        sql
    }

    pub fn drop_sql(&self) -> String {
        drop_policy_sql(&self.name, &self.table)
    }
}

pub fn drop_policy_sql(name: &str, table: &str) -> String {
    format!(
        "DROP POLICY IF EXISTS {} ON {}",
        quote_ident(name),
        quote_qualified(table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sql_all_with_check() {
        let policy = PolicyConfig::new("owner_rw", "files", PolicyCommand::All, "file_service", "owner_id = current_setting('app.user_id')::uuid")
            .with_check("owner_id = current_setting('app.user_id')::uuid");
        policy.validate().unwrap();
        assert_eq!(
            policy.create_sql(),
            "CREATE POLICY \"owner_rw\" ON \"files\" FOR ALL TO \"file_service\" \
             USING (owner_id = current_setting('app.user_id')::uuid) \
             WITH CHECK (owner_id = current_setting('app.user_id')::uuid)"
        );
    }

    #[test]
    fn test_create_sql_quotes_qualified_table() {
        let policy = PolicyConfig::new("reader_select_users", "public.users", PolicyCommand::Select, "reader", "true");
        assert_eq!(
            policy.create_sql(),
            "CREATE POLICY \"reader_select_users\" ON \"public\".\"users\" FOR SELECT TO \"reader\" USING (true)"
        );
        assert_eq!(
            policy.drop_sql(),
            "DROP POLICY IF EXISTS \"reader_select_users\" ON \"public\".\"users\""
        );
    }

    #[test]
    fn test_insert_policy_uses_with_check_only() {
        let policy = PolicyConfig::new("ins", "files", PolicyCommand::Insert, "file_service", "size >= 0");
        policy.validate().unwrap();
        assert_eq!(
            policy.create_sql(),
            "CREATE POLICY \"ins\" ON \"files\" FOR INSERT TO \"file_service\" WITH CHECK (size >= 0)"
        );

        let both = policy.clone().with_check("true");
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_insert_policy_blank_check_falls_back_to_using() {
        let policy = PolicyConfig::new("ins", "files", PolicyCommand::Insert, "file_service", "id > 0")
            .with_check("   ");
        policy.validate().unwrap();
        assert_eq!(
            policy.create_sql(),
            "CREATE POLICY \"ins\" ON \"files\" FOR INSERT TO \"file_service\" WITH CHECK (id > 0)"
        );
    }

    #[test]
    fn test_select_and_delete_reject_with_check() {
        for command in [PolicyCommand::Select, PolicyCommand::Delete] {
            let policy = PolicyConfig::new("p", "users", command, "r", "true").with_check("true");
            let err = policy.validate().unwrap_err();
            assert!(err.to_string().starts_with("[P008]"));
        }
    }

    #[test]
    fn test_validate_rejects_missing_parts() {
        assert!(PolicyConfig::new("", "users", PolicyCommand::All, "r", "true").validate().is_err());
        assert!(PolicyConfig::new("p", " ", PolicyCommand::All, "r", "true").validate().is_err());
        assert!(PolicyConfig::new("p", "users", PolicyCommand::All, "", "true").validate().is_err());
        assert!(PolicyConfig::new("p", "users", PolicyCommand::Update, "r", "").validate().is_err());
    }

    #[test]
    fn test_policy_command_parse() {
        assert_eq!("select".parse::<PolicyCommand>().unwrap(), PolicyCommand::Select);
        assert_eq!("ALL".parse::<PolicyCommand>().unwrap(), PolicyCommand::All);
        assert!("MERGE".parse::<PolicyCommand>().is_err());
    }
}
