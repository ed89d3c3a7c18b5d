// ABOUTME: Provisioning actions invoked by the CLI
// ABOUTME: Exports migrate, provision_roles, reset, fresh, and status plus their Outcome

pub mod fresh;
pub mod migrate;
pub mod provision_roles;
pub mod reset;
pub mod status;

pub use fresh::fresh;
pub use migrate::migrate;
pub use provision_roles::provision_roles;
pub use reset::reset;
pub use status::status;

use std::process::ExitCode;

/// What an action changed, mapped to the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NothingToDo,
    Applied(usize),
}

impl Outcome {
    pub fn from_count(changes: usize) -> Self {
        if changes == 0 {
            Outcome::NothingToDo
        } else {
            Outcome::Applied(changes)
        }
    }

    pub fn changes(self) -> usize {
        match self {
            Outcome::NothingToDo => 0,
            Outcome::Applied(n) => n,
        }
    }

    /// 0 when nothing changed, 2 when changes were applied (1 is reserved for errors)
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::NothingToDo => 0,
            Outcome::Applied(_) => 2,
        }
    }

    pub fn merge(self, other: Outcome) -> Outcome {
        Outcome::from_count(self.changes() + other.changes())
    }
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        ExitCode::from(outcome.exit_code())
    }
}

/// Exit status for a fatal error
pub const EXIT_FAILURE: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_outcomes() {
        assert_eq!(Outcome::NothingToDo.exit_code(), 0);
        assert_eq!(Outcome::Applied(3).exit_code(), 2);
        assert_ne!(Outcome::Applied(1).exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_from_count_and_merge() {
        assert_eq!(Outcome::from_count(0), Outcome::NothingToDo);
        assert_eq!(Outcome::from_count(2), Outcome::Applied(2));
        assert_eq!(
            Outcome::NothingToDo.merge(Outcome::NothingToDo),
            Outcome::NothingToDo
        );
        assert_eq!(
            Outcome::Applied(2).merge(Outcome::Applied(1)),
            Outcome::Applied(3)
        );
    }
}
