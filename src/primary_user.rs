//! Primary-user resolution.
//!
//! Older templates address a single account through `{{user.name}}` and
//! `{{user.password}}`. Those legacy fields are derived here from the declared
//! user records and handed to the renderer as a separate view; the parameter
//! tree itself is never modified.

use thiserror::Error;

use crate::params::UserRecord;

/// Legacy-compatible projection of the primary account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrimaryUser {
    /// Number of the `userN` record this projection came from.
    pub number: u32,
    /// Login name.
    pub name: String,
    /// Credential material.
    pub password: String,
}

impl PrimaryUser {
    /// Derived placeholder values exposed to templates.
    #[must_use]
    pub fn legacy_fields(&self) -> [(&'static str, &str); 2] {
        [("user.name", &self.name), ("user.password", &self.password)]
    }
}

/// Errors raised when no usable primary account exists.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PrimaryUserError {
    /// Raised when credentials are needed but no `userN` record exists.
    #[error("no users declared; in-guest credentials are required")]
    NoUsers,
    /// Raised when the resolved record lacks a name or credential.
    #[error("primary user user{number} has an empty name or password")]
    EmptyCredentials {
        /// Number of the offending record.
        number: u32,
    },
}

/// Picks the first record flagged primary, else the lowest-numbered record.
///
/// `users` must be in ascending numeric order, as produced by
/// [`crate::params::DeploymentParameters::users`].
#[must_use]
pub fn select_primary(users: &[UserRecord]) -> Option<&UserRecord> {
    users
        .iter()
        .find(|user| user.primary)
        .or_else(|| users.iter().min_by_key(|user| user.number))
}

/// Resolves the legacy projection, failing when credentials are unusable.
///
/// # Errors
///
/// Returns [`PrimaryUserError::NoUsers`] for an empty list and
/// [`PrimaryUserError::EmptyCredentials`] when the chosen record has a blank
/// name or password.
pub fn resolve_primary(users: &[UserRecord]) -> Result<PrimaryUser, PrimaryUserError> {
    let record = select_primary(users).ok_or(PrimaryUserError::NoUsers)?;
    if record.name.trim().is_empty() || record.password.is_empty() {
        return Err(PrimaryUserError::EmptyCredentials {
            number: record.number,
        });
    }
    Ok(PrimaryUser {
        number: record.number,
        name: record.name.clone(),
        password: record.password.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn user(number: u32, name: &str, primary: bool) -> UserRecord {
        UserRecord {
            number,
            name: name.to_owned(),
            password: format!("{name}-pw"),
            groups: Vec::new(),
            ssh_keys: Vec::new(),
            primary,
        }
    }

    #[rstest]
    #[case(vec![user(1, "a", false), user(2, "b", true), user(3, "c", false)], "b")]
    #[case(vec![user(3, "c", true), user(1, "a", false)], "c")]
    #[case(vec![user(2, "b", false), user(1, "a", false)], "a")]
    #[case(vec![user(5, "e", false)], "e")]
    fn resolves_marked_or_lowest_numbered(#[case] users: Vec<UserRecord>, #[case] expected: &str) {
        let primary = resolve_primary(&users).expect("resolvable");
        assert_eq!(primary.name, expected);
        assert_eq!(primary.password, format!("{expected}-pw"));
    }

    #[test]
    fn empty_list_has_no_primary() {
        assert_eq!(resolve_primary(&[]), Err(PrimaryUserError::NoUsers));
    }

    #[test]
    fn blank_password_is_rejected() {
        let mut record = user(1, "ops", true);
        record.password.clear();
        assert_eq!(
            resolve_primary(&[record]),
            Err(PrimaryUserError::EmptyCredentials { number: 1 })
        );
    }

    #[test]
    fn legacy_fields_expose_name_and_password() {
        let primary = resolve_primary(&[user(1, "ops", false)]).expect("resolvable");
        assert_eq!(
            primary.legacy_fields(),
            [("user.name", "ops"), ("user.password", "ops-pw")]
        );
    }
}
