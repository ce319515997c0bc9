//! Portal: credentials in, avatar out.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Avatar, CredentialChecker, Credentials, Permissions, UserId};
use crate::error::KnobooError;
use crate::Result;

/// Maps authenticated users to the avatars they receive.
#[derive(Debug, Clone, Default)]
pub struct Realm {
    admins: HashSet<UserId>,
}

impl Realm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `MANAGE_PROCESSES` to `user`.
    pub fn admin(mut self, user: impl Into<UserId>) -> Self {
        self.admins.insert(user.into());
        self
    }

    pub fn is_admin(&self, user: &UserId) -> bool {
        self.admins.contains(user)
    }

    /// Build the avatar for a verified user.
    pub fn avatar_for(&self, user: UserId) -> Avatar {
        let mut permissions = Permissions::ATTACH_SESSIONS;
        if self.is_admin(&user) {
            permissions = permissions.union(Permissions::MANAGE_PROCESSES);
        }
        Avatar::new(user, permissions)
    }
}

/// Authentication entry point.
///
/// Checkers are consulted in registration order, restricted to those
/// accepting the presented credential kind. The first success wins.
#[derive(Clone, Default)]
pub struct Portal {
    checkers: Vec<Arc<dyn CredentialChecker>>,
    realm: Realm,
}

impl Portal {
    pub fn new(realm: Realm) -> Self {
        Self {
            checkers: Vec::new(),
            realm,
        }
    }

    /// Append a checker to the end of the chain.
    pub fn register(&mut self, checker: Arc<dyn CredentialChecker>) {
        self.checkers.push(checker);
    }

    /// Builder form of [`Portal::register`].
    pub fn with_checker(mut self, checker: Arc<dyn CredentialChecker>) -> Self {
        self.register(checker);
        self
    }

    pub fn checker_count(&self) -> usize {
        self.checkers.len()
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Verify `credentials` and hand out an avatar.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Avatar> {
        let kind = credentials.kind();
        let mut last_error = None;

        for checker in self.checkers.iter().filter(|c| c.kind() == kind) {
            match checker.check(credentials) {
                Ok(user) => {
                    debug!(user = %user, ?kind, "credentials accepted");
                    return Ok(self.realm.avatar_for(user));
                }
                Err(e) => last_error = Some(e),
            }
        }

        warn!(
            user = credentials.claimed_user().unwrap_or("-"),
            ?kind,
            "authentication failed"
        );
        Err(last_error.unwrap_or_else(|| {
            KnobooError::Authentication(format!("no checker accepts {:?} credentials", kind))
        }))
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("checkers", &self.checkers.len())
            .field("realm", &self.realm)
            .finish()
    }
}
