//! Authenticated capabilities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Verified user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for UserId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Set of operations an avatar may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    /// May open sessions against notebooks it has access to.
    pub const ATTACH_SESSIONS: Permissions = Permissions(0b01);
    /// May list and stop any kernel process.
    pub const MANAGE_PROCESSES: Permissions = Permissions(0b10);
    pub const ALL: Permissions = Permissions(0b11);

    pub fn contains(&self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    /// Names of the granted permissions.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::ATTACH_SESSIONS) {
            names.push("attach_sessions");
        }
        if self.contains(Self::MANAGE_PROCESSES) {
            names.push("manage_processes");
        }
        names
    }
}

/// Capability handed out by the realm after authentication.
///
/// Holds no credentials, only the verified identity and what it may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    user: UserId,
    permissions: Permissions,
}

impl Avatar {
    pub fn new(user: UserId, permissions: Permissions) -> Self {
        Self { user, permissions }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn can_attach(&self) -> bool {
        self.permissions.contains(Permissions::ATTACH_SESSIONS)
    }

    pub fn can_manage_processes(&self) -> bool {
        self.permissions.contains(Permissions::MANAGE_PROCESSES)
    }
}
