//! Credential objects presented by connecting clients.

use serde::{Deserialize, Serialize};

/// Kinds of credentials a checker can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Password,
    Token,
}

/// Credentials carried in a handshake or request header.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    /// Username and shared secret.
    Password { username: String, secret: String },
    /// Opaque bearer token.
    Token { token: String },
}

impl Credentials {
    pub fn password(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Password { .. } => CredentialKind::Password,
            Self::Token { .. } => CredentialKind::Token,
        }
    }

    /// Username claimed by these credentials, for logging.
    pub fn claimed_user(&self) -> Option<&str> {
        match self {
            Self::Password { username, .. } => Some(username),
            Self::Token { .. } => None,
        }
    }
}

// Secrets never reach logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("secret", &"<redacted>")
                .finish(),
            Self::Token { .. } => f
                .debug_struct("Token")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}
