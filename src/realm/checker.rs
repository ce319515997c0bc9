//! Pluggable credential checkers.

use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use super::{CredentialKind, Credentials, UserId};
use crate::error::KnobooError;
use crate::Result;

/// Verifies one kind of credentials and names the user they belong to.
pub trait CredentialChecker: Send + Sync {
    /// Credential kind this checker understands.
    fn kind(&self) -> CredentialKind;

    /// Verify `credentials`, returning the authenticated user.
    ///
    /// Must return [`KnobooError::Authentication`] on any mismatch.
    fn check(&self, credentials: &Credentials) -> Result<UserId>;
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Compare digests without short-circuiting on the first differing byte.
fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Administrator-configured username/secret pairs.
///
/// Secrets are kept only as SHA-256 digests.
#[derive(Debug, Default)]
pub struct PasswordChecker {
    users: RwLock<HashMap<String, [u8; 32]>>,
}

impl PasswordChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a checker from `(username, secret)` pairs.
    pub fn with_users<I, U, S>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, S)>,
        U: Into<String>,
        S: AsRef<str>,
    {
        let checker = Self::new();
        for (user, secret) in users {
            checker.add_user(user, secret.as_ref());
        }
        checker
    }

    pub fn add_user(&self, username: impl Into<String>, secret: &str) {
        if let Ok(mut users) = self.users.write() {
            users.insert(username.into(), digest(secret));
        }
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.users
            .write()
            .map(|mut users| users.remove(username).is_some())
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.users.read().map(|u| u.len()).unwrap_or(0)
    }
}

impl CredentialChecker for PasswordChecker {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Password
    }

    fn check(&self, credentials: &Credentials) -> Result<UserId> {
        let Credentials::Password { username, secret } = credentials else {
            return Err(KnobooError::Authentication("unsupported credentials".into()));
        };

        let users = self.users.read().map_err(|_| KnobooError::LockPoisoned)?;
        match users.get(username) {
            Some(expected) if digests_match(expected, &digest(secret)) => {
                Ok(UserId::new(username.clone()))
            }
            _ => Err(KnobooError::Authentication(format!(
                "invalid username or secret for '{}'",
                username
            ))),
        }
    }
}

/// Bearer tokens mapped to the users they act for.
#[derive(Debug, Default)]
pub struct TokenChecker {
    tokens: RwLock<HashMap<String, UserId>>,
}

impl TokenChecker {
    /// Prefix expected in `Authorization` headers.
    pub const BEARER_PREFIX: &'static str = "Bearer ";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&self, token: impl Into<String>, user: UserId) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), user);
        }
    }

    pub fn remove_token(&self, token: &str) -> bool {
        self.tokens
            .write()
            .map(|mut tokens| tokens.remove(token).is_some())
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Extract the token from an `Authorization` header value.
    pub fn extract_bearer(header_value: &str) -> Option<&str> {
        header_value
            .strip_prefix(Self::BEARER_PREFIX)
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

impl CredentialChecker for TokenChecker {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Token
    }

    fn check(&self, credentials: &Credentials) -> Result<UserId> {
        let Credentials::Token { token } = credentials else {
            return Err(KnobooError::Authentication("unsupported credentials".into()));
        };

        let tokens = self.tokens.read().map_err(|_| KnobooError::LockPoisoned)?;
        tokens
            .get(token)
            .cloned()
            .ok_or_else(|| KnobooError::Authentication("unknown token".into()))
    }
}

/// Generate a random-looking access token.
pub fn generate_token() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let hash = Sha256::digest(format!("{}:{}", timestamp, std::process::id()).as_bytes());
    let hex: String = hash.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("kb_{}", hex)
}
