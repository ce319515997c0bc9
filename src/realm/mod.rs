//! Credential realm.
//!
//! Checkers verify credentials, the portal picks the first checker that
//! accepts them and the realm turns the resulting user into an [`Avatar`]
//! carrying that user's permissions.

mod avatar;
mod checker;
mod credentials;
mod portal;

pub use avatar::{Avatar, Permissions, UserId};
pub use checker::{generate_token, CredentialChecker, PasswordChecker, TokenChecker};
pub use credentials::{CredentialKind, Credentials};
pub use portal::{Portal, Realm};
