//! Authentication collaborator.
//!
//! The connection engine validates credentials during the handshake through
//! the [`Authenticator`] trait. The broker ships PLAIN over an in-memory
//! user table; anything else (LDAP, JWT) plugs in behind the same trait.

use std::collections::HashMap;

use ottermq_proto::PlainCredentials;
use thiserror::Error;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Login name
    pub name: String,
}

/// Why authentication failed. All variants map to 403 ACCESS-REFUSED on the
/// wire; the detail stays in the server log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Mechanism other than PLAIN requested
    #[error("unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    /// Response bytes did not parse as the mechanism requires
    #[error("malformed SASL response")]
    MalformedResponse,

    /// Unknown user or wrong password
    #[error("invalid credentials for user {0:?}")]
    InvalidCredentials(String),
}

/// Validates a SASL exchange and yields the authenticated user.
pub trait Authenticator: Send + Sync + 'static {
    /// Check `response` under `mechanism`.
    fn authenticate(&self, mechanism: &str, response: &[u8]) -> Result<User, AuthError>;
}

/// PLAIN authentication over an in-memory user table.
#[derive(Debug, Default)]
pub struct PlainAuthenticator {
    users: HashMap<String, String>,
}

impl PlainAuthenticator {
    /// Empty table; every login fails until users are added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn add_user(&mut self, name: impl Into<String>, password: impl Into<String>) {
        self.users.insert(name.into(), password.into());
    }

    /// Builder-style [`Self::add_user`].
    #[must_use]
    pub fn with_user(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.add_user(name, password);
        self
    }
}

impl Authenticator for PlainAuthenticator {
    fn authenticate(&self, mechanism: &str, response: &[u8]) -> Result<User, AuthError> {
        if mechanism != "PLAIN" {
            return Err(AuthError::UnsupportedMechanism(mechanism.to_string()));
        }

        let creds =
            PlainCredentials::parse(response).map_err(|_| AuthError::MalformedResponse)?;

        match self.users.get(&creds.username) {
            Some(stored) if *stored == creds.password => Ok(User { name: creds.username }),
            _ => Err(AuthError::InvalidCredentials(creds.username)),
        }
    }
}
