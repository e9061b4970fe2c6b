//! SASL PLAIN payloads.
//!
//! The PLAIN response travels inside `Connection.Start-Ok` as a long string
//! of the form `NUL username NUL password` (the leading authorization
//! identity is empty).

use crate::errors::{ProtocolError, Result};

/// Credentials carried by a PLAIN response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Authentication identity
    pub username: String,
    /// Cleartext password
    pub password: String,
}

impl PlainCredentials {
    /// Render the `\0user\0pass` response bytes.
    #[must_use]
    pub fn to_response(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.username.len() + self.password.len());
        out.push(0);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        out
    }

    /// Parse a PLAIN response.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::BadSaslResponse`] unless the payload contains
    /// exactly the `\0user\0pass` framing; [`ProtocolError::Utf8`] for
    /// non-UTF-8 identity bytes.
    pub fn parse(response: &[u8]) -> Result<Self> {
        let mut parts = response.split(|&b| b == 0);
        let (Some(authzid), Some(user), Some(pass), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::BadSaslResponse);
        };
        if !authzid.is_empty() {
            return Err(ProtocolError::BadSaslResponse);
        }

        let username =
            String::from_utf8(user.to_vec()).map_err(|_| ProtocolError::Utf8)?;
        let password =
            String::from_utf8(pass.to_vec()).map_err(|_| ProtocolError::Utf8)?;
        Ok(Self { username, password })
    }
}
