//! IPMI v1.5 session authentication
//!
//! Usernames and passwords are fixed 16-byte, NUL-padded fields on the
//! wire. Auth codes are computed over the padded password:
//!
//! - straight password: the password field itself
//! - MD5: `md5(password + session_id + message + sequence + password)`

use crate::error::{IpmiError, Result};
use crate::packet::{AuthType, AUTH_CODE_LEN};
use std::fmt;

/// Width of the username and password fields
pub const CREDENTIAL_LEN: usize = 16;

/// Username / password pair of one emulated BMC
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: [u8; CREDENTIAL_LEN],
    password: [u8; CREDENTIAL_LEN],
}

impl Credentials {
    /// Create credentials, rejecting values wider than the wire field
    pub fn new(username: &str, password: &str) -> Result<Self> {
        Ok(Self {
            username: pad("username", username)?,
            password: pad("password", password)?,
        })
    }

    /// Whether a 16-byte username field from the wire names this user
    pub fn username_matches(&self, field: &[u8]) -> bool {
        if field.len() != CREDENTIAL_LEN {
            return false;
        }
        constant_time_eq(&self.username, field)
    }

    /// Padded username field
    pub fn username_field(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.username
    }

    /// Padded password field
    pub fn password_field(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self
            .username
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(CREDENTIAL_LEN);
        f.debug_struct("Credentials")
            .field("username", &String::from_utf8_lossy(&self.username[..end]))
            .field("password", &"<redacted>")
            .finish()
    }
}

fn pad(field: &str, value: &str) -> Result<[u8; CREDENTIAL_LEN]> {
    let bytes = value.as_bytes();
    if bytes.len() > CREDENTIAL_LEN {
        return Err(IpmiError::InvalidConfig(format!(
            "{} is {} bytes, at most {} allowed",
            field,
            bytes.len(),
            CREDENTIAL_LEN
        )));
    }
    let mut padded = [0u8; CREDENTIAL_LEN];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

/// Compute the auth code for a message
///
/// Returns `None` for auth types this listener does not implement.
pub fn auth_code(
    auth_type: AuthType,
    password: &[u8; CREDENTIAL_LEN],
    session_id: u32,
    sequence: u32,
    message: &[u8],
) -> Option<[u8; AUTH_CODE_LEN]> {
    match auth_type {
        AuthType::Password => Some(*password),
        AuthType::Md5 => {
            let mut ctx = md5::Context::new();
            ctx.consume(password);
            ctx.consume(session_id.to_le_bytes());
            ctx.consume(message);
            ctx.consume(sequence.to_le_bytes());
            ctx.consume(password);
            Some(ctx.compute().0)
        }
        AuthType::None | AuthType::Md2 | AuthType::Oem => None,
    }
}

/// Verify a received auth code
pub fn verify(
    auth_type: AuthType,
    password: &[u8; CREDENTIAL_LEN],
    session_id: u32,
    sequence: u32,
    message: &[u8],
    received: &[u8; AUTH_CODE_LEN],
) -> bool {
    match auth_code(auth_type, password, session_id, sequence, message) {
        Some(expected) => constant_time_eq(&expected, received),
        None => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_padding() {
        let creds = Credentials::new("admin", "password").unwrap();
        assert_eq!(&creds.username_field()[..5], b"admin");
        assert!(creds.username_field()[5..].iter().all(|b| *b == 0));
        assert!(creds.username_matches(b"admin\0\0\0\0\0\0\0\0\0\0\0"));
        assert!(!creds.username_matches(b"root\0\0\0\0\0\0\0\0\0\0\0\0"));
        assert!(!creds.username_matches(b"admin"));
    }

    #[test]
    fn test_credentials_too_long() {
        let err = Credentials::new("admin", "a-password-longer-than-16").unwrap_err();
        assert!(err.to_string().contains("password is 25 bytes"));
        assert!(Credentials::new("sixteen-byte-usr", "x").is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2").unwrap();
        let debug = format!("{:?}", creds);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_password_auth_code() {
        let creds = Credentials::new("admin", "password").unwrap();
        let code = auth_code(AuthType::Password, creds.password_field(), 1, 2, b"ignored").unwrap();
        assert_eq!(&code, creds.password_field());
    }

    #[test]
    fn test_md5_auth_code() {
        let creds = Credentials::new("admin", "password").unwrap();
        let pw = creds.password_field();

        let mut input = Vec::new();
        input.extend_from_slice(pw);
        input.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        input.extend_from_slice(b"message");
        input.extend_from_slice(&7u32.to_le_bytes());
        input.extend_from_slice(pw);
        let expected = md5::compute(&input).0;

        let code = auth_code(AuthType::Md5, pw, 0x1234_5678, 7, b"message").unwrap();
        assert_eq!(code, expected);
        assert!(verify(AuthType::Md5, pw, 0x1234_5678, 7, b"message", &expected));
        assert!(!verify(AuthType::Md5, pw, 0x1234_5678, 8, b"message", &expected));
    }

    #[test]
    fn test_unimplemented_auth_types() {
        let pw = [0u8; CREDENTIAL_LEN];
        assert!(auth_code(AuthType::None, &pw, 0, 0, &[]).is_none());
        assert!(auth_code(AuthType::Md2, &pw, 0, 0, &[]).is_none());
        assert!(!verify(AuthType::Md2, &pw, 0, 0, &[], &[0u8; AUTH_CODE_LEN]));
    }
}
