//! Secret hashes and passwords.

use std::fmt;

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
};
use rand::{RngCore, rngs::OsRng};
use serde::{Serialize, Serializer};
use thiserror::Error;
use zeroize::Zeroize;

const MD5_PREFIX: &str = "md5";
const MD5_HEX_CHARS: usize = 32;
const SCRAM_PREFIX: &str = "SCRAM-SHA-256$";
const SCRAM_KEY_BYTES: usize = 32;

/// Number of random bytes in a generated password.
pub const GENERATED_PASSWORD_BYTES: usize = 24;

/// Versioned hash formats accepted in the credential cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashScheme {
    /// `md5` followed by 32 lowercase hex digits.
    Md5,

    /// `SCRAM-SHA-256$<iterations>:<salt>$<stored key>:<server key>`.
    ScramSha256,
}

/// Reasons a secret hash fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretHashError {
    /// Hash is empty.
    #[error("secret hash is empty")]
    Empty,

    /// Hash does not start with a known scheme prefix.
    #[error("secret hash uses an unknown scheme")]
    UnknownScheme,

    /// Hash starts with a known prefix but its body is malformed or truncated.
    #[error("{scheme:?} secret hash is malformed: {reason}")]
    Malformed {
        /// Scheme identified from the prefix.
        scheme: HashScheme,

        /// What was wrong with the body.
        reason: &'static str,
    },
}

/// Opaque, versioned credential hash as stored by the primary store.
///
/// The value is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SecretHash {
    value: String,
    scheme: HashScheme,
}

impl SecretHash {
    /// Parse and validate a secret hash.
    ///
    /// # Errors
    ///
    /// Returns a [`SecretHashError`] if the hash is empty, uses an unknown scheme or is
    /// structurally invalid (including truncated).
    pub fn parse(value: &str) -> Result<Self, SecretHashError> {
        if value.is_empty() {
            return Err(SecretHashError::Empty);
        }

        let scheme = if let Some(hex) = value.strip_prefix(MD5_PREFIX) {
            validate_md5(hex)?;
            HashScheme::Md5
        } else if let Some(body) = value.strip_prefix(SCRAM_PREFIX) {
            validate_scram(body)?;
            HashScheme::ScramSha256
        } else {
            return Err(SecretHashError::UnknownScheme);
        };

        Ok(Self {
            value: value.to_string(),
            scheme,
        })
    }

    /// Borrow the raw hash.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Hash scheme.
    #[must_use]
    pub const fn scheme(&self) -> HashScheme {
        self.scheme
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({:?}, **redacted**)", self.scheme)
    }
}

impl Serialize for SecretHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.scheme.serialize(serializer)
    }
}

fn validate_md5(hex: &str) -> Result<(), SecretHashError> {
    let malformed = |reason| SecretHashError::Malformed {
        scheme: HashScheme::Md5,
        reason,
    };

    if hex.len() != MD5_HEX_CHARS {
        return Err(malformed("digest must be 32 hex digits"));
    }

    if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(malformed("digest must be lowercase hex"));
    }

    Ok(())
}

fn validate_scram(body: &str) -> Result<(), SecretHashError> {
    let malformed = |reason| SecretHashError::Malformed {
        scheme: HashScheme::ScramSha256,
        reason,
    };

    let (iterations_and_salt, keys) = body
        .split_once('$')
        .ok_or_else(|| malformed("missing key section"))?;

    let (iterations, salt) = iterations_and_salt
        .split_once(':')
        .ok_or_else(|| malformed("missing salt"))?;

    if iterations.is_empty() || !iterations.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("iteration count must be decimal"));
    }

    if !iterations.parse::<u32>().is_ok_and(|count| count > 0) {
        return Err(malformed("iteration count out of range"));
    }

    if !BASE64.decode(salt).is_ok_and(|bytes| !bytes.is_empty()) {
        return Err(malformed("salt is not valid base64"));
    }

    let (stored_key, server_key) = keys
        .split_once(':')
        .ok_or_else(|| malformed("missing server key"))?;

    for key in [stored_key, server_key] {
        match BASE64.decode(key) {
            Ok(bytes) if bytes.len() == SCRAM_KEY_BYTES => {}
            Ok(_) => return Err(malformed("key has the wrong length")),
            Err(_) => return Err(malformed("key is not valid base64")),
        }
    }

    Ok(())
}

/// Errors raised when constructing a [`Password`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PasswordError {
    /// Password is empty or only whitespace.
    #[error("password cannot be empty")]
    Empty,
}

/// Plaintext credential handed to the primary store once, then zeroized.
#[derive(Clone)]
pub struct Password(String);

impl Password {
    /// Wrap an operator-supplied password.
    ///
    /// # Errors
    ///
    /// Returns [`PasswordError::Empty`] for blank input.
    pub fn new(value: impl Into<String>) -> Result<Self, PasswordError> {
        let value = value.into();

        if value.trim().is_empty() {
            return Err(PasswordError::Empty);
        }

        Ok(Self(value))
    }

    /// Generate a random URL-safe password.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0_u8; GENERATED_PASSWORD_BYTES];

        OsRng.fill_bytes(&mut bytes);

        let password = Self(URL_SAFE_NO_PAD.encode(bytes));

        bytes.zeroize();

        password
    }

    /// Expose the plaintext, e.g. to print it once after creation.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(**redacted**)")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use testresult::TestResult;

    use super::*;

    pub(crate) const MD5_HASH: &str = "md5c0ffee00c0ffee00c0ffee00c0ffee00";

    pub(crate) fn scram_hash() -> String {
        format!(
            "SCRAM-SHA-256$4096:{}${}:{}",
            BASE64.encode([7_u8; 16]),
            BASE64.encode([1_u8; 32]),
            BASE64.encode([2_u8; 32]),
        )
    }

    #[test]
    fn parses_md5_and_scram_hashes() -> TestResult {
        assert_eq!(SecretHash::parse(MD5_HASH)?.scheme(), HashScheme::Md5);
        assert_eq!(
            SecretHash::parse(&scram_hash())?.scheme(),
            HashScheme::ScramSha256
        );

        Ok(())
    }

    #[test]
    fn rejects_truncated_hashes() {
        let truncated_md5 = MD5_HASH.trim_end_matches("00");
        let scram = scram_hash();
        let truncated_scram = scram.trim_end_matches('=');

        assert!(matches!(
            SecretHash::parse(truncated_md5),
            Err(SecretHashError::Malformed { .. })
        ));
        assert!(matches!(
            SecretHash::parse(truncated_scram),
            Err(SecretHashError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_plaintext_and_empty_values() {
        assert_eq!(SecretHash::parse(""), Err(SecretHashError::Empty));
        assert_eq!(
            SecretHash::parse("hunter2"),
            Err(SecretHashError::UnknownScheme)
        );
    }

    #[test]
    fn debug_output_redacts_secrets() -> TestResult {
        let hash = SecretHash::parse(MD5_HASH)?;
        let password = Password::new("hunter2")?;

        assert!(!format!("{hash:?}").contains("c0ffee"));
        assert!(!format!("{password:?}").contains("hunter2"));

        Ok(())
    }

    #[test]
    fn generated_passwords_are_unique_and_nonempty() {
        let first = Password::generate();
        let second = Password::generate();

        assert_eq!(first.expose().len(), 32);
        assert_ne!(first.expose(), second.expose());
    }

    #[test]
    fn blank_passwords_are_rejected() {
        assert_eq!(Password::new("   ").err(), Some(PasswordError::Empty));
    }
}
