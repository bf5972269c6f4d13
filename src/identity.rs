//! Validated identifiers
//!
//! Tenant ids double as `PostgreSQL` database names, subdomains are DNS labels and role names
//! end up quoted inside the pooler's credential cache, so each is parsed once at the edge and
//! carried around as a newtype afterwards.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest identifier `PostgreSQL` keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Suffix appended to a tenant id to name its owner role.
pub const OWNER_ROLE_SUFFIX: &str = "_owner";

const MAX_TENANT_ID_LEN: usize = MAX_IDENTIFIER_LEN - OWNER_ROLE_SUFFIX.len();

const RESERVED_WORDS: &[&str] = &[
    "user",
    "table",
    "select",
    "insert",
    "update",
    "delete",
    "drop",
    "create",
    "alter",
    "index",
    "database",
    "schema",
    "role",
    "grant",
    "revoke",
    "postgres",
    "template0",
    "template1",
];

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// Value is empty or longer than the allowed maximum.
    #[error("{kind} must be 1-{max} characters long")]
    Length {
        /// Which identifier was being parsed.
        kind: &'static str,

        /// Maximum accepted length.
        max: usize,
    },

    /// Value must start with a letter or underscore.
    #[error("{kind} must start with a letter or underscore")]
    InvalidStart {
        /// Which identifier was being parsed.
        kind: &'static str,
    },

    /// Value contains a character outside the allowed set.
    #[error("{kind} contains invalid character {character:?}")]
    InvalidCharacter {
        /// Which identifier was being parsed.
        kind: &'static str,

        /// Offending character.
        character: char,
    },

    /// Value is a reserved word.
    #[error("{kind} {value:?} is reserved")]
    Reserved {
        /// Which identifier was being parsed.
        kind: &'static str,

        /// Rejected value.
        value: String,
    },

    /// Subdomain begins or ends with a hyphen.
    #[error("subdomain must not begin or end with a hyphen")]
    EdgeHyphen,
}

/// Tenant identifier; also the name of the tenant's database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parse a tenant id.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] unless the value is a lowercase `PostgreSQL` identifier short
    /// enough to carry the owner-role suffix.
    pub fn parse(value: &str) -> Result<Self, NameError> {
        const KIND: &str = "tenant id";

        if value.is_empty() || value.len() > MAX_TENANT_ID_LEN {
            return Err(NameError::Length {
                kind: KIND,
                max: MAX_TENANT_ID_LEN,
            });
        }

        if !value.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
            return Err(NameError::InvalidStart { kind: KIND });
        }

        if let Some(character) = value
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
        {
            return Err(NameError::InvalidCharacter {
                kind: KIND,
                character,
            });
        }

        if RESERVED_WORDS.contains(&value) {
            return Err(NameError::Reserved {
                kind: KIND,
                value: value.to_string(),
            });
        }

        Ok(Self(value.to_string()))
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the full-privilege role owning this tenant.
    #[must_use]
    pub fn owner_role(&self) -> RoleName {
        RoleName(format!("{}{OWNER_ROLE_SUFFIX}", self.0))
    }

    /// Subdomain used when none is given at creation: the id itself.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] when the id is not a valid DNS label (e.g. it contains `_`).
    pub fn default_subdomain(&self) -> Result<Subdomain, NameError> {
        Subdomain::parse(&self.0)
    }
}

/// DNS label a tenant is reachable through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subdomain(String);

impl Subdomain {
    /// Parse a subdomain label.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] unless the value is a lowercase DNS label.
    pub fn parse(value: &str) -> Result<Self, NameError> {
        const KIND: &str = "subdomain";

        if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
            return Err(NameError::Length {
                kind: KIND,
                max: MAX_IDENTIFIER_LEN,
            });
        }

        if let Some(character) = value
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(NameError::InvalidCharacter {
                kind: KIND,
                character,
            });
        }

        if value.starts_with('-') || value.ends_with('-') {
            return Err(NameError::EdgeHyphen);
        }

        Ok(Self(value.to_string()))
    }

    /// Borrow the label as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully qualified hostname under the platform's root identity.
    #[must_use]
    pub fn hostname(&self, root_identity: &str) -> String {
        format!("{}.{root_identity}", self.0)
    }
}

/// Authentication principal name.
///
/// Restricted to characters that survive the credential cache's quoting and the registry's
/// annotation syntax unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    /// Parse a role name.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] unless the value starts with a letter or underscore and contains
    /// only ASCII letters, digits, `_`, `.` or `-`.
    pub fn parse(value: &str) -> Result<Self, NameError> {
        const KIND: &str = "role name";

        if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
            return Err(NameError::Length {
                kind: KIND,
                max: MAX_IDENTIFIER_LEN,
            });
        }

        if !value.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            return Err(NameError::InvalidStart { kind: KIND });
        }

        if let Some(character) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(NameError::InvalidCharacter {
                kind: KIND,
                character,
            });
        }

        Ok(Self(value.to_string()))
    }

    /// Borrow the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_newtype_impls {
    ($($name:ident),+) => {
        $(
            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl FromStr for $name {
                type Err = NameError;

                fn from_str(value: &str) -> Result<Self, Self::Err> {
                    Self::parse(value)
                }
            }

            impl TryFrom<String> for $name {
                type Error = NameError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    Self::parse(&value)
                }
            }

            impl From<$name> for String {
                fn from(value: $name) -> Self {
                    value.0
                }
            }

            impl AsRef<str> for $name {
                fn as_ref(&self) -> &str {
                    &self.0
                }
            }
        )+
    };
}

string_newtype_impls!(TenantId, Subdomain, RoleName);

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn tenant_id_accepts_lowercase_identifiers() -> TestResult {
        let id = TenantId::parse("acme_01")?;

        assert_eq!(id.as_str(), "acme_01");
        assert_eq!(id.owner_role().as_str(), "acme_01_owner");

        Ok(())
    }

    #[test]
    fn tenant_id_rejects_invalid_values() {
        assert!(matches!(
            TenantId::parse(""),
            Err(NameError::Length { .. })
        ));
        assert!(matches!(
            TenantId::parse("1acme"),
            Err(NameError::InvalidStart { .. })
        ));
        assert!(matches!(
            TenantId::parse("Acme"),
            Err(NameError::InvalidStart { .. })
        ));
        assert!(matches!(
            TenantId::parse("acme-co"),
            Err(NameError::InvalidCharacter { character: '-', .. })
        ));
        assert!(matches!(
            TenantId::parse("postgres"),
            Err(NameError::Reserved { .. })
        ));
    }

    #[test]
    fn tenant_id_leaves_room_for_owner_suffix() {
        let longest = "a".repeat(MAX_TENANT_ID_LEN);
        let too_long = "a".repeat(MAX_TENANT_ID_LEN + 1);

        assert!(TenantId::parse(&longest).is_ok());
        assert!(TenantId::parse(&too_long).is_err());
    }

    #[test]
    fn default_subdomain_requires_dns_safe_id() -> TestResult {
        assert_eq!(TenantId::parse("alpha")?.default_subdomain()?.as_str(), "alpha");
        assert!(TenantId::parse("alpha_beta")?.default_subdomain().is_err());

        Ok(())
    }

    #[test]
    fn subdomain_rejects_edge_hyphens_and_uppercase() {
        assert!(Subdomain::parse("shop-1").is_ok());
        assert_eq!(Subdomain::parse("-shop"), Err(NameError::EdgeHyphen));
        assert_eq!(Subdomain::parse("shop-"), Err(NameError::EdgeHyphen));
        assert!(Subdomain::parse("Shop").is_err());
        assert!(Subdomain::parse("shop.example").is_err());
    }

    #[test]
    fn role_name_rejects_quotes_and_whitespace() {
        assert!(RoleName::parse("app.reader-1").is_ok());
        assert!(RoleName::parse("ali ce").is_err());
        assert!(RoleName::parse("ali\"ce").is_err());
        assert!(RoleName::parse("a,b").is_err());
    }
}
