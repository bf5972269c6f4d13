//! `PostgreSQL` error classification

use std::fmt::Display;

use sqlx::Error;
use tenantgate::{identity::RoleName, store::StoreError};

/// Broad class of a `SQLSTATE` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStateClass {
    /// Object already exists.
    Duplicate,

    /// Object does not exist.
    Missing,

    /// Other objects depend on the one being changed.
    Dependent,

    /// Insufficient privilege.
    Privilege,

    /// Connection trouble, contention or a serialization failure; worth retrying.
    Transient,

    /// Anything else.
    Other,
}

/// Classify a `SQLSTATE` code.
#[must_use]
pub fn classify(code: &str) -> SqlStateClass {
    match code {
        // duplicate_object, duplicate_database, unique_violation, duplicate_schema,
        // duplicate_table, duplicate_function
        "42710" | "42P04" | "23505" | "42P06" | "42P07" | "42723" => SqlStateClass::Duplicate,

        // undefined_object, invalid_catalog_name, undefined_table, undefined_function,
        // invalid_schema_name
        "42704" | "3D000" | "42P01" | "42883" | "3F000" => SqlStateClass::Missing,

        "2BP01" => SqlStateClass::Dependent,

        "42501" => SqlStateClass::Privilege,

        // too_many_connections, cannot_connect_now, admin_shutdown, crash_shutdown,
        // serialization_failure, deadlock_detected, lock_not_available, object_in_use
        "53300" | "57P01" | "57P02" | "57P03" | "40001" | "40P01" | "55P03" | "55006" => {
            SqlStateClass::Transient
        }

        code if code.starts_with("08") => SqlStateClass::Transient,

        _ => SqlStateClass::Other,
    }
}

/// Map a driver error raised while working on `subject`.
pub fn store_error(error: Error, subject: impl Display) -> StoreError {
    match &error {
        Error::Io(_) | Error::Tls(_) | Error::PoolTimedOut | Error::PoolClosed => {
            return StoreError::Unavailable(Box::new(error));
        }
        Error::Database(database) => {
            let class = database.code().map_or(SqlStateClass::Other, |code| classify(&code));
            let message = database.message().to_string();

            return match class {
                SqlStateClass::Duplicate => StoreError::AlreadyExists(subject.to_string()),
                SqlStateClass::Missing => StoreError::Missing(subject.to_string()),
                SqlStateClass::Dependent => StoreError::Irrecoverable {
                    object: subject.to_string(),
                    detail: database_detail(&message, &**database),
                },
                SqlStateClass::Privilege | SqlStateClass::Other => {
                    StoreError::Rejected(format!("{subject}: {message}"))
                }
                SqlStateClass::Transient => StoreError::Unavailable(Box::new(error)),
            };
        }
        _ => {}
    }

    StoreError::Rejected(format!("{subject}: {error}"))
}

/// Map a driver error raised while dropping `role`; dependent objects keep the role alive.
pub fn drop_role_error(error: Error, role: &RoleName) -> StoreError {
    if let Error::Database(database) = &error
        && database.code().is_some_and(|code| code == "2BP01")
    {
        return StoreError::DependentObjects {
            role: role.clone(),
            detail: database_detail(database.message(), &**database),
        };
    }

    store_error(error, format_args!("role {role}"))
}

fn database_detail(message: &str, database: &dyn sqlx::error::DatabaseError) -> String {
    let detail = database
        .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
        .and_then(sqlx::postgres::PgDatabaseError::detail);

    match detail {
        Some(detail) => format!("{message}: {detail}"),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tenantgate::retry::Transient;

    use super::*;

    #[test]
    fn sqlstate_codes_are_classified() {
        assert_eq!(classify("42710"), SqlStateClass::Duplicate);
        assert_eq!(classify("42P04"), SqlStateClass::Duplicate);
        assert_eq!(classify("42704"), SqlStateClass::Missing);
        assert_eq!(classify("3D000"), SqlStateClass::Missing);
        assert_eq!(classify("2BP01"), SqlStateClass::Dependent);
        assert_eq!(classify("42501"), SqlStateClass::Privilege);
        assert_eq!(classify("08006"), SqlStateClass::Transient);
        assert_eq!(classify("40P01"), SqlStateClass::Transient);
        assert_eq!(classify("55006"), SqlStateClass::Transient);
        assert_eq!(classify("22023"), SqlStateClass::Other);
    }

    #[test]
    fn connection_failures_are_transient() {
        let error = store_error(
            Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            "role alpha_owner",
        );

        assert!(matches!(error, StoreError::Unavailable(_)));
        assert!(error.is_transient());
    }

    #[test]
    fn other_driver_errors_are_rejections() {
        let error = store_error(Error::RowNotFound, "role alpha_owner");

        assert!(matches!(error, StoreError::Rejected(message) if message.contains("alpha_owner")));
    }
}
