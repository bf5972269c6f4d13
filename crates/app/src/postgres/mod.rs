//! `PostgreSQL` adapter
//!
//! [`PgPrimaryStore`] implements the engine's primary store against a live cluster. Catalog
//! reads live in `sql/`; DDL is assembled from quoted identifiers because role and database
//! names cannot be bound as parameters.

use std::str::FromStr;

use sqlx::postgres::PgConnectOptions;

pub mod errors;
mod store;

pub use store::PgPrimaryStore;

/// Quote an identifier for interpolation into SQL.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Connection options from a URL, or from the `PG*` environment variables when `url` is `None`.
///
/// # Errors
///
/// Returns an error if the URL cannot be parsed.
pub fn connect_options(url: Option<&str>) -> Result<PgConnectOptions, sqlx::Error> {
    match url {
        Some(url) => PgConnectOptions::from_str(url),
        None => Ok(PgConnectOptions::new()),
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_ident("alpha_owner"), "\"alpha_owner\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn urls_select_the_database() -> TestResult {
        let options = connect_options(Some("postgres://admin@db.internal:5432/postgres"))?;

        assert_eq!(options.get_database(), Some("postgres"));
        assert_eq!(options.get_host(), "db.internal");

        Ok(())
    }
}
