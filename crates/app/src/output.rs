//! Command output
//!
//! Text output prints `key: value` lines and a table for listings; JSON output prints a
//! single object whose `status` is `ok` or `error`.

use std::{fmt::Display, io};

use serde_json::{Value, json};
use tabled::{builder::Builder, settings::Style};

use crate::errors::CliError;

/// Output format of the command result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// `key: value` lines.
    #[default]
    Text,

    /// One JSON object.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Listing {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    fields: Vec<(&'static str, String)>,
    listing: Option<Listing>,
    result: Value,
}

impl Report {
    /// Report whose JSON form carries `result`.
    #[must_use]
    pub fn new(result: Value) -> Self {
        Self {
            fields: Vec::new(),
            listing: None,
            result,
        }
    }

    /// Add a text line.
    #[must_use]
    pub fn field(mut self, key: &'static str, value: impl Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Add a text table.
    #[must_use]
    pub fn table(mut self, headers: Vec<&'static str>, rows: Vec<Vec<String>>) -> Self {
        self.listing = Some(Listing { headers, rows });
        self
    }

    /// Write the report in `format`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` fails.
    pub fn write_to(&self, format: OutputFormat, mut out: impl io::Write) -> io::Result<()> {
        match format {
            OutputFormat::Text => {
                writeln!(out, "status: ok")?;

                for (key, value) in &self.fields {
                    writeln!(out, "{key}: {value}")?;
                }

                if let Some(listing) = &self.listing {
                    writeln!(out, "{}", render_table(listing))?;
                }

                Ok(())
            }
            OutputFormat::Json => {
                let document = json!({ "status": "ok", "result": self.result });

                writeln!(out, "{document}")
            }
        }
    }
}

fn render_table(listing: &Listing) -> String {
    let mut builder = Builder::default();

    builder.push_record(listing.headers.iter().copied());

    for row in &listing.rows {
        builder.push_record(row.iter().map(String::as_str));
    }

    let mut table = builder.build();
    table.with(Style::modern_rounded());

    table.to_string()
}

/// Write a failed command in `format`.
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn write_error(
    error: &CliError,
    format: OutputFormat,
    mut out: impl io::Write,
) -> io::Result<()> {
    match format {
        OutputFormat::Text => {
            writeln!(out, "status: error")?;
            writeln!(out, "kind: {}", error.kind)?;
            writeln!(out, "message: {}", error.message)
        }
        OutputFormat::Json => {
            let document = json!({
                "status": "error",
                "kind": error.kind.as_str(),
                "message": error.message,
            });

            writeln!(out, "{document}")
        }
    }
}

#[cfg(test)]
mod tests {
    use tenantgate::errors::ErrorKind;
    use testresult::TestResult;

    use super::*;

    fn render(report: &Report, format: OutputFormat) -> TestResult<String> {
        let mut out = Vec::new();
        report.write_to(format, &mut out)?;

        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn text_output_prints_fields_in_order() -> TestResult {
        let report = Report::new(json!({}))
            .field("tenant", "alpha")
            .field("hostname", "alpha.db.example.com");

        assert_eq!(
            render(&report, OutputFormat::Text)?,
            "status: ok\ntenant: alpha\nhostname: alpha.db.example.com\n"
        );

        Ok(())
    }

    #[test]
    fn text_output_renders_listings_as_tables() -> TestResult {
        let report = Report::new(json!([])).table(
            vec!["tenant", "status"],
            vec![vec!["alpha".to_string(), "live".to_string()]],
        );

        let text = render(&report, OutputFormat::Text)?;

        assert!(text.contains("tenant"));
        assert!(text.contains("alpha"));
        assert!(text.contains("live"));

        Ok(())
    }

    #[test]
    fn json_output_wraps_the_result() -> TestResult {
        let report = Report::new(json!({ "tenant": "alpha" })).field("tenant", "alpha");

        let value: Value = serde_json::from_str(&render(&report, OutputFormat::Json)?)?;

        assert_eq!(value, json!({ "status": "ok", "result": { "tenant": "alpha" } }));

        Ok(())
    }

    #[test]
    fn errors_carry_kind_and_message() -> TestResult {
        let error = CliError::new(ErrorKind::NotFound, "tenant alpha not found");
        let mut out = Vec::new();

        write_error(&error, OutputFormat::Json, &mut out)?;

        let value: Value = serde_json::from_slice(&out)?;

        assert_eq!(
            value,
            json!({
                "status": "error",
                "kind": "NotFound",
                "message": "tenant alpha not found",
            })
        );

        Ok(())
    }
}
