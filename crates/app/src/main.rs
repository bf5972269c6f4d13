//! Tenantgate CLI

use std::{
    io::{self, Write},
    process::ExitCode,
};

use clap::{Parser, error::ErrorKind as ClapErrorKind};
use tenantgate_app::{
    errors::{EXIT_SUCCESS, EXIT_USAGE},
    observability,
};

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    let _env = dotenvy::dotenv();

    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = match error.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => EXIT_SUCCESS,
                _ => EXIT_USAGE,
            };

            // Usage errors keep clap's own formatting on stderr.
            let _printed = error.print();

            return ExitCode::from(code);
        }
    };

    if let Err(error) = observability::init(&cli.logging) {
        let _written = writeln!(io::stderr().lock(), "{error}");

        return ExitCode::from(EXIT_USAGE);
    }

    ExitCode::from(cli.run().await)
}
