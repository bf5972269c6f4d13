//! Tenantgate command-line adapters
//!
//! Concrete collaborators for the engine (the `PostgreSQL` primary store and the systemd pooler
//! controller) plus the configuration, logging and output layers of the `tenantgate` binary.

pub mod config;
pub mod errors;
pub mod observability;
pub mod output;
pub mod postgres;
pub mod systemd;
