//! Tenantgate
//!
//! Tenantgate is the tenant isolation and credential synchronization engine for a hosted,
//! multi-tenant `PostgreSQL` platform. Every tenant owns one database that is reachable only
//! through its own hostname, and the credentials the connection pooler authenticates against
//! are kept consistent with the primary store.
//!
//! The engine is split into four components:
//!
//! - [`registry`]: the durable `tenant → subdomain` mapping and tenant state.
//! - [`gate`]: the per-session check comparing the declared network identity with the registry.
//! - [`credentials`]: the pooler credential cache and its synchronizer.
//! - [`lifecycle`]: tenant creation and tiered, resumable teardown.

pub mod config;
pub mod credentials;
pub mod engine;
pub mod errors;
pub mod fixtures;
pub mod gate;
pub mod identity;
pub mod lifecycle;
pub mod prelude;
pub mod process;
pub mod registry;
pub mod retry;
pub mod secrets;
pub mod store;

mod files;
