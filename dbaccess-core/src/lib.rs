//! Generic PostgreSQL access layer.
//!
//! Runs parameterized SQL over one owned connection, materializes rows into
//! caller-registered record types, and inserts many rows at once by binding
//! each column as a single array parameter.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dbaccess_core::{params, CancellationToken, Database, ModelRegistry};
//!
//! # async fn run() -> dbaccess_core::Result<()> {
//! let mut db = Database::from_url("postgres://localhost/planning", Arc::new(ModelRegistry::new()))?;
//! let cancel = CancellationToken::new();
//! let rows = db
//!     .update("PLANNER", &params! { "GCC4" => "SCS" }, &params! { "PID" => 267763 }, &cancel)
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod bulk;
pub mod command;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod params;
pub mod registry;
pub mod statement;
pub mod value;

pub use bulk::{BulkData, ColumnValues, SqlType};
pub use command::Command;
pub use config::DatabaseConfig;
pub use connection::{ConnectionManager, ConnectionState, Connector, PgConnector};
pub use database::Database;
pub use error::{DbError, Result};
pub use params::Params;
pub use registry::{Model, ModelRegistry, Record};
pub use value::Value;

pub use tokio_util::sync::CancellationToken;
