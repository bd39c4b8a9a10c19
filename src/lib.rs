//! # Partwarden
//!
//! Range-partition lifecycle engine for live PostgreSQL databases, running on
//! the `may` coroutine runtime.
//!
//! Partwarden converts plain tables into range-partitioned ones, keeps a
//! configured number of empty partitions ahead of the data, propagates
//! indexes and foreign keys to every partition, adds pruning constraints and
//! retires old partitions (detach, then drop after a cool-down). Every
//! structural change takes its locks with a short `lock_timeout` and retries,
//! so application traffic is never blocked for long.
//!
//! The engine talks to the database through the [`backend`] traits;
//! [`PgBackend`] implements them over a [`PgExecutor`].

pub mod backend;
pub mod boundary;
pub mod config;
pub mod connection;
pub mod ddl;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ident;
pub mod interval;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod state;

#[cfg(test)]
mod test_helpers;

pub use backend::{Catalog, PartitionBackend, PartitionStateStore, PgBackend, SchemaExecutor};
pub use config::EngineConfig;
pub use connection::{check_connection_health, connect, validate_connection_string, ConnectionError};
pub use ddl::Ddl;
pub use engine::{ConversionRequest, MaintenanceFailure, MaintenancePass, MaintenanceReport, PartitionManager};
pub use error::PartitionError;
pub use executor::{ExecError, MayPostgresExecutor, PgExecutor};
pub use ident::QualifiedName;
pub use interval::CalendarInterval;
pub use lock::{AttachOutcome, CancelToken, LockRetryPolicy};
pub use model::{BoundValue, ColumnFamily, PartitionBounds, PartitionStrategy, RangeKey};
pub use state::PartitionSettings;
