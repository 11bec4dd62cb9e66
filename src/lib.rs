//! PathSense monitoring core
//!
//! Real-time safety monitoring for assisted-navigation event streams:
//!
//! - [`watchdog::Watchdog`] runs the per-client pattern detectors (stuck,
//!   danger surge, inactivity, maneuvering, accident) with debounced alert
//!   emission.
//! - [`aggregate::aggregate`] turns raw stored records into an immutable
//!   [`aggregate::Aggregation`] summary over an arbitrary time range.
//! - [`query::MetricResolver`] answers natural-language questions from
//!   authorized emergency contacts against those aggregations.
//!
//! Transport, persistent storage, and SMS delivery are external
//! collaborators reached through the traits in [`collab`].

pub mod aggregate;
pub mod collab;
pub mod config;
pub mod error;
pub mod ingest;
pub mod query;
pub mod types;
pub mod watchdog;

pub use aggregate::{aggregate, Aggregation, AggregationParams, StuckInterval};
pub use collab::{AlertNotifier, AuthorizationProvider, EventStore};
pub use config::MonitorConfig;
pub use error::MonitorError;
pub use ingest::{ingest_batch, ingest_record, run_ingestion, BatchReport, IngestOutcome};
pub use query::{
    require_metric, resolve_metric, resolve_time_range, Metric, MetricResolver, QueryRequest,
};
pub use types::{Alert, AlertType, EventRecord};
pub use watchdog::{Watchdog, WatchdogStatus};
