//! Error taxonomy for the monitoring core
//!
//! No error here is fatal to the process: every failure is scoped to a
//! single record or a single query. Callers decide whether to drop, count,
//! or surface each one.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Malformed record. Dropped and counted, never propagated into
    /// per-client detector state.
    #[error("invalid record: {0}")]
    Validation(String),

    /// Requester is not an authorized contact for the client. The message
    /// carries no aggregation data.
    #[error("requester {requester_id} is not authorized for client {client_id}")]
    Authorization {
        client_id: String,
        requester_id: String,
    },

    /// Question did not match any known metric. Resolvers turn this into an
    /// explicit "not understood" answer rather than guessing.
    #[error("question not understood: {0}")]
    UnresolvedMetric(String),

    /// Time range rejected before any aggregation work (e.g. end before start).
    #[error("invalid time range: {0}")]
    Range(String),

    /// Failure reported by an external collaborator (store, notifier).
    #[error("collaborator failure: {0}")]
    Store(String),
}

impl MonitorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MonitorError::Validation(msg.into())
    }

    pub fn range(msg: impl Into<String>) -> Self {
        MonitorError::Range(msg.into())
    }
}
