//! External collaborator seams
//!
//! Storage, authorization, and notification are owned by other systems; the
//! core talks to them through these traits and assumes at-least-once
//! semantics. The in-memory implementations back the runtime binary and the
//! test suite; a real deployment swaps in transport-backed ones.

use crate::aggregate::Aggregation;
use crate::error::MonitorError;
use crate::types::{Alert, EventRecord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Cache key for a computed aggregation.
type RangeKey = (String, i64, i64, Option<String>);

/// Persisted event records, queried by client and time range.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, record: EventRecord) -> Result<(), MonitorError>;

    /// Records for `client_id` within `[time_start, time_end)`, optionally
    /// narrowed to one session. Order is not guaranteed.
    async fn query(
        &self,
        client_id: &str,
        session_id: Option<&str>,
        time_start: i64,
        time_end: i64,
    ) -> Result<Vec<EventRecord>, MonitorError>;

    /// Optional read-through cache. The default implementations make the
    /// cache invisible; the core must function correctly without one.
    async fn cached_aggregation(
        &self,
        _client_id: &str,
        _time_start: i64,
        _time_end: i64,
        _session_id: Option<&str>,
    ) -> Option<Aggregation> {
        None
    }

    async fn cache_aggregation(&self, _client_id: &str, _aggregation: &Aggregation) {}
}

/// Externally-owned mapping of client to authorized requester ids. The core
/// only reads it.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn is_authorized(&self, client_id: &str, requester_id: &str)
        -> Result<bool, MonitorError>;
}

/// Alert delivery (SMS, push, persistence). Fire-and-forget: delivery
/// failures are the collaborator's concern and never reach detector state.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn deliver(&self, alert: Alert);
}

/// In-memory event store with per-client record vectors and an aggregation
/// cache keyed by (client, range, session).
#[derive(Default)]
pub struct MemoryEventStore {
    records: RwLock<HashMap<String, Vec<EventRecord>>>,
    cache: RwLock<HashMap<RangeKey, Aggregation>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, record: EventRecord) -> Result<(), MonitorError> {
        self.records
            .write()
            .unwrap()
            .entry(record.client_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn query(
        &self,
        client_id: &str,
        session_id: Option<&str>,
        time_start: i64,
        time_end: i64,
    ) -> Result<Vec<EventRecord>, MonitorError> {
        let records = self.records.read().unwrap();
        Ok(records
            .get(client_id)
            .map(|rs| {
                rs.iter()
                    .filter(|r| r.timestamp >= time_start && r.timestamp < time_end)
                    .filter(|r| session_id.map_or(true, |s| r.session_id == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cached_aggregation(
        &self,
        client_id: &str,
        time_start: i64,
        time_end: i64,
        session_id: Option<&str>,
    ) -> Option<Aggregation> {
        let key = (
            client_id.to_string(),
            time_start,
            time_end,
            session_id.map(|s| s.to_string()),
        );
        self.cache.read().unwrap().get(&key).cloned()
    }

    async fn cache_aggregation(&self, client_id: &str, aggregation: &Aggregation) {
        let key = (
            client_id.to_string(),
            aggregation.time_start,
            aggregation.time_end,
            aggregation.session_id.clone(),
        );
        self.cache.write().unwrap().insert(key, aggregation.clone());
    }
}

/// Contact mapping held in memory, mutated only through `authorize`.
#[derive(Default)]
pub struct StaticContacts {
    contacts: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authorize(&self, client_id: &str, requester_id: &str) {
        self.contacts
            .write()
            .unwrap()
            .entry(client_id.to_string())
            .or_default()
            .insert(requester_id.to_string());
    }
}

#[async_trait]
impl AuthorizationProvider for StaticContacts {
    async fn is_authorized(
        &self,
        client_id: &str,
        requester_id: &str,
    ) -> Result<bool, MonitorError> {
        Ok(self
            .contacts
            .read()
            .unwrap()
            .get(client_id)
            .map_or(false, |set| set.contains(requester_id)))
    }
}

/// Notifier that only logs. Stands in for the SMS provider in development.
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn deliver(&self, alert: Alert) {
        log::warn!(
            "ALERT [{}] client={} at {}: {}",
            alert.alert_type,
            alert.client_id,
            alert.timestamp,
            alert.rationale
        );
    }
}

/// Notifier forwarding alerts into a channel, used by tests to observe
/// emissions.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertNotifier for ChannelNotifier {
    async fn deliver(&self, alert: Alert) {
        // Receiver dropped means nobody is watching; that is fine.
        let _ = self.tx.send(alert);
    }
}
