//! Async ingestion loop and batch ingestion
//!
//! One unified loop owns both sides of real-time monitoring: records arriving
//! on the channel are pushed through the watchdog and persisted, and a single
//! global timer drives the inactivity sweep across all active clients.
//! Clearing a client removes the state the sweep iterates, so there is no
//! per-client timer handle to cancel.
//!
//! Alert delivery is fire-and-forget: emissions are spawned onto the runtime
//! and the loop never waits on the notifier.

use crate::collab::{AlertNotifier, EventStore};
use crate::error::MonitorError;
use crate::types::{Alert, EventRecord};
use crate::watchdog::Watchdog;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Result of ingesting one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum IngestOutcome {
    Accepted { alerts_emitted: usize },
    Rejected { reason: String },
}

/// Per-record accounting for a batch; never all-or-nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: usize,
}

fn dispatch_alerts(notifier: &Arc<dyn AlertNotifier>, alerts: Vec<Alert>) {
    for alert in alerts {
        let notifier = Arc::clone(notifier);
        tokio::spawn(async move {
            notifier.deliver(alert).await;
        });
    }
}

/// Feed one record to the watchdog and the store.
///
/// Validation failures are reported, never fatal; the record is counted and
/// dropped. A store failure does not retract alerts already handed off.
pub async fn ingest_record(
    watchdog: &Watchdog,
    store: &Arc<dyn EventStore>,
    notifier: &Arc<dyn AlertNotifier>,
    record: EventRecord,
) -> IngestOutcome {
    let alerts = match watchdog.process(&record) {
        Ok(alerts) => alerts,
        Err(MonitorError::Validation(reason)) => {
            log::debug!("rejected record from {}: {}", record.client_id, reason);
            return IngestOutcome::Rejected { reason };
        }
        Err(other) => {
            return IngestOutcome::Rejected {
                reason: other.to_string(),
            }
        }
    };

    let emitted = alerts.len();
    dispatch_alerts(notifier, alerts);

    if let Err(e) = store.append(record).await {
        log::error!("store append failed: {}", e);
    }
    IngestOutcome::Accepted {
        alerts_emitted: emitted,
    }
}

/// Ingest a batch with per-record success/failure counts.
pub async fn ingest_batch(
    watchdog: &Watchdog,
    store: &Arc<dyn EventStore>,
    notifier: &Arc<dyn AlertNotifier>,
    records: Vec<EventRecord>,
) -> BatchReport {
    let mut report = BatchReport::default();
    for record in records {
        match ingest_record(watchdog, store, notifier, record).await {
            IngestOutcome::Accepted { .. } => report.accepted += 1,
            IngestOutcome::Rejected { .. } => report.rejected += 1,
        }
    }
    report
}

/// Unified ingestion loop: record channel plus the inactivity tick.
///
/// Runs until the channel closes (producer shutdown). The tick branch is the
/// independent periodic trigger the inactivity detector needs; it fires even
/// when no records arrive.
pub async fn run_ingestion(
    mut rx: mpsc::Receiver<EventRecord>,
    watchdog: Arc<Watchdog>,
    store: Arc<dyn EventStore>,
    notifier: Arc<dyn AlertNotifier>,
    tick_interval_ms: u64,
) {
    log::info!(
        "starting ingestion loop (inactivity tick every {}ms)",
        tick_interval_ms
    );
    let mut tick_timer = interval(Duration::from_millis(tick_interval_ms));
    let mut accepted = 0u64;
    let mut rejected = 0u64;

    loop {
        tokio::select! {
            maybe_record = rx.recv() => {
                match maybe_record {
                    Some(record) => {
                        match ingest_record(&watchdog, &store, &notifier, record).await {
                            IngestOutcome::Accepted { .. } => accepted += 1,
                            IngestOutcome::Rejected { .. } => rejected += 1,
                        }
                    }
                    None => break,
                }
            }
            _ = tick_timer.tick() => {
                let alerts = watchdog.tick();
                if !alerts.is_empty() {
                    log::info!("inactivity sweep emitted {} alert(s)", alerts.len());
                    dispatch_alerts(&notifier, alerts);
                }
            }
        }
    }

    log::info!(
        "ingestion loop finished: {} accepted, {} rejected",
        accepted,
        rejected
    );
}
