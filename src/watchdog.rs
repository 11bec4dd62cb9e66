//! Per-client real-time emergency detection
//!
//! The `Watchdog` owns one `ClientWindowState` per active client, created
//! lazily on the first record and discarded on `clear()`. Each state sits
//! behind its own mutex so clients never contend with each other; the outer
//! registry lock is held only long enough to find or insert an entry.
//!
//! Detection runs in a fixed order per tick (stuck, danger surge,
//! maneuvering, accident); the order decides only which alert is reported
//! first, every qualifying non-debounced alert is still emitted. Inactivity
//! is the one detector that cannot be driven by incoming records and is fired
//! from the periodic `tick()` instead.

use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::types::{Alert, AlertType, EventRecord, VeerDirection};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Injectable wall-clock, the only clock read the watchdog performs.
pub type NowFn = Box<dyn Fn() -> i64 + Send + Sync>;

/// Mutable window state for a single client. Owned exclusively by the
/// watchdog, never shared across clients.
#[derive(Debug, Default)]
struct ClientWindowState {
    recent_records: VecDeque<EventRecord>,
    last_clear_time: Option<i64>,
    direction_change_log: VecDeque<(i64, VeerDirection)>,
    last_alert_sent: HashMap<AlertType, i64>,
    last_record_time: i64,
}

impl ClientWindowState {
    fn evict(&mut self, now: i64, retention_s: i64, maneuver_window_s: i64) {
        let cutoff = now - retention_s;
        while let Some(front) = self.recent_records.front() {
            if front.timestamp < cutoff {
                self.recent_records.pop_front();
            } else {
                break;
            }
        }
        let maneuver_cutoff = now - maneuver_window_s;
        while let Some((t, _)) = self.direction_change_log.front() {
            if *t < maneuver_cutoff {
                self.direction_change_log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Baseline for the stuck detector: last clear signal, or the earliest
    /// retained record when no clear was ever seen.
    fn stuck_baseline(&self) -> Option<i64> {
        self.last_clear_time
            .or_else(|| self.recent_records.front().map(|r| r.timestamp))
    }
}

/// Per-alert-type emission gate, surfaced by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertGate {
    pub alert_type: AlertType,
    pub last_sent: Option<i64>,
    pub debounce_s: i64,
}

/// Read-only snapshot of a client's monitoring state.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub client_id: String,
    pub window_len: usize,
    pub last_record_time: Option<i64>,
    pub gates: Vec<AlertGate>,
}

/// Registry of per-client window states plus the pattern detectors.
pub struct Watchdog {
    config: MonitorConfig,
    clients: RwLock<HashMap<String, Arc<Mutex<ClientWindowState>>>>,
    now_fn: NowFn,
}

impl Watchdog {
    /// Watchdog reading the system clock.
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_now_fn(config, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Watchdog with an injected clock, for deterministic tests.
    pub fn with_now_fn(config: MonitorConfig, now_fn: NowFn) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
            now_fn,
        }
    }

    fn state_for(&self, client_id: &str) -> Arc<Mutex<ClientWindowState>> {
        if let Some(state) = self.clients.read().unwrap().get(client_id) {
            return Arc::clone(state);
        }
        let mut clients = self.clients.write().unwrap();
        Arc::clone(
            clients
                .entry(client_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ClientWindowState::default()))),
        )
    }

    /// Process one record through the detectors.
    ///
    /// Returns the alerts that passed their debounce gates; the caller hands
    /// them to the notification collaborator without awaiting delivery.
    /// Malformed input is reported as a validation error and leaves all
    /// per-client state untouched.
    pub fn process(&self, record: &EventRecord) -> Result<Vec<Alert>, MonitorError> {
        record.validate()?;

        let now = (self.now_fn)();
        let state = self.state_for(&record.client_id);
        let mut state = state.lock().unwrap();

        state.recent_records.push_back(record.clone());
        state.last_record_time = state.last_record_time.max(record.timestamp);
        if record.has_clear_tag() {
            state.last_clear_time = Some(record.timestamp);
        }
        if let Some(direction) = record.veer_direction() {
            let flipped = state
                .direction_change_log
                .back()
                .map_or(true, |(_, last)| *last != direction);
            if flipped {
                state.direction_change_log.push_back((record.timestamp, direction));
            }
        }
        state.evict(now, self.config.retention_s, self.config.maneuver_window_s);

        let mut candidates = Vec::new();
        if let Some(alert) = self.detect_stuck(&state, &record.client_id, now) {
            candidates.push(alert);
        }
        if let Some(alert) = self.detect_danger_surge(&state, &record.client_id, now) {
            candidates.push(alert);
        }
        if let Some(alert) = self.detect_maneuvering(&state, &record.client_id, now) {
            candidates.push(alert);
        }
        if let Some(alert) = self.detect_accident(record, now) {
            candidates.push(alert);
        }

        Ok(self.apply_debounce(&mut state, candidates, now))
    }

    /// Periodic inactivity sweep over all active clients.
    ///
    /// An event that never arrives cannot trigger a check, so this must be
    /// driven by an external timer. Idempotent: running it twice in the same
    /// second emits nothing new thanks to the debounce gate.
    pub fn tick(&self) -> Vec<Alert> {
        let now = (self.now_fn)();
        let states: Vec<(String, Arc<Mutex<ClientWindowState>>)> = {
            let clients = self.clients.read().unwrap();
            clients
                .iter()
                .map(|(id, state)| (id.clone(), Arc::clone(state)))
                .collect()
        };

        let mut alerts = Vec::new();
        for (client_id, state) in states {
            let mut state = state.lock().unwrap();
            if state.last_record_time == 0 {
                continue;
            }
            let gap = now - state.last_record_time;
            if gap < self.config.inactivity_s {
                continue;
            }
            let candidate = Alert {
                alert_type: AlertType::Inactivity,
                client_id: client_id.clone(),
                timestamp: now,
                rationale: format!("no events received for {}s", gap),
                payload: json!({ "last_record_time": state.last_record_time, "gap_s": gap }),
            };
            alerts.extend(self.apply_debounce(&mut state, vec![candidate], now));
        }
        alerts
    }

    /// Read-only view of a client's window and debounce gates.
    pub fn status(&self, client_id: &str) -> Option<WatchdogStatus> {
        let state = {
            let clients = self.clients.read().unwrap();
            Arc::clone(clients.get(client_id)?)
        };
        let state = state.lock().unwrap();
        let gates = AlertType::all()
            .iter()
            .map(|alert_type| AlertGate {
                alert_type: *alert_type,
                last_sent: state.last_alert_sent.get(alert_type).copied(),
                debounce_s: self.config.debounce_for(*alert_type),
            })
            .collect();
        Some(WatchdogStatus {
            client_id: client_id.to_string(),
            window_len: state.recent_records.len(),
            last_record_time: (state.last_record_time > 0).then_some(state.last_record_time),
            gates,
        })
    }

    /// Discard all state for a client. Idempotent; the inactivity tick stops
    /// covering the client as soon as the entry is gone.
    pub fn clear(&self, client_id: &str) {
        let removed = self.clients.write().unwrap().remove(client_id).is_some();
        if removed {
            log::info!("cleared watchdog state for client {}", client_id);
        }
    }

    /// Clients with live window state, in no particular order.
    pub fn active_clients(&self) -> Vec<String> {
        self.clients.read().unwrap().keys().cloned().collect()
    }

    fn detect_stuck(&self, state: &ClientWindowState, client_id: &str, now: i64) -> Option<Alert> {
        let baseline = state.stuck_baseline()?;
        let elapsed = now - baseline;
        if elapsed < self.config.stuck_alert_s {
            return None;
        }
        // Require evidence the client is still reporting: at least one
        // non-clear record since the baseline.
        let has_record_since = state
            .recent_records
            .iter()
            .any(|r| r.timestamp >= baseline && !r.has_clear_tag());
        if !has_record_since {
            return None;
        }
        Some(Alert {
            alert_type: AlertType::Stuck,
            client_id: client_id.to_string(),
            timestamp: now,
            rationale: format!("no clear-path signal for {}s", elapsed),
            payload: json!({ "since": baseline, "elapsed_s": elapsed }),
        })
    }

    fn detect_danger_surge(
        &self,
        state: &ClientWindowState,
        client_id: &str,
        now: i64,
    ) -> Option<Alert> {
        let cutoff = now - self.config.danger_window_s;
        let stop_count = state
            .recent_records
            .iter()
            .filter(|r| r.timestamp >= cutoff && r.has_stop_tag())
            .count();
        if stop_count < self.config.danger_stop_count {
            return None;
        }
        Some(Alert {
            alert_type: AlertType::DangerSurge,
            client_id: client_id.to_string(),
            timestamp: now,
            rationale: format!(
                "{} stop signals within {}s",
                stop_count, self.config.danger_window_s
            ),
            payload: json!({ "stop_count": stop_count, "window_s": self.config.danger_window_s }),
        })
    }

    fn detect_maneuvering(
        &self,
        state: &ClientWindowState,
        client_id: &str,
        now: i64,
    ) -> Option<Alert> {
        let cutoff = now - self.config.maneuver_window_s;
        let changes = state
            .direction_change_log
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .count();
        if changes < self.config.maneuver_count {
            return None;
        }
        Some(Alert {
            alert_type: AlertType::Maneuvering,
            client_id: client_id.to_string(),
            timestamp: now,
            rationale: format!(
                "{} direction changes within {}s",
                changes, self.config.maneuver_window_s
            ),
            payload: json!({ "direction_changes": changes, "window_s": self.config.maneuver_window_s }),
        })
    }

    fn detect_accident(&self, record: &EventRecord, now: i64) -> Option<Alert> {
        let tags = record.accident_tags();
        if tags.is_empty() {
            return None;
        }
        Some(Alert {
            alert_type: AlertType::Accident,
            client_id: record.client_id.clone(),
            timestamp: now,
            rationale: format!("accident event reported: {}", tags.join(", ")),
            payload: json!({
                "tags": tags,
                "record_timestamp": record.timestamp,
                "free_ahead_m": record.free_ahead_m,
                "confidence": record.confidence,
            }),
        })
    }

    fn apply_debounce(
        &self,
        state: &mut ClientWindowState,
        candidates: Vec<Alert>,
        now: i64,
    ) -> Vec<Alert> {
        let mut emitted = Vec::new();
        for alert in candidates {
            let debounce = self.config.debounce_for(alert.alert_type);
            let suppressed = state
                .last_alert_sent
                .get(&alert.alert_type)
                .map_or(false, |last| now - last < debounce);
            if suppressed {
                log::debug!(
                    "suppressed {} alert for {} inside {}s debounce",
                    alert.alert_type,
                    alert.client_id,
                    debounce
                );
                continue;
            }
            state.last_alert_sent.insert(alert.alert_type, now);
            log::warn!(
                "alert {} for client {}: {}",
                alert.alert_type,
                alert.client_id,
                alert.rationale
            );
            emitted.push(alert);
        }
        emitted
    }
}
