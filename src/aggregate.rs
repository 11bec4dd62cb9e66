//! Pure aggregation over ordered event records
//!
//! Turns a raw record set plus a closed time range into an immutable
//! `Aggregation` summary. No hidden clock reads: the only "now" involved is
//! the caller-supplied `as_of`, used solely to close a still-open stuck
//! interval. Identical input always yields identical output.

use crate::config::MonitorConfig;
use crate::types::EventRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum sample records retained per metric for evidentiary display.
pub const SAMPLE_LIMIT: usize = 5;

/// Threshold parameters for hazard metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationParams {
    pub crash_near_m: f64,
    pub conf_min: f64,
    pub stuck_min_s: i64,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            crash_near_m: 0.6,
            conf_min: 0.6,
            stuck_min_s: 120,
        }
    }
}

impl From<&MonitorConfig> for AggregationParams {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            crash_near_m: config.crash_near_m,
            conf_min: config.conf_min,
            stuck_min_s: config.stuck_min_s,
        }
    }
}

/// A maximal span during which no clear-path signal was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckInterval {
    pub start: i64,
    pub end: i64,
    /// True when the stream ended before a clear arrived and the interval was
    /// closed at `as_of` instead.
    pub open_ended: bool,
}

impl StuckInterval {
    pub fn duration_s(&self) -> i64 {
        self.end - self.start
    }
}

/// Immutable statistical summary over `[time_start, time_end)`.
///
/// Never mutated after construction; a fresh aggregation replaces a cached
/// one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub time_start: i64,
    pub time_end: i64,
    pub session_id: Option<String>,
    pub record_count: usize,
    /// Records failing validation or falling outside the range. Always
    /// `record_count + dropped_count == input length`.
    pub dropped_count: usize,
    pub event_counts: HashMap<String, u64>,
    pub class_counts: HashMap<String, u64>,
    pub almost_crash_count: usize,
    pub stuck_intervals: Vec<StuckInterval>,
    pub near_miss_samples: Vec<EventRecord>,
    pub accident_samples: Vec<EventRecord>,
    pub first_accident_time: Option<i64>,
}

impl Aggregation {
    fn empty(time_start: i64, time_end: i64, session_id: Option<&str>) -> Self {
        Self {
            time_start,
            time_end,
            session_id: session_id.map(|s| s.to_string()),
            record_count: 0,
            dropped_count: 0,
            event_counts: HashMap::new(),
            class_counts: HashMap::new(),
            almost_crash_count: 0,
            stuck_intervals: Vec::new(),
            near_miss_samples: Vec::new(),
            accident_samples: Vec::new(),
            first_accident_time: None,
        }
    }

    /// Total seconds spent inside stuck intervals.
    pub fn stuck_seconds(&self) -> i64 {
        self.stuck_intervals.iter().map(|i| i.duration_s()).sum()
    }

    /// Detected object classes sorted by occurrence, most frequent first.
    pub fn top_classes(&self, limit: usize) -> Vec<(String, u64)> {
        let mut classes: Vec<(String, u64)> = self
            .class_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        classes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        classes.truncate(limit);
        classes
    }
}

/// Build an `Aggregation` from raw records.
///
/// Records outside `[time_start, time_end)` or failing validation are counted
/// in `dropped_count`, never silently ignored. Input order does not matter;
/// records are sorted by timestamp internally to tolerate network reordering.
pub fn aggregate(
    records: &[EventRecord],
    time_start: i64,
    time_end: i64,
    session_id: Option<&str>,
    params: &AggregationParams,
    as_of: i64,
) -> Aggregation {
    let mut agg = Aggregation::empty(time_start, time_end, session_id);

    let mut kept: Vec<&EventRecord> = Vec::with_capacity(records.len());
    for record in records {
        let in_range = record.timestamp >= time_start && record.timestamp < time_end;
        let in_session = session_id.map_or(true, |s| record.session_id == s);
        if record.validate().is_err() || !in_range || !in_session {
            agg.dropped_count += 1;
            continue;
        }
        kept.push(record);
    }
    kept.sort_by_key(|r| r.timestamp);
    agg.record_count = kept.len();

    if kept.is_empty() {
        return agg;
    }

    for record in &kept {
        for event in &record.events {
            *agg.event_counts.entry(event.clone()).or_insert(0) += 1;
        }
        for class in &record.detected_classes {
            *agg.class_counts.entry(class.clone()).or_insert(0) += 1;
        }

        let near_miss = record
            .free_ahead_m
            .map_or(false, |d| d < params.crash_near_m)
            && record.confidence >= params.conf_min;
        if near_miss {
            agg.almost_crash_count += 1;
            if agg.near_miss_samples.len() < SAMPLE_LIMIT {
                agg.near_miss_samples.push((*record).clone());
            }
        }

        if !record.accident_tags().is_empty() {
            if agg.first_accident_time.is_none() {
                agg.first_accident_time = Some(record.timestamp);
            }
            if agg.accident_samples.len() < SAMPLE_LIMIT {
                agg.accident_samples.push((*record).clone());
            }
        }
    }

    agg.stuck_intervals = scan_stuck_intervals(&kept, params.stuck_min_s, as_of);
    agg
}

/// Scan sorted records for stuck intervals.
///
/// Maintains a running last-clear anchor; when the gap since the anchor
/// reaches `stuck_min_s`, an interval opens at the anchor and closes at the
/// first subsequent clear, or at `as_of` (open-ended) if the stream ends
/// first. A record carrying both clear and non-clear tags counts as clearing.
fn scan_stuck_intervals(sorted: &[&EventRecord], stuck_min_s: i64, as_of: i64) -> Vec<StuckInterval> {
    let first = match sorted.first() {
        Some(r) => r,
        None => return Vec::new(),
    };

    let mut intervals = Vec::new();
    let mut anchor = first.timestamp;
    let mut open_start: Option<i64> = None;

    for record in sorted {
        if record.has_clear_tag() {
            if let Some(start) = open_start.take() {
                intervals.push(StuckInterval {
                    start,
                    end: record.timestamp,
                    open_ended: false,
                });
            }
            anchor = record.timestamp;
        } else if open_start.is_none() && record.timestamp - anchor >= stuck_min_s {
            open_start = Some(anchor);
        }
    }

    // Close against as_of: either an already-open interval, or trailing
    // silence long enough to qualify on its own.
    if let Some(start) = open_start {
        intervals.push(StuckInterval {
            start,
            end: as_of.max(start),
            open_ended: true,
        });
    } else if as_of - anchor >= stuck_min_s {
        intervals.push(StuckInterval {
            start: anchor,
            end: as_of,
            open_ended: true,
        });
    }

    intervals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: i64, events: &[&str]) -> EventRecord {
        EventRecord {
            client_id: "client_1".to_string(),
            session_id: "session_1".to_string(),
            timestamp,
            events: events.iter().map(|e| e.to_string()).collect(),
            detected_classes: vec![],
            confidence: 0.9,
            free_ahead_m: None,
        }
    }

    fn near_miss(timestamp: i64, depth: f64, confidence: f64) -> EventRecord {
        let mut rec = record(timestamp, &["obstacle_center"]);
        rec.free_ahead_m = Some(depth);
        rec.confidence = confidence;
        rec
    }

    #[test]
    fn test_empty_input_yields_zero_aggregation() {
        let agg = aggregate(&[], 0, 1000, None, &AggregationParams::default(), 1000);
        assert_eq!(agg.record_count, 0);
        assert_eq!(agg.dropped_count, 0);
        assert_eq!(agg.almost_crash_count, 0);
        assert!(agg.stuck_intervals.is_empty());
    }

    #[test]
    fn test_count_invariant_holds() {
        let mut bad = record(100, &["stop"]);
        bad.events.clear();
        let records = vec![
            record(100, &["proceed"]),
            record(5000, &["stop"]), // outside range
            bad,                     // invalid
            record(200, &["stop"]),
        ];
        let agg = aggregate(&records, 0, 1000, None, &AggregationParams::default(), 1000);
        assert_eq!(agg.record_count, 2);
        assert_eq!(agg.dropped_count, 2);
        assert_eq!(agg.record_count + agg.dropped_count, records.len());
    }

    #[test]
    fn test_session_filter_drops_other_sessions() {
        let mut other = record(150, &["stop"]);
        other.session_id = "session_2".to_string();
        let records = vec![record(100, &["proceed"]), other];
        let agg = aggregate(
            &records,
            0,
            1000,
            Some("session_1"),
            &AggregationParams::default(),
            1000,
        );
        assert_eq!(agg.record_count, 1);
        assert_eq!(agg.dropped_count, 1);
    }

    #[test]
    fn test_almost_crash_thresholds() {
        let params = AggregationParams::default();
        let records = vec![
            near_miss(100, 0.3, 0.9),  // qualifies
            near_miss(110, 0.59, 0.6), // qualifies: strict < on depth, >= on conf
            near_miss(120, 0.6, 0.9),  // depth at threshold, excluded
            near_miss(130, 0.3, 0.5),  // confidence too low
            record(140, &["obstacle_center"]), // no depth reading
        ];
        let agg = aggregate(&records, 0, 1000, None, &params, 1000);
        assert_eq!(agg.almost_crash_count, 2);
        assert_eq!(agg.near_miss_samples.len(), 2);
        assert_eq!(agg.near_miss_samples[0].timestamp, 100);
    }

    #[test]
    fn test_stuck_interval_closed_by_clear() {
        let records = vec![
            record(0, &["proceed"]),
            record(100, &["stop"]),
            record(200, &["stop"]), // gap from anchor 0 reaches 120 here
            record(300, &["proceed"]),
        ];
        let agg = aggregate(&records, 0, 1000, None, &AggregationParams::default(), 400);
        assert_eq!(agg.stuck_intervals.len(), 1);
        let interval = &agg.stuck_intervals[0];
        assert_eq!(interval.start, 0);
        assert_eq!(interval.end, 300);
        assert!(!interval.open_ended);
        assert_eq!(agg.stuck_seconds(), 300);
    }

    #[test]
    fn test_stuck_interval_open_ended_at_as_of() {
        let records = vec![record(0, &["proceed"]), record(150, &["stop"])];
        let agg = aggregate(&records, 0, 1000, None, &AggregationParams::default(), 500);
        assert_eq!(agg.stuck_intervals.len(), 1);
        let interval = &agg.stuck_intervals[0];
        assert_eq!(interval.start, 0);
        assert_eq!(interval.end, 500);
        assert!(interval.open_ended);
    }

    #[test]
    fn test_trailing_silence_counts_as_stuck() {
        // No non-clear record after the clear, but the gap to as_of qualifies.
        let records = vec![record(0, &["proceed"])];
        let agg = aggregate(&records, 0, 1000, None, &AggregationParams::default(), 200);
        assert_eq!(agg.stuck_intervals.len(), 1);
        assert!(agg.stuck_intervals[0].open_ended);
        assert_eq!(agg.stuck_intervals[0].start, 0);
    }

    #[test]
    fn test_simultaneous_clear_and_stop_resolves_as_clearing() {
        let records = vec![
            record(0, &["proceed"]),
            record(130, &["stop", "proceed"]), // tie: treated as clearing
            record(260, &["stop", "clear"]),
        ];
        let agg = aggregate(&records, 0, 1000, None, &AggregationParams::default(), 300);
        assert!(agg.stuck_intervals.is_empty());
    }

    #[test]
    fn test_out_of_order_records_are_sorted() {
        let records = vec![
            record(300, &["proceed"]),
            record(0, &["proceed"]),
            record(150, &["stop"]),
        ];
        let agg = aggregate(&records, 0, 1000, None, &AggregationParams::default(), 400);
        // Sorted view: proceed@0, stop@150, proceed@300 -> one closed interval.
        assert_eq!(agg.stuck_intervals.len(), 1);
        assert!(!agg.stuck_intervals[0].open_ended);
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let records = vec![
            record(0, &["proceed"]),
            near_miss(50, 0.2, 0.8),
            record(200, &["stop"]),
        ];
        let params = AggregationParams::default();
        let a = aggregate(&records, 0, 1000, None, &params, 500);
        let b = aggregate(&records, 0, 1000, None, &params, 500);
        assert_eq!(a, b);
    }

    #[test]
    fn test_event_and_class_counts() {
        let mut rec = record(100, &["obstacle_center", "stop"]);
        rec.detected_classes = vec!["person".to_string(), "bicycle".to_string()];
        let mut rec2 = record(110, &["stop"]);
        rec2.detected_classes = vec!["person".to_string()];
        let agg = aggregate(
            &[rec, rec2],
            0,
            1000,
            None,
            &AggregationParams::default(),
            1000,
        );
        assert_eq!(agg.event_counts["stop"], 2);
        assert_eq!(agg.event_counts["obstacle_center"], 1);
        assert_eq!(agg.class_counts["person"], 2);
        assert_eq!(agg.top_classes(1), vec![("person".to_string(), 2)]);
    }

    #[test]
    fn test_accident_first_time_and_samples() {
        let records = vec![
            record(100, &["stop"]),
            record(200, &["fall", "stop"]),
            record(300, &["collision"]),
        ];
        let agg = aggregate(&records, 0, 1000, None, &AggregationParams::default(), 1000);
        assert_eq!(agg.first_accident_time, Some(200));
        assert_eq!(agg.accident_samples.len(), 2);
    }
}
