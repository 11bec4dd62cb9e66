//! Natural-language metric resolution for authorized contacts
//!
//! Maps a free-text question to one of a closed set of metrics, resolves the
//! time range, authorizes the requester, aggregates (through the store's
//! read-through cache when present), and renders a deterministic one-sentence
//! answer plus supporting samples.
//!
//! Question parsing is deliberately a flat ranked rule table, first match
//! wins; an unmatched question produces an explicit "not understood" answer,
//! never a guess.

use crate::aggregate::{aggregate, Aggregation, AggregationParams, SAMPLE_LIMIT};
use crate::collab::{AuthorizationProvider, EventStore};
use crate::error::MonitorError;
use crate::watchdog::NowFn;
use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

const DAY_S: i64 = 86_400;

/// Closed metric set. Anything outside it is "not understood".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AlmostCrashCount,
    StuckMinutes,
    StuckIntervalsList,
    AccidentOccurred,
    TopObstacleClasses,
    NearMissSamples,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::AlmostCrashCount => "almost_crash_count",
            Metric::StuckMinutes => "stuck_minutes",
            Metric::StuckIntervalsList => "stuck_intervals_list",
            Metric::AccidentOccurred => "accident_occurred",
            Metric::TopObstacleClasses => "top_obstacle_classes",
            Metric::NearMissSamples => "near_miss_samples",
        }
    }
}

fn near_miss_phrase(q: &str) -> bool {
    ["almost crash", "near miss", "near-miss", "close call", "collision warning", "almost hit"]
        .iter()
        .any(|kw| q.contains(kw))
}

fn stuck_phrase(q: &str) -> bool {
    ["stuck", "not moving", "stationary", "standing still"]
        .iter()
        .any(|kw| q.contains(kw))
}

fn wants_listing(q: &str) -> bool {
    ["show", "list", "sample", "example", "which ones", "when"]
        .iter()
        .any(|kw| q.contains(kw))
}

/// Resolve a question to a metric via the ranked rule table.
///
/// Case-insensitive phrase matching, evaluated top to bottom; the first rule
/// that matches wins.
pub fn resolve_metric(question: &str) -> Option<Metric> {
    let q = question.to_lowercase();
    let rules: [(fn(&str) -> bool, Metric); 6] = [
        (
            |q| near_miss_phrase(q) && wants_listing(q),
            Metric::NearMissSamples,
        ),
        (near_miss_phrase, Metric::AlmostCrashCount),
        (
            |q| stuck_phrase(q) && (q.contains("interval") || wants_listing(q)),
            Metric::StuckIntervalsList,
        ),
        (stuck_phrase, Metric::StuckMinutes),
        (
            |q| {
                ["accident", "fell", "fall", "crashed", "collision", "impact", "hurt"]
                    .iter()
                    .any(|kw| q.contains(kw))
            },
            Metric::AccidentOccurred,
        ),
        (
            |q| {
                q.contains("obstacle")
                    || q.contains("classes")
                    || q.contains("run into")
                    || has_word(q, "top")
            },
            Metric::TopObstacleClasses,
        ),
    ];
    rules
        .iter()
        .find(|(matches, _)| matches(&q))
        .map(|(_, metric)| *metric)
}

// Whole-word match; "top" must not fire on "stop".
fn has_word(q: &str, word: &str) -> bool {
    q.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|w| w == word)
}

/// Like [`resolve_metric`], but an unmatched question is an error carrying
/// the original text. For callers that treat resolution failure as a fault
/// instead of an answer.
pub fn require_metric(question: &str) -> Result<Metric, MonitorError> {
    resolve_metric(question)
        .ok_or_else(|| MonitorError::UnresolvedMetric(question.to_string()))
}

/// Resolved query window, Unix seconds, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

fn parse_offset(tz: Option<&str>) -> Result<FixedOffset, MonitorError> {
    match tz {
        None | Some("") | Some("UTC") | Some("utc") | Some("Z") => Ok(Utc.fix()),
        Some(s) => s
            .parse::<FixedOffset>()
            .map_err(|_| MonitorError::range(format!("unrecognized timezone: {}", s))),
    }
}

fn local_midnight(now: i64, offset: FixedOffset, days_back: i64) -> Result<i64, MonitorError> {
    let local = offset
        .timestamp_opt(now, 0)
        .single()
        .ok_or_else(|| MonitorError::range("timestamp out of range"))?;
    let date = local.date_naive() - chrono::Duration::days(days_back);
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| MonitorError::range("timestamp out of range"))?;
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| MonitorError::range("ambiguous local midnight"))
}

fn parse_absolute(value: &str, offset: FixedOffset) -> Result<i64, MonitorError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    // Bare dates resolve to local midnight in the supplied timezone.
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| MonitorError::range("timestamp out of range"))?;
        return offset
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.timestamp())
            .ok_or_else(|| MonitorError::range("ambiguous local midnight"));
    }
    Err(MonitorError::range(format!(
        "unparseable timestamp: {}",
        value
    )))
}

/// Resolve symbolic or absolute range endpoints against the caller's
/// timezone. With neither endpoint given, defaults to the last 24 hours
/// ending now. `end <= start` is rejected before any aggregation work.
pub fn resolve_time_range(
    time_start: Option<&str>,
    time_end: Option<&str>,
    tz: Option<&str>,
    now: i64,
) -> Result<TimeRange, MonitorError> {
    let offset = parse_offset(tz)?;

    // `yesterday` with no explicit end means that whole day.
    if time_start == Some("yesterday") && time_end.is_none() {
        return Ok(TimeRange {
            start: local_midnight(now, offset, 1)?,
            end: local_midnight(now, offset, 0)?,
        });
    }

    let end = match time_end {
        None | Some("now") => now,
        // "up to today" means the end of today, the next local midnight.
        Some("today") => local_midnight(now, offset, -1)?,
        Some("yesterday") => local_midnight(now, offset, 0)?,
        Some(value) => parse_absolute(value, offset)?,
    };

    let start = match time_start {
        None => end - DAY_S,
        Some("now") => now,
        Some("today") => local_midnight(now, offset, 0)?,
        Some("yesterday") => local_midnight(now, offset, 1)?,
        Some("last_7d") | Some("last_week") => now - 7 * DAY_S,
        Some(value) => parse_absolute(value, offset)?,
    };

    if end <= start {
        return Err(MonitorError::range(format!(
            "end ({}) is not after start ({})",
            end, start
        )));
    }
    Ok(TimeRange { start, end })
}

/// A question from an emergency contact about one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub requester_id: String,
    pub client_id: String,
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub time_start: Option<String>,
    #[serde(default)]
    pub time_end: Option<String>,
    #[serde(default)]
    pub tz: Option<String>,
}

/// Rendered answer plus the evidence behind it.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    /// None when the question was not understood.
    pub metric: Option<Metric>,
    pub time_start: i64,
    pub time_end: i64,
    pub aggregation: Option<Aggregation>,
    pub samples: Vec<serde_json::Value>,
}

/// Resolves questions to metrics and evaluates them against the store.
pub struct MetricResolver {
    store: Arc<dyn EventStore>,
    auth: Arc<dyn AuthorizationProvider>,
    params: AggregationParams,
    now_fn: NowFn,
}

impl MetricResolver {
    pub fn new(
        store: Arc<dyn EventStore>,
        auth: Arc<dyn AuthorizationProvider>,
        params: AggregationParams,
    ) -> Self {
        Self::with_now_fn(store, auth, params, Box::new(|| Utc::now().timestamp()))
    }

    pub fn with_now_fn(
        store: Arc<dyn EventStore>,
        auth: Arc<dyn AuthorizationProvider>,
        params: AggregationParams,
        now_fn: NowFn,
    ) -> Self {
        Self {
            store,
            auth,
            params,
            now_fn,
        }
    }

    /// Answer one question. Authorization runs before anything else; a
    /// refused requester learns nothing about the data, not even whether the
    /// question parses.
    pub async fn handle_query(&self, request: &QueryRequest) -> Result<QueryAnswer, MonitorError> {
        let authorized = self
            .auth
            .is_authorized(&request.client_id, &request.requester_id)
            .await?;
        if !authorized {
            return Err(MonitorError::Authorization {
                client_id: request.client_id.clone(),
                requester_id: request.requester_id.clone(),
            });
        }

        let now = (self.now_fn)();
        let range = resolve_time_range(
            request.time_start.as_deref(),
            request.time_end.as_deref(),
            request.tz.as_deref(),
            now,
        )?;

        let metric = match require_metric(&request.question) {
            Ok(metric) => metric,
            Err(err) => {
                log::debug!("{}", err);
                return Ok(QueryAnswer {
                    answer: "Question not understood. Ask about near misses, stuck time, \
                             accidents, or obstacle classes."
                        .to_string(),
                    metric: None,
                    time_start: range.start,
                    time_end: range.end,
                    aggregation: None,
                    samples: Vec::new(),
                });
            }
        };

        let aggregation = self
            .load_aggregation(&request.client_id, request.session_id.as_deref(), range, now)
            .await?;

        let (answer, samples) = render_answer(metric, &aggregation);
        Ok(QueryAnswer {
            answer,
            metric: Some(metric),
            time_start: range.start,
            time_end: range.end,
            aggregation: Some(aggregation),
            samples,
        })
    }

    async fn load_aggregation(
        &self,
        client_id: &str,
        session_id: Option<&str>,
        range: TimeRange,
        as_of: i64,
    ) -> Result<Aggregation, MonitorError> {
        if let Some(cached) = self
            .store
            .cached_aggregation(client_id, range.start, range.end, session_id)
            .await
        {
            log::debug!(
                "aggregation cache hit for {} [{}, {})",
                client_id,
                range.start,
                range.end
            );
            return Ok(cached);
        }

        let records = self
            .store
            .query(client_id, session_id, range.start, range.end)
            .await?;
        let aggregation = aggregate(
            &records,
            range.start,
            range.end,
            session_id,
            &self.params,
            as_of.min(range.end),
        );
        self.store.cache_aggregation(client_id, &aggregation).await;
        Ok(aggregation)
    }
}

fn fmt_ts(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn interval_samples(aggregation: &Aggregation) -> Vec<serde_json::Value> {
    aggregation
        .stuck_intervals
        .iter()
        .take(SAMPLE_LIMIT)
        .map(|i| {
            json!({
                "start": fmt_ts(i.start),
                "end": fmt_ts(i.end),
                "duration_s": i.duration_s(),
                "open_ended": i.open_ended,
            })
        })
        .collect()
}

fn record_samples(records: &[crate::types::EventRecord]) -> Vec<serde_json::Value> {
    records
        .iter()
        .take(SAMPLE_LIMIT)
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect()
}

/// Deterministic one-sentence rendering of a metric result.
fn render_answer(metric: Metric, aggregation: &Aggregation) -> (String, Vec<serde_json::Value>) {
    match metric {
        Metric::AlmostCrashCount => {
            let n = aggregation.almost_crash_count;
            (
                format!("{} near-miss event{} in the specified time window.", n, plural(n)),
                record_samples(&aggregation.near_miss_samples),
            )
        }
        Metric::StuckMinutes => {
            let minutes = aggregation.stuck_seconds() as f64 / 60.0;
            (
                format!(
                    "{:.1} minutes without a clear path in the specified time window.",
                    minutes
                ),
                interval_samples(aggregation),
            )
        }
        Metric::StuckIntervalsList => {
            let n = aggregation.stuck_intervals.len();
            (
                format!("{} stuck interval{} found.", n, plural(n)),
                interval_samples(aggregation),
            )
        }
        Metric::AccidentOccurred => match aggregation.first_accident_time {
            Some(t) => (
                format!("Accident indicators detected at {}.", fmt_ts(t)),
                record_samples(&aggregation.accident_samples),
            ),
            None => (
                "No accident indicators in the specified time window.".to_string(),
                Vec::new(),
            ),
        },
        Metric::TopObstacleClasses => {
            let top = aggregation.top_classes(SAMPLE_LIMIT);
            if top.is_empty() {
                (
                    "No object classes detected in the specified time window.".to_string(),
                    Vec::new(),
                )
            } else {
                let listing = top
                    .iter()
                    .map(|(class, count)| format!("{} ({})", class, count))
                    .collect::<Vec<_>>()
                    .join(", ");
                let samples = top
                    .iter()
                    .map(|(class, count)| json!({ "class": class, "count": count }))
                    .collect();
                (format!("Most frequent obstacle classes: {}.", listing), samples)
            }
        }
        Metric::NearMissSamples => {
            let shown = aggregation.near_miss_samples.len();
            let total = aggregation.almost_crash_count;
            (
                format!("Showing {} of {} near-miss event{}.", shown, total, plural(total)),
                record_samples(&aggregation.near_miss_samples),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_rules_first_match_wins() {
        assert_eq!(
            resolve_metric("How many times did he almost crash today?"),
            Some(Metric::AlmostCrashCount)
        );
        assert_eq!(
            resolve_metric("Show me the near miss events"),
            Some(Metric::NearMissSamples)
        );
        assert_eq!(
            resolve_metric("How long was she stuck?"),
            Some(Metric::StuckMinutes)
        );
        assert_eq!(
            resolve_metric("Show the stuck intervals from yesterday"),
            Some(Metric::StuckIntervalsList)
        );
        assert_eq!(
            resolve_metric("Did he fall or have an accident?"),
            Some(Metric::AccidentOccurred)
        );
        assert_eq!(
            resolve_metric("What obstacles did she run into most?"),
            Some(Metric::TopObstacleClasses)
        );
    }

    #[test]
    fn test_unmatched_question_is_none() {
        assert_eq!(resolve_metric("What is the weather like?"), None);
        assert_eq!(resolve_metric(""), None);
    }

    #[test]
    fn test_top_matches_whole_word_only() {
        // "stop" contains "top" but must not read as a class listing.
        assert_eq!(resolve_metric("How often did he stop?"), None);
        assert_eq!(
            resolve_metric("What was at the top?"),
            Some(Metric::TopObstacleClasses)
        );
    }

    #[test]
    fn test_require_metric_carries_question() {
        assert_eq!(require_metric("stuck?").unwrap(), Metric::StuckMinutes);
        let err = require_metric("What is the weather like?").unwrap_err();
        match err {
            MonitorError::UnresolvedMetric(question) => {
                assert_eq!(question, "What is the weather like?");
            }
            other => panic!("expected unresolved metric, got {:?}", other),
        }
    }

    #[test]
    fn test_time_range_default_last_24h() {
        let now = 1_700_000_000;
        let range = resolve_time_range(None, None, None, now).unwrap();
        assert_eq!(range.end, now);
        assert_eq!(range.start, now - DAY_S);
    }

    #[test]
    fn test_time_range_today() {
        // 2023-11-14T22:13:20Z
        let now = 1_700_000_000;
        let range = resolve_time_range(Some("today"), None, Some("UTC"), now).unwrap();
        assert_eq!(range.end, now);
        assert_eq!(range.start % DAY_S, 0);
        assert!(now - range.start < DAY_S);
    }

    #[test]
    fn test_time_range_end_today_is_next_midnight() {
        let now = 1_700_000_000;
        let range =
            resolve_time_range(Some("yesterday"), Some("today"), Some("UTC"), now).unwrap();
        assert_eq!(range.end % DAY_S, 0);
        assert!(range.end > now);
        assert_eq!(range.end - range.start, 2 * DAY_S);
    }

    #[test]
    fn test_time_range_yesterday_is_whole_day() {
        let now = 1_700_000_000;
        let range = resolve_time_range(Some("yesterday"), None, None, now).unwrap();
        assert_eq!(range.end - range.start, DAY_S);
        assert_eq!(range.start % DAY_S, 0);
        assert!(range.end <= now);
    }

    #[test]
    fn test_time_range_last_7d() {
        let now = 1_700_000_000;
        let range = resolve_time_range(Some("last_7d"), None, None, now).unwrap();
        assert_eq!(range.start, now - 7 * DAY_S);
        assert_eq!(range.end, now);
    }

    #[test]
    fn test_time_range_absolute_rfc3339() {
        let range = resolve_time_range(
            Some("2023-11-01T00:00:00Z"),
            Some("2023-11-02T00:00:00Z"),
            None,
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(range.end - range.start, DAY_S);
    }

    #[test]
    fn test_time_range_end_before_start_rejected() {
        let err = resolve_time_range(
            Some("2023-11-02T00:00:00Z"),
            Some("2023-11-01T00:00:00Z"),
            None,
            1_700_000_000,
        )
        .unwrap_err();
        assert!(matches!(err, MonitorError::Range(_)));
    }

    #[test]
    fn test_time_range_fixed_offset_midnight() {
        let now = 1_700_000_000;
        let utc = resolve_time_range(Some("today"), None, Some("UTC"), now).unwrap();
        let shifted = resolve_time_range(Some("today"), None, Some("+05:30"), now).unwrap();
        assert_ne!(utc.start, shifted.start);
    }

    #[test]
    fn test_unrecognized_timezone_rejected() {
        let err = resolve_time_range(None, None, Some("Mars/Olympus"), 1_700_000_000).unwrap_err();
        assert!(matches!(err, MonitorError::Range(_)));
    }
}
