//! Monitoring runtime: stdin JSONL feed into the ingestion loop
//!
//! Development harness for the core. Reads one `EventRecord` per line from
//! stdin and pushes it through the watchdog; alerts go to the logging
//! notifier. The production transport and SMS collaborators replace the
//! stdin reader and `LogNotifier` without touching the core.

use pathsense::collab::{AlertNotifier, EventStore, LogNotifier, MemoryEventStore};
use pathsense::config::MonitorConfig;
use pathsense::ingest::run_ingestion;
use pathsense::types::EventRecord;
use pathsense::watchdog::Watchdog;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = MonitorConfig::from_env();
    log::info!(
        "starting pathsense monitor (stuck: {}s, inactivity: {}s, tick: {}ms)",
        config.stuck_alert_s,
        config.inactivity_s,
        config.tick_interval_ms
    );

    let watchdog = Arc::new(Watchdog::new(config.clone()));
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let notifier: Arc<dyn AlertNotifier> = Arc::new(LogNotifier);

    let (tx, rx) = mpsc::channel::<EventRecord>(config.channel_buffer);
    let ingestion = tokio::spawn(run_ingestion(
        rx,
        Arc::clone(&watchdog),
        Arc::clone(&store),
        notifier,
        config.tick_interval_ms,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut parse_failures = 0u64;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<EventRecord>(line) {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        parse_failures += 1;
                        log::debug!("unparseable line dropped: {}", e);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::error!("stdin read error: {}", e);
                break;
            }
        }
    }

    if parse_failures > 0 {
        log::warn!("{} line(s) failed to parse", parse_failures);
    }

    // Close the channel so the ingestion loop drains and exits.
    drop(tx);
    if let Err(e) = ingestion.await {
        log::error!("ingestion task failed: {}", e);
    }
}
