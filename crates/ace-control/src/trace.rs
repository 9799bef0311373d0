//! Debug Trace Sink (C12, spec §4.12).
//!
//! When enabled, appends JSONL records per category to `DEBUG_LOG_DIR`. The
//! sink is a bounded `mpsc` channel drained by a single background task;
//! `try_send` drops a record rather than blocking the caller, matching
//! `ace_docker::cache`'s bounded-background-work shape applied to a smaller
//! sink.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceCategory {
    Session,
    Provisioning,
    Health,
    Vpn,
    CircuitBreaker,
    Performance,
    Stress,
    Errors,
}

impl TraceCategory {
    fn file_stem(&self) -> &'static str {
        match self {
            TraceCategory::Session => "session",
            TraceCategory::Provisioning => "provisioning",
            TraceCategory::Health => "health",
            TraceCategory::Vpn => "vpn",
            TraceCategory::CircuitBreaker => "circuit_breaker",
            TraceCategory::Performance => "performance",
            TraceCategory::Stress => "stress",
            TraceCategory::Errors => "errors",
        }
    }
}

#[derive(Debug, Serialize)]
struct TraceRecord {
    session_id: String,
    timestamp: chrono::DateTime<Utc>,
    elapsed_seconds: f64,
    #[serde(flatten)]
    fields: HashMap<String, Value>,
}

struct TraceMessage {
    category: TraceCategory,
    record: TraceRecord,
}

#[derive(Clone)]
pub struct DebugTraceSink {
    sender: Option<mpsc::Sender<TraceMessage>>,
    session_id: String,
    started_at: std::time::Instant,
}

const CHANNEL_CAPACITY: usize = 1024;

impl DebugTraceSink {
    /// Starts the background writer task when `enabled`. A disabled sink
    /// is a cheap no-op sender so callers never need to branch on whether
    /// tracing is active.
    pub fn start(enabled: bool, log_dir: PathBuf, session_id: String) -> Self {
        let started_at = std::time::Instant::now();
        if !enabled {
            return Self {
                sender: None,
                session_id,
                started_at,
            };
        }

        let (tx, mut rx) = mpsc::channel::<TraceMessage>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, "failed to create debug log directory, trace sink disabled");
                return;
            }
            while let Some(msg) = rx.recv().await {
                let path = log_dir.join(format!("{}.jsonl", msg.category.file_stem()));
                let line = match serde_json::to_string(&msg.record) {
                    Ok(mut s) => {
                        s.push('\n');
                        s
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to serialize trace record");
                        continue;
                    }
                };
                match tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
                    Ok(mut file) => {
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(error = %e, path = %path.display(), "failed to write trace record");
                        }
                    }
                    Err(e) => warn!(error = %e, path = %path.display(), "failed to open trace log file"),
                }
            }
        });

        Self {
            sender: Some(tx),
            session_id,
            started_at,
        }
    }

    pub fn disabled(session_id: String) -> Self {
        Self {
            sender: None,
            session_id,
            started_at: std::time::Instant::now(),
        }
    }

    /// Enqueues a record; drops it silently if the channel is full or the
    /// sink is disabled, per spec "dropping records is permitted over
    /// blocking".
    pub fn emit(&self, category: TraceCategory, fields: HashMap<String, Value>) {
        let Some(sender) = &self.sender else { return };
        let record = TraceRecord {
            session_id: self.session_id.clone(),
            timestamp: Utc::now(),
            elapsed_seconds: self.started_at.elapsed().as_secs_f64(),
            fields,
        };
        if sender.try_send(TraceMessage { category, record }).is_err() {
            warn!(category = ?category, "debug trace channel full, dropping record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_sink_does_not_panic_on_emit() {
        let sink = DebugTraceSink::disabled("test-session".to_string());
        sink.emit(TraceCategory::Health, HashMap::new());
    }

    #[tokio::test]
    async fn enabled_sink_writes_a_jsonl_record() {
        let dir = std::env::temp_dir().join(format!("ace-trace-test-{}", uuid::Uuid::new_v4()));
        let sink = DebugTraceSink::start(true, dir.clone(), "test-session".to_string());

        let mut fields = HashMap::new();
        fields.insert("vpn".to_string(), serde_json::json!("vpn1"));
        sink.emit(TraceCategory::Vpn, fields);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let path = dir.join("vpn.jsonl");
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("test-session"));
        assert!(content.contains("vpn1"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
