//! Structured event logging for pipeline runs.
//!
//! Writes append-only JSONL to `{state_dir}/runs/{run_id}/events.jsonl`.
//! Independent of `RUST_LOG`: these lines are a product artifact, not
//! diagnostics.

use foreman_core::clock::now_rfc3339;
use foreman_core::{PipelineType, ScopeToken, TokenUsage};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::stage::PipelineStage;

// ── Event types ──

/// A run event. Serialized as tagged JSON (`"type": "run_start"`, etc.).
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStart {
        run_id: String,
        pipeline_type: PipelineType,
        stages: Vec<PipelineStage>,
        resumed: bool,
    },
    StageStart {
        stage: PipelineStage,
    },
    StageCompleted {
        stage: PipelineStage,
        duration_ms: u64,
        tokens: TokenUsage,
    },
    StageFailed {
        stage: PipelineStage,
        duration_ms: u64,
        error: String,
    },
    StageSkipped {
        stage: PipelineStage,
        reason: String,
    },
    StagePaused {
        stage: PipelineStage,
        status: String,
    },
    PolicyDenied {
        fix_id: String,
        operation: String,
        required_scope: Option<ScopeToken>,
        reason: String,
    },
    RunCompleted {
        stages_completed: usize,
        total_tokens: TokenUsage,
    },
    RunFailed {
        stage: Option<PipelineStage>,
        error: String,
    },
    RunCancelled {
        stages_completed: usize,
    },
}

/// Wrapper that adds sequence number and timestamp to each event.
#[derive(Debug, Serialize)]
pub struct FullEvent {
    pub seq: u32,
    pub ts: String,
    #[serde(flatten)]
    pub event: Event,
}

// ── EventLogger ──

/// Append-only JSONL event writer. Without a state directory every record is
/// dropped.
pub struct EventLogger {
    jsonl_path: Option<PathBuf>,
    seq: u32,
}

impl EventLogger {
    /// Path: `{state_dir}/runs/{run_id}/events.jsonl`. Sequence numbers continue
    /// after any lines already in the file, so a resumed run appends.
    pub fn new(state_dir: Option<&Path>, run_id: &str) -> Self {
        let jsonl_path = state_dir.map(|d| events_path(d, run_id));
        let seq = jsonl_path.as_deref().map(count_lines).unwrap_or(0);
        Self { jsonl_path, seq }
    }

    /// Record an event. Best-effort: silently ignores write failures.
    pub fn record(&mut self, event: Event) {
        let Some(path) = &self.jsonl_path else {
            return;
        };
        let full = FullEvent {
            seq: self.seq,
            ts: now_rfc3339(),
            event,
        };
        self.seq += 1;

        if let Ok(line) = serde_json::to_string(&full) {
            let _ = append_line(path, &line);
        }
    }
}

pub fn events_path(state_dir: &Path, run_id: &str) -> PathBuf {
    state_dir.join("runs").join(run_id).join("events.jsonl")
}

fn count_lines(path: &Path) -> u32 {
    fs::File::open(path)
        .map(|f| BufReader::new(f).lines().count() as u32)
        .unwrap_or(0)
}

/// Append a single line to a file, creating parent dirs if needed.
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_is_tagged() {
        let event = Event::StageSkipped {
            stage: PipelineStage::Docs,
            reason: "no docs for security scans".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"stage_skipped""#));
        assert!(json.contains(r#""stage":"docs""#));
    }

    #[test]
    fn full_event_includes_seq_and_ts() {
        let full = FullEvent {
            seq: 5,
            ts: "2026-02-18T10:00:00Z".into(),
            event: Event::StageStart {
                stage: PipelineStage::Plans,
            },
        };
        let json = serde_json::to_string(&full).unwrap();
        assert!(json.contains(r#""seq":5"#));
        assert!(json.contains(r#""ts":"2026-02-18T10:00:00Z""#));
        assert!(json.contains(r#""type":"stage_start""#));
    }

    #[test]
    fn logger_appends_and_resumes_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(Some(dir.path()), "run-1");
        logger.record(Event::StageStart {
            stage: PipelineStage::Audit,
        });
        logger.record(Event::RunCancelled { stages_completed: 0 });

        let mut resumed = EventLogger::new(Some(dir.path()), "run-1");
        resumed.record(Event::StageStart {
            stage: PipelineStage::Issues,
        });

        let content = fs::read_to_string(events_path(dir.path(), "run-1")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["seq"], 0);
        assert_eq!(lines[2]["seq"], 2);
        assert_eq!(lines[1]["type"], "run_cancelled");
    }

    #[test]
    fn logger_without_state_dir_is_silent() {
        let mut logger = EventLogger::new(None, "run-1");
        logger.record(Event::StageStart {
            stage: PipelineStage::Audit,
        });
        assert!(logger.jsonl_path.is_none());
    }
}
