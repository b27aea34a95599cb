//! Durable, append-only audit trail for pipeline runs.
//!
//! One JSONL file per run under the log directory. `append` is the only write
//! operation; every append assigns a monotonically increasing sequence number
//! and flushes, so the trail survives a crash mid-run. A reloaded run with no
//! `run_sealed` event is an incomplete run (`overall == None`).
//!
//! # Log format
//!
//! ```jsonl
//! {"seq":0,"ts_ms":1707900000000,"event":"run_started","raw_text":"..."}
//! {"seq":1,"ts_ms":1707900000004,"event":"steps_extracted","steps":[...]}
//! {"seq":2,"ts_ms":1707900002100,"event":"reviewed","index":0,...}
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;
use crate::exec::Outcome;
use crate::extract::{Step, StepAction};
use crate::review::Decision;

/// How a sealed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Every executed step succeeded.
    Succeeded,
    /// Execution finished but at least one step failed or was not attempted.
    CompletedWithFailures,
    /// The user aborted during review.
    Aborted,
    /// The run failed before execution (bad input or generation failure).
    Failed,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::CompletedWithFailures => write!(f, "completed_with_failures"),
            Self::Aborted => write!(f, "aborted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Events appended over the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        raw_text: String,
    },
    StepsExtracted {
        steps: Vec<Step>,
    },
    Reviewed {
        index: usize,
        original: StepAction,
        edited: StepAction,
        decision: Decision,
    },
    StepStarted {
        index: usize,
    },
    StepFinished {
        outcome: Outcome,
    },
    RunSealed {
        overall: OverallStatus,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        /// Why the run failed before execution, when it did.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// One persisted log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// A review decision as reconstructed from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub index: usize,
    pub original: StepAction,
    pub edited: StepAction,
    pub decision: Decision,
}

/// The full audit trail of one pipeline invocation, folded from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_ms: u64,
    pub raw_text: String,
    pub steps: Vec<Step>,
    pub reviews: Vec<ReviewEntry>,
    pub outcomes: Vec<Outcome>,
    pub ended_ms: Option<u64>,
    /// `None` means the run never sealed (crash or still in progress).
    pub overall: Option<OverallStatus>,
    /// Failure detail from the seal, for runs that died before execution.
    pub detail: Option<String>,
}

/// Per-run log writer, opened at run start and owned by the orchestrator.
pub struct RunLogWriter {
    path: PathBuf,
    file: File,
    next_seq: u64,
}

impl RunLogWriter {
    pub fn create(dir: &Path, run_id: &str) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir).map_err(|err| PipelineError::LogWrite(err.to_string()))?;
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| PipelineError::LogWrite(err.to_string()))?;
        Ok(Self {
            path,
            file,
            next_seq: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush. A write failure is fatal to the run.
    pub fn append(&mut self, event: RunEvent) -> Result<(), PipelineError> {
        let record = LogRecord {
            seq: self.next_seq,
            ts_ms: now_epoch_ms(),
            event,
        };
        let line = serde_json::to_string(&record)
            .map_err(|err| PipelineError::LogWrite(err.to_string()))?;
        writeln!(self.file, "{line}").map_err(|err| PipelineError::LogWrite(err.to_string()))?;
        self.file
            .flush()
            .map_err(|err| PipelineError::LogWrite(err.to_string()))?;
        self.next_seq += 1;
        Ok(())
    }
}

/// Fresh run id, unique enough for one machine's log directory.
pub fn new_run_id() -> String {
    format!("run-{}-{}", now_epoch_ms(), std::process::id())
}

/// Default log directory, overridable with `--log-dir`.
pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("projgen")
        .join("runs")
}

/// List run ids present in the log directory, oldest first.
pub fn list_runs(dir: &Path) -> Result<Vec<String>> {
    let mut runs = Vec::new();
    if !dir.exists() {
        return Ok(runs);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            runs.push(stem.to_string());
        }
    }
    runs.sort();
    Ok(runs)
}

/// Read all log records for a run. Corrupt lines are skipped with a warning
/// so a damaged trail stays inspectable.
pub fn events_for(dir: &Path, run_id: &str) -> Result<Vec<LogRecord>> {
    let path = dir.join(format!("{run_id}.jsonl"));
    let file = File::open(&path).with_context(|| format!("open run log {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of run log", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(
                    line = line_num + 1,
                    %err,
                    "skip corrupt run log entry"
                );
            }
        }
    }
    Ok(records)
}

/// Reconstruct a [`RunRecord`] by folding a run's events.
pub fn load(dir: &Path, run_id: &str) -> Result<RunRecord> {
    let records = events_for(dir, run_id)?;
    let mut run = RunRecord {
        run_id: run_id.to_string(),
        started_ms: 0,
        raw_text: String::new(),
        steps: Vec::new(),
        reviews: Vec::new(),
        outcomes: Vec::new(),
        ended_ms: None,
        overall: None,
        detail: None,
    };
    for record in records {
        match record.event {
            RunEvent::RunStarted { raw_text } => {
                run.started_ms = record.ts_ms;
                run.raw_text = raw_text;
            }
            RunEvent::StepsExtracted { steps } => run.steps = steps,
            RunEvent::Reviewed {
                index,
                original,
                edited,
                decision,
            } => run.reviews.push(ReviewEntry {
                index,
                original,
                edited,
                decision,
            }),
            RunEvent::StepStarted { .. } => {}
            RunEvent::StepFinished { outcome } => run.outcomes.push(outcome),
            RunEvent::RunSealed {
                overall, detail, ..
            } => {
                run.ended_ms = Some(record.ts_ms);
                run.overall = Some(overall);
                run.detail = detail;
            }
        }
    }
    Ok(run)
}

fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
