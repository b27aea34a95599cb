//! Run orchestration: extract, review, execute, seal.
//!
//! The orchestrator exclusively owns the run's log writer and record for the
//! run's duration. Every run ends sealed, and every seal is preceded by the
//! complete event trail, so a reloaded log always tells the full story.

use anyhow::Result;
use std::path::PathBuf;

use crate::error::PipelineError;
use crate::exec::{self, ExecConfig, StepStatus};
use crate::extract;
use crate::review::{self, DecisionSource};
use crate::runlog::{self, OverallStatus, RunEvent, RunLogWriter};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub exec: ExecConfig,
    pub log_dir: PathBuf,
}

/// Final summary printed at the end of every run, however it terminated.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub overall: OverallStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// One line per failed or unattempted step.
    pub failures: Vec<String>,
}

/// Run the full pipeline over raw model text.
///
/// Step failures and user aborts are normal terminations reported in the
/// summary. Errors are reserved for invalid input and log-write failures.
pub fn run_pipeline(
    raw_text: &str,
    source: &mut dyn DecisionSource,
    config: &PipelineConfig,
) -> Result<RunSummary> {
    let run_id = runlog::new_run_id();
    let mut log = RunLogWriter::create(&config.log_dir, &run_id)?;
    tracing::info!(%run_id, log = %log.path().display(), "run started");
    log.append(RunEvent::RunStarted {
        raw_text: raw_text.to_string(),
    })?;

    let steps = match extract::extract(raw_text) {
        Ok(steps) => steps,
        Err(err) => {
            seal(&mut log, OverallStatus::Failed, 0, 0, 0, Some(err.to_string()))?;
            return Err(err.into());
        }
    };
    log.append(RunEvent::StepsExtracted {
        steps: steps.clone(),
    })?;

    let reviewed = review::review(&steps, source, &mut log)?;
    let skipped = reviewed.skipped();
    if reviewed.aborted {
        seal(&mut log, OverallStatus::Aborted, 0, 0, skipped, None)?;
        return Ok(RunSummary {
            run_id,
            overall: OverallStatus::Aborted,
            succeeded: 0,
            failed: 0,
            skipped,
            failures: Vec::new(),
        });
    }

    let outcomes = exec::execute(&reviewed.plan, &config.exec, &mut log)?;
    let succeeded = outcomes
        .iter()
        .filter(|o| o.status == StepStatus::Success)
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| o.status == StepStatus::Failure)
        .count();
    let mut failures = Vec::new();
    for outcome in &outcomes {
        match outcome.status {
            StepStatus::Failure => failures.push(format!(
                "step {} failed: {}",
                outcome.step_index,
                outcome.detail.as_deref().unwrap_or("unknown error")
            )),
            StepStatus::AbortedRun => {
                failures.push(format!("step {} not attempted (run halted)", outcome.step_index))
            }
            StepStatus::Success => {}
        }
    }

    let overall = if failures.is_empty() {
        OverallStatus::Succeeded
    } else {
        OverallStatus::CompletedWithFailures
    };
    seal(&mut log, overall, succeeded, failed, skipped, None)?;
    tracing::info!(%run_id, %overall, succeeded, failed, skipped, "run sealed");

    Ok(RunSummary {
        run_id,
        overall,
        succeeded,
        failed,
        skipped,
        failures,
    })
}

/// Record a run that died before extraction because the generator failed.
pub fn record_generation_failure(
    config: &PipelineConfig,
    err: &PipelineError,
) -> Result<String> {
    let run_id = runlog::new_run_id();
    let mut log = RunLogWriter::create(&config.log_dir, &run_id)?;
    log.append(RunEvent::RunStarted {
        raw_text: String::new(),
    })?;
    tracing::error!(%run_id, %err, "generation failed");
    seal(&mut log, OverallStatus::Failed, 0, 0, 0, Some(err.to_string()))?;
    Ok(run_id)
}

fn seal(
    log: &mut RunLogWriter,
    overall: OverallStatus,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    detail: Option<String>,
) -> Result<(), PipelineError> {
    log.append(RunEvent::RunSealed {
        overall,
        succeeded,
        failed,
        skipped,
        detail,
    })
}
