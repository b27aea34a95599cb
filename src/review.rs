//! Human gating between extraction and execution.
//!
//! Review is an explicit request/response protocol: each step is presented to
//! a [`DecisionSource`], which answers with approve, replace, skip, or abort.
//! Keeping the source behind a trait lets the CLI plug in an interactive
//! prompt while tests script the decisions.
//!
//! Abort policy: an abort discards the whole plan, including steps already
//! approved in this session. Nothing reviewed but unexecuted ever runs after
//! an abort; the audit trail of everything reviewed so far is preserved.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};

use crate::extract::{Step, StepAction};
use crate::runlog::{RunEvent, RunLogWriter};

/// Final decision recorded for a reviewed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Skip,
    Abort,
}

/// Answer from a decision source for one presented step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewChoice {
    /// Keep the step as extracted.
    Approve,
    /// Approve with replacement text: the command line for shell steps, the
    /// body for file steps (the path is kept). Empty text keeps the original.
    Replace(String),
    /// Exclude from the plan; still recorded for audit.
    Skip,
    /// Halt the session and discard the plan.
    Abort,
}

/// A step after review. Immutable once the session moves past it.
#[derive(Debug, Clone, PartialEq)]
pub struct EditedStep {
    pub step: Step,
    pub final_action: StepAction,
    pub decision: Decision,
}

/// The approved, ordered subset of steps eligible for execution. Original
/// indices are retained for audit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<EditedStep>,
}

/// Result of a review session.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub plan: Plan,
    /// Every decision made, including skips and the abort, in review order.
    pub reviews: Vec<EditedStep>,
    pub aborted: bool,
}

impl ReviewOutcome {
    pub fn skipped(&self) -> usize {
        self.reviews
            .iter()
            .filter(|r| r.decision == Decision::Skip)
            .count()
    }
}

/// Supplies a decision for each presented step.
pub trait DecisionSource {
    fn decide(&mut self, step: &Step) -> Result<ReviewChoice>;
}

/// Run the review protocol over extracted steps.
///
/// Each decision is appended to the run log before the next step is shown,
/// so an aborted session still has a complete trail of everything reviewed.
pub fn review(
    steps: &[Step],
    source: &mut dyn DecisionSource,
    log: &mut RunLogWriter,
) -> Result<ReviewOutcome> {
    let mut reviews: Vec<EditedStep> = Vec::new();
    let mut aborted = false;

    for step in steps {
        let choice = source.decide(step)?;
        let (decision, final_action) = match choice {
            ReviewChoice::Approve => (Decision::Approve, step.action.clone()),
            ReviewChoice::Replace(text) => (Decision::Approve, apply_edit(&step.action, text)),
            ReviewChoice::Skip => (Decision::Skip, step.action.clone()),
            ReviewChoice::Abort => (Decision::Abort, step.action.clone()),
        };
        log.append(RunEvent::Reviewed {
            index: step.index,
            original: step.action.clone(),
            edited: final_action.clone(),
            decision,
        })?;
        reviews.push(EditedStep {
            step: step.clone(),
            final_action,
            decision,
        });
        if decision == Decision::Abort {
            aborted = true;
            break;
        }
    }

    let plan = if aborted {
        Plan::default()
    } else {
        Plan {
            steps: reviews
                .iter()
                .filter(|r| r.decision == Decision::Approve)
                .cloned()
                .collect(),
        }
    };

    Ok(ReviewOutcome {
        plan,
        reviews,
        aborted,
    })
}

fn apply_edit(original: &StepAction, text: String) -> StepAction {
    if text.trim().is_empty() {
        return original.clone();
    }
    match original {
        StepAction::Shell { .. } => StepAction::Shell {
            command: text.trim().to_string(),
        },
        StepAction::WriteFile { path, .. } => StepAction::WriteFile {
            path: path.clone(),
            body: text,
        },
    }
}

/// Approves everything unchanged; used by `--yes`.
pub struct AutoApprove;

impl DecisionSource for AutoApprove {
    fn decide(&mut self, _step: &Step) -> Result<ReviewChoice> {
        Ok(ReviewChoice::Approve)
    }
}

/// Scripted decisions for tests; approves once exhausted.
#[cfg(test)]
pub struct ScriptedDecisions {
    choices: std::collections::VecDeque<ReviewChoice>,
}

#[cfg(test)]
impl ScriptedDecisions {
    pub fn new(choices: impl IntoIterator<Item = ReviewChoice>) -> Self {
        Self {
            choices: choices.into_iter().collect(),
        }
    }
}

#[cfg(test)]
impl DecisionSource for ScriptedDecisions {
    fn decide(&mut self, _step: &Step) -> Result<ReviewChoice> {
        Ok(self.choices.pop_front().unwrap_or(ReviewChoice::Approve))
    }
}

/// Interactive prompt on stderr, decisions read from stdin.
pub struct TerminalDecisionSource;

impl DecisionSource for TerminalDecisionSource {
    fn decide(&mut self, step: &Step) -> Result<ReviewChoice> {
        let mut err = io::stderr();
        writeln!(err, "\nstep {} [{}]", step.index, step.action.kind())?;
        match &step.action {
            StepAction::Shell { command } => writeln!(err, "  {command}")?,
            StepAction::WriteFile { path, body } => {
                writeln!(err, "  path: {path}")?;
                for line in body.lines() {
                    writeln!(err, "  | {line}")?;
                }
            }
        }
        loop {
            write!(err, "[a]pprove / [e]dit / [s]kip / [q]uit session> ")?;
            err.flush()?;
            let answer = read_line()?;
            match answer.trim() {
                "a" | "" => return Ok(ReviewChoice::Approve),
                "s" => return Ok(ReviewChoice::Skip),
                "q" => return Ok(ReviewChoice::Abort),
                "e" => return Ok(ReviewChoice::Replace(read_replacement(&step.action)?)),
                other => writeln!(err, "unrecognized choice {other:?}")?,
            }
        }
    }
}

fn read_line() -> Result<String> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read review decision")?;
    Ok(line)
}

fn read_replacement(action: &StepAction) -> Result<String> {
    let mut err = io::stderr();
    match action {
        StepAction::Shell { .. } => {
            write!(err, "replacement command> ")?;
            err.flush()?;
            Ok(read_line()?.trim_end().to_string())
        }
        StepAction::WriteFile { .. } => {
            writeln!(err, "replacement body, end with a line containing only '.'")?;
            let stdin = io::stdin();
            let mut body = String::new();
            for line in stdin.lock().lines() {
                let line = line.context("read replacement body")?;
                if line == "." {
                    break;
                }
                body.push_str(&line);
                body.push('\n');
            }
            Ok(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract;

    fn writer(dir: &tempfile::TempDir) -> RunLogWriter {
        RunLogWriter::create(dir.path(), "review-test").unwrap()
    }

    fn sample_steps() -> Vec<Step> {
        extract("```bash\nmkdir app\ncd app\nnpm init -y\n```").unwrap()
    }

    #[test]
    fn test_all_approve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = writer(&dir);
        let steps = sample_steps();
        let mut source = AutoApprove;
        let outcome = review(&steps, &mut source, &mut log).unwrap();

        assert!(!outcome.aborted);
        assert_eq!(outcome.plan.steps.len(), steps.len());
        for (edited, step) in outcome.plan.steps.iter().zip(&steps) {
            assert_eq!(edited.final_action, step.action);
            assert_eq!(edited.step.index, step.index);
        }
    }

    #[test]
    fn test_skip_preserves_order_and_indices() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = writer(&dir);
        let steps = sample_steps();
        let mut source = ScriptedDecisions::new([
            ReviewChoice::Approve,
            ReviewChoice::Skip,
            ReviewChoice::Approve,
        ]);
        let outcome = review(&steps, &mut source, &mut log).unwrap();

        let indices: Vec<usize> = outcome.plan.steps.iter().map(|s| s.step.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(outcome.skipped(), 1);
    }

    #[test]
    fn test_edit_replaces_command_but_not_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = writer(&dir);
        let steps = sample_steps();
        let mut source = ScriptedDecisions::new([ReviewChoice::Replace("mkdir demo".into())]);
        let outcome = review(&steps, &mut source, &mut log).unwrap();

        let first = &outcome.plan.steps[0];
        assert_eq!(first.step.index, 0);
        assert_eq!(
            first.final_action,
            StepAction::Shell {
                command: "mkdir demo".into()
            }
        );
        // The pre-edit form survives on the step for audit.
        assert_eq!(
            first.step.action,
            StepAction::Shell {
                command: "mkdir app".into()
            }
        );
    }

    #[test]
    fn test_empty_replacement_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = writer(&dir);
        let steps = sample_steps();
        let mut source = ScriptedDecisions::new([ReviewChoice::Replace("   ".into())]);
        let outcome = review(&steps, &mut source, &mut log).unwrap();
        assert_eq!(outcome.plan.steps[0].final_action, steps[0].action);
    }

    #[test]
    fn test_abort_discards_plan_but_keeps_trail() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = writer(&dir);
        let steps = sample_steps();
        let mut source = ScriptedDecisions::new([ReviewChoice::Approve, ReviewChoice::Abort]);
        let outcome = review(&steps, &mut source, &mut log).unwrap();

        assert!(outcome.aborted);
        assert!(outcome.plan.steps.is_empty());
        // Both the approval and the abort were reviewed and logged.
        assert_eq!(outcome.reviews.len(), 2);
        let records = crate::runlog::events_for(dir.path(), "review-test").unwrap();
        assert_eq!(records.len(), 2);
    }
}
