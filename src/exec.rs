//! Sequential execution of an approved plan with failure isolation.
//!
//! Steps run one at a time; later steps may depend on filesystem state left
//! by earlier ones, so there is no parallelism here. A failing step produces
//! a failure outcome and never an error: the continuation policy decides
//! whether the rest of the plan still runs.
//!
//! Working-directory policy is an explicit knob. `Persist` matches the
//! upstream model output conventions: a bare `cd <dir>` step updates a
//! threaded working directory instead of spawning a shell, so later steps see
//! it. `Isolated` gives every command a fresh shell rooted at the configured
//! directory. Environment variables are never threaded in either mode.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::extract::StepAction;
use crate::review::Plan;
use crate::runlog::{RunEvent, RunLogWriter};
use crate::util::truncate_bytes;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_SNIPPET_BYTES: usize = 2048;

/// Result status for one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    /// The run halted before this step was attempted.
    AbortedRun,
}

/// Recorded result of attempting one step. Append-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub step_index: usize,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_snippet: Option<String>,
}

/// Whether execution proceeds past a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationPolicy {
    /// Keep going to maximize partial progress (default).
    Continue,
    /// Mark the remaining steps aborted without attempting them.
    Halt,
}

/// Whether `cd` steps thread a working directory across the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwdPolicy {
    Persist,
    Isolated,
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub step_timeout: Duration,
    pub continuation: ContinuationPolicy,
    pub cwd_policy: CwdPolicy,
    /// Starting working directory for the run.
    pub root: PathBuf,
}

impl ExecConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            step_timeout: Duration::from_secs(120),
            continuation: ContinuationPolicy::Continue,
            cwd_policy: CwdPolicy::Persist,
            root,
        }
    }
}

/// Execute the plan in order, producing one outcome per step.
///
/// Only log-write failures surface as errors; everything a step does wrong
/// becomes a failure outcome.
pub fn execute(
    plan: &Plan,
    config: &ExecConfig,
    log: &mut RunLogWriter,
) -> Result<Vec<Outcome>, PipelineError> {
    let mut outcomes = Vec::with_capacity(plan.steps.len());
    let mut cwd = config.root.clone();
    let mut halted = false;

    for edited in &plan.steps {
        let index = edited.step.index;
        if halted {
            let outcome = Outcome {
                step_index: index,
                status: StepStatus::AbortedRun,
                exit_code: None,
                detail: Some("run halted by earlier failure".to_string()),
                duration_ms: 0,
                stdout_snippet: None,
                stderr_snippet: None,
            };
            log.append(RunEvent::StepFinished {
                outcome: outcome.clone(),
            })?;
            outcomes.push(outcome);
            continue;
        }

        log.append(RunEvent::StepStarted { index })?;
        let started = Instant::now();
        let outcome = match &edited.final_action {
            StepAction::Shell { command } => {
                if config.cwd_policy == CwdPolicy::Persist {
                    if let Some(target) = cd_target(command) {
                        let outcome = change_dir(index, &mut cwd, &target, started);
                        log.append(RunEvent::StepFinished {
                            outcome: outcome.clone(),
                        })?;
                        if outcome.status == StepStatus::Failure
                            && config.continuation == ContinuationPolicy::Halt
                        {
                            halted = true;
                        }
                        outcomes.push(outcome);
                        continue;
                    }
                }
                run_shell(index, command, &cwd, config.step_timeout, started)
            }
            StepAction::WriteFile { path, body } => write_file(index, &cwd, path, body, started),
        };

        tracing::debug!(
            index,
            status = ?outcome.status,
            duration_ms = outcome.duration_ms,
            "step finished"
        );
        log.append(RunEvent::StepFinished {
            outcome: outcome.clone(),
        })?;
        if outcome.status == StepStatus::Failure
            && config.continuation == ContinuationPolicy::Halt
        {
            halted = true;
        }
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

/// Bare `cd <dir>`; anything more complex (`cd a && b`) runs in the shell.
fn cd_target(command: &str) -> Option<String> {
    let tokens = shell_words::split(command).ok()?;
    if tokens.len() == 2 && tokens[0] == "cd" {
        return Some(tokens[1].clone());
    }
    None
}

fn change_dir(index: usize, cwd: &mut PathBuf, target: &str, started: Instant) -> Outcome {
    let candidate = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        cwd.join(target)
    };
    match candidate.canonicalize() {
        Ok(resolved) if resolved.is_dir() => {
            *cwd = resolved;
            Outcome {
                step_index: index,
                status: StepStatus::Success,
                exit_code: None,
                detail: Some(format!("changed directory to {}", cwd.display())),
                duration_ms: elapsed_ms(started),
                stdout_snippet: None,
                stderr_snippet: None,
            }
        }
        Ok(resolved) => failure(
            index,
            format!("not a directory: {}", resolved.display()),
            started,
        ),
        Err(err) => failure(
            index,
            format!("cd {}: {}", candidate.display(), err),
            started,
        ),
    }
}

fn run_shell(
    index: usize,
    command: &str,
    cwd: &Path,
    timeout: Duration,
    started: Instant,
) -> Outcome {
    // Each step gets its own process group so a timeout can kill the shell
    // and every descendant it spawned, not just the shell itself.
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return failure(index, format!("spawn failed: {err}"), started),
    };

    // Drain pipes on threads so a chatty command cannot deadlock the poll loop.
    let stdout_handle = drain(child.stdout.take());
    let stderr_handle = drain(child.stderr.take());

    let deadline = started + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => {
                kill_group(&mut child);
                return failure(index, format!("wait failed: {err}"), started);
            }
        }
        if Instant::now() >= deadline {
            kill_group(&mut child);
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let stdout_snippet = snippet(&stdout);
    let stderr_snippet = snippet(&stderr);

    match status {
        None => Outcome {
            step_index: index,
            status: StepStatus::Failure,
            exit_code: None,
            detail: Some(format!("timeout after {}s", timeout.as_secs_f64())),
            duration_ms: elapsed_ms(started),
            stdout_snippet,
            stderr_snippet,
        },
        Some(status) if status.success() => Outcome {
            step_index: index,
            status: StepStatus::Success,
            exit_code: status.code(),
            detail: None,
            duration_ms: elapsed_ms(started),
            stdout_snippet,
            stderr_snippet,
        },
        Some(status) => Outcome {
            step_index: index,
            status: StepStatus::Failure,
            exit_code: status.code(),
            detail: Some(match status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            }),
            duration_ms: elapsed_ms(started),
            stdout_snippet,
            stderr_snippet,
        },
    }
}

/// Kill the step's whole process group. Descendants would otherwise outlive
/// the shell, keep running, and hold the output pipes open past the timeout.
fn kill_group(child: &mut Child) {
    let pgid = child.id() as i32;
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.wait();
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn write_file(index: usize, cwd: &Path, path: &str, body: &str, started: Instant) -> Outcome {
    let dest = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        cwd.join(path)
    };
    match write_file_atomic(&dest, body) {
        Ok(()) => Outcome {
            step_index: index,
            status: StepStatus::Success,
            exit_code: None,
            detail: Some(format!("wrote {}", dest.display())),
            duration_ms: elapsed_ms(started),
            stdout_snippet: None,
            stderr_snippet: None,
        },
        Err(err) => failure(index, format!("write {}: {}", dest.display(), err), started),
    }
}

/// Write through a temp file in the destination directory so a failed write
/// never leaves a truncated file behind.
fn write_file_atomic(dest: &Path, body: &str) -> std::io::Result<()> {
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }
    let dir = parent.unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

fn snippet(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    Some(truncate_bytes(bytes, MAX_SNIPPET_BYTES))
}

fn failure(index: usize, detail: String, started: Instant) -> Outcome {
    Outcome {
        step_index: index,
        status: StepStatus::Failure,
        exit_code: None,
        detail: Some(detail),
        duration_ms: elapsed_ms(started),
        stdout_snippet: None,
        stderr_snippet: None,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{SourceSpan, Step};
    use crate::review::{Decision, EditedStep};

    fn plan_of(actions: Vec<StepAction>) -> Plan {
        Plan {
            steps: actions
                .into_iter()
                .enumerate()
                .map(|(index, action)| EditedStep {
                    step: Step {
                        index,
                        action: action.clone(),
                        span: SourceSpan { start: 0, end: 0 },
                    },
                    final_action: action,
                    decision: Decision::Approve,
                })
                .collect(),
        }
    }

    fn shell(command: &str) -> StepAction {
        StepAction::Shell {
            command: command.to_string(),
        }
    }

    fn setup(dir: &tempfile::TempDir) -> (ExecConfig, RunLogWriter) {
        let config = ExecConfig::new(dir.path().to_path_buf());
        let log = RunLogWriter::create(&dir.path().join("logs"), "exec-test").unwrap();
        (config, log)
    }

    #[test]
    fn test_failure_isolation_with_continue_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut log) = setup(&dir);
        let plan = plan_of(vec![shell("true"), shell("false"), shell("true")]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();

        let statuses: Vec<StepStatus> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Success, StepStatus::Failure, StepStatus::Success]
        );
        assert_eq!(outcomes[1].exit_code, Some(1));
    }

    #[test]
    fn test_halt_policy_marks_tail_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, mut log) = setup(&dir);
        config.continuation = ContinuationPolicy::Halt;
        let plan = plan_of(vec![shell("false"), shell("true")]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();

        assert_eq!(outcomes[0].status, StepStatus::Failure);
        assert_eq!(outcomes[1].status, StepStatus::AbortedRun);
    }

    #[test]
    fn test_file_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut log) = setup(&dir);
        let plan = plan_of(vec![StepAction::WriteFile {
            path: "nested/deeper/app.py".into(),
            body: "print('hi')\n".into(),
        }]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();

        assert_eq!(outcomes[0].status, StepStatus::Success);
        let written = dir.path().join("nested/deeper/app.py");
        assert_eq!(fs::read_to_string(written).unwrap(), "print('hi')\n");
    }

    #[test]
    fn test_cd_persists_for_later_steps() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut log) = setup(&dir);
        let plan = plan_of(vec![
            shell("mkdir app"),
            shell("cd app"),
            StepAction::WriteFile {
                path: "main.py".into(),
                body: "x = 1\n".into(),
            },
        ]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();

        assert!(outcomes.iter().all(|o| o.status == StepStatus::Success));
        assert!(dir.path().join("app/main.py").is_file());
    }

    #[test]
    fn test_isolated_policy_does_not_thread_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, mut log) = setup(&dir);
        config.cwd_policy = CwdPolicy::Isolated;
        fs::create_dir(dir.path().join("app")).unwrap();
        let plan = plan_of(vec![
            shell("cd app"),
            StepAction::WriteFile {
                path: "main.py".into(),
                body: "x = 1\n".into(),
            },
        ]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();

        assert!(outcomes.iter().all(|o| o.status == StepStatus::Success));
        // The write lands at the root, not inside app/.
        assert!(dir.path().join("main.py").is_file());
        assert!(!dir.path().join("app/main.py").exists());
    }

    #[test]
    fn test_cd_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut log) = setup(&dir);
        let plan = plan_of(vec![shell("cd nowhere")]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();
        assert_eq!(outcomes[0].status, StepStatus::Failure);
    }

    #[test]
    fn test_timeout_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, mut log) = setup(&dir);
        config.step_timeout = Duration::from_millis(200);
        let plan = plan_of(vec![shell("sleep 5")]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();

        assert_eq!(outcomes[0].status, StepStatus::Failure);
        assert!(outcomes[0]
            .detail
            .as_deref()
            .unwrap_or("")
            .starts_with("timeout"));
        assert!(outcomes[0].duration_ms < 5000);
    }

    #[test]
    fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, mut log) = setup(&dir);
        config.step_timeout = Duration::from_millis(200);
        // The shell forks children that hold the output pipes open; the
        // executor must not wait for them after the deadline.
        let plan = plan_of(vec![shell("sleep 5 | sleep 5")]);
        let started = Instant::now();
        let outcomes = execute(&plan, &config, &mut log).unwrap();

        assert_eq!(outcomes[0].status, StepStatus::Failure);
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "executor blocked past the step timeout"
        );
    }

    #[test]
    fn test_re_execution_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut log) = setup(&dir);
        let plan = plan_of(vec![shell("mkdir -p app"), shell("false"), shell("true")]);
        let first: Vec<StepStatus> = execute(&plan, &config, &mut log)
            .unwrap()
            .iter()
            .map(|o| o.status)
            .collect();
        let second: Vec<StepStatus> = execute(&plan, &config, &mut log)
            .unwrap()
            .iter()
            .map(|o| o.status)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_command_output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut log) = setup(&dir);
        let plan = plan_of(vec![shell("echo hello")]);
        let outcomes = execute(&plan, &config, &mut log).unwrap();
        assert_eq!(outcomes[0].stdout_snippet.as_deref(), Some("hello\n"));
    }
}
