use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cli;
mod error;
mod exec;
mod extract;
mod generate;
mod pipeline;
mod prompt;
mod review;
mod runlog;
mod util;

use cli::{Command, ExecArgs, ExtractArgs, LogArgs, PipelineOpts, RootArgs, RunArgs};
use exec::{ContinuationPolicy, CwdPolicy, ExecConfig};
use pipeline::{PipelineConfig, RunSummary};
use review::{AutoApprove, DecisionSource, TerminalDecisionSource};
use runlog::OverallStatus;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = RootArgs::parse();
    match args.command {
        Command::Run(args) => run_run(args),
        Command::Exec(args) => run_exec(args),
        Command::Extract(args) => run_extract(args),
        Command::Log(args) => run_log(args),
    }
}

fn pipeline_config(opts: &PipelineOpts) -> PipelineConfig {
    let mut exec = ExecConfig::new(opts.root.clone());
    exec.step_timeout = Duration::from_secs(opts.step_timeout);
    if opts.halt_on_failure {
        exec.continuation = ContinuationPolicy::Halt;
    }
    if opts.isolated {
        exec.cwd_policy = CwdPolicy::Isolated;
    }
    PipelineConfig {
        exec,
        log_dir: opts
            .log_dir
            .clone()
            .unwrap_or_else(runlog::default_log_dir),
    }
}

fn decision_source(opts: &PipelineOpts) -> Box<dyn DecisionSource> {
    if opts.yes {
        Box::new(AutoApprove)
    } else {
        Box::new(TerminalDecisionSource)
    }
}

/// Model-backed pipeline with a feedback loop: execution failures can be fed
/// back to the model as a follow-up turn until the user stops.
fn run_run(args: RunArgs) -> Result<()> {
    let generator = generate::resolve_generator(args.lm.as_deref())?;
    let idea = match args.idea {
        Some(idea) => idea,
        None => prompt_line("Enter your prompt: ")?,
    };
    let config = pipeline_config(&args.pipeline);
    fs::create_dir_all(&config.exec.root)
        .with_context(|| format!("create root {}", config.exec.root.display()))?;

    let mut turn = prompt::initial_prompt(&idea);
    loop {
        let raw_text = match generator.generate(&turn) {
            Ok(text) => text,
            Err(err) => {
                pipeline::record_generation_failure(&config, &err)?;
                return Err(err.into());
            }
        };
        let mut source = decision_source(&args.pipeline);
        let summary = pipeline::run_pipeline(&raw_text, source.as_mut(), &config)?;
        print_summary(&summary);

        if summary.overall == OverallStatus::Aborted
            || summary.failed == 0
            || args.pipeline.yes
        {
            break;
        }
        let feedback =
            prompt_line("Describe fixes for the model, or press Enter to stop: ")?;
        let feedback = feedback.trim().to_string();
        if feedback.is_empty() || matches!(feedback.as_str(), "exit" | "quit" | "stop") {
            break;
        }
        turn = prompt::retry_prompt(&format!(
            "{feedback}\n\nFailures from the previous attempt:\n{}",
            summary.failures.join("\n")
        ));
    }
    Ok(())
}

fn run_exec(args: ExecArgs) -> Result<()> {
    let raw_text = fs::read_to_string(&args.file)
        .with_context(|| format!("read {}", args.file.display()))?;
    let config = pipeline_config(&args.pipeline);
    fs::create_dir_all(&config.exec.root)
        .with_context(|| format!("create root {}", config.exec.root.display()))?;
    let mut source = decision_source(&args.pipeline);
    let summary = pipeline::run_pipeline(&raw_text, source.as_mut(), &config)?;
    print_summary(&summary);
    Ok(())
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let raw_text = match &args.file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("read raw text from stdin")?;
            buf
        }
    };
    let steps = extract::extract(&raw_text)?;
    let json = serde_json::to_string_pretty(&steps).context("serialize steps")?;
    println!("{json}");
    Ok(())
}

fn run_log(args: LogArgs) -> Result<()> {
    let dir: PathBuf = args.log_dir.unwrap_or_else(runlog::default_log_dir);
    match args.run_id {
        None => {
            for run_id in runlog::list_runs(&dir)? {
                let record = runlog::load(&dir, &run_id)?;
                let status = record
                    .overall
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "incomplete".to_string());
                println!(
                    "{run_id}  {status}  steps={} outcomes={}",
                    record.steps.len(),
                    record.outcomes.len()
                );
            }
        }
        Some(run_id) => {
            if args.json {
                let records = runlog::events_for(&dir, &run_id)?;
                for record in records {
                    println!("{}", serde_json::to_string(&record).context("serialize event")?);
                }
            } else {
                print_record(&runlog::load(&dir, &run_id)?);
            }
        }
    }
    Ok(())
}

fn print_record(record: &runlog::RunRecord) {
    let status = record
        .overall
        .map(|s| s.to_string())
        .unwrap_or_else(|| "incomplete (no seal; run crashed or is in progress)".to_string());
    println!("run {}  [{status}]", record.run_id);
    if let Some(detail) = &record.detail {
        println!("  detail: {detail}");
    }
    for review in &record.reviews {
        let edited = if review.edited == review.original {
            String::new()
        } else {
            format!("  (edited: {})", review.edited.summary())
        };
        println!(
            "  review {}: {:?}  {}{edited}",
            review.index,
            review.decision,
            review.original.summary()
        );
    }
    for outcome in &record.outcomes {
        println!(
            "  step {}: {:?} in {}ms{}",
            outcome.step_index,
            outcome.status,
            outcome.duration_ms,
            outcome
                .detail
                .as_deref()
                .map(|d| format!("  ({d})"))
                .unwrap_or_default()
        );
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {}: {} (succeeded {}, failed {}, skipped {})",
        summary.run_id, summary.overall, summary.succeeded, summary.failed, summary.skipped
    );
    for line in &summary.failures {
        println!("  {line}");
    }
}

fn prompt_line(message: &str) -> Result<String> {
    let mut err = io::stderr();
    write!(err, "{message}")?;
    err.flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read prompt line")?;
    Ok(line.trim_end().to_string())
}
