//! CLI argument parsing for the project-generation pipeline.
//!
//! The CLI is intentionally thin: it wires the extract-review-execute loop
//! without embedding policy, so the same core can be driven from tests.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "projgen",
    version,
    about = "Turn a project description into reviewed, executed steps",
    after_help = "Commands:\n  run [IDEA]        Query the model and run the pipeline over its output\n  exec --file F     Run the pipeline over saved model output (no model call)\n  extract [--file F]  Parse text into steps and print them as JSON\n  log [RUN_ID]      List recorded runs, or dump one run's audit trail\n\nExamples:\n  projgen run \"a flask todo app\" --root ~/projects\n  projgen run --yes --halt-on-failure \"a cli stopwatch in go\"\n  projgen exec --file response.txt --isolated\n  projgen extract --file response.txt\n  projgen log\n  projgen log run-1707900000000-4242 --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Exec(ExecArgs),
    Extract(ExtractArgs),
    Log(LogArgs),
}

/// Shared pipeline knobs for commands that execute steps.
#[derive(Parser, Debug)]
pub struct PipelineOpts {
    /// Directory the run executes in (working directory for step 0)
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub root: PathBuf,

    /// Approve every step without prompting
    #[arg(long)]
    pub yes: bool,

    /// Per-step timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    pub step_timeout: u64,

    /// Stop executing after the first failed step
    #[arg(long)]
    pub halt_on_failure: bool,

    /// Run every command in a fresh shell at the root (no `cd` threading)
    #[arg(long)]
    pub isolated: bool,

    /// Directory for run audit logs
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
}

/// Run the full model-backed pipeline.
#[derive(Parser, Debug)]
#[command(about = "Generate steps from a project idea and execute them after review")]
pub struct RunArgs {
    /// Project idea; prompted for on stdin when omitted
    pub idea: Option<String>,

    /// Generator command (prompt on stdin, or a {prompt} placeholder)
    #[arg(long, value_name = "CMD")]
    pub lm: Option<String>,

    #[command(flatten)]
    pub pipeline: PipelineOpts,
}

/// Run the pipeline over saved model output.
#[derive(Parser, Debug)]
#[command(about = "Execute steps extracted from a saved model response")]
pub struct ExecArgs {
    /// File containing raw model output
    #[arg(long, value_name = "PATH")]
    pub file: PathBuf,

    #[command(flatten)]
    pub pipeline: PipelineOpts,
}

/// Extraction only, for inspecting what would run.
#[derive(Parser, Debug)]
#[command(about = "Parse raw text into steps and print them as JSON")]
pub struct ExtractArgs {
    /// File containing raw text; stdin when omitted
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,
}

/// Audit trail inspection.
#[derive(Parser, Debug)]
#[command(about = "List recorded runs or dump one run's audit trail")]
pub struct LogArgs {
    /// Run id to dump; lists all runs when omitted
    pub run_id: Option<String>,

    /// Directory for run audit logs
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Emit raw JSONL events instead of a readable summary
    #[arg(long)]
    pub json: bool,
}
