//! Step extraction from raw model output.
//!
//! Model responses mix prose, fenced code blocks, and inline commands. This
//! module classifies each candidate unit once, at extraction time, into a
//! tagged [`StepAction`] so downstream components dispatch on the tag instead
//! of re-sniffing text. Document order is the only ordering signal: the model
//! is assumed to emit steps in intended execution order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::PipelineError;

/// Fence tags that mark a block as shell commands.
const SHELL_TAGS: &[&str] = &["bash", "sh", "shell", "zsh", "console", "terminal"];

/// First tokens that mark a bare line outside a fence as a command.
const SHELL_VERBS: &[&str] = &[
    "cd", "mkdir", "touch", "cp", "mv", "rm", "ls", "echo", "cat", "chmod", "chown", "tar",
    "unzip", "curl", "wget", "git", "make", "sh", "bash", "export", "source", "sudo", "docker",
    "npm", "npx", "yarn", "pnpm", "node", "pip", "pip3", "python", "python3", "virtualenv", "uv",
    "cargo", "rustc", "go", "mvn", "gradle", "dotnet", "bundle", "rails", "apt", "apt-get",
    "brew",
];

/// Kind tag for a step, derived from its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ShellCommand,
    FileWrite,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShellCommand => write!(f, "shell"),
            Self::FileWrite => write!(f, "file"),
        }
    }
}

/// The work a step performs, decided once at extraction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StepAction {
    /// A single logical command line for the host shell.
    #[serde(rename = "shell_command")]
    Shell { command: String },
    /// A file to create or overwrite with the given body.
    #[serde(rename = "file_write")]
    WriteFile { path: String, body: String },
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Shell { .. } => StepKind::ShellCommand,
            Self::WriteFile { .. } => StepKind::FileWrite,
        }
    }

    /// One-line label for prompts and summaries.
    pub fn summary(&self) -> String {
        match self {
            Self::Shell { command } => command.clone(),
            Self::WriteFile { path, body } => {
                format!("write {} ({} bytes)", path, body.len())
            }
        }
    }
}

/// Byte region of the raw text a step was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

/// One atomic unit of extracted work with a fixed position in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    #[serde(flatten)]
    pub action: StepAction,
    pub span: SourceSpan,
}

/// Parse raw model text into an ordered step list.
///
/// Never fails on malformed content: worst case a block is emitted as one
/// opaque shell step. The only error is empty/whitespace-only input.
pub fn extract(raw_text: &str) -> Result<Vec<Step>, PipelineError> {
    if raw_text.trim().is_empty() {
        return Err(PipelineError::InvalidInput);
    }

    let lines = lines_with_offsets(raw_text);
    let mut actions: Vec<(StepAction, SourceSpan)> = Vec::new();
    let mut last_prose: Option<&str> = None;
    let mut i = 0;

    while i < lines.len() {
        let (offset, line) = lines[i];
        let trimmed = line.trim();

        if trimmed.starts_with("```") {
            let tag = trimmed.trim_start_matches('`').trim();
            // An unclosed fence consumes to end of text.
            let close = lines[i + 1..]
                .iter()
                .position(|(_, l)| l.trim().starts_with("```"))
                .map(|rel| i + 1 + rel);
            let body_end = close.unwrap_or(lines.len());
            let span = SourceSpan {
                start: offset,
                end: close
                    .map(|j| lines[j].0 + lines[j].1.len())
                    .unwrap_or(raw_text.len()),
            };
            let block: Vec<&str> = lines[i + 1..body_end].iter().map(|(_, l)| *l).collect();
            classify_block(tag, last_prose, &block, span, &mut actions);
            last_prose = None;
            i = body_end + 1;
            continue;
        }

        if let Some(command) = inline_command(trimmed) {
            let mut command = command.to_string();
            let mut end = offset + line.len();
            // Trailing backslash continues the command onto the next line.
            while command.ends_with('\\') && i + 1 < lines.len() {
                command.pop();
                i += 1;
                let (next_offset, next_line) = lines[i];
                command.push(' ');
                command.push_str(next_line.trim());
                end = next_offset + next_line.len();
            }
            let command = command.trim().to_string();
            if !command.is_empty() {
                actions.push((
                    StepAction::Shell { command },
                    SourceSpan { start: offset, end },
                ));
            }
            last_prose = None;
        } else if !trimmed.is_empty() {
            last_prose = Some(trimmed);
        }
        i += 1;
    }

    // Catch-all: non-empty input always yields at least one step, even when
    // nothing in it parsed as a command or file block.
    if actions.is_empty() {
        actions.push((
            StepAction::Shell {
                command: raw_text.trim().to_string(),
            },
            SourceSpan {
                start: 0,
                end: raw_text.len(),
            },
        ));
    }

    let steps = actions
        .into_iter()
        .enumerate()
        .map(|(index, (action, span))| Step { index, action, span })
        .collect::<Vec<_>>();

    tracing::debug!(steps = steps.len(), "extracted steps from raw text");
    Ok(steps)
}

fn lines_with_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut offset = 0;
    for raw in text.split_inclusive('\n') {
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let line = line.strip_suffix('\r').unwrap_or(line);
        out.push((offset, line));
        offset += raw.len();
    }
    out
}

fn classify_block(
    tag: &str,
    title: Option<&str>,
    block: &[&str],
    span: SourceSpan,
    actions: &mut Vec<(StepAction, SourceSpan)>,
) {
    // A filename in the fence tag wins over everything else.
    if let Some(path) = filename_from_tag(tag) {
        actions.push((
            StepAction::WriteFile {
                path,
                body: block_body(block),
            },
            span,
        ));
        return;
    }

    let shell_tag = SHELL_TAGS.contains(&tag);
    if shell_tag {
        let commands = split_commands(block);
        if commands.is_empty() {
            push_opaque(block, span, actions);
        } else {
            for command in commands {
                actions.push((StepAction::Shell { command }, span));
            }
        }
        return;
    }

    // The prompt style asks the model to title file steps "write <name>",
    // "create <name>", or "edit <name>".
    if let Some(path) = title.and_then(filename_from_title) {
        actions.push((
            StepAction::WriteFile {
                path,
                body: block_body(block),
            },
            span,
        ));
        return;
    }

    // Untagged block: split only if every line reads as a command; otherwise
    // the content is opaque and emitted as a single step.
    if tag.is_empty() && block_is_all_commands(block) {
        for command in split_commands(block) {
            actions.push((StepAction::Shell { command }, span));
        }
        return;
    }

    push_opaque(block, span, actions);
}

fn push_opaque(block: &[&str], span: SourceSpan, actions: &mut Vec<(StepAction, SourceSpan)>) {
    let text = block.join("\n").trim().to_string();
    if !text.is_empty() {
        actions.push((StepAction::Shell { command: text }, span));
    }
}

fn block_body(block: &[&str]) -> String {
    let mut body = block.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    body
}

/// Split a shell block into one command per logical line, merging
/// backslash-continued lines and dropping blanks and comments.
fn split_commands(block: &[&str]) -> Vec<String> {
    let mut commands = Vec::new();
    let mut pending: Option<String> = None;
    for line in block {
        let mut line = line.trim();
        if let Some(rest) = line.strip_prefix("$ ") {
            line = rest.trim();
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (fragment, continued) = match line.strip_suffix('\\') {
            Some(head) => (head.trim_end(), true),
            None => (line, false),
        };
        let merged = match pending.take() {
            Some(mut prev) => {
                prev.push(' ');
                prev.push_str(fragment);
                prev
            }
            None => fragment.to_string(),
        };
        if continued {
            pending = Some(merged);
        } else if !merged.is_empty() {
            commands.push(merged);
        }
    }
    if let Some(rest) = pending {
        let rest = rest.trim().to_string();
        if !rest.is_empty() {
            commands.push(rest);
        }
    }
    commands
}

fn block_is_all_commands(block: &[&str]) -> bool {
    let mut saw_any = false;
    for line in block {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        saw_any = true;
        if trimmed.strip_prefix("$ ").is_some() {
            continue;
        }
        let first = trimmed.split_whitespace().next().unwrap_or("");
        if !SHELL_VERBS.contains(&first) {
            return false;
        }
    }
    saw_any
}

/// Bare command outside a fence: a `$ ` prefix, or a line starting with a
/// recognized shell verb. Sentence-ish lines (trailing colon or period,
/// markdown emphasis) stay prose.
fn inline_command(trimmed: &str) -> Option<&str> {
    if let Some(rest) = trimmed.strip_prefix("$ ") {
        return Some(rest);
    }
    if trimmed.ends_with(':') || trimmed.ends_with('.') || trimmed.contains("**") {
        return None;
    }
    let first = trimmed.split_whitespace().next()?;
    if SHELL_VERBS.contains(&first) {
        return Some(trimmed);
    }
    None
}

fn filename_from_tag(tag: &str) -> Option<String> {
    if tag.is_empty() || SHELL_TAGS.contains(&tag) {
        return None;
    }
    // Language tags ("python", "json") carry no dot or slash; filenames do.
    let candidate = tag.split_whitespace().next()?;
    if candidate.contains('.') || candidate.contains('/') {
        return Some(candidate.to_string());
    }
    None
}

/// Extensionless names that still read as filenames in a step title.
const BARE_FILENAMES: &[&str] = &[
    "Makefile", "Dockerfile", "Justfile", "Rakefile", "Gemfile", "Procfile", "Vagrantfile",
    "LICENSE", "README",
];

fn filename_from_title(title: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:write|create|edit)\b[:\s`]+([\w./\-]+)")
            .expect("valid filename regex")
    });
    let caps = re.captures(title)?;
    let candidate = caps[1].trim_matches('`').trim_end_matches('.');
    // An ordinary word after the verb ("create the project") is prose, not a
    // filename: require an extension, a path separator, or a known bare name.
    if candidate.contains('.') || candidate.contains('/') || BARE_FILENAMES.contains(&candidate) {
        Some(candidate.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(step: &Step) -> &str {
        match &step.action {
            StepAction::Shell { command } => command,
            other => panic!("expected shell step, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_input_is_invalid() {
        assert!(matches!(extract(""), Err(PipelineError::InvalidInput)));
        assert!(matches!(extract("  \n\t"), Err(PipelineError::InvalidInput)));
    }

    #[test]
    fn test_fenced_shell_block_splits_per_command() {
        let raw = "Run:\n```bash\nmkdir app\ncd app\nnpm init -y\n```";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(shell(&steps[0]), "mkdir app");
        assert_eq!(shell(&steps[1]), "cd app");
        assert_eq!(shell(&steps[2]), "npm init -y");
        let indices: Vec<usize> = steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_indices_are_dense_across_mixed_content() {
        let raw = concat!(
            "First set up the tree.\n",
            "```sh\nmkdir -p src\n```\n",
            "create src/app.py\n",
            "```python\nprint('hi')\n```\n",
            "Then run it:\n",
            "```bash\npython3 src/app.py\n```\n",
        );
        let steps = extract(raw).unwrap();
        let indices: Vec<usize> = steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..steps.len()).collect::<Vec<_>>());
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].action.kind(), StepKind::FileWrite);
    }

    #[test]
    fn test_continuation_lines_merge() {
        let raw = "```bash\npip install \\\n  flask \\\n  requests\nls\n```";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(shell(&steps[0]), "pip install flask requests");
        assert_eq!(shell(&steps[1]), "ls");
    }

    #[test]
    fn test_file_write_from_step_title() {
        let raw = "**Step 2: write app/main.py**\n```python\nprint(1)\nprint(2)\n```";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 1);
        match &steps[0].action {
            StepAction::WriteFile { path, body } => {
                assert_eq!(path, "app/main.py");
                assert_eq!(body, "print(1)\nprint(2)\n");
            }
            other => panic!("expected file write, got {other:?}"),
        }
    }

    #[test]
    fn test_file_write_from_extensionless_title() {
        let raw = "**Step 1: create Dockerfile**\n```\nFROM debian:stable-slim\n```";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 1);
        match &steps[0].action {
            StepAction::WriteFile { path, body } => {
                assert_eq!(path, "Dockerfile");
                assert_eq!(body, "FROM debian:stable-slim\n");
            }
            other => panic!("expected file write, got {other:?}"),
        }
    }

    #[test]
    fn test_prose_word_after_create_is_not_a_filename() {
        let raw = "create the project\n```\nmkdir app\n```";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(shell(&steps[0]), "mkdir app");
    }

    #[test]
    fn test_file_write_from_fence_tag() {
        let raw = "```src/index.js\nconsole.log('x');\n```";
        let steps = extract(raw).unwrap();
        match &steps[0].action {
            StepAction::WriteFile { path, .. } => assert_eq!(path, "src/index.js"),
            other => panic!("expected file write, got {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_block_is_one_opaque_step() {
        let raw = "```python\nfor x in range(3):\n    print(x)\n```";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action.kind(), StepKind::ShellCommand);
        assert!(shell(&steps[0]).contains("for x in range(3):"));
    }

    #[test]
    fn test_unclosed_fence_consumes_to_end() {
        let raw = "setup below\n```bash\nmkdir demo\ncd demo";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(shell(&steps[1]), "cd demo");
        assert_eq!(steps[1].span.end, raw.len());
    }

    #[test]
    fn test_inline_commands_and_prose() {
        let raw = "Install the dependency.\n$ pip install flask\ngit init\nThis creates the repo.\n";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(shell(&steps[0]), "pip install flask");
        assert_eq!(shell(&steps[1]), "git init");
    }

    #[test]
    fn test_comments_and_blanks_dropped_in_shell_block() {
        let raw = "```bash\n# create tree\n\nmkdir app\n```";
        let steps = extract(raw).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(shell(&steps[0]), "mkdir app");
    }

    #[test]
    fn test_spans_point_into_raw_text() {
        let raw = "Run:\n```bash\nmkdir app\n```";
        let steps = extract(raw).unwrap();
        let span = steps[0].span;
        assert!(raw[span.start..span.end].contains("mkdir app"));
    }

    #[test]
    fn test_prose_only_input_yields_catch_all_step() {
        let steps = extract("This project needs a plan.\nNothing to do yet.\n").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action.kind(), StepKind::ShellCommand);
        assert!(shell(&steps[0]).starts_with("This project needs a plan."));
    }
}
