//! Prompt assembly for the generation collaborator.
//!
//! The preambles steer the model toward output the extractor parses well:
//! fenced shell blocks for commands, and `write <name>` / `create <name>` /
//! `edit <name>` titled blocks for file contents.

const INSTRUCTION: &str = "\
Produce complete, runnable output for the project described above. Create as \
many files as the task needs, choosing the language, packages, and framework \
best suited to the host platform. Emit only commands and file contents, \
organized as numbered steps in the exact order they must run, including \
dependency installation and a final command to run the project.";

const STYLE: &str = "\
Formatting rules:
- Put terminal commands in fenced ```bash blocks, one command per line.
- Title every file-content step exactly `write <filename>`, `create <filename>`, \
or `edit <filename>`, followed by a fenced block containing the full file body.
- Title command steps `bash commands`.
- No prose inside fenced blocks.";

const ERROR_INSTRUCTION: &str = "\
The files and directories from your previous response already exist. Fix the \
errors reported below by emitting only the corrective steps, in the same \
step format as before. Do not repeat steps that already succeeded.";

/// First-turn prompt for a project idea.
pub fn initial_prompt(idea: &str) -> String {
    format!("{idea}\n\n{INSTRUCTION}\n\n{STYLE}")
}

/// Follow-up prompt carrying execution feedback from the previous turn.
pub fn retry_prompt(feedback: &str) -> String {
    format!("{feedback}\n\n{ERROR_INSTRUCTION}\n\n{STYLE}")
}
