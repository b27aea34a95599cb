//! Text-generation collaborators.
//!
//! The pipeline treats generation as an opaque `prompt -> text` call. Two
//! backends are provided: a user-configured local command (prompt on stdin or
//! via a `{prompt}` placeholder, text on stdout) and a Gemini-style HTTP
//! endpoint. Any backend failure surfaces as a single
//! [`PipelineError::GenerationFailed`]; auth, quota, and retry concerns stay
//! on the backend's side of the boundary.
//!
//! Backend resolution order: `--lm` flag, `PROJGEN_LM_COMMAND` env var,
//! `GEMINI_API_KEY` env var.

use serde_json::{json, Value};
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::PipelineError;

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Opaque text generator.
pub trait Generator {
    fn generate(&self, prompt: &str) -> Result<String, PipelineError>;
}

/// Spawns a user-configured command for each generation call.
#[derive(Debug)]
pub struct CommandGenerator {
    argv: Vec<String>,
}

impl CommandGenerator {
    /// Parse a command string and resolve its executable up front so a typo
    /// fails before any prompt is sent.
    pub fn new(command: &str) -> Result<Self, PipelineError> {
        let argv = shell_words::split(command)
            .map_err(|err| PipelineError::GenerationFailed(format!("bad LM command: {err}")))?;
        let program = argv
            .first()
            .ok_or_else(|| PipelineError::GenerationFailed("LM command is empty".to_string()))?;
        which::which(program).map_err(|err| {
            PipelineError::GenerationFailed(format!("LM command {program:?}: {err}"))
        })?;
        Ok(Self { argv })
    }
}

impl Generator for CommandGenerator {
    fn generate(&self, prompt: &str) -> Result<String, PipelineError> {
        let mut argv = self.argv.clone();
        let mut has_placeholder = false;
        for arg in &mut argv {
            if arg == "{prompt}" {
                *arg = prompt.to_string();
                has_placeholder = true;
            }
        }
        let program = argv.remove(0);
        let mut command = Command::new(program);
        command.args(argv);
        if has_placeholder {
            command.stdin(Stdio::null());
        } else {
            command.stdin(Stdio::piped());
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let result = if has_placeholder {
            command.output()
        } else {
            command.spawn().and_then(|mut child| {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(prompt.as_bytes())?;
                }
                child.wait_with_output()
            })
        };
        let output = result
            .map_err(|err| PipelineError::GenerationFailed(format!("run LM command: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::GenerationFailed(format!(
                "LM command failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Calls a Gemini-style `generateContent` endpoint.
pub struct HttpGenerator {
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpGenerator {
    pub fn new(api_key: String) -> Self {
        Self {
            endpoint: GEMINI_ENDPOINT.to_string(),
            model: env::var("PROJGEN_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key,
        }
    }
}

impl Generator for HttpGenerator {
    fn generate(&self, prompt: &str) -> Result<String, PipelineError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let mut response = ureq::post(&url)
            .send_json(&body)
            .map_err(|err| PipelineError::GenerationFailed(format!("model request: {err}")))?;
        let value: Value = response
            .body_mut()
            .read_json()
            .map_err(|err| PipelineError::GenerationFailed(format!("model response: {err}")))?;
        extract_candidate_text(&value)
            .ok_or_else(|| PipelineError::GenerationFailed("model response has no text".into()))
    }
}

fn extract_candidate_text(value: &Value) -> Option<String> {
    let parts = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let mut text = String::new();
    for part in parts {
        if let Some(piece) = part.get("text").and_then(Value::as_str) {
            text.push_str(piece);
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Resolve the configured generator backend.
pub fn resolve_generator(lm_flag: Option<&str>) -> Result<Box<dyn Generator>, PipelineError> {
    if let Some(command) = lm_flag {
        return Ok(Box::new(CommandGenerator::new(command)?));
    }
    if let Ok(command) = env::var("PROJGEN_LM_COMMAND") {
        return Ok(Box::new(CommandGenerator::new(&command)?));
    }
    if let Ok(api_key) = env::var("GEMINI_API_KEY") {
        return Ok(Box::new(HttpGenerator::new(api_key)));
    }
    Err(PipelineError::GenerationFailed(
        "no generator configured: pass --lm, or set PROJGEN_LM_COMMAND or GEMINI_API_KEY"
            .to_string(),
    ))
}
