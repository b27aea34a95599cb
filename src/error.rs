use thiserror::Error;

/// Fatal pipeline errors. Step-level failures are not errors; they are
/// recorded as [`crate::exec::Outcome`] values and the run keeps going.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Raw text handed to the extractor was empty or whitespace-only.
    #[error("invalid input: raw text is empty")]
    InvalidInput,

    /// The upstream text generator failed before any steps were extracted.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The audit log could not be written. Fatal: without the log the user
    /// can no longer verify what ran.
    #[error("audit log write failed: {0}")]
    LogWrite(String),
}
