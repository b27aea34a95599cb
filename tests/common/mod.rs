//! Shared test infrastructure for integration tests.

use std::path::PathBuf;

/// Path to the compiled `projgen` binary, provided by cargo for integration
/// tests.
pub fn projgen_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_projgen"))
}
