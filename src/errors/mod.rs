//! # Error Handling
//!
//! Error handling for the cutover orchestrator. The library propagates
//! [`CutoverError`] everywhere; the CLI wraps it in `anyhow` and maps the
//! orchestration taxonomy onto process exit codes.

pub mod types;

pub use types::{CutoverError, Result};

/// Short alias used by modules that only need the type name
pub type Error = CutoverError;
