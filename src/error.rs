//! Crate-wide error taxonomy. Each variant is a distinct error kind per the
//! engine's error handling design, not merely a different message.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed identity {identity:?}: {reason}")]
    MalformedIdentity { identity: String, reason: String },

    #[error("malformed recipe {path:?}: {reason}")]
    MalformedRecipe { path: Option<PathBuf>, reason: String },

    #[error("unsupported option type at {path}: {reason}")]
    UnsupportedOptionType { path: String, reason: String },

    #[error("dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("identity mismatch: recipe declares {declared:?}, descriptor expects {expected:?}")]
    IdentityMismatch { declared: String, expected: String },

    #[error(
        "dependency {identity:?} not ready: needed by phase {needed_by}, current phase {current}"
    )]
    DependencyNotReady {
        identity: String,
        needed_by: String,
        current: String,
    },

    #[error("undeclared dependency {identity:?} referenced from {from:?}")]
    UndeclaredDependency { identity: String, from: String },

    #[error("ambiguous weak reference {query:?}: matches {matches:?}")]
    AmbiguousWeakReference { query: String, matches: Vec<String> },

    #[error("unresolved weak reference {query:?} and no fallback provided")]
    UnresolvedWeakReference { query: String },

    #[error("hash mismatch for {path:?}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("lock broken: {reason}")]
    LockBroken { reason: String },

    #[error("phase script failure in {identity} during phase {phase}: {reason}")]
    PhaseScriptFailure {
        identity: String,
        phase: String,
        reason: String,
        file: Option<PathBuf>,
        provenance: Vec<String>,
    },

    #[error("shell failure (exit {exit_code:?}, signal {signal:?}): {command}")]
    ShellFailure {
        command: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    },

    #[error("cache corruption at {path:?}: {reason}")]
    CacheCorruption { path: PathBuf, reason: String },

    #[error("operation called outside an active phase context: {operation}")]
    OutOfPhaseContext { operation: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
