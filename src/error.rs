//! Error types, one enum per concern.

use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the database through a [`crate::gateway::DatabaseGateway`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("could not launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command failed with exit code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("could not decode server output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("server output is not valid UTF-8")]
    Encoding,

    #[error("no definition available for '{0}' (missing or encrypted)")]
    MissingDefinition(String),

    #[error("database '{0}' does not exist")]
    UnknownDatabase(String),
}

/// Trace lifecycle failures. Only failures at start are fatal to a run.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a trace session is already active; stop it before starting another")]
    AlreadyActive,

    #[error("no trace session is active")]
    NotStarted,

    #[error("trace session '{session}' could not be created: {source}")]
    Create {
        session: String,
        #[source]
        source: GatewayError,
    },

    #[error("trace session '{session}' could not be {action}: {source}")]
    Lifecycle {
        session: String,
        action: &'static str,
        #[source]
        source: GatewayError,
    },
}

/// The measured workload failed. Measurement continues regardless.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("could not launch '{}': {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse workload arguments '{0}'")]
    Arguments(String),

    #[error("workload command failed: {0}")]
    Command(#[from] GatewayError),
}

/// Source text that the splitter refuses to segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentationError {
    #[error("unterminated string literal starting on line {line}")]
    UnterminatedString { line: u32 },

    #[error("unterminated quoted identifier starting on line {line}")]
    UnterminatedIdentifier { line: u32 },

    #[error("unterminated block comment starting on line {line}")]
    UnterminatedComment { line: u32 },

    #[error("unbalanced parenthesis on line {line}")]
    UnbalancedParenthesis { line: u32 },

    #[error("END without matching BEGIN on line {line}")]
    UnmatchedEnd { line: u32 },

    #[error("{block} opened on line {line} is never closed")]
    UnterminatedBlock { block: &'static str, line: u32 },

    #[error("module header has no AS keyword")]
    MissingBody,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
