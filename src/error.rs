use thiserror::Error;

/// Crate-wide error taxonomy. Subsystems return this from fallible operations;
/// top-level task loops convert stray errors into a log line instead of
/// propagating, since a single failed HTTP call or malformed line must never
/// bring down the agent (see the error handling design in SPEC_FULL.md §7).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to read state file {path}: {source}")]
    StateRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    StateWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state file {path}: {source}")]
    StateParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("remote API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pub/sub session error: {0}")]
    PubSub(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
