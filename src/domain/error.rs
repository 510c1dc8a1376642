//! Domain error types for the discovery engine.
//!
//! One enum per concern, all built on thiserror. Components below the
//! learning loop convert these into iteration-record fields; only fatal
//! infrastructure errors propagate upward.

use thiserror::Error;

/// Errors from (date × symbol) frame construction and arithmetic.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    /// Value matrix shape disagrees with the label axes.
    #[error("Frame shape mismatch: {rows} dates x {cols} symbols, but matrix is {got_rows}x{got_cols}")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        got_rows: usize,
        got_cols: usize,
    },

    /// Two frames in a binary operation have different axes.
    #[error("Frame axes mismatch in '{op}'")]
    AxisMismatch { op: String },

    /// A frame with zero dates or zero symbols.
    #[error("Frame has no {0}")]
    Empty(&'static str),

    /// Rolling window longer than the date axis.
    #[error("Rolling window {window} exceeds {rows} rows")]
    WindowTooLarge { window: usize, rows: usize },
}

/// Errors from artifact construction and structural validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// CodeForm with empty code text.
    #[error("Code artifact has empty code text")]
    EmptyCode,

    /// GraphForm with an empty strategy id.
    #[error("Graph artifact has empty strategy id")]
    EmptyStrategyId,

    /// Two DAG nodes share an id.
    #[error("Duplicate node id '{0}' in factor graph")]
    DuplicateNode(String),

    /// A node references an id that does not exist.
    #[error("Node '{node}' references unknown node '{reference}'")]
    UnknownNodeRef { node: String, reference: String },

    /// The depends-on relation contains a cycle.
    #[error("Factor graph contains a cycle")]
    CycleDetected,

    /// No node produces the terminal position matrix.
    #[error("Factor graph has no terminal node")]
    NoTerminalNode,

    /// A node names a factor absent from the registry.
    #[error("Unknown factor '{0}'")]
    UnknownFactor(String),
}

/// Errors from the market-data gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The symbolic key is not in the manifest.
    #[error("Unknown data field '{field}'")]
    UnknownField {
        field: String,
        suggestion: Option<String>,
    },

    /// Underlying storage failure.
    #[error("Data source IO error: {0}")]
    Io(String),

    /// A matrix file failed to parse.
    #[error("Malformed matrix for field '{field}': {reason}")]
    MalformedMatrix { field: String, reason: String },
}

/// Errors from the LLM transport and schema layer.
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// Network or HTTP failure.
    #[error("LLM transport error: {0}")]
    Transport(String),

    /// Provider returned 429.
    #[error("LLM rate limited: {0}")]
    RateLimited(String),

    /// Provider quota exhausted for this run.
    #[error("LLM quota exhausted for provider '{0}'")]
    QuotaExhausted(String),

    /// Call exceeded the configured timeout.
    #[error("LLM call timed out after {0}s")]
    Timeout(u64),

    /// Response body was not usable.
    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    /// Authentication failed, not retryable.
    #[error("LLM authentication failed for provider '{0}'")]
    AuthenticationFailed(String),

    /// Every configured provider failed.
    #[error("All LLM providers exhausted")]
    AllProvidersExhausted,
}

impl LlmError {
    /// Transient errors may succeed on retry against the same provider.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }
}

/// Infrastructure-level sandbox failures.
///
/// Strategy-level failures (timeout, runtime error, resource cap) are not
/// errors: they are `ExecutionResult` variants recorded in the iteration
/// log. This enum covers failures of the isolation machinery itself.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The worker binary could not be started.
    #[error("Failed to spawn sandbox worker: {0}")]
    SpawnFailed(String),

    /// The isolation runtime is not usable on this host.
    #[error("Isolation runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Worker produced output the executor could not decode.
    #[error("Sandbox protocol error: {0}")]
    Protocol(String),

    /// Scratch directory could not be created or removed.
    #[error("Sandbox scratch error: {0}")]
    Scratch(String),
}

/// Errors from the append-only iteration history.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Underlying file IO failed.
    #[error("History IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized.
    #[error("History serialization error: {0}")]
    Serialize(String),

    /// The append failed after the single retry. Fatal for the loop.
    #[error("History append failed after {attempts} attempts: {last_error}")]
    AppendFailed { attempts: u32, last_error: String },
}

/// Errors from champion persistence.
#[derive(Error, Debug)]
pub enum ChampionError {
    /// The champion file could not be written.
    #[error("Champion persistence failed: {0}")]
    PersistFailed(String),

    /// The champion file exists but could not be parsed.
    #[error("Champion file corrupt: {0}")]
    Corrupt(String),
}

/// Failures of a generation attempt.
///
/// Generator failures are recoverable: the iteration executor falls
/// through to the other generation path before recording level 0.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// The LLM reply never matched the template schema.
    #[error("LLM schema validation failed after {attempts} attempts")]
    LlmSchema { attempts: u32 },

    /// The LLM transport gave out entirely.
    #[error("LLM transport failed: {0}")]
    LlmTransport(#[from] LlmError),

    /// The selected mutation could not be applied to the parent graph.
    #[error("Mutation rejected: {0}")]
    MutationRejected(String),

    /// The mutator needs a parent graph and none exists.
    #[error("No parent graph available")]
    NoParent,

    /// Unknown template name requested.
    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_transient_classification() {
        assert!(LlmError::Transport("reset".into()).is_transient());
        assert!(LlmError::RateLimited("429".into()).is_transient());
        assert!(LlmError::Timeout(30).is_transient());
        assert!(!LlmError::AuthenticationFailed("primary".into()).is_transient());
        assert!(!LlmError::QuotaExhausted("primary".into()).is_transient());
        assert!(!LlmError::AllProvidersExhausted.is_transient());
    }

    #[test]
    fn test_history_error_wraps_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: HistoryError = io.into();
        assert!(err.to_string().contains("disk full"));
    }
}
