//! Error types for hexhook-analysis.
//!
//! Incomplete analysis is never an error here: missing artifacts and
//! unresolved conventions surface as `None`. These variants cover misuse
//! that the session loop should abort on.

use hexhook_core::{FunctionId, StatementId};
use thiserror::Error;

/// Errors raised by the analysis passes.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("IR error: {0}")]
    Ir(#[from] hexhook_core::Error),

    #[error(
        "dataflow for {function} is stale: computed at revision {computed}, function is at {current}"
    )]
    StaleDataflow {
        function: FunctionId,
        computed: u64,
        current: u64,
    },

    #[error("dataflow was computed for {dataflow}, not {function}")]
    DataflowMismatch {
        function: FunctionId,
        dataflow: FunctionId,
    },

    #[error("missing artifact: {0}")]
    MissingArtifact(&'static str),

    #[error("{0} registry lock poisoned")]
    PoisonedRegistry(&'static str),

    #[error("synthetic statement {statement} still present in {function}")]
    SyntheticLeak {
        function: FunctionId,
        statement: StatementId,
    },

    #[error("analysis cancelled")]
    Cancelled,
}

/// Result type for analysis operations.
pub type AnalysisResult<T> = Result<T, AnalysisError>;
