//! Error types for hexhook-core.

use crate::{BasicBlockId, FunctionId, StatementId};
use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid basic block reference.
    #[error("invalid basic block id: {0}")]
    InvalidBlockId(BasicBlockId),

    /// Statement not present in the function body.
    #[error("statement {statement} not found in function {function}")]
    StatementNotFound {
        function: FunctionId,
        statement: StatementId,
    },

    /// Invalid function reference.
    #[error("invalid function id: {0}")]
    InvalidFunctionId(FunctionId),

    /// Two program blocks claim the same address.
    #[error("duplicate block at address {0:#x}")]
    DuplicateBlock(u64),

    /// A function entry does not name any program block.
    #[error("no block at function entry {0:#x}")]
    MissingEntryBlock(u64),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
