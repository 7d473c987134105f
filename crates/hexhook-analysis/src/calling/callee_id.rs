//! Callee identities.

use hexhook_core::{Function, FunctionId, StatementRef};
use std::fmt;

/// What a calling convention is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CalleeId {
    /// Code at a known entry address.
    Address(u64),
    /// A function without an entry address.
    Function(FunctionId),
    /// An indirect call whose target could not be resolved.
    Call(StatementRef),
}

impl CalleeId {
    /// Identity under which a function's own convention is registered.
    pub fn of_function(function: &Function) -> Self {
        match function.entry_address() {
            Some(addr) => Self::Address(addr),
            None => Self::Function(function.id()),
        }
    }

    /// Identity of the callee of a call site.
    pub fn of_call(call: StatementRef, target: Option<u64>) -> Self {
        match target {
            Some(addr) => Self::Address(addr),
            None => Self::Call(call),
        }
    }

    /// Returns true for callees reached through an unresolved indirect call.
    pub fn is_indirect(&self) -> bool {
        matches!(self, Self::Call(_))
    }
}

impl fmt::Display for CalleeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{:#x}", addr),
            Self::Function(id) => write!(f, "{}", id),
            Self::Call(call) => write!(f, "indirect@{}", call),
        }
    }
}
