//! Calling conventions and the hooks that make them explicit in the IR.
//!
//! - [`Convention`] / [`Conventions`]: ABI descriptions and the registry
//!   assigning them to callees.
//! - [`FunctionSignature`] / [`CallSignature`] / [`Signatures`]: recovered
//!   arity and types.
//! - [`Hooks`]: synthesizes, caches, attaches and detaches hook statements.

pub mod callee_id;
pub mod convention;
pub mod conventions;
pub mod detect;
pub mod hook;
pub mod hooks;
pub mod signature;

pub use callee_id::CalleeId;
pub use convention::{Convention, Site, StackCleanup};
pub use conventions::{ConventionId, Conventions, SharedConventions};
pub use detect::{ArchitectureDefault, ConventionDetector, FixedConvention};
pub use hook::{CallHook, EntryHook, HookId, ReturnHook};
pub use hooks::{Hooks, InstrumentStats};
pub use signature::{
    CallSignature, CallSignatureId, FunctionSignature, FunctionSignatureId, ParamType,
    SharedSignatures, SignatureRef, Signatures,
};
