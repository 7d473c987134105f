//! # hexhook-core
//!
//! Core IR for the hexhook analysis. This crate defines the types shared by
//! every pass: architectures and registers, decoded instructions, and the
//! statement-level IR (statements, basic blocks, functions, program) that
//! calling-convention hooks are inserted into.

pub mod arch;
pub mod error;
pub mod function;
pub mod instruction;
pub mod module;
pub mod program;
pub mod register;
pub mod statement;

pub use arch::Architecture;
pub use error::{Error, Result};
pub use function::{BasicBlock, BasicBlockId, Function, FunctionId, Functions, InsertPosition};
pub use instruction::{Instruction, Instructions};
pub use module::Module;
pub use program::{Program, ProgramBlock, ProgramStatement};
pub use register::{register_by_name, register_name};
pub use statement::{
    Access, CallTarget, HookKind, Location, Origin, Statement, StatementId, StatementKind,
    StatementRef, Value,
};
