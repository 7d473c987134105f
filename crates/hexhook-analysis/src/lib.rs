//! # hexhook-analysis
//!
//! Calling-convention instrumentation for decompilation.
//!
//! Conventions are not known up front. They are assigned to callees as
//! evidence accumulates, and the [`Hooks`] engine turns each assignment
//! into synthetic IR statements (argument reads, return value writes,
//! clobbers, stack cleanup) so that a convention-agnostic dataflow
//! analysis sees the effects of every call. The [`Scheduler`] alternates
//! dataflow passes with re-instrumentation until nothing changes, and the
//! [`Context`] owns every artifact of the session.
//!
//! ```ignore
//! use hexhook_analysis::{AnalysisConfig, Context, Scheduler};
//!
//! let mut ctx = Context::new();
//! ctx.set_program(program);
//! let config = AnalysisConfig::default().with_default_convention("cdecl");
//! let stats = Scheduler::new(config).run(&mut ctx)?;
//! ```

pub mod artifacts;
pub mod calling;
pub mod cancel;
pub mod config;
pub mod context;
pub mod dataflow;
pub mod error;
pub mod scheduler;
pub mod term_to_function;
pub mod tree;

pub use artifacts::{
    FunctionArtifacts, Liveness, Region, RegionGraph, RegionKind, Types, Variable, Variables,
};
pub use calling::{
    ArchitectureDefault, CallHook, CallSignature, CalleeId, Convention, ConventionDetector,
    ConventionId, Conventions, EntryHook, FixedConvention, FunctionSignature, HookId, Hooks,
    InstrumentStats, ParamType, ReturnHook, SharedConventions, SharedSignatures, Signatures,
};
pub use cancel::CancellationToken;
pub use config::AnalysisConfig;
pub use context::{Context, ContextEvent, InstrumentationParts};
pub use dataflow::{CallSite, Dataflow, Dataflows};
pub use error::{AnalysisError, AnalysisResult};
pub use scheduler::{ScheduleStats, Scheduler};
pub use term_to_function::TermToFunction;
pub use tree::{EmittedFunction, Tree};
