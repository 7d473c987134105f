//! The analysis loop.
//!
//! Alternates dataflow passes with re-instrumentation until instrumentation
//! stops changing, the way conventions and signatures are refined over a
//! session. Dataflow snapshots are computed on the rayon pool when enabled;
//! instrumentation mutates the IR and runs one function at a time.

use crate::calling::{
    ArchitectureDefault, Conventions, FixedConvention, Hooks, InstrumentStats, SharedConventions,
    SharedSignatures, Signatures,
};
use crate::cancel::CancellationToken;
use crate::config::AnalysisConfig;
use crate::context::{Context, InstrumentationParts};
use crate::dataflow::{Dataflow, Dataflows};
use crate::term_to_function::TermToFunction;
use crate::tree::Tree;
use crate::{AnalysisError, AnalysisResult};
use hexhook_core::Function;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::sync::Arc;

/// Summary of a [`Scheduler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Passes executed.
    pub iterations: usize,
    /// The last pass changed nothing.
    pub converged: bool,
    /// Totals over all passes.
    pub instrument: InstrumentStats,
    /// Statements removed by the final deinstrumentation.
    pub deinstrumented: usize,
}

/// Drives instrumentation over a [`Context`].
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: AnalysisConfig,
}

impl Scheduler {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Runs passes until convergence or the iteration limit.
    ///
    /// Missing artifacts are filled in first: functions are built from the
    /// program, empty registries are created, and a hooks engine wired to
    /// them is installed with the configured detector.
    pub fn run(&self, ctx: &mut Context) -> AnalysisResult<ScheduleStats> {
        self.prepare(ctx)?;
        let cancellation = ctx.cancellation().clone();
        let conventions = shared_conventions(ctx)?;
        let signatures = shared_signatures(ctx)?;

        let mut stats = ScheduleStats::default();
        for iteration in 1..=self.config.max_iterations {
            let before = revisions(&conventions, &signatures)?;
            let parts = ctx
                .instrumentation_parts()
                .ok_or(AnalysisError::MissingArtifact("hooks"))?;
            let pass = self.pass(parts, &cancellation)?;
            let after = revisions(&conventions, &signatures)?;

            stats.iterations = iteration;
            stats.instrument.merge(&pass);
            info!(
                "pass {}: {} attached, {} detached, {} synthesized, {} unresolved",
                iteration, pass.attached, pass.detached, pass.synthesized, pass.unresolved
            );

            if !pass.changed() && before == after {
                stats.converged = true;
                break;
            }
        }
        if !stats.converged {
            warn!("instrumentation did not converge after {} passes", stats.iterations);
        }

        if self.config.deinstrument_at_end {
            stats.deinstrumented = self.deinstrument(ctx)?;
        }
        if self.config.emit_tree {
            let functions = ctx
                .functions()
                .ok_or(AnalysisError::MissingArtifact("functions"))?;
            let tree = {
                let signatures = signatures
                    .read()
                    .map_err(|_| AnalysisError::PoisonedRegistry("signatures"))?;
                Tree::emit(functions, &signatures)?
            };
            ctx.set_tree(tree);
        }

        Ok(stats)
    }

    /// Removes every hook statement and refreshes the snapshots.
    pub fn deinstrument(&self, ctx: &mut Context) -> AnalysisResult<usize> {
        let parts = ctx
            .instrumentation_parts()
            .ok_or(AnalysisError::MissingArtifact("hooks"))?;
        let removed = parts.hooks.deinstrument_all(parts.functions);
        *parts.dataflows = snapshots(parts.functions.iter(), self.config.parallel_dataflow)
            .into_iter()
            .collect();
        Ok(removed)
    }

    fn prepare(&self, ctx: &mut Context) -> AnalysisResult<()> {
        if ctx.functions().is_none() {
            let program = ctx
                .program()
                .ok_or(AnalysisError::MissingArtifact("program"))?;
            let functions = program.build_functions()?;
            debug!("built {} functions from the program", functions.len());
            ctx.set_functions(functions);
        }
        if ctx.term_to_function().is_none() {
            if let Some(functions) = ctx.functions() {
                let map = TermToFunction::build(functions);
                ctx.set_term_to_function(map);
            }
        }
        if ctx.conventions().is_none() {
            ctx.set_conventions(Conventions::new().into_shared());
        }
        if ctx.signatures().is_none() {
            ctx.set_signatures(Signatures::new().into_shared());
        }
        if ctx.hooks().is_none() {
            let mut hooks = Hooks::new(shared_conventions(ctx)?, shared_signatures(ctx)?);
            let guess = self.config.guess_indirect_calls;
            if let Some(name) = &self.config.default_convention {
                match FixedConvention::preset(name) {
                    Some(detector) => {
                        hooks.set_convention_detector(detector.with_indirect_guessing(guess))
                    }
                    None => warn!("unknown default convention {:?}", name),
                }
            } else if self.config.architecture_default {
                match ctx.module() {
                    Some(module) => {
                        debug!("falling back to the {} platform convention", module.architecture);
                        hooks.set_convention_detector(
                            ArchitectureDefault::new(module.architecture)
                                .with_indirect_guessing(guess),
                        );
                    }
                    None => warn!("no module loaded; architecture default unavailable"),
                }
            }
            ctx.set_hooks(hooks);
        }
        if ctx.dataflows().is_none() {
            ctx.set_dataflows(Dataflows::new());
        }
        Ok(())
    }

    fn pass(
        &self,
        parts: InstrumentationParts<'_>,
        cancellation: &CancellationToken,
    ) -> AnalysisResult<InstrumentStats> {
        let InstrumentationParts {
            hooks,
            functions,
            dataflows,
        } = parts;

        let fresh = snapshots(functions.iter(), self.config.parallel_dataflow);

        // Learn callee cleanup before any call site is keyed on it.
        for dataflow in &fresh {
            if let Some(function) = functions.get(dataflow.function()) {
                hooks.observe_returns(function, dataflow);
            }
        }

        let mut stats = InstrumentStats::default();
        for dataflow in fresh {
            cancellation.check()?;
            let function = functions
                .get_mut(dataflow.function())
                .ok_or(hexhook_core::Error::InvalidFunctionId(dataflow.function()))?;
            let function_stats = hooks.instrument(function, &dataflow)?;
            stats.merge(&function_stats);
            dataflows.insert(Dataflow::analyze(function));
        }
        Ok(stats)
    }
}

fn snapshots<'a>(
    functions: impl Iterator<Item = &'a Function>,
    parallel: bool,
) -> Vec<Dataflow> {
    let functions: Vec<&Function> = functions.collect();
    if parallel {
        functions.par_iter().map(|f| Dataflow::analyze(f)).collect()
    } else {
        functions.iter().map(|f| Dataflow::analyze(f)).collect()
    }
}

fn shared_conventions(ctx: &Context) -> AnalysisResult<SharedConventions> {
    ctx.conventions()
        .map(Arc::clone)
        .ok_or(AnalysisError::MissingArtifact("conventions"))
}

fn shared_signatures(ctx: &Context) -> AnalysisResult<SharedSignatures> {
    ctx.signatures()
        .map(Arc::clone)
        .ok_or(AnalysisError::MissingArtifact("signatures"))
}

fn revisions(
    conventions: &SharedConventions,
    signatures: &SharedSignatures,
) -> AnalysisResult<(u64, u64)> {
    let conventions = conventions
        .read()
        .map_err(|_| AnalysisError::PoisonedRegistry("conventions"))?
        .revision();
    let signatures = signatures
        .read()
        .map_err(|_| AnalysisError::PoisonedRegistry("signatures"))?
        .revision();
    Ok((conventions, signatures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexhook_core::{Architecture, CallTarget, Module, Program, ProgramBlock, StatementKind};

    fn program() -> Program {
        let mut program = Program::new();
        let mut main = ProgramBlock::new(0x1000);
        main.push(
            0x1010,
            StatementKind::Call {
                target: CallTarget::Direct(0x2000),
            },
        )
        .push(0x1015, StatementKind::Return { pop: 0 });
        program.add_block(main).unwrap();

        let mut callee = ProgramBlock::new(0x2000);
        callee.push(0x2000, StatementKind::Return { pop: 0 });
        program.add_block(callee).unwrap();
        program.add_entry(0x1000, Some("main".to_string()));
        program
    }

    #[test]
    fn test_run_without_program_fails() {
        let mut ctx = Context::new();
        let err = Scheduler::default().run(&mut ctx).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingArtifact("program")));
    }

    #[test]
    fn test_run_without_conventions_converges_uninstrumented() {
        let mut ctx = Context::new();
        ctx.set_program(program());
        let stats = Scheduler::default().run(&mut ctx).unwrap();
        assert!(stats.converged);
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.instrument.inserted, 0);
        assert!(ctx.term_to_function().is_some());
        assert_eq!(ctx.dataflows().map(|d| d.len()), Some(2));
    }

    #[test]
    fn test_default_convention_instruments_everything() {
        let mut ctx = Context::new();
        ctx.set_program(program());
        let config = AnalysisConfig::default()
            .with_default_convention("cdecl")
            .with_parallel_dataflow(false);
        let stats = Scheduler::new(config).run(&mut ctx).unwrap();

        assert!(stats.converged);
        // Entry, call and return of main plus entry and return of the callee.
        assert_eq!(stats.instrument.attached, 5);
        let hooks = ctx.hooks().unwrap();
        assert_eq!(hooks.active_hook_count(), 5);
    }

    #[test]
    fn test_architecture_default_fallback() {
        let mut ctx = Context::new();
        ctx.set_module(Module::new("sample", Architecture::X86_64));
        ctx.set_program(program());
        let config = AnalysisConfig::default()
            .with_architecture_default(true)
            .with_parallel_dataflow(false);
        let stats = Scheduler::new(config).run(&mut ctx).unwrap();

        assert!(stats.converged);
        assert_eq!(stats.instrument.attached, 5);
        let hooks = ctx.hooks().unwrap();
        let conv = hooks.get_convention(&crate::CalleeId::Address(0x2000)).unwrap();
        assert_eq!(conv.map(|c| c.name.clone()), Some("sysv-amd64".to_string()));
    }

    #[test]
    fn test_architecture_default_without_platform_convention() {
        let mut ctx = Context::new();
        ctx.set_module(Module::new("sample", Architecture::Arm64));
        ctx.set_program(program());
        let config = AnalysisConfig::default().with_architecture_default(true);
        let stats = Scheduler::new(config).run(&mut ctx).unwrap();

        assert!(stats.converged);
        assert_eq!(stats.instrument.inserted, 0);
    }

    #[test]
    fn test_emission_leaves_no_synthetic_statements() {
        let mut ctx = Context::new();
        ctx.set_program(program());
        let rx = ctx.subscribe();
        let config = AnalysisConfig::default()
            .with_default_convention("cdecl")
            .for_emission();
        let stats = Scheduler::new(config).run(&mut ctx).unwrap();

        assert!(stats.deinstrumented > 0);
        let functions = ctx.functions().unwrap();
        assert!(functions.iter().all(|f| f.synthetic_count() == 0));
        assert!(ctx.tree().is_some());
        assert_eq!(rx.try_recv(), Ok(crate::ContextEvent::TreeChanged));
    }

    #[test]
    fn test_cancellation_between_functions() {
        let mut ctx = Context::new();
        ctx.set_program(program());
        let token: CancellationToken = ctx.cancellation().clone();
        token.cancel();
        let err = Scheduler::default().run(&mut ctx).unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }
}
