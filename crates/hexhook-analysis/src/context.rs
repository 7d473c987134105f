//! The artifact store.
//!
//! A [`Context`] owns every artifact of one decompilation session and hands
//! out references to them. It never runs an analysis and never checks that
//! artifacts agree with each other; that is up to the passes producing
//! them. An artifact that has not been set is `None`.
//!
//! Fields are declared in release order: the emitted tree first, then the
//! per-function results, dataflows, hooks and registries, the IR, and the
//! instructions last.

use crate::artifacts::{FunctionArtifacts, Liveness, RegionGraph, Types, Variables};
use crate::calling::{Hooks, SharedConventions, SharedSignatures};
use crate::cancel::CancellationToken;
use crate::dataflow::Dataflows;
use crate::term_to_function::TermToFunction;
use crate::tree::Tree;
use hexhook_core::{FunctionId, Functions, Instructions, Module, Program};
use log::trace;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// Changes external listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    InstructionsChanged,
    TreeChanged,
}

/// Disjoint mutable borrows used by an instrumentation pass.
pub struct InstrumentationParts<'a> {
    pub hooks: &'a mut Hooks,
    pub functions: &'a mut Functions,
    pub dataflows: &'a mut Dataflows,
}

/// Per-session artifact store.
#[derive(Default)]
pub struct Context {
    tree: Option<Tree>,
    artifacts: BTreeMap<FunctionId, FunctionArtifacts>,
    dataflows: Option<Dataflows>,
    hooks: Option<Hooks>,
    signatures: Option<SharedSignatures>,
    conventions: Option<SharedConventions>,
    term_to_function: Option<TermToFunction>,
    functions: Option<Functions>,
    program: Option<Program>,
    instructions: Option<Instructions>,
    module: Option<Module>,

    cancellation: CancellationToken,
    subscribers: Vec<Sender<ContextEvent>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a receiver for change notifications.
    pub fn subscribe(&mut self) -> Receiver<ContextEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: ContextEvent) {
        trace!("notifying {} subscribers of {:?}", self.subscribers.len(), event);
        // Dropped receivers unsubscribe.
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    /// Token polled between per-function passes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    // Whole-program artifacts

    pub fn set_module(&mut self, module: Module) {
        self.module = Some(module);
    }

    pub fn module(&self) -> Option<&Module> {
        self.module.as_ref()
    }

    pub fn set_instructions(&mut self, instructions: Instructions) {
        self.instructions = Some(instructions);
        self.notify(ContextEvent::InstructionsChanged);
    }

    pub fn instructions(&self) -> Option<&Instructions> {
        self.instructions.as_ref()
    }

    pub fn set_program(&mut self, program: Program) {
        self.program = Some(program);
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn set_functions(&mut self, functions: Functions) {
        self.functions = Some(functions);
    }

    pub fn functions(&self) -> Option<&Functions> {
        self.functions.as_ref()
    }

    pub fn functions_mut(&mut self) -> Option<&mut Functions> {
        self.functions.as_mut()
    }

    pub fn set_conventions(&mut self, conventions: SharedConventions) {
        self.conventions = Some(conventions);
    }

    pub fn conventions(&self) -> Option<&SharedConventions> {
        self.conventions.as_ref()
    }

    pub fn set_signatures(&mut self, signatures: SharedSignatures) {
        self.signatures = Some(signatures);
    }

    pub fn signatures(&self) -> Option<&SharedSignatures> {
        self.signatures.as_ref()
    }

    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = Some(hooks);
    }

    pub fn hooks(&self) -> Option<&Hooks> {
        self.hooks.as_ref()
    }

    pub fn hooks_mut(&mut self) -> Option<&mut Hooks> {
        self.hooks.as_mut()
    }

    pub fn set_term_to_function(&mut self, map: TermToFunction) {
        self.term_to_function = Some(map);
    }

    pub fn term_to_function(&self) -> Option<&TermToFunction> {
        self.term_to_function.as_ref()
    }

    pub fn set_dataflows(&mut self, dataflows: Dataflows) {
        self.dataflows = Some(dataflows);
    }

    pub fn dataflows(&self) -> Option<&Dataflows> {
        self.dataflows.as_ref()
    }

    pub fn dataflows_mut(&mut self) -> Option<&mut Dataflows> {
        self.dataflows.as_mut()
    }

    pub fn set_tree(&mut self, tree: Tree) {
        self.tree = Some(tree);
        self.notify(ContextEvent::TreeChanged);
    }

    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    /// Hooks, functions and dataflows at once, if all three are set.
    pub fn instrumentation_parts(&mut self) -> Option<InstrumentationParts<'_>> {
        Some(InstrumentationParts {
            hooks: self.hooks.as_mut()?,
            functions: self.functions.as_mut()?,
            dataflows: self.dataflows.as_mut()?,
        })
    }

    // Per-function artifacts

    fn bundle_mut(&mut self, function: FunctionId) -> &mut FunctionArtifacts {
        self.artifacts.entry(function).or_default()
    }

    /// Everything stored for a function.
    pub fn artifacts(&self, function: FunctionId) -> Option<&FunctionArtifacts> {
        self.artifacts.get(&function).filter(|a| !a.is_empty())
    }

    /// Drops every per-function artifact of a function.
    pub fn clear_artifacts(&mut self, function: FunctionId) {
        self.artifacts.remove(&function);
    }

    pub fn set_liveness(&mut self, function: FunctionId, liveness: Liveness) {
        self.bundle_mut(function).liveness = Some(liveness);
    }

    pub fn liveness(&self, function: FunctionId) -> Option<&Liveness> {
        self.artifacts.get(&function)?.liveness.as_ref()
    }

    pub fn set_types(&mut self, function: FunctionId, types: Types) {
        self.bundle_mut(function).types = Some(types);
    }

    pub fn types(&self, function: FunctionId) -> Option<&Types> {
        self.artifacts.get(&function)?.types.as_ref()
    }

    pub fn set_variables(&mut self, function: FunctionId, variables: Variables) {
        self.bundle_mut(function).variables = Some(variables);
    }

    pub fn variables(&self, function: FunctionId) -> Option<&Variables> {
        self.artifacts.get(&function)?.variables.as_ref()
    }

    pub fn set_region_graph(&mut self, function: FunctionId, graph: RegionGraph) {
        self.bundle_mut(function).region_graph = Some(graph);
    }

    pub fn region_graph(&self, function: FunctionId) -> Option<&RegionGraph> {
        self.artifacts.get(&function)?.region_graph.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::Conventions;
    use hexhook_core::{Architecture, Instruction};
    use std::sync::Arc;

    #[test]
    fn test_fresh_context_is_empty() {
        let ctx = Context::new();
        assert!(ctx.module().is_none());
        assert!(ctx.instructions().is_none());
        assert!(ctx.program().is_none());
        assert!(ctx.functions().is_none());
        assert!(ctx.conventions().is_none());
        assert!(ctx.signatures().is_none());
        assert!(ctx.hooks().is_none());
        assert!(ctx.term_to_function().is_none());
        assert!(ctx.dataflows().is_none());
        assert!(ctx.tree().is_none());
        assert!(ctx.liveness(FunctionId(0)).is_none());
        assert!(ctx.types(FunctionId(0)).is_none());
        assert!(ctx.variables(FunctionId(0)).is_none());
        assert!(ctx.region_graph(FunctionId(0)).is_none());
        assert!(ctx.artifacts(FunctionId(0)).is_none());
    }

    #[test]
    fn test_set_replaces() {
        let mut ctx = Context::new();
        ctx.set_module(Module::new("a.out", Architecture::X86));
        ctx.set_module(Module::new("b.out", Architecture::X86_64));
        assert_eq!(ctx.module().map(|m| m.name.as_str()), Some("b.out"));

        let shared = Conventions::new().into_shared();
        ctx.set_conventions(Arc::clone(&shared));
        assert!(Arc::ptr_eq(ctx.conventions().unwrap(), &shared));
    }

    #[test]
    fn test_per_function_artifacts_are_independent() {
        let mut ctx = Context::new();
        ctx.set_types(FunctionId(1), Types::new());
        assert!(ctx.types(FunctionId(1)).is_some());
        assert!(ctx.liveness(FunctionId(1)).is_none());
        assert!(ctx.types(FunctionId(2)).is_none());

        ctx.clear_artifacts(FunctionId(1));
        assert!(ctx.types(FunctionId(1)).is_none());
    }

    #[test]
    fn test_notifications() {
        let mut ctx = Context::new();
        let rx = ctx.subscribe();
        let dropped = ctx.subscribe();
        drop(dropped);

        ctx.set_instructions(
            [Instruction::new(0x1000, vec![0xc3], "ret")]
                .into_iter()
                .collect(),
        );
        ctx.set_tree(Tree::default());

        assert_eq!(rx.try_recv(), Ok(ContextEvent::InstructionsChanged));
        assert_eq!(rx.try_recv(), Ok(ContextEvent::TreeChanged));
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.subscribers.len(), 1);
    }

    #[test]
    fn test_instrumentation_parts_need_all_three() {
        let mut ctx = Context::new();
        ctx.set_functions(Functions::new());
        assert!(ctx.instrumentation_parts().is_none());

        let conventions = Conventions::new().into_shared();
        let signatures = crate::calling::Signatures::new().into_shared();
        ctx.set_hooks(Hooks::new(conventions, signatures));
        ctx.set_dataflows(Dataflows::new());
        assert!(ctx.instrumentation_parts().is_some());
    }
}
