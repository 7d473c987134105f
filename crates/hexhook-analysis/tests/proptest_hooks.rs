//! Property-based tests for hook instrumentation.
//!
//! These generate random functions and random convention assignments and
//! check that instrumentation is idempotent, fully reversible, and never
//! leaves statements of a replaced hook behind.

use proptest::prelude::*;

use hexhook_analysis::{CalleeId, Conventions, Dataflow, HookId, Hooks, Signatures};
use hexhook_core::{
    BasicBlockId, CallTarget, Function, FunctionId, Location, Statement, StatementKind,
    StatementRef, Value,
};

const ENTRY: u64 = 0x1000;
/// Direct call targets. The first one is the function itself.
const TARGETS: [u64; 3] = [ENTRY, 0x2000, 0x3000];
const PRESETS: [Option<&str>; 6] = [
    None,
    Some("cdecl"),
    Some("stdcall"),
    Some("fastcall"),
    Some("sysv-amd64"),
    Some("ms-x64"),
];

// =============================================================================
// Strategy Generators
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Assign(u16, u64),
    CallDirect(usize),
    /// Through a register that is never assigned, so the target stays unknown.
    CallIndirect,
    Return(u32),
    Nop,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u16..5, any::<u64>()).prop_map(|(reg, value)| Op::Assign(reg, value)),
        (0..TARGETS.len()).prop_map(Op::CallDirect),
        Just(Op::CallIndirect),
        prop::sample::select(vec![0u32, 4, 8, 12]).prop_map(Op::Return),
        Just(Op::Nop),
    ]
}

/// Blocks of operations plus extra edges between them.
fn arb_shape() -> impl Strategy<Value = (Vec<Vec<Op>>, Vec<(usize, usize)>)> {
    (1usize..5).prop_flat_map(|blocks| {
        (
            prop::collection::vec(prop::collection::vec(arb_op(), 0..6), blocks),
            prop::collection::vec((0..blocks, 0..blocks), 0..blocks * 2),
        )
    })
}

/// One preset index per direct target.
fn arb_assignment() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..PRESETS.len(), TARGETS.len())
}

fn build(blocks: &[Vec<Op>], edges: &[(usize, usize)]) -> Function {
    let mut function = Function::new(FunctionId(0), "f", Some(ENTRY));
    for _ in 1..blocks.len() {
        function.add_block(None);
    }
    let mut address = ENTRY;
    for (index, ops) in blocks.iter().enumerate() {
        for op in ops {
            let kind = match *op {
                Op::Assign(reg, value) => StatementKind::Assign {
                    dst: Location::Register(reg),
                    src: Value::Constant(value),
                },
                Op::CallDirect(target) => StatementKind::Call {
                    target: CallTarget::Direct(TARGETS[target]),
                },
                Op::CallIndirect => StatementKind::Call {
                    target: CallTarget::Indirect(Location::Register(7)),
                },
                Op::Return(pop) => StatementKind::Return { pop },
                Op::Nop => StatementKind::Nop,
            };
            function
                .push_statement(BasicBlockId(index as u32), Some(address), kind)
                .unwrap();
            address += 4;
        }
    }
    // Chain the blocks so most of them are reachable.
    for index in 1..blocks.len() {
        function
            .add_edge(BasicBlockId(index as u32 - 1), BasicBlockId(index as u32))
            .unwrap();
    }
    for &(from, to) in edges {
        function
            .add_edge(BasicBlockId(from as u32), BasicBlockId(to as u32))
            .unwrap();
    }
    function
}

fn hooks() -> Hooks {
    Hooks::new(
        Conventions::new().into_shared(),
        Signatures::new().into_shared(),
    )
}

fn apply(hooks: &Hooks, assignment: &[usize]) {
    let mut conventions = hooks.conventions().write().unwrap();
    for (target, preset) in TARGETS.iter().zip(assignment) {
        let callee = CalleeId::Address(*target);
        match PRESETS[*preset] {
            Some(name) => {
                let id = conventions.register_preset(name).unwrap();
                conventions.assign(callee, id);
            }
            None => {
                conventions.unassign(&callee);
            }
        }
    }
}

fn instrument(hooks: &mut Hooks, function: &mut Function) -> hexhook_analysis::InstrumentStats {
    let dataflow = Dataflow::analyze(function);
    hooks.instrument(function, &dataflow).unwrap()
}

fn body(function: &Function) -> Vec<Statement> {
    function.statements().cloned().collect()
}

/// Every hook attached to a function, with its anchor (`None` for the entry).
type Attached = (Option<StatementRef>, HookId, Vec<Statement>);

fn active(hooks: &Hooks, function: &Function) -> Vec<Attached> {
    let fid = function.id();
    let attached = hooks.active_hooks(fid);
    let mut out = Vec::new();
    if let Some(hook) = hooks.entry_hook(fid).filter(|h| attached.contains(&h.id())) {
        out.push((None, hook.id(), hook.statements().to_vec()));
    }
    for stmt in function.statements().filter(|s| !s.is_synthetic()) {
        let anchor = StatementRef::new(fid, stmt.id);
        if let Some(hook) = hooks.call_hook(anchor).filter(|h| attached.contains(&h.id())) {
            out.push((Some(anchor), hook.id(), hook.statements().to_vec()));
        }
        if let Some(hook) = hooks.return_hook(anchor).filter(|h| attached.contains(&h.id())) {
            out.push((Some(anchor), hook.id(), hook.statements().to_vec()));
        }
    }
    assert_eq!(out.len(), attached.len());
    out
}

fn attached_ids(hooks: &Hooks, function: &Function) -> Vec<HookId> {
    active(hooks, function).into_iter().map(|(_, id, _)| id).collect()
}

// =============================================================================
// Instrumentation Properties
// =============================================================================

proptest! {
    /// A second instrumentation with unchanged conventions is a no-op.
    #[test]
    fn instrument_is_idempotent(
        (blocks, edges) in arb_shape(),
        assignment in arb_assignment(),
    ) {
        let mut function = build(&blocks, &edges);
        let mut hooks = hooks();
        apply(&hooks, &assignment);

        instrument(&mut hooks, &mut function);
        let first = body(&function);
        let cached = hooks.cached_hook_count();

        let stats = instrument(&mut hooks, &mut function);
        prop_assert!(!stats.changed());
        prop_assert_eq!(stats.synthesized, 0);
        prop_assert_eq!(body(&function), first);
        prop_assert_eq!(hooks.cached_hook_count(), cached);
    }

    /// Deinstrumenting restores the lifted IR, and instrumenting again
    /// reproduces the instrumented IR exactly.
    #[test]
    fn deinstrument_round_trips(
        (blocks, edges) in arb_shape(),
        assignment in arb_assignment(),
    ) {
        let mut function = build(&blocks, &edges);
        let lifted = body(&function);
        let mut hooks = hooks();
        apply(&hooks, &assignment);

        instrument(&mut hooks, &mut function);
        let instrumented = body(&function);

        hooks.deinstrument(&mut function);
        prop_assert_eq!(function.synthetic_count(), 0);
        prop_assert_eq!(body(&function), lifted);
        prop_assert_eq!(hooks.active_hook_count(), 0);

        let stats = instrument(&mut hooks, &mut function);
        prop_assert_eq!(stats.synthesized, 0);
        prop_assert_eq!(body(&function), instrumented);
    }

    /// After any sequence of reassignments, the synthetic statements in the
    /// IR are exactly those of the active hooks, each right next to its
    /// anchor.
    #[test]
    fn reassignment_leaves_no_mixture(
        (blocks, edges) in arb_shape(),
        assignments in prop::collection::vec(arb_assignment(), 1..5),
    ) {
        let mut function = build(&blocks, &edges);
        let mut hooks = hooks();

        for assignment in &assignments {
            apply(&hooks, assignment);
            instrument(&mut hooks, &mut function);

            let hooked = active(&hooks, &function);
            let expected: usize = hooked.iter().map(|(_, _, stmts)| stmts.len()).sum();
            prop_assert_eq!(function.synthetic_count(), expected);

            let stmts = body(&function);
            for (anchor, _, hook_stmts) in &hooked {
                let Some(anchor) = anchor else { continue };
                let Some(first) = hook_stmts.first() else { continue };
                let at = stmts.iter().position(|s| s.id == first.id);
                prop_assert!(at.is_some());
                let at = at.unwrap();
                prop_assert_eq!(&stmts[at..at + hook_stmts.len()], hook_stmts.as_slice());

                let anchor_at = stmts.iter().position(|s| s.id == anchor.statement).unwrap();
                if stmts[anchor_at].is_call() {
                    prop_assert_eq!(at, anchor_at + 1);
                } else {
                    prop_assert!(at < anchor_at);
                }
            }
        }
    }

    /// Going back to an earlier assignment reuses the hooks built for it.
    #[test]
    fn same_key_reuses_hook(
        (blocks, edges) in arb_shape(),
        first in arb_assignment(),
        second in arb_assignment(),
    ) {
        let mut function = build(&blocks, &edges);
        let mut hooks = hooks();

        apply(&hooks, &first);
        instrument(&mut hooks, &mut function);
        let before = attached_ids(&hooks, &function);
        let ir = body(&function);

        apply(&hooks, &second);
        instrument(&mut hooks, &mut function);
        let cached = hooks.cached_hook_count();

        apply(&hooks, &first);
        let stats = instrument(&mut hooks, &mut function);
        prop_assert_eq!(stats.synthesized, 0);
        prop_assert_eq!(hooks.cached_hook_count(), cached);

        let after = attached_ids(&hooks, &function);
        prop_assert_eq!(after, before);
        prop_assert_eq!(body(&function), ir);
    }
}
