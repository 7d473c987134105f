//! Constant propagation over the statement IR.
//!
//! Tracks which locations hold a known constant at each block entry. Only
//! facts that hold on every incoming path survive a merge. Calls without a
//! hook destroy everything; a hooked call only loses what its hook kills or
//! writes, since those statements follow the call and go through the
//! transfer function like any other.

use hexhook_core::{
    Access, BasicBlock, BasicBlockId, Function, HookKind, Location, Origin, Statement,
    StatementKind, Value,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Known constant values at one program point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constants {
    values: BTreeMap<Location, u64>,
}

impl Constants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, loc: &Location) -> Option<u64> {
        self.values.get(loc).copied()
    }

    pub fn set(&mut self, loc: Location, value: Option<u64>) {
        match value {
            Some(v) => {
                self.values.insert(loc, v);
            }
            None => {
                self.values.remove(&loc);
            }
        }
    }

    /// Keeps only the facts both states agree on.
    pub fn meet(&mut self, other: &Self) {
        self.values.retain(|loc, v| other.values.get(loc) == Some(v));
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Rebases stack slots after the stack pointer moved by `delta`.
    fn shift_stack(&mut self, delta: i64) {
        let values = std::mem::take(&mut self.values);
        self.values = values
            .into_iter()
            .map(|(loc, v)| match loc {
                Location::Stack(off) => (Location::Stack(off - delta), v),
                other => (other, v),
            })
            .collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Location, u64)> {
        self.values.iter().map(|(l, v)| (l, *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Returns true if `next` is the first statement of a call hook.
pub(crate) fn is_hooked_call(next: Option<&Statement>) -> bool {
    matches!(next, Some(s) if s.origin == Origin::Synthetic(HookKind::Call))
}

/// Applies one statement to the state.
pub(crate) fn transfer(stmt: &Statement, next: Option<&Statement>, state: &mut Constants) {
    match stmt.kind {
        StatementKind::Assign { dst, src } => {
            let value = match src {
                Value::Constant(c) => Some(c),
                Value::Location(loc) => state.get(&loc),
            };
            state.set(dst, value);
        }
        StatementKind::Call { .. } => {
            if !is_hooked_call(next) {
                state.clear();
            }
        }
        StatementKind::Touch {
            location,
            access: Access::Write,
        }
        | StatementKind::Kill { location } => state.set(location, None),
        StatementKind::AdjustStack { pointer, delta } => {
            let moved = state.get(&pointer).map(|v| v.wrapping_add(delta as u64));
            state.shift_stack(delta);
            state.set(pointer, moved);
        }
        StatementKind::Touch {
            access: Access::Read,
            ..
        }
        | StatementKind::Return { .. }
        | StatementKind::Jump
        | StatementKind::Nop => {}
    }
}

/// Runs `visit` on each statement of a block with the state before it.
pub(crate) fn walk_block(
    block: &BasicBlock,
    mut state: Constants,
    mut visit: impl FnMut(&Statement, &Constants),
) -> Constants {
    let stmts = &block.statements;
    for (i, stmt) in stmts.iter().enumerate() {
        visit(stmt, &state);
        transfer(stmt, stmts.get(i + 1), &mut state);
    }
    state
}

/// Constant propagation result for one function.
#[derive(Debug, Clone, Default)]
pub struct ConstantPropagation {
    /// State at the entry of each reachable block.
    block_entry: HashMap<BasicBlockId, Constants>,
}

impl ConstantPropagation {
    /// Runs constant propagation on the blocks reachable from the entry.
    pub fn analyze(function: &Function) -> Self {
        let mut preds: HashMap<BasicBlockId, Vec<BasicBlockId>> = HashMap::new();
        for block in function.blocks() {
            for succ in &block.successors {
                preds.entry(*succ).or_default().push(block.id);
            }
        }

        let mut block_entry: HashMap<BasicBlockId, Constants> = HashMap::new();
        let mut block_exit: HashMap<BasicBlockId, Constants> = HashMap::new();
        let mut worklist = vec![BasicBlockId::ENTRY];
        let mut queued: HashSet<BasicBlockId> = HashSet::from([BasicBlockId::ENTRY]);

        while let Some(id) = worklist.pop() {
            queued.remove(&id);
            let Some(block) = function.block(id) else {
                continue;
            };

            // Unvisited predecessors contribute nothing yet.
            let mut entry: Option<Constants> = None;
            if id == BasicBlockId::ENTRY {
                entry = Some(Constants::new());
            }
            for pred in preds.get(&id).into_iter().flatten() {
                if let Some(exit) = block_exit.get(pred) {
                    match &mut entry {
                        Some(state) => state.meet(exit),
                        None => entry = Some(exit.clone()),
                    }
                }
            }
            let entry = entry.unwrap_or_default();
            block_entry.insert(id, entry.clone());

            let exit = walk_block(block, entry, |_, _| {});
            if block_exit.get(&id) != Some(&exit) {
                block_exit.insert(id, exit);
                for succ in &block.successors {
                    if queued.insert(*succ) {
                        worklist.push(*succ);
                    }
                }
            }
        }

        Self { block_entry }
    }

    /// State at the entry of a block, `None` if the block is unreachable.
    pub fn at_entry(&self, block: BasicBlockId) -> Option<&Constants> {
        self.block_entry.get(&block)
    }

    pub fn is_reachable(&self, block: BasicBlockId) -> bool {
        self.block_entry.contains_key(&block)
    }
}
