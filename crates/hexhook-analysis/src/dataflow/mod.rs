//! Dataflow snapshots.
//!
//! A [`Dataflow`] is the read-only result of one analysis pass over one
//! function. The hooks engine uses it to find the call and return anchors
//! and to resolve call targets. A snapshot remembers the function revision
//! it was computed at; using it after a lifted edit is rejected.

pub mod constants;

pub use constants::{ConstantPropagation, Constants};

use crate::{AnalysisError, AnalysisResult};
use hexhook_core::{CallTarget, Function, FunctionId, StatementId, StatementKind};
use std::collections::BTreeMap;

/// A call statement found by the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub statement: StatementId,
    /// Address of the call instruction.
    pub address: Option<u64>,
    /// Resolved target address: the direct target, or the constant held by
    /// the target location of an indirect call.
    pub target: Option<u64>,
    /// A call hook follows the call.
    pub instrumented: bool,
}

/// Dataflow results for one function at one revision.
#[derive(Debug, Clone)]
pub struct Dataflow {
    function: FunctionId,
    revision: u64,
    calls: Vec<CallSite>,
    returns: Vec<StatementId>,
    constants: ConstantPropagation,
}

impl Dataflow {
    /// Analyzes the blocks reachable from the function's entry.
    pub fn analyze(function: &Function) -> Self {
        let constants = ConstantPropagation::analyze(function);
        let mut calls = Vec::new();
        let mut returns = Vec::new();

        for block in function.blocks() {
            let Some(entry) = constants.at_entry(block.id) else {
                continue;
            };
            let stmts = &block.statements;
            let mut index = 0;
            constants::walk_block(block, entry.clone(), |stmt, state| {
                match stmt.kind {
                    StatementKind::Call { target } => {
                        let resolved = match target {
                            CallTarget::Direct(addr) => Some(addr),
                            CallTarget::Indirect(loc) => state.get(&loc),
                        };
                        calls.push(CallSite {
                            statement: stmt.id,
                            address: stmt.address,
                            target: resolved,
                            instrumented: constants::is_hooked_call(stmts.get(index + 1)),
                        });
                    }
                    StatementKind::Return { .. } if !stmt.is_synthetic() => returns.push(stmt.id),
                    _ => {}
                }
                index += 1;
            });
        }

        Self {
            function: function.id(),
            revision: function.revision(),
            calls,
            returns,
            constants,
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Function revision the snapshot was computed at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn calls(&self) -> &[CallSite] {
        &self.calls
    }

    pub fn returns(&self) -> &[StatementId] {
        &self.returns
    }

    pub fn constants(&self) -> &ConstantPropagation {
        &self.constants
    }

    /// Returns true if the snapshot still describes `function`.
    pub fn is_current(&self, function: &Function) -> bool {
        self.function == function.id() && self.revision == function.revision()
    }

    /// Fails unless the snapshot was computed for `function` at its current
    /// revision.
    pub fn ensure_current(&self, function: &Function) -> AnalysisResult<()> {
        if self.function != function.id() {
            return Err(AnalysisError::DataflowMismatch {
                function: function.id(),
                dataflow: self.function,
            });
        }
        if self.revision != function.revision() {
            return Err(AnalysisError::StaleDataflow {
                function: function.id(),
                computed: self.revision,
                current: function.revision(),
            });
        }
        Ok(())
    }
}

/// Dataflow snapshots by function.
#[derive(Debug, Clone, Default)]
pub struct Dataflows {
    snapshots: BTreeMap<FunctionId, Dataflow>,
}

impl Dataflows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot, replacing the previous one for the same function.
    pub fn insert(&mut self, dataflow: Dataflow) -> Option<Dataflow> {
        self.snapshots.insert(dataflow.function, dataflow)
    }

    pub fn get(&self, function: FunctionId) -> Option<&Dataflow> {
        self.snapshots.get(&function)
    }

    pub fn remove(&mut self, function: FunctionId) -> Option<Dataflow> {
        self.snapshots.remove(&function)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dataflow> {
        self.snapshots.values()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl FromIterator<Dataflow> for Dataflows {
    fn from_iter<I: IntoIterator<Item = Dataflow>>(iter: I) -> Self {
        let mut dataflows = Self::new();
        for dataflow in iter {
            dataflows.insert(dataflow);
        }
        dataflows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexhook_core::{BasicBlockId, Location, Value};

    fn function() -> (Function, StatementId, StatementId, StatementId) {
        let mut f = Function::new(FunctionId(0), "main", Some(0x1000));
        f.push_statement(
            BasicBlockId::ENTRY,
            Some(0x1000),
            StatementKind::Assign {
                dst: Location::Register(0),
                src: Value::Constant(0x3000),
            },
        )
        .unwrap();
        let indirect = f
            .push_statement(
                BasicBlockId::ENTRY,
                Some(0x1005),
                StatementKind::Call {
                    target: CallTarget::Indirect(Location::Register(0)),
                },
            )
            .unwrap();
        let direct = f
            .push_statement(
                BasicBlockId::ENTRY,
                Some(0x1010),
                StatementKind::Call {
                    target: CallTarget::Direct(0x2000),
                },
            )
            .unwrap();
        let ret = f
            .push_statement(BasicBlockId::ENTRY, Some(0x1015), StatementKind::Return { pop: 0 })
            .unwrap();
        (f, indirect, direct, ret)
    }

    #[test]
    fn test_call_sites_and_returns() {
        let (f, indirect, direct, ret) = function();
        let df = Dataflow::analyze(&f);
        assert_eq!(df.calls().len(), 2);
        assert_eq!(df.calls()[0].statement, indirect);
        assert_eq!(df.calls()[0].target, Some(0x3000));
        assert_eq!(df.calls()[1].statement, direct);
        assert_eq!(df.calls()[1].target, Some(0x2000));
        assert!(!df.calls()[1].instrumented);
        assert_eq!(df.returns(), &[ret]);
    }

    #[test]
    fn test_unreachable_calls_ignored() {
        let (mut f, _, _, _) = function();
        let orphan = f.add_block(Some(0x5000));
        f.push_statement(
            orphan,
            Some(0x5000),
            StatementKind::Call {
                target: CallTarget::Direct(0x6000),
            },
        )
        .unwrap();
        let df = Dataflow::analyze(&f);
        assert!(df.calls().iter().all(|c| c.target != Some(0x6000)));
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let (mut f, _, _, ret) = function();
        let df = Dataflow::analyze(&f);
        assert!(df.ensure_current(&f).is_ok());

        f.remove_statement(ret).unwrap();
        assert!(!df.is_current(&f));
        assert!(matches!(
            df.ensure_current(&f),
            Err(AnalysisError::StaleDataflow { .. })
        ));

        let other = Function::new(FunctionId(9), "other", None);
        assert!(matches!(
            df.ensure_current(&other),
            Err(AnalysisError::DataflowMismatch { .. })
        ));
    }

    #[test]
    fn test_dataflows_replace() {
        let (f, _, _, _) = function();
        let mut dataflows = Dataflows::new();
        assert!(dataflows.insert(Dataflow::analyze(&f)).is_none());
        assert!(dataflows.insert(Dataflow::analyze(&f)).is_some());
        assert_eq!(dataflows.len(), 1);
    }
}
