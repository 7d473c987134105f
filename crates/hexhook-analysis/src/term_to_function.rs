//! Instruction address to owning function.

use hexhook_core::{FunctionId, Functions};
use std::collections::BTreeMap;

/// Maps the address of every lifted statement to the function holding it.
///
/// A block reachable from several entries belongs to each of them; the
/// function with the lowest id wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermToFunction {
    owners: BTreeMap<u64, FunctionId>,
}

impl TermToFunction {
    pub fn build(functions: &Functions) -> Self {
        let mut owners = BTreeMap::new();
        for function in functions.iter() {
            for stmt in function.statements() {
                if let Some(addr) = stmt.address {
                    owners.entry(addr).or_insert(function.id());
                }
            }
        }
        Self { owners }
    }

    pub fn function_at(&self, address: u64) -> Option<FunctionId> {
        self.owners.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
