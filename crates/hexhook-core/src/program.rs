//! Whole-image lifted IR.
//!
//! A [`Program`] holds the lifted blocks of the image keyed by address,
//! independent of function boundaries. [`Program::build_functions`] splits
//! it into [`Functions`].

use crate::{BasicBlockId, Error, Functions, Result, StatementKind};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A lifted statement before it is assigned to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgramStatement {
    pub address: Option<u64>,
    pub kind: StatementKind,
}

/// A lifted basic block addressed by its first instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgramBlock {
    pub address: u64,
    pub statements: Vec<ProgramStatement>,
    /// Addresses of intra-procedural successor blocks.
    pub successors: Vec<u64>,
}

impl ProgramBlock {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            statements: Vec::new(),
            successors: Vec::new(),
        }
    }

    /// Appends a statement lifted from the instruction at `address`.
    pub fn push(&mut self, address: u64, kind: StatementKind) -> &mut Self {
        self.statements.push(ProgramStatement {
            address: Some(address),
            kind,
        });
        self
    }

    pub fn with_successor(mut self, address: u64) -> Self {
        self.successors.push(address);
        self
    }
}

/// Lifted IR of the whole image.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Program {
    blocks: BTreeMap<u64, ProgramBlock>,
    entries: BTreeSet<u64>,
    names: BTreeMap<u64, String>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block. Fails if a block already starts at the same address.
    pub fn add_block(&mut self, block: ProgramBlock) -> Result<()> {
        if self.blocks.contains_key(&block.address) {
            return Err(Error::DuplicateBlock(block.address));
        }
        self.blocks.insert(block.address, block);
        Ok(())
    }

    /// Marks an address as a function entry, optionally naming it.
    pub fn add_entry(&mut self, address: u64, name: Option<String>) {
        self.entries.insert(address);
        if let Some(name) = name {
            self.names.insert(address, name);
        }
    }

    pub fn block(&self, address: u64) -> Option<&ProgramBlock> {
        self.blocks.get(&address)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ProgramBlock> {
        self.blocks.values()
    }

    pub fn entries(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().copied()
    }

    /// Returns every address that starts a function: the declared entries
    /// plus direct call targets that name a block.
    pub fn function_entries(&self) -> BTreeSet<u64> {
        let mut entries = self.entries.clone();
        for block in self.blocks.values() {
            for stmt in &block.statements {
                if let StatementKind::Call { target } = stmt.kind {
                    if let Some(addr) = target.direct_address() {
                        if self.blocks.contains_key(&addr) {
                            entries.insert(addr);
                        }
                    }
                }
            }
        }
        entries
    }

    /// Partitions the program into functions.
    ///
    /// Each function receives its own copy of the blocks reachable from its
    /// entry through successor edges. Successors that name no block are
    /// dropped.
    pub fn build_functions(&self) -> Result<Functions> {
        let mut functions = Functions::new();

        for entry in self.function_entries() {
            if !self.blocks.contains_key(&entry) {
                return Err(Error::MissingEntryBlock(entry));
            }
            let name = self
                .names
                .get(&entry)
                .cloned()
                .unwrap_or_else(|| format!("sub_{:x}", entry));
            let id = functions.add(name, Some(entry));
            let function = functions.get_mut(id).ok_or(Error::InvalidFunctionId(id))?;

            let mut ids: HashMap<u64, BasicBlockId> = HashMap::new();
            ids.insert(entry, BasicBlockId::ENTRY);
            let mut order = vec![entry];
            let mut queue = VecDeque::from([entry]);

            while let Some(addr) = queue.pop_front() {
                for succ in &self.blocks[&addr].successors {
                    if ids.contains_key(succ) || !self.blocks.contains_key(succ) {
                        continue;
                    }
                    ids.insert(*succ, function.add_block(Some(*succ)));
                    order.push(*succ);
                    queue.push_back(*succ);
                }
            }

            for addr in order {
                let block = &self.blocks[&addr];
                let bb = ids[&addr];
                for stmt in &block.statements {
                    function.push_statement(bb, stmt.address, stmt.kind)?;
                }
                for succ in &block.successors {
                    if let Some(&to) = ids.get(succ) {
                        function.add_edge(bb, to)?;
                    }
                }
            }
        }

        Ok(functions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallTarget;

    fn program() -> Program {
        let mut program = Program::new();
        let mut main = ProgramBlock::new(0x1000).with_successor(0x1010);
        main.push(
            0x1000,
            StatementKind::Call {
                target: CallTarget::Direct(0x2000),
            },
        );
        program.add_block(main).unwrap();

        let mut tail = ProgramBlock::new(0x1010).with_successor(0x9999);
        tail.push(0x1010, StatementKind::Return { pop: 0 });
        program.add_block(tail).unwrap();

        let mut callee = ProgramBlock::new(0x2000);
        callee.push(0x2000, StatementKind::Return { pop: 8 });
        program.add_block(callee).unwrap();

        program.add_entry(0x1000, Some("main".to_string()));
        program
    }

    #[test]
    fn test_call_targets_become_entries() {
        let entries: Vec<u64> = program().function_entries().into_iter().collect();
        assert_eq!(entries, vec![0x1000, 0x2000]);
    }

    #[test]
    fn test_build_functions() {
        let functions = program().build_functions().unwrap();
        assert_eq!(functions.len(), 2);

        let main = functions.by_entry(0x1000).unwrap();
        assert_eq!(main.name(), "main");
        assert_eq!(main.blocks().len(), 2);
        assert_eq!(main.entry_block().successors, vec![BasicBlockId(1)]);

        let callee = functions.by_entry(0x2000).unwrap();
        assert_eq!(callee.name(), "sub_2000");
        assert_eq!(callee.statements().count(), 1);
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let mut program = program();
        let err = program.add_block(ProgramBlock::new(0x1000)).unwrap_err();
        assert_eq!(err, Error::DuplicateBlock(0x1000));
    }

    #[test]
    fn test_missing_entry_block() {
        let mut program = program();
        program.add_entry(0x5000, None);
        assert_eq!(
            program.build_functions().unwrap_err(),
            Error::MissingEntryBlock(0x5000)
        );
    }
}
