//! Functions and their basic blocks.
//!
//! A [`Function`] owns its blocks and statements. Two kinds of edits are
//! distinguished:
//!
//! - lifted edits ([`Function::push_statement`], [`Function::remove_statement`],
//!   [`Function::add_edge`]) change the function's meaning and bump its
//!   revision, which invalidates dataflow snapshots taken earlier;
//! - synthetic edits ([`Function::insert_synthetic`],
//!   [`Function::remove_synthetic`]) are how hooks attach and detach, and
//!   leave the revision untouched.

use crate::{Error, Result, Statement, StatementId, StatementKind};
use std::fmt;

/// Unique identifier for a basic block within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicBlockId(pub u32);

impl BasicBlockId {
    /// The entry block ID (always 0).
    pub const ENTRY: Self = Self(0);
}

impl fmt::Display for BasicBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Index of a function in [`Functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// A straight-line sequence of statements.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicBlock {
    pub id: BasicBlockId,
    /// Address of the first lifted instruction, if known.
    pub address: Option<u64>,
    pub statements: Vec<Statement>,
    pub successors: Vec<BasicBlockId>,
}

impl BasicBlock {
    /// Creates a new empty basic block.
    pub fn new(id: BasicBlockId, address: Option<u64>) -> Self {
        Self {
            id,
            address,
            statements: Vec::new(),
            successors: Vec::new(),
        }
    }

    /// Returns true if this block is empty.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Returns the number of statements in this block.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    fn position(&self, id: StatementId) -> Option<usize> {
        self.statements.iter().position(|s| s.id == id)
    }
}

/// Where synthetic statements go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// At the beginning of a block.
    BlockStart(BasicBlockId),
    /// Immediately before a statement.
    Before(StatementId),
    /// Immediately after a statement.
    After(StatementId),
}

/// A function: an entry block plus the blocks reachable from it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Function {
    id: FunctionId,
    name: String,
    entry_address: Option<u64>,
    blocks: Vec<BasicBlock>,
    next_statement: u32,
    revision: u64,
}

impl Function {
    /// Creates a function with an empty entry block.
    pub fn new(id: FunctionId, name: impl Into<String>, entry_address: Option<u64>) -> Self {
        Self {
            id,
            name: name.into(),
            entry_address,
            blocks: vec![BasicBlock::new(BasicBlockId::ENTRY, entry_address)],
            next_statement: 0,
            revision: 0,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_address(&self) -> Option<u64> {
        self.entry_address
    }

    /// Revision counter bumped by every lifted edit.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn entry_block(&self) -> &BasicBlock {
        &self.blocks[0]
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BasicBlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0 as usize)
    }

    /// Appends a new empty block.
    pub fn add_block(&mut self, address: Option<u64>) -> BasicBlockId {
        let id = BasicBlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, address));
        self.revision += 1;
        id
    }

    /// Adds a control flow edge.
    pub fn add_edge(&mut self, from: BasicBlockId, to: BasicBlockId) -> Result<()> {
        if self.block(to).is_none() {
            return Err(Error::InvalidBlockId(to));
        }
        let block = self.block_mut(from)?;
        if !block.successors.contains(&to) {
            block.successors.push(to);
        }
        self.revision += 1;
        Ok(())
    }

    /// Hands out a fresh statement id. Ids are never reused.
    pub fn allocate_statement_id(&mut self) -> StatementId {
        let id = StatementId(self.next_statement);
        self.next_statement += 1;
        id
    }

    /// Appends a lifted statement to a block.
    pub fn push_statement(
        &mut self,
        block: BasicBlockId,
        address: Option<u64>,
        kind: StatementKind,
    ) -> Result<StatementId> {
        self.block_mut(block)?;
        let id = self.allocate_statement_id();
        self.block_mut(block)?
            .statements
            .push(Statement::lifted(id, address, kind));
        self.revision += 1;
        Ok(id)
    }

    /// Removes a lifted statement.
    pub fn remove_statement(&mut self, id: StatementId) -> Result<Statement> {
        let (block, index) = self.locate(id).ok_or(Error::StatementNotFound {
            function: self.id,
            statement: id,
        })?;
        let removed = self.blocks[block.0 as usize].statements.remove(index);
        self.revision += 1;
        Ok(removed)
    }

    /// Finds the block and index holding a statement.
    pub fn locate(&self, id: StatementId) -> Option<(BasicBlockId, usize)> {
        self.blocks
            .iter()
            .find_map(|b| b.position(id).map(|idx| (b.id, idx)))
    }

    pub fn statement(&self, id: StatementId) -> Option<&Statement> {
        self.locate(id)
            .map(|(b, idx)| &self.blocks[b.0 as usize].statements[idx])
    }

    /// Iterates over every statement in block order.
    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.blocks.iter().flat_map(|b| b.statements.iter())
    }

    /// Number of synthetic statements currently in the body.
    pub fn synthetic_count(&self) -> usize {
        self.statements().filter(|s| s.is_synthetic()).count()
    }

    /// Inserts hook statements without bumping the revision.
    pub fn insert_synthetic(
        &mut self,
        position: InsertPosition,
        statements: &[Statement],
    ) -> Result<()> {
        let (block, index) = match position {
            InsertPosition::BlockStart(block) => {
                self.block_mut(block)?;
                (block, 0)
            }
            InsertPosition::Before(id) => self.locate(id).ok_or(Error::StatementNotFound {
                function: self.id,
                statement: id,
            })?,
            InsertPosition::After(id) => {
                let (block, index) = self.locate(id).ok_or(Error::StatementNotFound {
                    function: self.id,
                    statement: id,
                })?;
                (block, index + 1)
            }
        };

        let body = &mut self.blocks[block.0 as usize].statements;
        body.splice(index..index, statements.iter().cloned());
        Ok(())
    }

    /// Removes the given synthetic statements, returning how many were
    /// found. Lifted statements are never removed, whatever their id.
    ///
    /// Does not bump the revision.
    pub fn remove_synthetic(&mut self, ids: &[StatementId]) -> usize {
        let mut removed = 0;
        for block in &mut self.blocks {
            let before = block.statements.len();
            block.statements.retain(|s| !(s.is_synthetic() && ids.contains(&s.id)));
            removed += before - block.statements.len();
        }
        removed
    }

    fn block_mut(&mut self, id: BasicBlockId) -> Result<&mut BasicBlock> {
        self.blocks
            .get_mut(id.0 as usize)
            .ok_or(Error::InvalidBlockId(id))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry_address {
            Some(addr) => writeln!(f, "function {} @ {:#x}", self.name, addr)?,
            None => writeln!(f, "function {}", self.name)?,
        }
        for block in &self.blocks {
            write!(f, "  {}:", block.id)?;
            if !block.successors.is_empty() {
                let succs: Vec<String> = block.successors.iter().map(|s| s.to_string()).collect();
                write!(f, " -> {}", succs.join(", "))?;
            }
            writeln!(f)?;
            for stmt in &block.statements {
                writeln!(f, "    {}", stmt)?;
            }
        }
        Ok(())
    }
}

/// The set of functions of a program, indexed by [`FunctionId`].
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Functions {
    functions: Vec<Function>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new function and returns its id.
    pub fn add(&mut self, name: impl Into<String>, entry_address: Option<u64>) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Function::new(id, name, entry_address));
        id
    }

    pub fn get(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id.0 as usize)
    }

    /// Finds the function whose entry is at `address`.
    pub fn by_entry(&self, address: u64) -> Option<&Function> {
        self.functions
            .iter()
            .find(|f| f.entry_address == Some(address))
    }

    pub fn ids(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.functions.iter().map(|f| f.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.functions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallTarget, HookKind, Location};

    fn sample() -> (Function, StatementId, StatementId) {
        let mut func = Function::new(FunctionId(0), "f", Some(0x1000));
        let call = func
            .push_statement(
                BasicBlockId::ENTRY,
                Some(0x1000),
                StatementKind::Call {
                    target: CallTarget::Direct(0x2000),
                },
            )
            .unwrap();
        let ret = func
            .push_statement(BasicBlockId::ENTRY, Some(0x1005), StatementKind::Return { pop: 0 })
            .unwrap();
        (func, call, ret)
    }

    fn kill(func: &mut Function) -> Statement {
        let id = func.allocate_statement_id();
        Statement::synthetic(
            id,
            HookKind::Call,
            StatementKind::Kill {
                location: Location::Flags,
            },
        )
    }

    #[test]
    fn test_lifted_edits_bump_revision() {
        let (mut func, call, _) = sample();
        let rev = func.revision();
        func.remove_statement(call).unwrap();
        assert!(func.revision() > rev);
    }

    #[test]
    fn test_synthetic_edits_keep_revision() {
        let (mut func, call, ret) = sample();
        let rev = func.revision();

        let stmt = kill(&mut func);
        let id = stmt.id;
        func.insert_synthetic(InsertPosition::After(call), &[stmt]).unwrap();
        assert_eq!(func.locate(id), Some((BasicBlockId::ENTRY, 1)));
        assert_eq!(func.locate(ret), Some((BasicBlockId::ENTRY, 2)));
        assert_eq!(func.synthetic_count(), 1);

        assert_eq!(func.remove_synthetic(&[id]), 1);
        assert_eq!(func.synthetic_count(), 0);
        assert_eq!(func.revision(), rev);
    }

    #[test]
    fn test_remove_synthetic_spares_lifted() {
        let (mut func, call, ret) = sample();
        let rev = func.revision();
        assert_eq!(func.remove_synthetic(&[call, ret]), 0);
        assert_eq!(func.locate(call), Some((BasicBlockId::ENTRY, 0)));
        assert_eq!(func.statements().count(), 2);
        assert_eq!(func.revision(), rev);
    }

    #[test]
    fn test_insert_positions() {
        let (mut func, _, ret) = sample();
        let before = kill(&mut func);
        let start = kill(&mut func);
        let (before_id, start_id) = (before.id, start.id);

        func.insert_synthetic(InsertPosition::Before(ret), &[before]).unwrap();
        func.insert_synthetic(InsertPosition::BlockStart(BasicBlockId::ENTRY), &[start])
            .unwrap();

        let order: Vec<StatementId> = func.statements().map(|s| s.id).collect();
        assert_eq!(order[0], start_id);
        assert_eq!(order[order.len() - 2], before_id);
        assert_eq!(order[order.len() - 1], ret);
    }

    #[test]
    fn test_insert_after_missing_statement() {
        let (mut func, _, _) = sample();
        let stmt = kill(&mut func);
        let err = func
            .insert_synthetic(InsertPosition::After(StatementId(99)), &[stmt])
            .unwrap_err();
        assert!(matches!(err, Error::StatementNotFound { .. }));
    }

    #[test]
    fn test_statement_ids_not_reused() {
        let (mut func, call, _) = sample();
        func.remove_statement(call).unwrap();
        let next = func.allocate_statement_id();
        assert!(next > call);
    }

    #[test]
    fn test_functions_lookup() {
        let mut functions = Functions::new();
        let a = functions.add("a", Some(0x1000));
        let b = functions.add("b", None);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions.by_entry(0x1000).map(|f| f.id()), Some(a));
        assert_eq!(functions.get(b).map(|f| f.name()), Some("b"));
        assert!(functions.get(FunctionId(7)).is_none());
    }
}
