//! Decoded instructions.

use std::collections::BTreeMap;

/// A decoded machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    /// Virtual address of this instruction.
    pub address: u64,
    /// Size in bytes.
    pub size: usize,
    /// Raw bytes of the instruction.
    pub bytes: Vec<u8>,
    /// Mnemonic string (e.g., "mov", "call", "ret").
    pub mnemonic: String,
    /// Operand text as printed by the disassembler.
    pub operands: String,
}

impl Instruction {
    /// Creates a new instruction with minimal fields.
    pub fn new(address: u64, bytes: Vec<u8>, mnemonic: impl Into<String>) -> Self {
        Self {
            address,
            size: bytes.len(),
            bytes,
            mnemonic: mnemonic.into(),
            operands: String::new(),
        }
    }

    /// Sets the operand text.
    pub fn with_operands(mut self, operands: impl Into<String>) -> Self {
        self.operands = operands.into();
        self
    }

    /// Returns the address after this instruction.
    pub fn end_address(&self) -> u64 {
        self.address + self.size as u64
    }
}

/// An address-ordered set of instructions.
///
/// Built once by the decoder and treated as immutable afterwards; the
/// analysis context shares it behind an `Arc`.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instructions {
    by_address: BTreeMap<u64, Instruction>,
}

impl Instructions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an instruction, replacing any previous one at the same address.
    pub fn add(&mut self, instruction: Instruction) -> Option<Instruction> {
        self.by_address.insert(instruction.address, instruction)
    }

    pub fn get(&self, address: u64) -> Option<&Instruction> {
        self.by_address.get(&address)
    }

    /// Finds the instruction covering `address`.
    pub fn covering(&self, address: u64) -> Option<&Instruction> {
        self.by_address
            .range(..=address)
            .next_back()
            .map(|(_, inst)| inst)
            .filter(|inst| address < inst.end_address())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.by_address.values()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

impl FromIterator<Instruction> for Instructions {
    fn from_iter<I: IntoIterator<Item = Instruction>>(iter: I) -> Self {
        let mut set = Self::new();
        for inst in iter {
            set.add(inst);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_lookup() {
        let set: Instructions = [
            Instruction::new(0x1000, vec![0x55], "push").with_operands("ebp"),
            Instruction::new(0x1001, vec![0xe8, 0, 0, 0, 0], "call"),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.len(), 2);
        assert_eq!(set.covering(0x1003).map(|i| i.address), Some(0x1001));
        assert!(set.covering(0x1006).is_none());
        assert!(set.covering(0x0fff).is_none());
    }
}
