//! Statement-level IR.
//!
//! Lifted code is a sequence of [`Statement`]s per basic block. Calling
//! convention hooks insert additional statements whose [`Origin`] is
//! [`Origin::Synthetic`]; those make argument reads, return value writes,
//! register clobbers and stack cleanup visible to dataflow analysis.

use crate::FunctionId;
use std::fmt;

/// Identifier of a statement, unique within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatementId(pub u32);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A statement identified across the whole function set.
///
/// Call and return anchors are keyed by this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatementRef {
    pub function: FunctionId,
    pub statement: StatementId,
}

impl StatementRef {
    pub fn new(function: FunctionId, statement: StatementId) -> Self {
        Self {
            function,
            statement,
        }
    }
}

impl fmt::Display for StatementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.function, self.statement)
    }
}

/// A location (register or memory) that can be read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Location {
    /// A register, by architecture-specific id.
    Register(u16),
    /// A stack slot at an offset from the stack pointer value at the anchor.
    Stack(i64),
    /// A global memory address.
    Memory(u64),
    /// CPU flags register.
    Flags,
}

impl Location {
    /// Returns true if this is a register location.
    pub fn is_register(&self) -> bool {
        matches!(self, Self::Register(_))
    }

    /// Returns true if this is a stack slot.
    pub fn is_stack(&self) -> bool {
        matches!(self, Self::Stack(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(id) => write!(f, "r{}", id),
            Self::Stack(offset) if *offset < 0 => write!(f, "[sp-{:#x}]", -offset),
            Self::Stack(offset) => write!(f, "[sp+{:#x}]", offset),
            Self::Memory(addr) => write!(f, "[{:#x}]", addr),
            Self::Flags => write!(f, "flags"),
        }
    }
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Constant(u64),
    Location(Location),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(c) => write!(f, "{:#x}", c),
            Self::Location(loc) => loc.fmt(f),
        }
    }
}

/// Target of a call statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallTarget {
    /// Statically known target address.
    Direct(u64),
    /// Target computed at runtime from a location.
    Indirect(Location),
}

impl CallTarget {
    /// Returns the target address if it is statically known.
    pub fn direct_address(&self) -> Option<u64> {
        match self {
            Self::Direct(addr) => Some(*addr),
            Self::Indirect(_) => None,
        }
    }
}

/// Access mode of a [`StatementKind::Touch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Access {
    Read,
    Write,
}

/// The anchor kind a synthetic statement was inserted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HookKind {
    Entry,
    Call,
    Return,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Call => write!(f, "call"),
            Self::Return => write!(f, "return"),
        }
    }
}

/// Where a statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Origin {
    /// Produced by lifting machine code.
    #[default]
    Lifted,
    /// Inserted by a calling-convention hook.
    Synthetic(HookKind),
}

/// What a statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatementKind {
    /// `dst = src`
    Assign { dst: Location, src: Value },
    /// Call a subroutine. Control returns to the next statement.
    Call { target: CallTarget },
    /// Return to the caller, releasing `pop` bytes of stack arguments.
    Return { pop: u32 },
    /// Unconditional or conditional transfer; targets are the block successors.
    Jump,
    /// No effect.
    Nop,
    /// Synthetic read or write of a location.
    Touch { location: Location, access: Access },
    /// Synthetic destruction of a location's value.
    Kill { location: Location },
    /// Synthetic `pointer = pointer + delta`.
    AdjustStack { pointer: Location, delta: i64 },
}

impl StatementKind {
    /// Returns true for kinds that only hooks produce.
    pub fn is_hook_only(&self) -> bool {
        matches!(
            self,
            Self::Touch { .. } | Self::Kill { .. } | Self::AdjustStack { .. }
        )
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assign { dst, src } => write!(f, "{} = {}", dst, src),
            Self::Call {
                target: CallTarget::Direct(addr),
            } => write!(f, "call {:#x}", addr),
            Self::Call {
                target: CallTarget::Indirect(loc),
            } => write!(f, "call {}", loc),
            Self::Return { pop: 0 } => write!(f, "return"),
            Self::Return { pop } => write!(f, "return {:#x}", pop),
            Self::Jump => write!(f, "jump"),
            Self::Nop => write!(f, "nop"),
            Self::Touch {
                location,
                access: Access::Read,
            } => write!(f, "read {}", location),
            Self::Touch {
                location,
                access: Access::Write,
            } => write!(f, "write {}", location),
            Self::Kill { location } => write!(f, "kill {}", location),
            Self::AdjustStack { pointer, delta } if *delta < 0 => {
                write!(f, "{} -= {:#x}", pointer, -delta)
            }
            Self::AdjustStack { pointer, delta } => write!(f, "{} += {:#x}", pointer, delta),
        }
    }
}

/// A single IR statement.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Statement {
    pub id: StatementId,
    /// Address of the instruction this statement was lifted from.
    pub address: Option<u64>,
    pub kind: StatementKind,
    pub origin: Origin,
}

impl Statement {
    /// Creates a lifted statement.
    pub fn lifted(id: StatementId, address: Option<u64>, kind: StatementKind) -> Self {
        Self {
            id,
            address,
            kind,
            origin: Origin::Lifted,
        }
    }

    /// Creates a statement inserted on behalf of a hook.
    pub fn synthetic(id: StatementId, hook: HookKind, kind: StatementKind) -> Self {
        Self {
            id,
            address: None,
            kind,
            origin: Origin::Synthetic(hook),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.origin, Origin::Synthetic(_))
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, StatementKind::Call { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(self.kind, StatementKind::Return { .. })
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.origin, self.address) {
            (Origin::Synthetic(hook), _) => write!(f, "    [{}] {}", hook, self.kind),
            (Origin::Lifted, Some(addr)) => write!(f, "{:#010x}: {}", addr, self.kind),
            (Origin::Lifted, None) => write!(f, "            {}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_display() {
        let call = Statement::lifted(
            StatementId(1),
            Some(0x1010),
            StatementKind::Call {
                target: CallTarget::Direct(0x2000),
            },
        );
        assert_eq!(call.to_string(), "0x00001010: call 0x2000");

        let touch = Statement::synthetic(
            StatementId(2),
            HookKind::Call,
            StatementKind::Touch {
                location: Location::Stack(4),
                access: Access::Read,
            },
        );
        assert_eq!(touch.to_string(), "    [call] read [sp+0x4]");
        assert!(touch.is_synthetic());
        assert!(!call.is_synthetic());
    }

    #[test]
    fn test_hook_only_kinds() {
        assert!(StatementKind::Kill {
            location: Location::Flags
        }
        .is_hook_only());
        assert!(!StatementKind::Return { pop: 8 }.is_hook_only());
    }

    #[test]
    fn test_negative_adjust_display() {
        let kind = StatementKind::AdjustStack {
            pointer: Location::Register(4),
            delta: -8,
        };
        assert_eq!(kind.to_string(), "r4 -= 0x8");
    }
}
