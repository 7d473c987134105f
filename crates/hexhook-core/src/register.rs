//! Register identifiers.
//!
//! Registers appear in the IR as [`Location::Register`](crate::Location)
//! with an architecture-specific numeric id. The id is shared by all widths
//! of the same register (`rax`, `eax` and `ax` are all [`x86::RAX`]).

use crate::Architecture;

// x86/x86_64 register IDs
pub mod x86 {
    pub const RAX: u16 = 0;
    pub const RCX: u16 = 1;
    pub const RDX: u16 = 2;
    pub const RBX: u16 = 3;
    pub const RSP: u16 = 4;
    pub const RBP: u16 = 5;
    pub const RSI: u16 = 6;
    pub const RDI: u16 = 7;
    pub const R8: u16 = 8;
    pub const R9: u16 = 9;
    pub const R10: u16 = 10;
    pub const R11: u16 = 11;
    pub const R12: u16 = 12;
    pub const R13: u16 = 13;
    pub const R14: u16 = 14;
    pub const R15: u16 = 15;

    // Instruction pointer
    pub const RIP: u16 = 16;

    // XMM registers (128-bit, SSE)
    pub const XMM0: u16 = 64;
    pub const XMM1: u16 = 65;
    pub const XMM2: u16 = 66;
    pub const XMM3: u16 = 67;
}

// ARM64 register IDs: x0-x30 are 0-30.
pub mod arm64 {
    pub const X0: u16 = 0;
    pub const X8: u16 = 8;
    pub const X29: u16 = 29;
    pub const X30: u16 = 30;
    pub const SP: u16 = 31;
}

/// Returns the canonical name of a register id on the given architecture.
pub fn register_name(arch: Architecture, id: u16) -> &'static str {
    match arch {
        Architecture::X86_64 => x86_reg_name(id, 64),
        Architecture::X86 => x86_reg_name(id, 32),
        Architecture::Arm64 => arm64_reg_name(id),
        Architecture::Unknown(_) => "unknown",
    }
}

fn x86_reg_name(id: u16, size: u16) -> &'static str {
    match (id, size) {
        // 64-bit
        (x86::RAX, 64) => "rax",
        (x86::RCX, 64) => "rcx",
        (x86::RDX, 64) => "rdx",
        (x86::RBX, 64) => "rbx",
        (x86::RSP, 64) => "rsp",
        (x86::RBP, 64) => "rbp",
        (x86::RSI, 64) => "rsi",
        (x86::RDI, 64) => "rdi",
        (x86::R8, 64) => "r8",
        (x86::R9, 64) => "r9",
        (x86::R10, 64) => "r10",
        (x86::R11, 64) => "r11",
        (x86::R12, 64) => "r12",
        (x86::R13, 64) => "r13",
        (x86::R14, 64) => "r14",
        (x86::R15, 64) => "r15",
        (x86::RIP, 64) => "rip",

        // 32-bit
        (x86::RAX, 32) => "eax",
        (x86::RCX, 32) => "ecx",
        (x86::RDX, 32) => "edx",
        (x86::RBX, 32) => "ebx",
        (x86::RSP, 32) => "esp",
        (x86::RBP, 32) => "ebp",
        (x86::RSI, 32) => "esi",
        (x86::RDI, 32) => "edi",
        (x86::RIP, 32) => "eip",

        (x86::XMM0, _) => "xmm0",
        (x86::XMM1, _) => "xmm1",
        (x86::XMM2, _) => "xmm2",
        (x86::XMM3, _) => "xmm3",
        _ => "unknown",
    }
}

fn arm64_reg_name(id: u16) -> &'static str {
    const NAMES: [&str; 32] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "x29", "x30", "sp",
    ];
    NAMES.get(id as usize).copied().unwrap_or("unknown")
}

/// Looks up a register id by name. Accepts every width the id covers.
pub fn register_by_name(arch: Architecture, name: &str) -> Option<u16> {
    let name = name.to_lowercase();
    match arch {
        Architecture::X86 | Architecture::X86_64 => {
            (0..=x86::RIP)
                .chain(x86::XMM0..=x86::XMM3)
                .find(|&id| x86_reg_name(id, 64) == name || x86_reg_name(id, 32) == name)
        }
        Architecture::Arm64 => (0..=arm64::SP).find(|&id| arm64_reg_name(id) == name),
        Architecture::Unknown(_) => None,
    }
}
