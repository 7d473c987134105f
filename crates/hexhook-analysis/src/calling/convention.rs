//! Calling convention descriptions.
//!
//! A [`Convention`] is an immutable description of an ABI: where arguments
//! and return values live, who releases stack arguments, and which
//! locations a call destroys.
//!
//! # Presets
//!
//! ## cdecl (x86)
//! - Arguments: stack, 4-byte slots, right to left
//! - Return: eax, edx (64-bit)
//! - Clobbered: eax, ecx, edx, flags
//! - Cleanup: caller
//!
//! ## stdcall (x86)
//! - As cdecl, but the callee releases the arguments (`ret N`)
//!
//! ## fastcall (x86)
//! - Arguments: ecx, edx, then stack
//! - Cleanup: callee
//!
//! ## System V AMD64 (Linux, macOS, BSD)
//! - Arguments: rdi, rsi, rdx, rcx, r8, r9, then stack
//! - Return: rax, rdx (128-bit)
//! - Clobbered: rax, rcx, rdx, rsi, rdi, r8-r11, flags
//!
//! ## Microsoft x64
//! - Arguments: rcx, rdx, r8, r9, then stack above 32 bytes of shadow space
//! - Return: rax
//! - Clobbered: rax, rcx, rdx, r8-r11, flags

use hexhook_core::register::x86;
use hexhook_core::{Architecture, Location};

/// Who releases stack arguments after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackCleanup {
    Caller,
    Callee,
}

/// The point of view an argument location is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    /// Inside the callee, right after the return address was pushed.
    Entry,
    /// At the call statement in the caller, before the return address is pushed.
    Call,
}

/// An ABI description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convention {
    pub name: String,
    pub architecture: Architecture,
    pub stack_pointer: Location,
    /// Bytes the call instruction pushes (the return address).
    pub return_address_size: u32,
    /// Register arguments in order.
    pub register_arguments: Vec<Location>,
    /// Offset of the first stack argument from the stack pointer at the call.
    pub stack_arguments_offset: i64,
    pub stack_slot_size: u32,
    /// Stack arguments assumed when the callee's signature is unknown.
    pub speculative_stack_arguments: usize,
    /// Return value locations, lowest part first.
    pub return_values: Vec<Location>,
    pub clobbered: Vec<Location>,
    pub cleanup: StackCleanup,
}

impl Convention {
    /// Location of argument `index` as seen from `site`.
    pub fn argument_location(&self, index: usize, site: Site) -> Location {
        if let Some(reg) = self.register_arguments.get(index) {
            return *reg;
        }
        let stack_index = (index - self.register_arguments.len()) as i64;
        let mut offset = self.stack_arguments_offset + stack_index * self.stack_slot_size as i64;
        if site == Site::Entry {
            offset += self.return_address_size as i64;
        }
        Location::Stack(offset)
    }

    /// Locations of the first `count` arguments as seen from `site`.
    pub fn argument_locations(&self, count: usize, site: Site) -> Vec<Location> {
        (0..count).map(|i| self.argument_location(i, site)).collect()
    }

    /// Number of arguments assumed for an unsigned callee.
    pub fn speculative_argument_count(&self) -> usize {
        self.register_arguments.len() + self.speculative_stack_arguments
    }

    /// Bytes of stack used by `count` arguments.
    pub fn stack_argument_bytes(&self, count: usize) -> u32 {
        count.saturating_sub(self.register_arguments.len()) as u32 * self.stack_slot_size
    }

    /// Return locations for a value of `size` bytes.
    ///
    /// `None` means the size is unknown and every return location is used.
    pub fn return_locations(&self, size: Option<usize>) -> Vec<Location> {
        match size {
            None => self.return_values.clone(),
            Some(0) => Vec::new(),
            Some(size) => {
                let slot = self.stack_slot_size.max(1) as usize;
                let parts = size.div_ceil(slot).clamp(1, self.return_values.len().max(1));
                self.return_values.iter().take(parts).copied().collect()
            }
        }
    }

    /// Whether the callee releases its stack arguments.
    pub fn is_callee_cleanup(&self) -> bool {
        self.cleanup == StackCleanup::Callee
    }

    /// Looks up a preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "cdecl" => Some(Self::cdecl()),
            "stdcall" => Some(Self::stdcall()),
            "fastcall" => Some(Self::fastcall()),
            "sysv" | "sysv-amd64" | "systemv" => Some(Self::sysv_amd64()),
            "ms" | "ms-x64" | "win64" => Some(Self::ms_x64()),
            _ => None,
        }
    }

    /// Names accepted by [`Convention::preset`].
    pub fn preset_names() -> &'static [&'static str] {
        &["cdecl", "stdcall", "fastcall", "sysv-amd64", "ms-x64"]
    }

    /// Default preset for an architecture.
    pub fn default_for(arch: Architecture) -> Option<Self> {
        match arch {
            Architecture::X86 => Some(Self::cdecl()),
            Architecture::X86_64 => Some(Self::sysv_amd64()),
            Architecture::Arm64 | Architecture::Unknown(_) => None,
        }
    }

    pub fn cdecl() -> Self {
        Self {
            name: "cdecl".to_string(),
            architecture: Architecture::X86,
            stack_pointer: Location::Register(x86::RSP),
            return_address_size: 4,
            register_arguments: Vec::new(),
            stack_arguments_offset: 0,
            stack_slot_size: 4,
            speculative_stack_arguments: 4,
            return_values: regs(&[x86::RAX, x86::RDX]),
            clobbered: with_flags(&[x86::RAX, x86::RCX, x86::RDX]),
            cleanup: StackCleanup::Caller,
        }
    }

    pub fn stdcall() -> Self {
        Self {
            name: "stdcall".to_string(),
            cleanup: StackCleanup::Callee,
            ..Self::cdecl()
        }
    }

    pub fn fastcall() -> Self {
        Self {
            name: "fastcall".to_string(),
            register_arguments: regs(&[x86::RCX, x86::RDX]),
            speculative_stack_arguments: 2,
            cleanup: StackCleanup::Callee,
            ..Self::cdecl()
        }
    }

    pub fn sysv_amd64() -> Self {
        Self {
            name: "sysv-amd64".to_string(),
            architecture: Architecture::X86_64,
            stack_pointer: Location::Register(x86::RSP),
            return_address_size: 8,
            register_arguments: regs(&[x86::RDI, x86::RSI, x86::RDX, x86::RCX, x86::R8, x86::R9]),
            stack_arguments_offset: 0,
            stack_slot_size: 8,
            speculative_stack_arguments: 0,
            return_values: regs(&[x86::RAX, x86::RDX]),
            clobbered: with_flags(&[
                x86::RAX,
                x86::RCX,
                x86::RDX,
                x86::RSI,
                x86::RDI,
                x86::R8,
                x86::R9,
                x86::R10,
                x86::R11,
            ]),
            cleanup: StackCleanup::Caller,
        }
    }

    pub fn ms_x64() -> Self {
        Self {
            name: "ms-x64".to_string(),
            register_arguments: regs(&[x86::RCX, x86::RDX, x86::R8, x86::R9]),
            stack_arguments_offset: 32, // Shadow space
            return_values: regs(&[x86::RAX]),
            clobbered: with_flags(&[
                x86::RAX,
                x86::RCX,
                x86::RDX,
                x86::R8,
                x86::R9,
                x86::R10,
                x86::R11,
            ]),
            ..Self::sysv_amd64()
        }
    }
}

fn regs(ids: &[u16]) -> Vec<Location> {
    ids.iter().map(|&id| Location::Register(id)).collect()
}

fn with_flags(ids: &[u16]) -> Vec<Location> {
    let mut locs = regs(ids);
    locs.push(Location::Flags);
    locs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdecl_stack_arguments() {
        let cdecl = Convention::cdecl();
        assert_eq!(cdecl.argument_location(0, Site::Call), Location::Stack(0));
        assert_eq!(cdecl.argument_location(1, Site::Call), Location::Stack(4));
        // The return address sits between the callee's sp and its arguments.
        assert_eq!(cdecl.argument_location(0, Site::Entry), Location::Stack(4));
        assert_eq!(cdecl.stack_argument_bytes(3), 12);
    }

    #[test]
    fn test_fastcall_registers_then_stack() {
        let fastcall = Convention::fastcall();
        let locs = fastcall.argument_locations(3, Site::Call);
        assert_eq!(
            locs,
            vec![
                Location::Register(x86::RCX),
                Location::Register(x86::RDX),
                Location::Stack(0)
            ]
        );
        assert_eq!(fastcall.stack_argument_bytes(3), 4);
        assert_eq!(fastcall.stack_argument_bytes(1), 0);
    }

    #[test]
    fn test_ms_x64_shadow_space() {
        let ms = Convention::ms_x64();
        assert_eq!(ms.argument_location(4, Site::Call), Location::Stack(32));
        assert_eq!(ms.argument_location(4, Site::Entry), Location::Stack(40));
    }

    #[test]
    fn test_return_locations_by_size() {
        let cdecl = Convention::cdecl();
        assert_eq!(cdecl.return_locations(Some(0)), vec![]);
        assert_eq!(cdecl.return_locations(Some(4)), vec![Location::Register(x86::RAX)]);
        assert_eq!(cdecl.return_locations(Some(8)).len(), 2);
        assert_eq!(cdecl.return_locations(None).len(), 2);
        assert_eq!(Convention::ms_x64().return_locations(Some(16)).len(), 1);
    }

    #[test]
    fn test_presets() {
        for name in Convention::preset_names() {
            let conv = Convention::preset(name).unwrap();
            assert_eq!(&conv.name, name);
        }
        assert!(Convention::preset("pascal").is_none());
        assert!(Convention::stdcall().is_callee_cleanup());
        assert!(!Convention::cdecl().is_callee_cleanup());
        assert_eq!(
            Convention::default_for(Architecture::X86_64).map(|c| c.name),
            Some("sysv-amd64".to_string())
        );
    }
}
