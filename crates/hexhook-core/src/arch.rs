//! Architecture identification and properties.

/// Supported CPU architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Architecture {
    /// x86-64 / AMD64
    X86_64,
    /// 32-bit x86
    X86,
    /// ARM 64-bit (AArch64)
    Arm64,
    /// Unknown architecture
    Unknown(u16),
}

impl Architecture {
    /// Returns the pointer size in bytes for this architecture.
    pub fn pointer_size(&self) -> usize {
        match self {
            Self::X86_64 | Self::Arm64 => 8,
            Self::X86 => 4,
            Self::Unknown(_) => 8, // Default assumption
        }
    }

    /// Returns whether this is a 64-bit architecture.
    pub fn is_64bit(&self) -> bool {
        matches!(self, Self::X86_64 | Self::Arm64)
    }

    /// Returns the name of this architecture.
    pub fn name(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::X86 => "x86",
            Self::Arm64 => "arm64",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Parses an architecture name as printed by [`Architecture::name`].
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" | "x64" => Some(Self::X86_64),
            "x86" | "i386" | "i686" => Some(Self::X86),
            "arm64" | "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_size() {
        assert_eq!(Architecture::X86.pointer_size(), 4);
        assert_eq!(Architecture::X86_64.pointer_size(), 8);
        assert!(!Architecture::X86.is_64bit());
    }

    #[test]
    fn test_parse_round_trips_name() {
        for arch in [Architecture::X86, Architecture::X86_64, Architecture::Arm64] {
            assert_eq!(Architecture::parse(arch.name()), Some(arch));
        }
        assert_eq!(Architecture::parse("AMD64"), Some(Architecture::X86_64));
        assert_eq!(Architecture::parse("mips"), None);
    }
}
