//! The binary module being decompiled.

use crate::Architecture;

/// Identity of the image under analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Module {
    pub name: String,
    pub architecture: Architecture,
    pub entry_point: Option<u64>,
}

impl Module {
    pub fn new(name: impl Into<String>, architecture: Architecture) -> Self {
        Self {
            name: name.into(),
            architecture,
            entry_point: None,
        }
    }

    pub fn with_entry_point(mut self, address: u64) -> Self {
        self.entry_point = Some(address);
        self
    }
}
