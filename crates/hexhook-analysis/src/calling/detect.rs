//! Convention detection.
//!
//! The hooks engine calls its detector when a callee has no assigned
//! convention. A detector may run further analysis and registers whatever it
//! finds in the [`Conventions`] registry it is handed; the engine re-reads
//! the registry afterwards. Leaving the callee unassigned is a valid answer.

use super::{CalleeId, Convention, Conventions};
use hexhook_core::Architecture;
use log::debug;

/// Resolves the calling convention of a callee on demand.
pub trait ConventionDetector {
    fn detect(&mut self, callee: &CalleeId, conventions: &mut Conventions);
}

impl<F> ConventionDetector for F
where
    F: FnMut(&CalleeId, &mut Conventions),
{
    fn detect(&mut self, callee: &CalleeId, conventions: &mut Conventions) {
        self(callee, conventions)
    }
}

/// Assigns one convention preset to every callee it is asked about.
#[derive(Debug, Clone)]
pub struct FixedConvention {
    convention: Convention,
    guess_indirect: bool,
}

impl FixedConvention {
    pub fn new(convention: Convention) -> Self {
        Self {
            convention,
            guess_indirect: false,
        }
    }

    /// Looks up a preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        Convention::preset(name).map(Self::new)
    }

    /// Also assign the convention to unresolved indirect calls.
    pub fn with_indirect_guessing(mut self, enable: bool) -> Self {
        self.guess_indirect = enable;
        self
    }
}

impl ConventionDetector for FixedConvention {
    fn detect(&mut self, callee: &CalleeId, conventions: &mut Conventions) {
        if callee.is_indirect() && !self.guess_indirect {
            return;
        }
        let id = conventions.register(self.convention.clone());
        debug!("assuming {} for {}", self.convention.name, callee);
        conventions.assign(*callee, id);
    }
}

/// Picks the platform default convention for an architecture.
#[derive(Debug, Clone)]
pub struct ArchitectureDefault {
    inner: Option<FixedConvention>,
}

impl ArchitectureDefault {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            inner: Convention::default_for(architecture).map(FixedConvention::new),
        }
    }

    pub fn with_indirect_guessing(self, enable: bool) -> Self {
        Self {
            inner: self.inner.map(|f| f.with_indirect_guessing(enable)),
        }
    }
}

impl ConventionDetector for ArchitectureDefault {
    fn detect(&mut self, callee: &CalleeId, conventions: &mut Conventions) {
        if let Some(inner) = &mut self.inner {
            inner.detect(callee, conventions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexhook_core::{FunctionId, StatementId, StatementRef};

    fn indirect() -> CalleeId {
        CalleeId::Call(StatementRef::new(FunctionId(0), StatementId(4)))
    }

    #[test]
    fn test_fixed_convention_skips_indirect_by_default() {
        let mut conventions = Conventions::new();
        let mut detector = FixedConvention::preset("stdcall").unwrap();

        detector.detect(&CalleeId::Address(0x2000), &mut conventions);
        detector.detect(&indirect(), &mut conventions);

        assert_eq!(
            conventions
                .lookup(&CalleeId::Address(0x2000))
                .map(|(_, c)| c.name.clone()),
            Some("stdcall".to_string())
        );
        assert!(conventions.lookup(&indirect()).is_none());

        let mut guessing = FixedConvention::preset("stdcall")
            .unwrap()
            .with_indirect_guessing(true);
        guessing.detect(&indirect(), &mut conventions);
        assert!(conventions.lookup(&indirect()).is_some());
    }

    #[test]
    fn test_closure_detector() {
        let mut conventions = Conventions::new();
        let mut calls = 0;
        let mut detector = |_: &CalleeId, _: &mut Conventions| calls += 1;
        detector.detect(&CalleeId::Address(0x10), &mut conventions);
        assert_eq!(calls, 1);
        assert!(conventions.is_empty());
    }

    #[test]
    fn test_architecture_default() {
        let mut conventions = Conventions::new();
        ArchitectureDefault::new(Architecture::Arm64)
            .detect(&CalleeId::Address(0x10), &mut conventions);
        assert!(conventions.is_empty());

        ArchitectureDefault::new(Architecture::X86)
            .detect(&CalleeId::Address(0x10), &mut conventions);
        assert_eq!(conventions.find("cdecl").map(|id| id.0), Some(0));
    }
}
