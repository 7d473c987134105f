//! Analysis configuration.
//!
//! Controls how the [`Scheduler`](crate::Scheduler) alternates dataflow
//! passes with re-instrumentation and which conventions it falls back to.

/// Default upper bound on instrumentation passes.
const DEFAULT_MAX_ITERATIONS: usize = 8;

/// Configuration for an analysis session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Maximum number of dataflow/instrumentation passes.
    pub max_iterations: usize,

    /// Compute dataflow snapshots on the rayon pool.
    pub parallel_dataflow: bool,

    /// Preset name assigned to callees the registry knows nothing about.
    /// `None` leaves such callees uninstrumented.
    pub default_convention: Option<String>,

    /// Without a `default_convention`, fall back to the platform convention
    /// of the module's architecture.
    pub architecture_default: bool,

    /// Apply the default convention to indirect calls with no resolved target.
    pub guess_indirect_calls: bool,

    /// Remove all hook statements once the passes converge.
    pub deinstrument_at_end: bool,

    /// Emit the pseudo-source tree after deinstrumentation.
    pub emit_tree: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            parallel_dataflow: true,
            default_convention: None,
            architecture_default: false,
            guess_indirect_calls: false,
            deinstrument_at_end: false,
            emit_tree: false,
        }
    }
}

impl AnalysisConfig {
    /// Set the maximum number of passes. Zero is treated as one.
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations.max(1);
        self
    }

    /// Enable or disable parallel dataflow.
    pub fn with_parallel_dataflow(mut self, enable: bool) -> Self {
        self.parallel_dataflow = enable;
        self
    }

    /// Set the fallback convention preset.
    pub fn with_default_convention(mut self, name: impl Into<String>) -> Self {
        self.default_convention = Some(name.into());
        self
    }

    /// Enable or disable the platform convention fallback.
    pub fn with_architecture_default(mut self, enable: bool) -> Self {
        self.architecture_default = enable;
        self
    }

    /// Guess conventions for unresolved indirect calls.
    pub fn with_indirect_guessing(mut self, enable: bool) -> Self {
        self.guess_indirect_calls = enable;
        self
    }

    /// Deinstrument and emit the tree when the passes finish.
    pub fn for_emission(mut self) -> Self {
        self.deinstrument_at_end = true;
        self.emit_tree = true;
        self
    }
}
