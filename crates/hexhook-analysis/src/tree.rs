//! Emitted pseudo-source.
//!
//! The tree is the last artifact of a session. It is built from
//! deinstrumented IR only: hook statements describe analysis assumptions,
//! not program behavior, and must never reach the output.

use crate::calling::{CalleeId, FunctionSignature, Signatures};
use crate::{AnalysisError, AnalysisResult};
use hexhook_core::{CallTarget, Function, FunctionId, Functions, StatementKind};
use std::fmt;

/// Pseudo-source of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFunction {
    pub function: FunctionId,
    pub prototype: String,
    pub body: Vec<String>,
}

/// Pseudo-source of the whole program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    functions: Vec<EmittedFunction>,
}

impl Tree {
    /// Emits every function.
    ///
    /// Fails with [`AnalysisError::SyntheticLeak`] if any function still
    /// carries hook statements.
    pub fn emit(functions: &Functions, signatures: &Signatures) -> AnalysisResult<Self> {
        let mut emitted = Vec::with_capacity(functions.len());
        for function in functions.iter() {
            if let Some(stmt) = function.statements().find(|s| s.is_synthetic()) {
                return Err(AnalysisError::SyntheticLeak {
                    function: function.id(),
                    statement: stmt.id,
                });
            }
            emitted.push(emit_function(function, functions, signatures));
        }
        Ok(Self { functions: emitted })
    }

    pub fn functions(&self) -> &[EmittedFunction] {
        &self.functions
    }

    pub fn function(&self, id: FunctionId) -> Option<&EmittedFunction> {
        self.functions.iter().find(|f| f.function == id)
    }
}

fn emit_function(
    function: &Function,
    functions: &Functions,
    signatures: &Signatures,
) -> EmittedFunction {
    let prototype = match signatures.function_signature(&CalleeId::of_function(function)) {
        Some((_, sig)) => sig.to_c_string(function.name()),
        None => FunctionSignature::default().to_c_string(function.name()),
    };

    let mut body = Vec::new();
    let multi_block = function.blocks().len() > 1;
    for block in function.blocks() {
        if multi_block {
            body.push(format!("{}:", block.id));
        }
        for stmt in &block.statements {
            let line = match stmt.kind {
                StatementKind::Assign { dst, src } => format!("{} = {};", dst, src),
                StatementKind::Call {
                    target: CallTarget::Direct(addr),
                } => match functions.by_entry(addr) {
                    Some(callee) => format!("{}();", callee.name()),
                    None => format!("sub_{:x}();", addr),
                },
                StatementKind::Call {
                    target: CallTarget::Indirect(loc),
                } => format!("(*{})();", loc),
                StatementKind::Return { .. } => "return;".to_string(),
                StatementKind::Jump => {
                    let targets: Vec<String> =
                        block.successors.iter().map(|s| s.to_string()).collect();
                    format!("goto {};", targets.join(" | "))
                }
                StatementKind::Nop => continue,
                // Hook-only kinds are rejected before emission.
                StatementKind::Touch { .. }
                | StatementKind::Kill { .. }
                | StatementKind::AdjustStack { .. } => continue,
            };
            body.push(line);
        }
    }

    EmittedFunction {
        function: function.id(),
        prototype,
        body,
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{} {{", func.prototype)?;
            for line in &func.body {
                if line.ends_with(':') {
                    writeln!(f, "{}", line)?;
                } else {
                    writeln!(f, "    {}", line)?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}
