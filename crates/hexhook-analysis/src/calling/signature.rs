//! Recovered function and call-site signatures.
//!
//! Signatures are produced by an external reconstruction pass and stored in
//! the [`Signatures`] registry. Every `set_*` call creates a new entry with a
//! fresh id, so replacing a signature changes the identity the hooks engine
//! keys its cache on.

use super::CalleeId;
use hexhook_core::StatementRef;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Parameter or return type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    /// Unknown type (default). Treated as one machine word.
    #[default]
    Unknown,
    /// Void type (no return value).
    Void,
    /// Boolean type.
    Bool,
    /// Signed integer of specified size in bits (8, 16, 32, 64).
    SignedInt(u8),
    /// Unsigned integer of specified size in bits.
    UnsignedInt(u8),
    /// Pointer type.
    Pointer,
    /// Floating-point type (32 = float, 64 = double).
    Float(u8),
}

impl ParamType {
    /// Converts the type to a C-style type string.
    pub fn to_c_string(&self) -> String {
        match self {
            ParamType::Unknown => "intptr_t".to_string(),
            ParamType::Void => "void".to_string(),
            ParamType::Bool => "bool".to_string(),
            ParamType::SignedInt(bits @ (8 | 16 | 32 | 64)) => format!("int{}_t", bits),
            ParamType::SignedInt(_) => "int".to_string(),
            ParamType::UnsignedInt(bits @ (8 | 16 | 32 | 64)) => format!("uint{}_t", bits),
            ParamType::UnsignedInt(_) => "unsigned int".to_string(),
            ParamType::Pointer => "void*".to_string(),
            ParamType::Float(32) => "float".to_string(),
            ParamType::Float(_) => "double".to_string(),
        }
    }

    /// Returns the size in bytes given the target's pointer size.
    pub fn size(&self, pointer_size: usize) -> usize {
        match self {
            ParamType::Unknown | ParamType::Pointer => pointer_size,
            ParamType::Void => 0,
            ParamType::Bool => 1,
            ParamType::SignedInt(bits) | ParamType::UnsignedInt(bits) | ParamType::Float(bits) => {
                (*bits as usize).div_ceil(8)
            }
        }
    }

    /// Parses a C-ish type name such as `int32`, `uint8_t`, `void*` or `double`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let s = s.strip_suffix("_t").unwrap_or(&s);
        if s.ends_with('*') || s == "ptr" || s == "pointer" {
            return Some(Self::Pointer);
        }
        match s {
            "?" | "unknown" | "intptr" => Some(Self::Unknown),
            "void" => Some(Self::Void),
            "bool" => Some(Self::Bool),
            "char" => Some(Self::SignedInt(8)),
            "short" => Some(Self::SignedInt(16)),
            "int" | "long" => Some(Self::SignedInt(32)),
            "float" => Some(Self::Float(32)),
            "double" => Some(Self::Float(64)),
            _ => {
                if let Some(bits) = s.strip_prefix("uint") {
                    bits.parse().ok().map(Self::UnsignedInt)
                } else if let Some(bits) = s.strip_prefix("int") {
                    bits.parse().ok().map(Self::SignedInt)
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_c_string())
    }
}

/// Signature of a function as seen from its body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionSignature {
    pub name: Option<String>,
    pub arguments: Vec<ParamType>,
    /// `None` when the return type is unknown.
    pub return_type: Option<ParamType>,
    pub variadic: bool,
}

impl FunctionSignature {
    pub fn new(arguments: Vec<ParamType>, return_type: Option<ParamType>) -> Self {
        Self {
            name: None,
            arguments,
            return_type,
            variadic: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Formats the signature as a C prototype.
    pub fn to_c_string(&self, fallback_name: &str) -> String {
        let ret = self
            .return_type
            .as_ref()
            .map(ParamType::to_c_string)
            .unwrap_or_else(|| "intptr_t".to_string());
        let mut args: Vec<String> = self
            .arguments
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("{} a{}", ty, i + 1))
            .collect();
        if self.variadic {
            args.push("...".to_string());
        }
        if args.is_empty() {
            args.push("void".to_string());
        }
        format!(
            "{} {}({})",
            ret,
            self.name.as_deref().unwrap_or(fallback_name),
            args.join(", ")
        )
    }
}

/// Signature of one call site.
///
/// Differs from the callee's signature for variadic callees and carries an
/// explicitly known stack adjustment when the caller's code reveals it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSignature {
    pub arguments: Vec<ParamType>,
    pub return_type: Option<ParamType>,
    /// Bytes the callee releases, if known.
    pub stack_adjustment: Option<u32>,
}

impl CallSignature {
    pub fn new(arguments: Vec<ParamType>, return_type: Option<ParamType>) -> Self {
        Self {
            arguments,
            return_type,
            stack_adjustment: None,
        }
    }

    pub fn with_stack_adjustment(mut self, bytes: u32) -> Self {
        self.stack_adjustment = Some(bytes);
        self
    }
}

impl From<&FunctionSignature> for CallSignature {
    fn from(sig: &FunctionSignature) -> Self {
        Self::new(sig.arguments.clone(), sig.return_type.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionSignatureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallSignatureId(pub u32);

/// The signature a call hook was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignatureRef {
    /// A signature recorded for the call site itself.
    Call(CallSignatureId),
    /// The callee's function signature.
    Callee(FunctionSignatureId),
}

/// A registry shared between the context and the hooks engine.
pub type SharedSignatures = Arc<RwLock<Signatures>>;

/// Recovered signatures by callee and by call site.
#[derive(Debug, Default)]
pub struct Signatures {
    function_signatures: Vec<Arc<FunctionSignature>>,
    call_signatures: Vec<Arc<CallSignature>>,
    by_callee: HashMap<CalleeId, FunctionSignatureId>,
    by_call: HashMap<StatementRef, CallSignatureId>,
    revision: u64,
}

impl Signatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedSignatures {
        Arc::new(RwLock::new(self))
    }

    /// Records the signature of a callee.
    pub fn set_function_signature(
        &mut self,
        callee: CalleeId,
        signature: FunctionSignature,
    ) -> FunctionSignatureId {
        let id = FunctionSignatureId(self.function_signatures.len() as u32);
        self.function_signatures.push(Arc::new(signature));
        self.by_callee.insert(callee, id);
        self.revision += 1;
        id
    }

    /// Records the signature of a call site.
    pub fn set_call_signature(
        &mut self,
        call: StatementRef,
        signature: CallSignature,
    ) -> CallSignatureId {
        let id = CallSignatureId(self.call_signatures.len() as u32);
        self.call_signatures.push(Arc::new(signature));
        self.by_call.insert(call, id);
        self.revision += 1;
        id
    }

    pub fn function_signature(
        &self,
        callee: &CalleeId,
    ) -> Option<(FunctionSignatureId, Arc<FunctionSignature>)> {
        let id = *self.by_callee.get(callee)?;
        Some((id, Arc::clone(&self.function_signatures[id.0 as usize])))
    }

    pub fn call_signature(
        &self,
        call: &StatementRef,
    ) -> Option<(CallSignatureId, Arc<CallSignature>)> {
        let id = *self.by_call.get(call)?;
        Some((id, Arc::clone(&self.call_signatures[id.0 as usize])))
    }

    /// The signature governing a call: the call site's own, or else the
    /// callee's function signature.
    pub fn signature_for_call(
        &self,
        call: &StatementRef,
        callee: &CalleeId,
    ) -> Option<(SignatureRef, Arc<CallSignature>)> {
        if let Some((id, sig)) = self.call_signature(call) {
            return Some((SignatureRef::Call(id), sig));
        }
        self.function_signature(callee)
            .map(|(id, sig)| (SignatureRef::Callee(id), Arc::new(CallSignature::from(&*sig))))
    }

    /// Counter bumped whenever a signature is recorded.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
