//! Hook synthesis.
//!
//! A hook is the list of synthetic statements that make one anchor's
//! calling-convention effects explicit. Statement ids are allocated from the
//! anchor's function when the hook is synthesized and kept for the hook's
//! whole life, so detaching and re-attaching a cached hook reproduces the
//! exact same IR.

use super::{
    CallSignature, Convention, ConventionId, FunctionSignature, FunctionSignatureId, ParamType,
    SignatureRef, Site,
};
use hexhook_core::{
    Access, Function, FunctionId, HookKind, Location, Statement, StatementId, StatementKind,
    StatementRef,
};
use std::fmt;

/// Handle of a cached hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId {
    pub kind: HookKind,
    pub index: u32,
}

impl HookId {
    pub(crate) fn new(kind: HookKind, index: usize) -> Self {
        Self {
            kind,
            index: index as u32,
        }
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.index)
    }
}

/// Builds the statements of one hook, allocating ids from the function.
struct Emitter<'a> {
    function: &'a mut Function,
    kind: HookKind,
    statements: Vec<Statement>,
}

impl<'a> Emitter<'a> {
    fn new(function: &'a mut Function, kind: HookKind) -> Self {
        Self {
            function,
            kind,
            statements: Vec::new(),
        }
    }

    fn emit(&mut self, kind: StatementKind) {
        let id = self.function.allocate_statement_id();
        self.statements.push(Statement::synthetic(id, self.kind, kind));
    }

    fn touch(&mut self, location: Location, access: Access) {
        self.emit(StatementKind::Touch { location, access });
    }

    fn finish(self) -> Vec<Statement> {
        self.statements
    }
}

/// Return size in bytes, `None` when the type is unknown.
fn return_size(return_type: Option<&ParamType>, convention: &Convention) -> Option<usize> {
    return_type.map(|ty| ty.size(convention.architecture.pointer_size()))
}

/// Hook on a function entry: defines the stack pointer and the arguments.
#[derive(Debug, Clone)]
pub struct EntryHook {
    id: HookId,
    function: FunctionId,
    convention: ConventionId,
    signature: Option<FunctionSignatureId>,
    arguments: Vec<Location>,
    statements: Vec<Statement>,
}

impl EntryHook {
    pub(crate) fn synthesize(
        id: HookId,
        function: &mut Function,
        convention_id: ConventionId,
        convention: &Convention,
        signature: Option<(FunctionSignatureId, &FunctionSignature)>,
    ) -> Self {
        let arity = signature
            .map(|(_, sig)| sig.arguments.len())
            .unwrap_or_else(|| convention.speculative_argument_count());
        let arguments = convention.argument_locations(arity, Site::Entry);

        let function_id = function.id();
        let mut out = Emitter::new(function, HookKind::Entry);
        out.touch(convention.stack_pointer, Access::Write);
        for arg in &arguments {
            out.touch(*arg, Access::Write);
        }

        Self {
            id,
            function: function_id,
            convention: convention_id,
            signature: signature.map(|(id, _)| id),
            arguments,
            statements: out.finish(),
        }
    }

    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn convention(&self) -> ConventionId {
        self.convention
    }

    pub fn signature(&self) -> Option<FunctionSignatureId> {
        self.signature
    }

    /// Argument locations as seen from the callee.
    pub fn arguments(&self) -> &[Location] {
        &self.arguments
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

/// Bytes a callee releases when nothing overrides the convention.
pub(crate) fn implied_cleanup(convention: &Convention, arity: usize) -> u32 {
    if convention.is_callee_cleanup() {
        convention.stack_argument_bytes(arity)
    } else {
        0
    }
}

/// Argument count assumed for a call.
pub(crate) fn call_arity(convention: &Convention, signature: Option<&CallSignature>) -> usize {
    signature
        .map(|sig| sig.arguments.len())
        .unwrap_or_else(|| convention.speculative_argument_count())
}

/// Hook on a call site: reads arguments, clobbers, writes return values and
/// applies callee stack cleanup.
#[derive(Debug, Clone)]
pub struct CallHook {
    id: HookId,
    call: StatementRef,
    convention: ConventionId,
    signature: Option<SignatureRef>,
    stack_adjustment: Option<u32>,
    arguments: Vec<Location>,
    return_values: Vec<Location>,
    killed: Vec<Location>,
    cleanup: u32,
    statements: Vec<Statement>,
}

impl CallHook {
    pub(crate) fn synthesize(
        id: HookId,
        function: &mut Function,
        call: StatementId,
        convention_id: ConventionId,
        convention: &Convention,
        signature: Option<(SignatureRef, &CallSignature)>,
        stack_adjustment: Option<u32>,
    ) -> Self {
        let arity = call_arity(convention, signature.map(|(_, sig)| sig));
        let arguments = convention.argument_locations(arity, Site::Call);
        let return_values = convention.return_locations(
            signature.and_then(|(_, sig)| return_size(sig.return_type.as_ref(), convention)),
        );
        let killed: Vec<Location> = convention
            .clobbered
            .iter()
            .filter(|loc| !return_values.contains(loc))
            .copied()
            .collect();
        let cleanup = stack_adjustment.unwrap_or_else(|| implied_cleanup(convention, arity));

        let call_ref = StatementRef::new(function.id(), call);
        let mut out = Emitter::new(function, HookKind::Call);
        for arg in &arguments {
            out.touch(*arg, Access::Read);
        }
        for loc in &killed {
            out.emit(StatementKind::Kill { location: *loc });
        }
        for ret in &return_values {
            out.touch(*ret, Access::Write);
        }
        if cleanup != 0 {
            out.emit(StatementKind::AdjustStack {
                pointer: convention.stack_pointer,
                delta: cleanup as i64,
            });
        }

        Self {
            id,
            call: call_ref,
            convention: convention_id,
            signature: signature.map(|(sref, _)| sref),
            stack_adjustment,
            arguments,
            return_values,
            killed,
            cleanup,
            statements: out.finish(),
        }
    }

    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn call(&self) -> StatementRef {
        self.call
    }

    pub fn convention(&self) -> ConventionId {
        self.convention
    }

    pub fn signature(&self) -> Option<SignatureRef> {
        self.signature
    }

    /// Explicit stack adjustment the hook was keyed on.
    pub fn stack_adjustment(&self) -> Option<u32> {
        self.stack_adjustment
    }

    /// Argument locations as seen from the caller.
    pub fn arguments(&self) -> &[Location] {
        &self.arguments
    }

    pub fn return_values(&self) -> &[Location] {
        &self.return_values
    }

    /// Clobbered locations that do not carry a return value.
    pub fn killed(&self) -> &[Location] {
        &self.killed
    }

    /// Bytes released by the callee.
    pub fn cleanup(&self) -> u32 {
        self.cleanup
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

/// Hook on a return statement: reads the return values.
#[derive(Debug, Clone)]
pub struct ReturnHook {
    id: HookId,
    ret: StatementRef,
    convention: ConventionId,
    signature: Option<FunctionSignatureId>,
    return_values: Vec<Location>,
    statements: Vec<Statement>,
}

impl ReturnHook {
    pub(crate) fn synthesize(
        id: HookId,
        function: &mut Function,
        ret: StatementId,
        convention_id: ConventionId,
        convention: &Convention,
        signature: Option<(FunctionSignatureId, &FunctionSignature)>,
    ) -> Self {
        let return_values = convention.return_locations(
            signature.and_then(|(_, sig)| return_size(sig.return_type.as_ref(), convention)),
        );

        let ret_ref = StatementRef::new(function.id(), ret);
        let mut out = Emitter::new(function, HookKind::Return);
        for loc in &return_values {
            out.touch(*loc, Access::Read);
        }

        Self {
            id,
            ret: ret_ref,
            convention: convention_id,
            signature: signature.map(|(id, _)| id),
            return_values,
            statements: out.finish(),
        }
    }

    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn ret(&self) -> StatementRef {
        self.ret
    }

    pub fn convention(&self) -> ConventionId {
        self.convention
    }

    pub fn signature(&self) -> Option<FunctionSignatureId> {
        self.signature
    }

    pub fn return_values(&self) -> &[Location] {
        &self.return_values
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::CallSignatureId;
    use hexhook_core::register::x86;
    use hexhook_core::{BasicBlockId, CallTarget, Origin};

    fn caller() -> (Function, StatementId) {
        let mut func = Function::new(FunctionId(0), "main", Some(0x1000));
        let call = func
            .push_statement(
                BasicBlockId::ENTRY,
                Some(0x1010),
                StatementKind::Call {
                    target: CallTarget::Direct(0x2000),
                },
            )
            .unwrap();
        (func, call)
    }

    fn kinds(statements: &[Statement]) -> Vec<StatementKind> {
        statements.iter().map(|s| s.kind).collect()
    }

    #[test]
    fn test_entry_hook_writes_sp_then_arguments() {
        let (mut func, _) = caller();
        let conv = Convention::cdecl();
        let sig = FunctionSignature::new(vec![ParamType::Pointer], None);
        let hook = EntryHook::synthesize(
            HookId::new(HookKind::Entry, 0),
            &mut func,
            ConventionId(0),
            &conv,
            Some((FunctionSignatureId(0), &sig)),
        );

        assert_eq!(
            kinds(hook.statements()),
            vec![
                StatementKind::Touch {
                    location: Location::Register(x86::RSP),
                    access: Access::Write
                },
                StatementKind::Touch {
                    location: Location::Stack(4),
                    access: Access::Write
                },
            ]
        );
        assert!(hook
            .statements()
            .iter()
            .all(|s| s.origin == Origin::Synthetic(HookKind::Entry)));
    }

    #[test]
    fn test_unsigned_call_uses_speculative_arity() {
        let (mut func, call) = caller();
        let conv = Convention::cdecl();
        let hook = CallHook::synthesize(
            HookId::new(HookKind::Call, 0),
            &mut func,
            call,
            ConventionId(0),
            &conv,
            None,
            None,
        );

        assert_eq!(hook.arguments().len(), conv.speculative_argument_count());
        assert_eq!(hook.return_values().len(), 2);
        // eax/edx carry return values, so only ecx and flags are killed.
        assert_eq!(
            hook.killed(),
            &[Location::Register(x86::RCX), Location::Flags]
        );
        assert_eq!(hook.cleanup(), 0);
        assert_eq!(hook.statements().len(), 4 + 2 + 2);
    }

    #[test]
    fn test_void_call_with_callee_cleanup() {
        let (mut func, call) = caller();
        let conv = Convention::stdcall();
        let sig = CallSignature::new(
            vec![ParamType::SignedInt(32), ParamType::Pointer],
            Some(ParamType::Void),
        );
        let hook = CallHook::synthesize(
            HookId::new(HookKind::Call, 0),
            &mut func,
            call,
            ConventionId(0),
            &conv,
            Some((SignatureRef::Call(CallSignatureId(0)), &sig)),
            None,
        );

        assert!(hook.return_values().is_empty());
        assert_eq!(hook.cleanup(), 8);
        assert_eq!(
            hook.statements().last().map(|s| s.kind),
            Some(StatementKind::AdjustStack {
                pointer: Location::Register(x86::RSP),
                delta: 8
            })
        );
    }

    #[test]
    fn test_explicit_stack_adjustment_wins() {
        let (mut func, call) = caller();
        let conv = Convention::stdcall();
        let hook = CallHook::synthesize(
            HookId::new(HookKind::Call, 0),
            &mut func,
            call,
            ConventionId(0),
            &conv,
            None,
            Some(12),
        );
        assert_eq!(hook.cleanup(), 12);
        assert_eq!(hook.stack_adjustment(), Some(12));
    }

    #[test]
    fn test_return_hook_by_type_size() {
        let (mut func, call) = caller();
        let conv = Convention::cdecl();
        let sig = FunctionSignature::new(vec![], Some(ParamType::SignedInt(64)));
        let hook = ReturnHook::synthesize(
            HookId::new(HookKind::Return, 0),
            &mut func,
            call,
            ConventionId(0),
            &conv,
            Some((FunctionSignatureId(0), &sig)),
        );
        assert_eq!(
            hook.return_values(),
            &[Location::Register(x86::RAX), Location::Register(x86::RDX)]
        );
    }

    #[test]
    fn test_synthesis_allocates_fresh_ids() {
        let (mut func, call) = caller();
        let conv = Convention::cdecl();
        let a = CallHook::synthesize(
            HookId::new(HookKind::Call, 0),
            &mut func,
            call,
            ConventionId(0),
            &conv,
            None,
            None,
        );
        let b = CallHook::synthesize(
            HookId::new(HookKind::Call, 1),
            &mut func,
            call,
            ConventionId(0),
            &conv,
            None,
            None,
        );
        let a_ids: Vec<StatementId> = a.statements().iter().map(|s| s.id).collect();
        assert!(b.statements().iter().all(|s| !a_ids.contains(&s.id)));
        assert!(a_ids.iter().all(|id| *id > call));
    }
}
