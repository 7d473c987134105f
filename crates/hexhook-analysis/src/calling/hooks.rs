//! The instrumentation engine.
//!
//! [`Hooks`] makes calling-convention effects explicit in the IR. For every
//! anchor (function entry, call, return) it computes a key from the anchor,
//! the convention assigned to the callee and the signature in force, looks
//! the key up in its cache, synthesizes a hook only on a miss, and attaches
//! the hook if the anchor's active hook differs. Hooks are never dropped
//! while the engine lives: a key that comes back reuses the same hook and
//! therefore the same statements.
//!
//! At most one hook is active per anchor. Replacing it detaches the old
//! statements before the new ones go in. The hook last attached to an
//! anchor stays queryable after it is detached.

use super::hook::{call_arity, implied_cleanup};
use super::{
    CallHook, CalleeId, Convention, ConventionDetector, ConventionId, EntryHook,
    FunctionSignature, FunctionSignatureId, HookId, ReturnHook, SharedConventions,
    SharedSignatures, SignatureRef,
};
use crate::dataflow::Dataflow;
use crate::{AnalysisError, AnalysisResult};
use hexhook_core::{
    BasicBlockId, Function, FunctionId, Functions, HookKind, InsertPosition, Statement,
    StatementId, StatementKind, StatementRef,
};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, RwLock, RwLockReadGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    function: FunctionId,
    convention: ConventionId,
    signature: Option<FunctionSignatureId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CallKey {
    call: StatementRef,
    convention: ConventionId,
    signature: Option<SignatureRef>,
    /// `None` when the cleanup is what the convention already implies.
    stack_adjustment: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReturnKey {
    ret: StatementRef,
    convention: ConventionId,
    signature: Option<FunctionSignatureId>,
}

/// The hook attached to an anchor and the statements it inserted.
#[derive(Debug, Clone)]
struct Active {
    hook: usize,
    statements: Vec<StatementId>,
}

impl Active {
    fn new(hook: usize, statements: &[Statement]) -> Self {
        Self {
            hook,
            statements: statements.iter().map(|s| s.id).collect(),
        }
    }
}

/// What one `instrument` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrumentStats {
    /// Hooks attached to an anchor.
    pub attached: usize,
    /// Hooks detached from an anchor.
    pub detached: usize,
    /// Synthetic statements inserted.
    pub inserted: usize,
    /// Synthetic statements removed.
    pub removed: usize,
    /// Hooks built on a cache miss.
    pub synthesized: usize,
    /// Anchors left uninstrumented for lack of a convention.
    pub unresolved: usize,
}

impl InstrumentStats {
    /// Returns true if the IR changed.
    pub fn changed(&self) -> bool {
        self.attached > 0 || self.detached > 0
    }

    pub fn merge(&mut self, other: &Self) {
        self.attached += other.attached;
        self.detached += other.detached;
        self.inserted += other.inserted;
        self.removed += other.removed;
        self.synthesized += other.synthesized;
        self.unresolved += other.unresolved;
    }
}

type Resolved = (ConventionId, Arc<Convention>);

/// Calling-convention instrumentation engine.
pub struct Hooks {
    conventions: SharedConventions,
    signatures: SharedSignatures,
    detector: Option<Box<dyn ConventionDetector + Send>>,

    entry_hooks: Vec<EntryHook>,
    call_hooks: Vec<CallHook>,
    return_hooks: Vec<ReturnHook>,

    entry_cache: BTreeMap<EntryKey, usize>,
    call_cache: BTreeMap<CallKey, usize>,
    return_cache: BTreeMap<ReturnKey, usize>,

    entries: BTreeMap<FunctionId, Active>,
    calls: BTreeMap<StatementRef, Active>,
    returns: BTreeMap<StatementRef, Active>,

    last_entries: BTreeMap<FunctionId, usize>,
    last_calls: BTreeMap<StatementRef, usize>,
    last_returns: BTreeMap<StatementRef, usize>,

    /// Bytes popped by each callee's returns.
    observed_cleanup: BTreeMap<CalleeId, u32>,
    touched: BTreeSet<FunctionId>,
}

impl Hooks {
    pub fn new(conventions: SharedConventions, signatures: SharedSignatures) -> Self {
        Self {
            conventions,
            signatures,
            detector: None,
            entry_hooks: Vec::new(),
            call_hooks: Vec::new(),
            return_hooks: Vec::new(),
            entry_cache: BTreeMap::new(),
            call_cache: BTreeMap::new(),
            return_cache: BTreeMap::new(),
            entries: BTreeMap::new(),
            calls: BTreeMap::new(),
            returns: BTreeMap::new(),
            last_entries: BTreeMap::new(),
            last_calls: BTreeMap::new(),
            last_returns: BTreeMap::new(),
            observed_cleanup: BTreeMap::new(),
            touched: BTreeSet::new(),
        }
    }

    pub fn conventions(&self) -> &SharedConventions {
        &self.conventions
    }

    pub fn signatures(&self) -> &SharedSignatures {
        &self.signatures
    }

    /// The convention assigned to a callee. Never runs the detector.
    pub fn get_convention(&self, callee: &CalleeId) -> AnalysisResult<Option<Arc<Convention>>> {
        let conventions = read_lock(&self.conventions, "conventions")?;
        Ok(conventions.lookup(callee).map(|(_, conv)| conv))
    }

    /// Installs the detector run when a callee has no convention.
    pub fn set_convention_detector(&mut self, detector: impl ConventionDetector + Send + 'static) {
        self.detector = Some(Box::new(detector));
    }

    /// The hook last attached to a function's entry, or `None` if the
    /// entry was never instrumented.
    pub fn entry_hook(&self, function: FunctionId) -> Option<&EntryHook> {
        let index = *self.last_entries.get(&function)?;
        self.entry_hooks.get(index)
    }

    /// The hook last attached to a call statement.
    pub fn call_hook(&self, call: StatementRef) -> Option<&CallHook> {
        let index = *self.last_calls.get(&call)?;
        self.call_hooks.get(index)
    }

    /// The hook last attached to a return statement.
    pub fn return_hook(&self, ret: StatementRef) -> Option<&ReturnHook> {
        let index = *self.last_returns.get(&ret)?;
        self.return_hooks.get(index)
    }

    /// Hooks currently attached to a function: entry, then calls, then
    /// returns, each in statement order.
    pub fn active_hooks(&self, function: FunctionId) -> Vec<HookId> {
        let mut out = Vec::new();
        if let Some(active) = self.entries.get(&function) {
            out.push(HookId::new(HookKind::Entry, active.hook));
        }
        let range = anchors_of(function);
        out.extend(
            self.calls
                .range(range.clone())
                .map(|(_, a)| HookId::new(HookKind::Call, a.hook)),
        );
        out.extend(
            self.returns
                .range(range)
                .map(|(_, a)| HookId::new(HookKind::Return, a.hook)),
        );
        out
    }

    /// Statements a hook inserts, looked up by handle.
    pub fn hook_statements(&self, id: HookId) -> Option<&[Statement]> {
        let index = id.index as usize;
        match id.kind {
            HookKind::Entry => self.entry_hooks.get(index).map(EntryHook::statements),
            HookKind::Call => self.call_hooks.get(index).map(CallHook::statements),
            HookKind::Return => self.return_hooks.get(index).map(ReturnHook::statements),
        }
    }

    /// Number of hooks ever synthesized.
    pub fn cached_hook_count(&self) -> usize {
        self.entry_hooks.len() + self.call_hooks.len() + self.return_hooks.len()
    }

    /// Number of anchors currently instrumented.
    pub fn active_hook_count(&self) -> usize {
        self.entries.len() + self.calls.len() + self.returns.len()
    }

    /// Returns true if any anchor of the function is instrumented.
    pub fn is_instrumented(&self, function: FunctionId) -> bool {
        self.entries.contains_key(&function)
            || self.calls.range(anchors_of(function)).next().is_some()
            || self.returns.range(anchors_of(function)).next().is_some()
    }

    /// Functions instrumented at least once.
    pub fn touched(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.touched.iter().copied()
    }

    /// Stack bytes a callee was seen to release on return.
    pub fn observed_cleanup(&self, callee: &CalleeId) -> Option<u32> {
        self.observed_cleanup.get(callee).copied()
    }

    /// Records how many bytes the function's returns pop, for use as the
    /// stack adjustment of calls to it.
    pub fn observe_returns(&mut self, function: &Function, dataflow: &Dataflow) {
        let pop = dataflow
            .returns()
            .iter()
            .filter_map(|id| match function.statement(*id).map(|s| s.kind) {
                Some(StatementKind::Return { pop }) => Some(pop),
                _ => None,
            })
            .max();
        if let Some(pop) = pop {
            let callee = CalleeId::of_function(function);
            if self.observed_cleanup.insert(callee, pop) != Some(pop) {
                trace!("{} releases {:#x} bytes on return", callee, pop);
            }
        }
    }

    /// Instruments the entry, calls and returns of a function.
    ///
    /// The snapshot must have been computed for this function at its
    /// current revision. Anchors whose convention cannot be resolved are
    /// left uninstrumented. Repeating the call with unchanged conventions
    /// and signatures changes nothing.
    pub fn instrument(
        &mut self,
        function: &mut Function,
        dataflow: &Dataflow,
    ) -> AnalysisResult<InstrumentStats> {
        dataflow.ensure_current(function)?;
        let fid = function.id();
        self.touched.insert(fid);
        self.observe_returns(function, dataflow);

        let mut stats = InstrumentStats::default();
        let own = CalleeId::of_function(function);
        let convention = self.resolve(&own)?;
        let signature = read_lock(&self.signatures, "signatures")?.function_signature(&own);

        // Entry first, so call and return hooks see a consistent entry.
        self.instrument_entry(function, convention.as_ref(), signature.as_ref(), &mut stats)?;

        let mut seen = BTreeSet::new();
        for site in dataflow.calls() {
            let call = StatementRef::new(fid, site.statement);
            seen.insert(call);
            self.instrument_call(function, call, site.target, &mut stats)?;
        }
        stats.removed += detach_unseen(function, &mut self.calls, &seen, &mut stats.detached);
        forget_unseen(&mut self.last_calls, fid, &seen);

        seen.clear();
        for &ret in dataflow.returns() {
            let anchor = StatementRef::new(fid, ret);
            seen.insert(anchor);
            self.instrument_return(
                function,
                anchor,
                convention.as_ref(),
                signature.as_ref(),
                &mut stats,
            )?;
        }
        stats.removed += detach_unseen(function, &mut self.returns, &seen, &mut stats.detached);
        forget_unseen(&mut self.last_returns, fid, &seen);

        if stats.changed() {
            debug!(
                "{}: attached {} hooks (+{} stmts), detached {} (-{} stmts)",
                function.name(),
                stats.attached,
                stats.inserted,
                stats.detached,
                stats.removed
            );
        }
        Ok(stats)
    }

    /// Removes every hook statement from a function. Cached hooks are kept.
    pub fn deinstrument(&mut self, function: &mut Function) -> usize {
        let fid = function.id();
        let mut removed = detach(function, &mut self.entries, &fid).unwrap_or(0);
        for anchors in [&mut self.calls, &mut self.returns] {
            let keys: Vec<StatementRef> = anchors.range(anchors_of(fid)).map(|(k, _)| *k).collect();
            for key in keys {
                removed += detach(function, anchors, &key).unwrap_or(0);
            }
        }
        removed
    }

    /// Deinstruments every function the engine has touched.
    pub fn deinstrument_all(&mut self, functions: &mut Functions) -> usize {
        let touched: Vec<FunctionId> = self.touched.iter().copied().collect();
        let mut removed = 0;
        for id in touched {
            if let Some(function) = functions.get_mut(id) {
                removed += self.deinstrument(function);
            }
        }
        debug!("deinstrumented {} statements", removed);
        removed
    }

    fn resolve(&mut self, callee: &CalleeId) -> AnalysisResult<Option<Resolved>> {
        let known = read_lock(&self.conventions, "conventions")?.lookup(callee);
        if known.is_some() {
            return Ok(known);
        }
        let Some(detector) = self.detector.as_mut() else {
            debug!("no convention for {}", callee);
            return Ok(None);
        };
        let mut conventions = self
            .conventions
            .write()
            .map_err(|_| AnalysisError::PoisonedRegistry("conventions"))?;
        detector.detect(callee, &mut conventions);
        let found = conventions.lookup(callee);
        if found.is_none() {
            debug!("detector left {} unresolved", callee);
        }
        Ok(found)
    }

    fn instrument_entry(
        &mut self,
        function: &mut Function,
        convention: Option<&Resolved>,
        signature: Option<&(FunctionSignatureId, Arc<FunctionSignature>)>,
        stats: &mut InstrumentStats,
    ) -> AnalysisResult<()> {
        let fid = function.id();
        let Some((conv_id, conv)) = convention else {
            stats.unresolved += 1;
            if let Some(n) = detach(function, &mut self.entries, &fid) {
                stats.detached += 1;
                stats.removed += n;
            }
            return Ok(());
        };

        let key = EntryKey {
            function: fid,
            convention: *conv_id,
            signature: signature.map(|(id, _)| *id),
        };
        let index = match self.entry_cache.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.entry_hooks.len();
                let hook = EntryHook::synthesize(
                    HookId::new(HookKind::Entry, index),
                    function,
                    *conv_id,
                    conv,
                    signature.map(|(id, sig)| (*id, sig.as_ref())),
                );
                debug!(
                    "synthesized {} for {} ({}, {} args)",
                    hook.id(),
                    function.name(),
                    conv.name,
                    hook.arguments().len()
                );
                self.entry_hooks.push(hook);
                self.entry_cache.insert(key, index);
                stats.synthesized += 1;
                index
            }
        };

        let outcome = attach(
            function,
            &mut self.entries,
            fid,
            index,
            self.entry_hooks[index].statements(),
            InsertPosition::BlockStart(BasicBlockId::ENTRY),
        )?;
        outcome.record(stats);
        self.last_entries.insert(fid, index);
        Ok(())
    }

    fn instrument_call(
        &mut self,
        function: &mut Function,
        call: StatementRef,
        target: Option<u64>,
        stats: &mut InstrumentStats,
    ) -> AnalysisResult<()> {
        let callee = CalleeId::of_call(call, target);
        let Some((conv_id, conv)) = self.resolve(&callee)? else {
            stats.unresolved += 1;
            if let Some(n) = detach(function, &mut self.calls, &call) {
                stats.detached += 1;
                stats.removed += n;
            }
            return Ok(());
        };

        let signature =
            read_lock(&self.signatures, "signatures")?.signature_for_call(&call, &callee);
        let arity = call_arity(&conv, signature.as_ref().map(|(_, sig)| sig.as_ref()));
        let implied = implied_cleanup(&conv, arity);
        let stack_adjustment = signature
            .as_ref()
            .and_then(|(_, sig)| sig.stack_adjustment)
            .or_else(|| self.observed_cleanup.get(&callee).copied())
            .filter(|&bytes| bytes != implied);

        let key = CallKey {
            call,
            convention: conv_id,
            signature: signature.as_ref().map(|(sref, _)| *sref),
            stack_adjustment,
        };
        let index = match self.call_cache.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.call_hooks.len();
                let hook = CallHook::synthesize(
                    HookId::new(HookKind::Call, index),
                    function,
                    call.statement,
                    conv_id,
                    &conv,
                    signature.as_ref().map(|(sref, sig)| (*sref, sig.as_ref())),
                    stack_adjustment,
                );
                debug!(
                    "synthesized {} for call {} to {} ({}, {} args, cleanup {:#x})",
                    hook.id(),
                    call,
                    callee,
                    conv.name,
                    hook.arguments().len(),
                    hook.cleanup()
                );
                self.call_hooks.push(hook);
                self.call_cache.insert(key, index);
                stats.synthesized += 1;
                index
            }
        };

        let outcome = attach(
            function,
            &mut self.calls,
            call,
            index,
            self.call_hooks[index].statements(),
            InsertPosition::After(call.statement),
        )?;
        outcome.record(stats);
        self.last_calls.insert(call, index);
        Ok(())
    }

    fn instrument_return(
        &mut self,
        function: &mut Function,
        ret: StatementRef,
        convention: Option<&Resolved>,
        signature: Option<&(FunctionSignatureId, Arc<FunctionSignature>)>,
        stats: &mut InstrumentStats,
    ) -> AnalysisResult<()> {
        let Some((conv_id, conv)) = convention else {
            stats.unresolved += 1;
            if let Some(n) = detach(function, &mut self.returns, &ret) {
                stats.detached += 1;
                stats.removed += n;
            }
            return Ok(());
        };

        let key = ReturnKey {
            ret,
            convention: *conv_id,
            signature: signature.map(|(id, _)| *id),
        };
        let index = match self.return_cache.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.return_hooks.len();
                let hook = ReturnHook::synthesize(
                    HookId::new(HookKind::Return, index),
                    function,
                    ret.statement,
                    *conv_id,
                    conv,
                    signature.map(|(id, sig)| (*id, sig.as_ref())),
                );
                debug!("synthesized {} for return {}", hook.id(), ret);
                self.return_hooks.push(hook);
                self.return_cache.insert(key, index);
                stats.synthesized += 1;
                index
            }
        };

        let outcome = attach(
            function,
            &mut self.returns,
            ret,
            index,
            self.return_hooks[index].statements(),
            InsertPosition::Before(ret.statement),
        )?;
        outcome.record(stats);
        self.last_returns.insert(ret, index);
        Ok(())
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("cached", &self.cached_hook_count())
            .field("active", &self.active_hook_count())
            .field("touched", &self.touched.len())
            .field("detector", &self.detector.is_some())
            .finish()
    }
}

fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
) -> AnalysisResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| AnalysisError::PoisonedRegistry(name))
}

/// Every statement anchor of one function.
fn anchors_of(function: FunctionId) -> RangeInclusive<StatementRef> {
    StatementRef::new(function, StatementId(0))..=StatementRef::new(function, StatementId(u32::MAX))
}

enum Attach {
    Unchanged,
    Attached { replaced: Option<usize>, inserted: usize },
}

impl Attach {
    fn record(&self, stats: &mut InstrumentStats) {
        if let Attach::Attached { replaced, inserted } = self {
            if let Some(removed) = replaced {
                stats.detached += 1;
                stats.removed += removed;
            }
            stats.attached += 1;
            stats.inserted += inserted;
        }
    }
}

/// Makes `hook` the active hook of `anchor`, detaching the previous one.
fn attach<A: Ord + Copy + fmt::Display>(
    function: &mut Function,
    active: &mut BTreeMap<A, Active>,
    anchor: A,
    hook: usize,
    statements: &[Statement],
    position: InsertPosition,
) -> AnalysisResult<Attach> {
    if active.get(&anchor).is_some_and(|a| a.hook == hook) {
        return Ok(Attach::Unchanged);
    }
    let replaced = detach(function, active, &anchor);
    function.insert_synthetic(position, statements)?;
    trace!("attached {} statements at {}", statements.len(), anchor);
    active.insert(anchor, Active::new(hook, statements));
    Ok(Attach::Attached {
        replaced,
        inserted: statements.len(),
    })
}

/// Removes the active hook of `anchor`, returning how many statements went.
fn detach<A: Ord + fmt::Display>(
    function: &mut Function,
    active: &mut BTreeMap<A, Active>,
    anchor: &A,
) -> Option<usize> {
    let previous = active.remove(anchor)?;
    let removed = function.remove_synthetic(&previous.statements);
    trace!("detached {} statements at {}", removed, anchor);
    Some(removed)
}

/// Detaches hooks on anchors of `function` that the snapshot no longer lists.
fn detach_unseen(
    function: &mut Function,
    active: &mut BTreeMap<StatementRef, Active>,
    seen: &BTreeSet<StatementRef>,
    detached: &mut usize,
) -> usize {
    let stale: Vec<StatementRef> = active
        .range(anchors_of(function.id()))
        .map(|(k, _)| *k)
        .filter(|k| !seen.contains(k))
        .collect();
    let mut removed = 0;
    for anchor in stale {
        if let Some(n) = detach(function, active, &anchor) {
            *detached += 1;
            removed += n;
        }
    }
    removed
}

/// Drops last-used records of anchors the snapshot no longer lists.
fn forget_unseen(
    last: &mut BTreeMap<StatementRef, usize>,
    function: FunctionId,
    seen: &BTreeSet<StatementRef>,
) {
    last.retain(|anchor, _| anchor.function != function || seen.contains(anchor));
}
