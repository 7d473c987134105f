//! Registry of assigned calling conventions.

use super::{CalleeId, Convention};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Index of a convention in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConventionId(pub u32);

impl fmt::Display for ConventionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cc{}", self.0)
    }
}

/// A registry shared between the context, the hooks engine and detectors.
pub type SharedConventions = Arc<RwLock<Conventions>>;

/// Conventions known to the session and the callees they are assigned to.
///
/// Registered conventions are immutable and never removed, so a
/// [`ConventionId`] stays valid for the whole session.
#[derive(Debug, Default)]
pub struct Conventions {
    conventions: Vec<Arc<Convention>>,
    by_name: HashMap<String, ConventionId>,
    assigned: HashMap<CalleeId, ConventionId>,
    revision: u64,
}

impl Conventions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the registry for sharing.
    pub fn into_shared(self) -> SharedConventions {
        Arc::new(RwLock::new(self))
    }

    /// Registers a convention. A convention with the same name is returned
    /// instead of registering a duplicate.
    pub fn register(&mut self, convention: Convention) -> ConventionId {
        if let Some(&id) = self.by_name.get(&convention.name) {
            return id;
        }
        let id = ConventionId(self.conventions.len() as u32);
        self.by_name.insert(convention.name.clone(), id);
        self.conventions.push(Arc::new(convention));
        id
    }

    /// Registers a preset by name.
    pub fn register_preset(&mut self, name: &str) -> Option<ConventionId> {
        Convention::preset(name).map(|conv| self.register(conv))
    }

    pub fn get(&self, id: ConventionId) -> Option<&Arc<Convention>> {
        self.conventions.get(id.0 as usize)
    }

    pub fn find(&self, name: &str) -> Option<ConventionId> {
        self.by_name.get(name).copied()
    }

    /// Assigns a convention to a callee, replacing any previous assignment.
    pub fn assign(&mut self, callee: CalleeId, id: ConventionId) {
        if self.assigned.insert(callee, id) != Some(id) {
            self.revision += 1;
        }
    }

    /// Drops the assignment of a callee.
    pub fn unassign(&mut self, callee: &CalleeId) -> Option<ConventionId> {
        let removed = self.assigned.remove(callee);
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    /// The convention id assigned to a callee.
    pub fn assigned(&self, callee: &CalleeId) -> Option<ConventionId> {
        self.assigned.get(callee).copied()
    }

    /// The convention assigned to a callee.
    pub fn lookup(&self, callee: &CalleeId) -> Option<(ConventionId, Arc<Convention>)> {
        let id = self.assigned(callee)?;
        self.get(id).map(|conv| (id, Arc::clone(conv)))
    }

    /// Counter bumped whenever an assignment changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.conventions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conventions.is_empty()
    }
}
