//! Per-function analysis results.
//!
//! These are produced by passes outside this crate (liveness, type
//! recovery, variable recovery, control-region recovery). The store only
//! keeps them, bundled per function in [`FunctionArtifacts`].

use crate::calling::ParamType;
use hexhook_core::{BasicBlockId, Location, StatementId};
use std::collections::{BTreeMap, BTreeSet};

/// Statements whose results are live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Liveness {
    live: BTreeSet<StatementId>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_live(&mut self, statement: StatementId) {
        self.live.insert(statement);
    }

    pub fn is_live(&self, statement: StatementId) -> bool {
        self.live.contains(&statement)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl FromIterator<StatementId> for Liveness {
    fn from_iter<I: IntoIterator<Item = StatementId>>(iter: I) -> Self {
        Self {
            live: iter.into_iter().collect(),
        }
    }
}

/// Recovered location types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Types {
    types: BTreeMap<Location, ParamType>,
}

impl Types {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, location: Location, ty: ParamType) -> Option<ParamType> {
        self.types.insert(location, ty)
    }

    pub fn get(&self, location: &Location) -> Option<&ParamType> {
        self.types.get(location)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Location, &ParamType)> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// A source-level variable and the locations that hold it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub locations: Vec<Location>,
}

/// Recovered variables of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    variables: Vec<Variable>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, locations: Vec<Location>) {
        self.variables.push(Variable {
            name: name.into(),
            locations,
        });
    }

    /// The variable a location belongs to.
    pub fn find(&self, location: &Location) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.locations.contains(location))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Structured region kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Block,
    Sequence,
    IfThen,
    IfThenElse,
    Loop,
    Unstructured,
}

/// A control region covering a set of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub blocks: Vec<BasicBlockId>,
    pub children: Vec<usize>,
}

/// Control regions of one function. The first region added is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionGraph {
    regions: Vec<Region>,
}

impl RegionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a region and returns its index.
    pub fn add(&mut self, kind: RegionKind, blocks: Vec<BasicBlockId>) -> usize {
        self.regions.push(Region {
            kind,
            blocks,
            children: Vec::new(),
        });
        self.regions.len() - 1
    }

    /// Nests `child` under `parent`. Returns false if either is unknown.
    pub fn nest(&mut self, parent: usize, child: usize) -> bool {
        if child >= self.regions.len() {
            return false;
        }
        match self.regions.get_mut(parent) {
            Some(region) => {
                region.children.push(child);
                true
            }
            None => false,
        }
    }

    pub fn root(&self) -> Option<&Region> {
        self.regions.first()
    }

    pub fn region(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Everything the store keeps for one function.
#[derive(Debug, Clone, Default)]
pub struct FunctionArtifacts {
    pub liveness: Option<Liveness>,
    pub types: Option<Types>,
    pub variables: Option<Variables>,
    pub region_graph: Option<RegionGraph>,
}

impl FunctionArtifacts {
    /// Returns true if no pass has stored anything yet.
    pub fn is_empty(&self) -> bool {
        self.liveness.is_none()
            && self.types.is_none()
            && self.variables.is_none()
            && self.region_graph.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_find() {
        let mut vars = Variables::new();
        vars.add("count", vec![Location::Register(1), Location::Stack(-8)]);
        assert_eq!(
            vars.find(&Location::Stack(-8)).map(|v| v.name.as_str()),
            Some("count")
        );
        assert!(vars.find(&Location::Register(2)).is_none());
    }

    #[test]
    fn test_region_nesting() {
        let mut graph = RegionGraph::new();
        let root = graph.add(RegionKind::Sequence, vec![BasicBlockId(0), BasicBlockId(1)]);
        let body = graph.add(RegionKind::Loop, vec![BasicBlockId(1)]);
        assert!(graph.nest(root, body));
        assert!(!graph.nest(root, 7));
        assert_eq!(graph.root().map(|r| r.children.clone()), Some(vec![body]));
    }

    #[test]
    fn test_bundle_starts_empty() {
        let mut bundle = FunctionArtifacts::default();
        assert!(bundle.is_empty());
        bundle.liveness = Some([StatementId(1)].into_iter().collect());
        assert!(!bundle.is_empty());
        assert!(bundle.liveness.as_ref().unwrap().is_live(StatementId(1)));
    }
}
