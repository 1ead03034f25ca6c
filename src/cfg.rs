//! The control-flow graph of a reachability proof.
//!
//! A content-addressed multigraph: nodes are constrained terms keyed by
//! their digest, successors come in four stored kinds (edge, cover, split,
//! non-deterministic branch) plus the `vacuous` marker flag. Nodes reference
//! each other by id only, so cover edges may close cycles without creating
//! cyclic ownership.
//!
//! ## Invariants
//!
//! 1. `NodeId` = digest of the node's constrained term; at most one node per
//!    id.
//! 2. A node has at most one outgoing successor, of any kind. Constructors
//!    fail with [`CfgError::HasSuccessors`] otherwise.
//! 3. Every edge has depth >= 1.
//! 4. Splits and non-deterministic branches have at least two targets.
//! 5. Removing a node removes all its incident successors.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::claim::Claim;
use crate::cterm::{match_with_constraint, CSubst, CTerm};
use crate::term::{flatten_and, ml_and, RcTerm, TermError};
use crate::utils::{compare_short_hashes, shorten_hash};

/// Graph format tag.
pub const CFG_FORMAT: &str = "MLCFG";
/// Graph schema version.
pub const CFG_VERSION: u64 = 1;

/// Content id of a node: the digest of its constrained term.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn of(cterm: &CTerm) -> NodeId {
        NodeId(cterm.hash().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `abcdef..fedcba` display form.
    pub fn shortened(&self) -> String {
        shorten_hash(&self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A graph node; identity is the id alone.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Creation ordinal; pending nodes are served FIFO over this.
    pub index: u64,
    pub cterm: CTerm,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

/// `target` is reached from `source` by `depth` rewrite steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub depth: u64,
    pub rules: Vec<String>,
}

/// `source` is subsumed by `target` under the witness `csubst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cover {
    pub source: NodeId,
    pub target: NodeId,
    pub csubst: CSubst,
}

/// Deterministic case split; the branch conditions cover the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub source: NodeId,
    pub targets: Vec<(NodeId, CSubst)>,
}

impl Split {
    pub fn target_ids(&self) -> Vec<NodeId> {
        self.targets.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn csubst(&self, target: &NodeId) -> Option<&CSubst> {
        self.targets.iter().find(|(id, _)| id == target).map(|(_, c)| c)
    }

    /// Projection onto one chosen branch, used by path enumeration.
    pub fn with_single_target(&self, target: &NodeId) -> Option<Split> {
        let csubst = self.csubst(target)?.clone();
        Some(Split { source: self.source.clone(), targets: vec![(target.clone(), csubst)] })
    }
}

/// Nondeterministic branch built into the semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NDBranch {
    pub source: NodeId,
    pub targets: Vec<NodeId>,
    pub rules: Vec<String>,
}

impl NDBranch {
    pub fn with_single_target(&self, target: &NodeId) -> Option<NDBranch> {
        if !self.targets.contains(target) {
            return None;
        }
        Some(NDBranch {
            source: self.source.clone(),
            targets: vec![target.clone()],
            rules: self.rules.clone(),
        })
    }
}

/// The tagged union of successor kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Successor {
    Edge(Edge),
    Cover(Cover),
    Split(Split),
    NDBranch(NDBranch),
}

impl Successor {
    pub fn source(&self) -> &NodeId {
        match self {
            Successor::Edge(e) => &e.source,
            Successor::Cover(c) => &c.source,
            Successor::Split(s) => &s.source,
            Successor::NDBranch(b) => &b.source,
        }
    }

    pub fn target_ids(&self) -> Vec<NodeId> {
        match self {
            Successor::Edge(e) => vec![e.target.clone()],
            Successor::Cover(c) => vec![c.target.clone()],
            Successor::Split(s) => s.target_ids(),
            Successor::NDBranch(b) => b.targets.clone(),
        }
    }

    /// The one target of an already-projected successor.
    fn single_target(&self) -> Option<NodeId> {
        match self.target_ids().as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }
}

/// Errors from graph queries and mutations. Invariant violations here are
/// bugs in the caller, not recoverable proof conditions.
#[derive(Debug, thiserror::Error)]
pub enum CfgError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("ambiguous node reference `{0}`")]
    AmbiguousRef(String),
    #[error("unknown alias: {0}")]
    UnknownAlias(String),
    #[error("node already exists: {0}")]
    DuplicateNode(NodeId),
    #[error("node already has successors: {0}")]
    HasSuccessors(NodeId),
    #[error("cannot create an edge with depth 0: {src_node} -> {target}")]
    ZeroDepthEdge { src_node: NodeId, target: NodeId },
    #[error("cannot create {kind} with fewer than 2 targets: {src_node}")]
    TooFewTargets { kind: &'static str, src_node: NodeId },
    #[error("no matching between {src_node} and {target}")]
    NoMatch { src_node: NodeId, target: NodeId },
    #[error("alias may not contain `@`: {0}")]
    BadAlias(String),
    #[error("duplicate alias: {0}")]
    DuplicateAlias(String),
    #[error("no unique {0} node")]
    NoUnique(&'static str),
    #[error("no path from init to {0}")]
    NoPath(NodeId),
    #[error("cannot lift node {id}: {reason}")]
    CannotLift { id: NodeId, reason: String },
    #[error("bad graph data: {0}")]
    BadFormat(String),
    #[error(transparent)]
    Term(#[from] TermError),
}

/// The proof graph.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<NodeId, Edge>,
    covers: BTreeMap<NodeId, Cover>,
    splits: BTreeMap<NodeId, Split>,
    ndbranches: BTreeMap<NodeId, NDBranch>,
    init: BTreeSet<NodeId>,
    target: BTreeSet<NodeId>,
    expanded: BTreeSet<NodeId>,
    terminal: BTreeSet<NodeId>,
    stuck: BTreeSet<NodeId>,
    vacuous: BTreeSet<NodeId>,
    admitted: BTreeSet<NodeId>,
    aliases: BTreeMap<String, NodeId>,
    next_index: u64,
}

impl Cfg {
    pub fn new() -> Self {
        Cfg::default()
    }

    /// Build the two-node graph of a claim: init from the left projection,
    /// target from the right.
    pub fn from_claim(claim: &Claim) -> Result<(Cfg, NodeId, NodeId), CfgError> {
        let mut cfg = Cfg::new();
        let init = cfg.create_node(claim.lhs())?.id.clone();
        cfg.init.insert(init.clone());
        let target = cfg.get_or_create_node(claim.rhs()).id.clone();
        cfg.target.insert(target.clone());
        Ok((cfg, init, target))
    }

    // -- nodes --------------------------------------------------------------

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_node_by_cterm(&self, cterm: &CTerm) -> Option<&Node> {
        self.nodes.get(&NodeId::of(cterm))
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Insert a new node; its id is the digest of `cterm`.
    pub fn create_node(&mut self, cterm: CTerm) -> Result<&Node, CfgError> {
        let id = NodeId::of(&cterm);
        if self.nodes.contains_key(&id) {
            return Err(CfgError::DuplicateNode(id));
        }
        let index = self.next_index;
        self.next_index += 1;
        self.nodes.insert(id.clone(), Node { id: id.clone(), index, cterm });
        Ok(&self.nodes[&id])
    }

    /// Idempotent node creation.
    pub fn get_or_create_node(&mut self, cterm: CTerm) -> &Node {
        let id = NodeId::of(&cterm);
        if !self.nodes.contains_key(&id) {
            let index = self.next_index;
            self.next_index += 1;
            self.nodes.insert(id.clone(), Node { id: id.clone(), index, cterm });
        }
        &self.nodes[&id]
    }

    /// Remove a node and every incident successor, flag and alias.
    pub fn remove_node(&mut self, id_like: &str) -> Result<(), CfgError> {
        let id = self.resolve(id_like)?;
        self.nodes.remove(&id);

        self.edges.remove(&id);
        self.edges.retain(|_, e| e.target != id);
        self.covers.remove(&id);
        self.covers.retain(|_, c| c.target != id);
        self.splits.remove(&id);
        self.splits.retain(|_, s| !s.target_ids().contains(&id));
        self.ndbranches.remove(&id);
        self.ndbranches.retain(|_, b| !b.targets.contains(&id));

        for set in [
            &mut self.init,
            &mut self.target,
            &mut self.expanded,
            &mut self.terminal,
            &mut self.stuck,
            &mut self.vacuous,
            &mut self.admitted,
        ] {
            set.remove(&id);
        }
        self.aliases.retain(|_, target| *target != id);
        Ok(())
    }

    /// Swap a node's constrained term, rewiring every incident successor to
    /// the new id. Returns the new id.
    pub fn replace_node(&mut self, id_like: &str, new_cterm: CTerm) -> Result<NodeId, CfgError> {
        let old = self.resolve(id_like)?;

        let in_edges: Vec<Edge> = self.edges.values().filter(|e| e.target == old).cloned().collect();
        let out_edge = self.edges.get(&old).cloned();
        let in_covers: Vec<Cover> =
            self.covers.values().filter(|c| c.target == old).cloned().collect();
        let out_cover = self.covers.get(&old).cloned();
        let in_splits: Vec<Split> =
            self.splits.values().filter(|s| s.target_ids().contains(&old)).cloned().collect();
        let out_split = self.splits.get(&old).cloned();
        let in_branches: Vec<NDBranch> =
            self.ndbranches.values().filter(|b| b.targets.contains(&old)).cloned().collect();
        let out_branch = self.ndbranches.get(&old).cloned();

        let flags = [
            self.init.contains(&old),
            self.target.contains(&old),
            self.expanded.contains(&old),
            self.terminal.contains(&old),
            self.stuck.contains(&old),
            self.vacuous.contains(&old),
            self.admitted.contains(&old),
        ];
        let aliases: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, id)| **id == old)
            .map(|(name, _)| name.clone())
            .collect();

        self.remove_node(old.as_str())?;
        let new = self.get_or_create_node(new_cterm).id.clone();

        let rewire = |id: &NodeId| if *id == old { new.clone() } else { id.clone() };

        for e in in_edges {
            let source = rewire(&e.source);
            self.edges.insert(
                source.clone(),
                Edge { source, target: new.clone(), depth: e.depth, rules: e.rules },
            );
        }
        if let Some(e) = out_edge {
            self.edges.insert(
                new.clone(),
                Edge { source: new.clone(), target: e.target, depth: e.depth, rules: e.rules },
            );
        }
        for c in in_covers {
            let source = rewire(&c.source);
            self.covers.insert(
                source.clone(),
                Cover { source, target: new.clone(), csubst: c.csubst },
            );
        }
        if let Some(c) = out_cover {
            self.covers.insert(
                new.clone(),
                Cover { source: new.clone(), target: c.target, csubst: c.csubst },
            );
        }
        for s in in_splits {
            let source = rewire(&s.source);
            let targets =
                s.targets.iter().map(|(id, c)| (rewire(id), c.clone())).collect::<Vec<_>>();
            self.splits.insert(source.clone(), Split { source, targets });
        }
        if let Some(s) = out_split {
            self.splits
                .insert(new.clone(), Split { source: new.clone(), targets: s.targets });
        }
        for b in in_branches {
            let source = rewire(&b.source);
            let targets = b.targets.iter().map(&rewire).collect::<Vec<_>>();
            self.ndbranches
                .insert(source.clone(), NDBranch { source, targets, rules: b.rules });
        }
        if let Some(b) = out_branch {
            self.ndbranches.insert(
                new.clone(),
                NDBranch { source: new.clone(), targets: b.targets, rules: b.rules },
            );
        }

        let sets = [
            &mut self.init,
            &mut self.target,
            &mut self.expanded,
            &mut self.terminal,
            &mut self.stuck,
            &mut self.vacuous,
            &mut self.admitted,
        ];
        for (set, was_set) in sets.into_iter().zip(flags) {
            if was_set {
                set.insert(new.clone());
            }
        }
        for name in aliases {
            self.aliases.insert(name, new.clone());
        }
        Ok(new)
    }

    // -- reference resolution ----------------------------------------------

    /// Resolve a node reference: `#init`, `#target`, `#frontier`, `@alias`,
    /// a full id, or a short hash that uniquely identifies one node.
    pub fn resolve(&self, id_like: &str) -> Result<NodeId, CfgError> {
        match id_like {
            "#init" => return self.unique_init(),
            "#target" => return self.unique_target(),
            "#frontier" => {
                return self
                    .frontier()
                    .first()
                    .map(|n| n.id.clone())
                    .ok_or(CfgError::NoUnique("frontier"))
            }
            _ => {}
        }
        if let Some(alias) = id_like.strip_prefix('@') {
            return self
                .aliases
                .get(alias)
                .cloned()
                .ok_or_else(|| CfgError::UnknownAlias(alias.to_string()));
        }
        let matches: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| compare_short_hashes(id_like, id.as_str()))
            .cloned()
            .collect();
        match matches.as_slice() {
            [] => Err(CfgError::UnknownNode(id_like.to_string())),
            [only] => Ok(only.clone()),
            _ => Err(CfgError::AmbiguousRef(id_like.to_string())),
        }
    }

    pub fn node(&self, id_like: &str) -> Result<&Node, CfgError> {
        let id = self.resolve(id_like)?;
        self.nodes
            .get(&id)
            .ok_or_else(|| CfgError::UnknownNode(id_like.to_string()))
    }

    fn unique_init(&self) -> Result<NodeId, CfgError> {
        crate::utils::single(self.init.iter().cloned()).map_err(|_| CfgError::NoUnique("init"))
    }

    fn unique_target(&self) -> Result<NodeId, CfgError> {
        crate::utils::single(self.target.iter().cloned()).map_err(|_| CfgError::NoUnique("target"))
    }

    // -- successors ---------------------------------------------------------

    fn require_node(&self, id: &NodeId) -> Result<(), CfgError> {
        if self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(CfgError::UnknownNode(id.to_string()))
        }
    }

    fn check_no_successors(&self, source: &NodeId) -> Result<(), CfgError> {
        if self.successor(source).is_some() {
            return Err(CfgError::HasSuccessors(source.clone()));
        }
        Ok(())
    }

    /// The (at most one) outgoing successor of `source`.
    pub fn successor(&self, source: &NodeId) -> Option<Successor> {
        if let Some(e) = self.edges.get(source) {
            return Some(Successor::Edge(e.clone()));
        }
        if let Some(c) = self.covers.get(source) {
            return Some(Successor::Cover(c.clone()));
        }
        if let Some(s) = self.splits.get(source) {
            return Some(Successor::Split(s.clone()));
        }
        if let Some(b) = self.ndbranches.get(source) {
            return Some(Successor::NDBranch(b.clone()));
        }
        None
    }

    /// All outgoing successors (zero or one, by the invariant).
    pub fn successors(&self, source: &NodeId) -> Vec<Successor> {
        self.successor(source).into_iter().collect()
    }

    /// All successors with `target` among their targets.
    pub fn predecessors(&self, target: &NodeId) -> Vec<Successor> {
        let mut preds: Vec<Successor> = Vec::new();
        preds.extend(
            self.edges.values().filter(|e| e.target == *target).cloned().map(Successor::Edge),
        );
        preds.extend(
            self.covers.values().filter(|c| c.target == *target).cloned().map(Successor::Cover),
        );
        preds.extend(
            self.splits
                .values()
                .filter(|s| s.target_ids().contains(target))
                .cloned()
                .map(Successor::Split),
        );
        preds.extend(
            self.ndbranches
                .values()
                .filter(|b| b.targets.contains(target))
                .cloned()
                .map(Successor::NDBranch),
        );
        preds
    }

    pub fn edge(&self, source: &NodeId) -> Option<&Edge> {
        self.edges.get(source)
    }

    pub fn edges(&self, source: Option<&NodeId>, target: Option<&NodeId>) -> Vec<&Edge> {
        self.edges
            .values()
            .filter(|e| source.map_or(true, |s| e.source == *s))
            .filter(|e| target.map_or(true, |t| e.target == *t))
            .collect()
    }

    pub fn contains_edge(&self, edge: &Edge) -> bool {
        self.edges.get(&edge.source) == Some(edge)
    }

    pub fn covers(&self, source: Option<&NodeId>, target: Option<&NodeId>) -> Vec<&Cover> {
        self.covers
            .values()
            .filter(|c| source.map_or(true, |s| c.source == *s))
            .filter(|c| target.map_or(true, |t| c.target == *t))
            .collect()
    }

    pub fn splits(&self, source: Option<&NodeId>, target: Option<&NodeId>) -> Vec<&Split> {
        self.splits
            .values()
            .filter(|s| source.map_or(true, |src| s.source == *src))
            .filter(|s| target.map_or(true, |t| s.target_ids().contains(t)))
            .collect()
    }

    pub fn contains_split(&self, split: &Split) -> bool {
        self.splits.get(&split.source) == Some(split)
    }

    pub fn ndbranches(&self, source: Option<&NodeId>, target: Option<&NodeId>) -> Vec<&NDBranch> {
        self.ndbranches
            .values()
            .filter(|b| source.map_or(true, |s| b.source == *s))
            .filter(|b| target.map_or(true, |t| b.targets.contains(t)))
            .collect()
    }

    pub fn create_edge(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        depth: u64,
        rules: Vec<String>,
    ) -> Result<&Edge, CfgError> {
        self.require_node(source)?;
        self.require_node(target)?;
        self.check_no_successors(source)?;
        if depth == 0 {
            return Err(CfgError::ZeroDepthEdge { src_node: source.clone(), target: target.clone() });
        }
        self.edges.insert(
            source.clone(),
            Edge { source: source.clone(), target: target.clone(), depth, rules },
        );
        Ok(&self.edges[source])
    }

    pub fn remove_edge(&mut self, source: &NodeId) -> Result<Edge, CfgError> {
        self.edges
            .remove(source)
            .ok_or_else(|| CfgError::UnknownNode(format!("no edge from {source}")))
    }

    /// Create a cover; the witness is computed by matching when not given.
    pub fn create_cover(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        csubst: Option<CSubst>,
    ) -> Result<&Cover, CfgError> {
        self.require_node(source)?;
        self.require_node(target)?;
        self.check_no_successors(source)?;
        let csubst = match csubst {
            Some(c) => c,
            None => {
                let source_node = &self.nodes[source];
                let target_node = &self.nodes[target];
                match_with_constraint(&source_node.cterm, &target_node.cterm).ok_or(
                    CfgError::NoMatch { src_node: source.clone(), target: target.clone() },
                )?
            }
        };
        self.covers.insert(
            source.clone(),
            Cover { source: source.clone(), target: target.clone(), csubst },
        );
        Ok(&self.covers[source])
    }

    pub fn remove_cover(&mut self, source: &NodeId) -> Result<Cover, CfgError> {
        self.covers
            .remove(source)
            .ok_or_else(|| CfgError::UnknownNode(format!("no cover from {source}")))
    }

    pub fn create_split(
        &mut self,
        source: &NodeId,
        targets: Vec<(NodeId, CSubst)>,
    ) -> Result<&Split, CfgError> {
        self.require_node(source)?;
        for (target, _) in &targets {
            self.require_node(target)?;
        }
        self.check_no_successors(source)?;
        if targets.len() < 2 {
            return Err(CfgError::TooFewTargets { kind: "split", src_node: source.clone() });
        }
        self.splits.insert(source.clone(), Split { source: source.clone(), targets });
        Ok(&self.splits[source])
    }

    pub fn remove_split(&mut self, source: &NodeId) -> Result<Split, CfgError> {
        self.splits
            .remove(source)
            .ok_or_else(|| CfgError::UnknownNode(format!("no split from {source}")))
    }

    pub fn create_ndbranch(
        &mut self,
        source: &NodeId,
        targets: Vec<NodeId>,
        rules: Vec<String>,
    ) -> Result<&NDBranch, CfgError> {
        self.require_node(source)?;
        for target in &targets {
            self.require_node(target)?;
        }
        self.check_no_successors(source)?;
        if targets.len() < 2 {
            return Err(CfgError::TooFewTargets { kind: "ndbranch", src_node: source.clone() });
        }
        self.ndbranches
            .insert(source.clone(), NDBranch { source: source.clone(), targets, rules });
        Ok(&self.ndbranches[source])
    }

    /// Case-split a node on extra constraints, one branch per constraint.
    pub fn split_on_constraints(
        &mut self,
        source: &NodeId,
        constraints: Vec<RcTerm>,
    ) -> Result<Vec<NodeId>, CfgError> {
        self.require_node(source)?;
        let source_cterm = self.nodes[source].cterm.clone();
        let mut targets: Vec<(NodeId, CSubst)> = Vec::with_capacity(constraints.len());
        let mut ids: Vec<NodeId> = Vec::with_capacity(constraints.len());
        for constraint in constraints {
            let branch = source_cterm.add_constraint(constraint.clone());
            let id = self.get_or_create_node(branch).id.clone();
            ids.push(id.clone());
            targets.push((id, CSubst::from_constraints(flatten_and(&constraint))));
        }
        self.create_split(source, targets)?;
        Ok(ids)
    }

    // -- flags and aliases --------------------------------------------------

    pub fn add_init(&mut self, id: &NodeId) {
        self.init.insert(id.clone());
    }

    pub fn add_target(&mut self, id: &NodeId) {
        self.target.insert(id.clone());
    }

    pub fn add_expanded(&mut self, id: &NodeId) {
        self.expanded.insert(id.clone());
    }

    pub fn add_terminal(&mut self, id: &NodeId) {
        self.terminal.insert(id.clone());
    }

    pub fn add_stuck(&mut self, id: &NodeId) {
        self.stuck.insert(id.clone());
    }

    pub fn add_vacuous(&mut self, id: &NodeId) {
        self.vacuous.insert(id.clone());
    }

    pub fn add_admitted(&mut self, id: &NodeId) {
        self.admitted.insert(id.clone());
    }

    pub fn discard_expanded(&mut self, id: &NodeId) {
        self.expanded.remove(id);
    }

    pub fn is_init(&self, id: &NodeId) -> bool {
        self.init.contains(id)
    }

    pub fn is_target(&self, id: &NodeId) -> bool {
        self.target.contains(id)
    }

    pub fn is_expanded(&self, id: &NodeId) -> bool {
        self.expanded.contains(id)
    }

    pub fn is_terminal(&self, id: &NodeId) -> bool {
        self.terminal.contains(id)
    }

    pub fn is_stuck(&self, id: &NodeId) -> bool {
        self.stuck.contains(id)
    }

    pub fn is_vacuous(&self, id: &NodeId) -> bool {
        self.vacuous.contains(id)
    }

    pub fn is_admitted(&self, id: &NodeId) -> bool {
        self.admitted.contains(id)
    }

    /// No outgoing edge, split or branch. A covered node still counts as a
    /// leaf; the cover is what closes it.
    pub fn is_leaf(&self, id: &NodeId) -> bool {
        !self.edges.contains_key(id)
            && !self.splits.contains_key(id)
            && !self.ndbranches.contains_key(id)
    }

    pub fn is_covered(&self, id: &NodeId) -> bool {
        self.covers.contains_key(id)
    }

    /// Pending: a leaf that still needs work.
    pub fn is_pending(&self, id: &NodeId) -> bool {
        self.is_leaf(id)
            && !self.is_covered(id)
            && !self.is_target(id)
            && !self.is_terminal(id)
            && !self.is_stuck(id)
            && !self.is_vacuous(id)
            && !self.is_admitted(id)
    }

    pub fn leaves(&self) -> Vec<&Node> {
        self.nodes.values().filter(|n| self.is_leaf(&n.id)).collect()
    }

    /// Pending nodes in creation order (FIFO frontier).
    pub fn frontier(&self) -> Vec<&Node> {
        let mut pending: Vec<&Node> =
            self.nodes.values().filter(|n| self.is_pending(&n.id)).collect();
        pending.sort_by_key(|n| n.index);
        pending
    }

    pub fn add_alias(&mut self, alias: &str, id: &NodeId) -> Result<(), CfgError> {
        if alias.contains('@') {
            return Err(CfgError::BadAlias(alias.to_string()));
        }
        if self.aliases.contains_key(alias) {
            return Err(CfgError::DuplicateAlias(alias.to_string()));
        }
        self.require_node(id)?;
        self.aliases.insert(alias.to_string(), id.clone());
        Ok(())
    }

    pub fn remove_alias(&mut self, alias: &str) -> Result<(), CfgError> {
        self.aliases
            .remove(alias)
            .map(|_| ())
            .ok_or_else(|| CfgError::UnknownAlias(alias.to_string()))
    }

    pub fn aliases_of(&self, id: &NodeId) -> Vec<&str> {
        self.aliases
            .iter()
            .filter(|(_, target)| *target == id)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    // -- reachability and paths ---------------------------------------------

    /// Nodes reachable from `id` (or reaching it, with `reverse`).
    pub fn reachable_nodes(
        &self,
        id: &NodeId,
        reverse: bool,
        traverse_covers: bool,
    ) -> BTreeSet<NodeId> {
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        let mut worklist: Vec<NodeId> = vec![id.clone()];
        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if reverse {
                for pred in self.predecessors(&current) {
                    if !traverse_covers && matches!(pred, Successor::Cover(_)) {
                        continue;
                    }
                    worklist.push(pred.source().clone());
                }
            } else {
                for succ in self.successors(&current) {
                    if !traverse_covers && matches!(succ, Successor::Cover(_)) {
                        continue;
                    }
                    worklist.extend(succ.target_ids());
                }
            }
        }
        visited
    }

    /// Depth-first enumeration of all paths from `source` to `target`.
    ///
    /// Multi-target successors are projected per chosen branch with
    /// `with_single_target`, and a node already on the path is never
    /// revisited, so cover-closed loops terminate.
    pub fn paths_between(
        &self,
        source: &NodeId,
        target: &NodeId,
        traverse_covers: bool,
    ) -> Vec<Vec<Successor>> {
        let start = match self.successor(source) {
            Some(s) => s,
            None => return Vec::new(),
        };

        fn in_path(id: &NodeId, path: &[Successor]) -> bool {
            path.iter().any(|s| s.source() == id)
                || path.last().map_or(false, |s| s.target_ids().contains(id))
        }

        let mut paths: Vec<Vec<Successor>> = Vec::new();
        let mut worklist: VecDeque<Vec<Successor>> = VecDeque::new();
        for projected in self.project(&start) {
            worklist.push_back(vec![projected]);
        }

        while let Some(path) = worklist.pop_front() {
            let Some(last) = path.last() else { continue };
            if !traverse_covers && matches!(last, Successor::Cover(_)) {
                continue;
            }
            let Some(tip) = last.single_target() else { continue };
            if tip == *target {
                paths.push(path);
                continue;
            }
            let Some(next) = self.successor(&tip) else { continue };
            for projected in self.project(&next) {
                let goes_to = match projected.single_target() {
                    Some(t) => t,
                    None => continue,
                };
                if in_path(&goes_to, &path) {
                    continue;
                }
                let mut extended = path.clone();
                extended.push(projected);
                worklist.push_back(extended);
            }
        }
        paths
    }

    /// Split multi-target successors into their single-target projections.
    fn project(&self, successor: &Successor) -> Vec<Successor> {
        match successor {
            Successor::Split(s) => s
                .target_ids()
                .iter()
                .filter_map(|t| s.with_single_target(t))
                .map(Successor::Split)
                .collect(),
            Successor::NDBranch(b) => b
                .targets
                .iter()
                .filter_map(|t| b.with_single_target(t))
                .map(Successor::NDBranch)
                .collect(),
            other => vec![other.clone()],
        }
    }

    /// The path with the fewest successors, if any.
    pub fn shortest_path_between(
        &self,
        source: &NodeId,
        target: &NodeId,
    ) -> Option<Vec<Successor>> {
        let paths = self.paths_between(source, target, true);
        if paths.len() > 1 {
            warn!(
                source = %source.shortened(),
                target = %target.shortened(),
                paths = paths.len(),
                "multiple paths reach node; using the shortest for path constraints"
            );
        }
        paths.into_iter().min_by_key(Vec::len)
    }

    /// Are `source` and `target` connected without taking any rewrite step?
    pub fn zero_depth_between(&self, source: &NodeId, target: &NodeId) -> bool {
        if source == target {
            return true;
        }
        match self.shortest_path_between(source, target) {
            None => false,
            Some(path) => path
                .iter()
                .all(|s| !matches!(s, Successor::Edge(_) | Successor::NDBranch(_))),
        }
    }

    /// The predicate under which `id` is reachable from the unique init
    /// node: split and cover witnesses conjoined along the shortest path,
    /// walked in reverse.
    pub fn path_constraints(&self, id_like: &str) -> Result<RcTerm, CfgError> {
        let target = self.resolve(id_like)?;
        let init = self.unique_init()?;
        if target == init {
            return Ok(ml_and([]));
        }
        let path = self
            .shortest_path_between(&init, &target)
            .ok_or(CfgError::NoPath(target))?;

        let mut constraint = ml_and([]);
        for successor in path.iter().rev() {
            match successor {
                Successor::Split(split) => {
                    if let Some((_, csubst)) = split.targets.first() {
                        constraint = ml_and([
                            csubst.subst.ml_pred(),
                            csubst.constraint(),
                            constraint,
                        ]);
                    }
                }
                Successor::Cover(cover) => {
                    constraint = ml_and([
                        cover.csubst.constraint(),
                        cover.csubst.subst.apply(&constraint),
                    ]);
                }
                Successor::Edge(_) | Successor::NDBranch(_) => {}
            }
        }
        Ok(ml_and(flatten_and(&constraint)))
    }

    /// Remove the whole cone reachable from `id` (covers included).
    pub fn prune(&mut self, id_like: &str) -> Result<Vec<NodeId>, CfgError> {
        let id = self.resolve(id_like)?;
        let doomed = self.reachable_nodes(&id, false, true);
        for node_id in &doomed {
            self.remove_node(node_id.as_str())?;
        }
        Ok(doomed.into_iter().collect())
    }

    // -- serialization ------------------------------------------------------

    pub fn to_dict(&self) -> Value {
        let nodes: Vec<Value> = self
            .nodes
            .values()
            .map(|n| {
                json!({
                    "id": n.id.as_str(),
                    "index": n.index,
                    "cterm": n.cterm.to_value(),
                })
            })
            .collect();
        let edges: Vec<Value> = self
            .edges
            .values()
            .map(|e| {
                json!({
                    "source": e.source.as_str(),
                    "target": e.target.as_str(),
                    "depth": e.depth,
                    "rules": e.rules,
                })
            })
            .collect();
        let covers: Vec<Value> = self
            .covers
            .values()
            .map(|c| {
                json!({
                    "source": c.source.as_str(),
                    "target": c.target.as_str(),
                    "csubst": c.csubst.to_value(),
                })
            })
            .collect();
        let splits: Vec<Value> = self
            .splits
            .values()
            .map(|s| {
                json!({
                    "source": s.source.as_str(),
                    "targets": s
                        .targets
                        .iter()
                        .map(|(id, csubst)| json!({
                            "target": id.as_str(),
                            "csubst": csubst.to_value(),
                        }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let ndbranches: Vec<Value> = self
            .ndbranches
            .values()
            .map(|b| {
                json!({
                    "source": b.source.as_str(),
                    "targets": b.targets.iter().map(NodeId::as_str).collect::<Vec<_>>(),
                    "rules": b.rules,
                })
            })
            .collect();

        fn id_set(set: &BTreeSet<NodeId>) -> Vec<&str> {
            set.iter().map(NodeId::as_str).collect()
        }

        let mut dict = Map::new();
        dict.insert("format".into(), json!(CFG_FORMAT));
        dict.insert("version".into(), json!(CFG_VERSION));
        dict.insert("next".into(), json!(self.next_index));
        let mut put = |key: &str, value: Value| {
            let empty = match &value {
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            };
            if !empty {
                dict.insert(key.into(), value);
            }
        };
        put("nodes", json!(nodes));
        put("edges", json!(edges));
        put("covers", json!(covers));
        put("splits", json!(splits));
        put("ndbranches", json!(ndbranches));
        put("init", json!(id_set(&self.init)));
        put("target", json!(id_set(&self.target)));
        put("expanded", json!(id_set(&self.expanded)));
        put("terminal", json!(id_set(&self.terminal)));
        put("stuck", json!(id_set(&self.stuck)));
        put("vacuous", json!(id_set(&self.vacuous)));
        put("admitted", json!(id_set(&self.admitted)));
        put(
            "aliases",
            json!(self
                .aliases
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.as_str().to_string())))
                .collect::<Map<String, Value>>()),
        );
        Value::Object(dict)
    }

    pub fn from_dict(value: &Value) -> Result<Cfg, CfgError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CfgError::BadFormat("graph data is not an object".into()))?;
        match obj.get("format").and_then(Value::as_str) {
            Some(CFG_FORMAT) | None => {}
            other => return Err(CfgError::BadFormat(format!("format {other:?}"))),
        }
        match obj.get("version").and_then(Value::as_u64) {
            Some(CFG_VERSION) | None => {}
            other => return Err(CfgError::BadFormat(format!("version {other:?}"))),
        }

        let mut cfg = Cfg::new();

        for entry in obj.get("nodes").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]) {
            let node_obj = entry
                .as_object()
                .ok_or_else(|| CfgError::BadFormat(format!("bad node entry: {entry}")))?;
            let declared = node_obj
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| CfgError::BadFormat("node without id".into()))?;
            let cterm = CTerm::from_value(
                node_obj
                    .get("cterm")
                    .ok_or_else(|| CfgError::BadFormat("node without cterm".into()))?,
            )?;
            let id = NodeId::of(&cterm);
            if id.as_str() != declared {
                return Err(CfgError::BadFormat(format!(
                    "node id {declared} does not match its content digest {id}"
                )));
            }
            if cfg.nodes.contains_key(&id) {
                return Err(CfgError::BadFormat(format!("multiple declarations of node {id}")));
            }
            let index = node_obj.get("index").and_then(Value::as_u64).unwrap_or(cfg.next_index);
            cfg.next_index = cfg.next_index.max(index + 1);
            cfg.nodes.insert(id.clone(), Node { id, index, cterm });
        }
        if let Some(next) = obj.get("next").and_then(Value::as_u64) {
            cfg.next_index = cfg.next_index.max(next);
        }

        let resolve = |cfg: &Cfg, raw: &Value| -> Result<NodeId, CfgError> {
            let id = raw
                .as_str()
                .ok_or_else(|| CfgError::BadFormat(format!("bad node reference: {raw}")))?;
            let node_id = NodeId(id.to_string());
            if !cfg.nodes.contains_key(&node_id) {
                return Err(CfgError::BadFormat(format!("undeclared node: {id}")));
            }
            Ok(node_id)
        };

        for entry in obj.get("edges").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]) {
            let edge = entry
                .as_object()
                .ok_or_else(|| CfgError::BadFormat(format!("bad edge entry: {entry}")))?;
            let source = resolve(&cfg, edge.get("source").unwrap_or(&Value::Null))?;
            let target = resolve(&cfg, edge.get("target").unwrap_or(&Value::Null))?;
            let depth = edge
                .get("depth")
                .and_then(Value::as_u64)
                .ok_or_else(|| CfgError::BadFormat("edge without depth".into()))?;
            let rules = string_list(edge.get("rules"))?;
            cfg.create_edge(&source, &target, depth, rules)?;
        }

        for entry in obj.get("covers").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]) {
            let cover = entry
                .as_object()
                .ok_or_else(|| CfgError::BadFormat(format!("bad cover entry: {entry}")))?;
            let source = resolve(&cfg, cover.get("source").unwrap_or(&Value::Null))?;
            let target = resolve(&cfg, cover.get("target").unwrap_or(&Value::Null))?;
            let csubst = CSubst::from_value(
                cover
                    .get("csubst")
                    .ok_or_else(|| CfgError::BadFormat("cover without csubst".into()))?,
            )?;
            cfg.create_cover(&source, &target, Some(csubst))?;
        }

        for entry in obj.get("splits").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]) {
            let split = entry
                .as_object()
                .ok_or_else(|| CfgError::BadFormat(format!("bad split entry: {entry}")))?;
            let source = resolve(&cfg, split.get("source").unwrap_or(&Value::Null))?;
            let mut targets: Vec<(NodeId, CSubst)> = Vec::new();
            for target_entry in split
                .get("targets")
                .and_then(Value::as_array)
                .ok_or_else(|| CfgError::BadFormat("split without targets".into()))?
            {
                let target_obj = target_entry
                    .as_object()
                    .ok_or_else(|| CfgError::BadFormat(format!("bad split target: {target_entry}")))?;
                let target = resolve(&cfg, target_obj.get("target").unwrap_or(&Value::Null))?;
                let csubst = CSubst::from_value(
                    target_obj
                        .get("csubst")
                        .ok_or_else(|| CfgError::BadFormat("split target without csubst".into()))?,
                )?;
                targets.push((target, csubst));
            }
            cfg.create_split(&source, targets)?;
        }

        for entry in obj.get("ndbranches").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]) {
            let branch = entry
                .as_object()
                .ok_or_else(|| CfgError::BadFormat(format!("bad ndbranch entry: {entry}")))?;
            let source = resolve(&cfg, branch.get("source").unwrap_or(&Value::Null))?;
            let mut targets: Vec<NodeId> = Vec::new();
            for target in branch
                .get("targets")
                .and_then(Value::as_array)
                .ok_or_else(|| CfgError::BadFormat("ndbranch without targets".into()))?
            {
                targets.push(resolve(&cfg, target)?);
            }
            let rules = string_list(branch.get("rules"))?;
            cfg.create_ndbranch(&source, targets, rules)?;
        }

        for key in ["init", "target", "expanded", "terminal", "stuck", "vacuous", "admitted"] {
            let mut ids: Vec<NodeId> = Vec::new();
            for raw in obj.get(key).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]) {
                ids.push(resolve(&cfg, raw)?);
            }
            let set = match key {
                "init" => &mut cfg.init,
                "target" => &mut cfg.target,
                "expanded" => &mut cfg.expanded,
                "terminal" => &mut cfg.terminal,
                "stuck" => &mut cfg.stuck,
                "vacuous" => &mut cfg.vacuous,
                _ => &mut cfg.admitted,
            };
            set.extend(ids);
        }

        if let Some(Value::Object(aliases)) = obj.get("aliases") {
            for (alias, raw) in aliases {
                let id = resolve(&cfg, raw)?;
                cfg.add_alias(alias, &id)?;
            }
        }

        Ok(cfg)
    }

    pub fn to_json(&self) -> String {
        self.to_dict().to_string()
    }

    pub fn from_json(raw: &str) -> Result<Cfg, CfgError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| CfgError::BadFormat(e.to_string()))?;
        Cfg::from_dict(&value)
    }

    /// One-line description of a node: short id plus its attributes.
    pub fn node_short_info(&self, id: &NodeId) -> String {
        let mut attrs: Vec<String> = Vec::new();
        for (flag, set) in [
            ("init", &self.init),
            ("target", &self.target),
            ("expanded", &self.expanded),
            ("terminal", &self.terminal),
            ("stuck", &self.stuck),
            ("vacuous", &self.vacuous),
            ("admitted", &self.admitted),
        ] {
            if set.contains(id) {
                attrs.push(flag.to_string());
            }
        }
        if self.is_leaf(id) {
            attrs.push("leaf".to_string());
        }
        if self.is_pending(id) {
            attrs.push("pending".to_string());
        }
        for alias in self.aliases_of(id) {
            attrs.push(format!("@{alias}"));
        }
        if attrs.is_empty() {
            id.shortened()
        } else {
            format!("{} ({})", id.shortened(), attrs.join(", "))
        }
    }
}

fn string_list(value: Option<&Value>) -> Result<Vec<String>, CfgError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CfgError::BadFormat(format!("bad rule label: {v}")))
            })
            .collect(),
        Some(other) => Err(CfgError::BadFormat(format!("expected a list: {other}"))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small-graph builders shared by the cfg, minimize and store tests.

    use super::*;
    use crate::term::{int_token, Term};

    /// Distinct configurations indexed by a small integer; over 10 the
    /// contents is a variable.
    pub fn term(i: u64) -> CTerm {
        let inside = if i > 10 { Term::var(format!("V{i}")) } else { int_token(i as i64) };
        CTerm::from_config(Term::apply("<top>", vec![inside]))
    }

    pub fn node_id(i: u64) -> NodeId {
        NodeId::of(&term(i))
    }

    pub fn with_nodes(cfg: &mut Cfg, ids: impl IntoIterator<Item = u64>) {
        for i in ids {
            cfg.get_or_create_node(term(i));
        }
    }
}
