// src/graph/mod.rs

//! Dependency graph data structures
//!
//! The graph is an arena: nodes live in a `Vec` addressed by `NodeId`,
//! edges are a flat list, and each node additionally keeps
//! `dependants` (incoming edge sources) plus its transitive-requirement
//! map. Requirements propagate downstream (toward consumers) as nodes
//! are created, so a later branch reaching the same package identity
//! finds it at the shallowest owning node and either closes the diamond
//! or reports the conflict there.
//!
//! Ownership never cycles: nodes refer to each other only by id.

pub mod builder;
pub mod resolver;

use crate::reference::RecipeReference;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

/// Settings map (os, arch, compiler, ...)
pub type Settings = BTreeMap<String, String>;

/// Option values keyed by option name
pub type OptionsMap = BTreeMap<String, String>;

/// Whether a node's binaries run on the build machine or the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeContext {
    Host,
    Build,
}

impl fmt::Display for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeContext::Host => write!(f, "host"),
            NodeContext::Build => write!(f, "build"),
        }
    }
}

/// How a node's recipe was obtained, as classified by the remote proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeStatus {
    /// The root consumer recipe
    Consumer,
    /// A synthetic root carrying command-line requirements only
    Virtual,
    /// Linked to a local working copy, not the cache
    Editable,
    /// Fetched from a remote during this build
    Downloaded,
    /// Served from the local cache, no remote consulted or remote equal
    InCache,
    /// Remote was newer and `update` replaced the local copy
    Updated,
    /// Local copy is newer than the selected remote
    Newer,
    /// Remote is newer but `update` was not requested
    Updateable,
    /// The reference is cached but the selected remote no longer has it
    NotInRemote,
    /// The reference is cached and no remote is known for it
    NoRemote,
}

impl fmt::Display for RecipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecipeStatus::Consumer => "consumer",
            RecipeStatus::Virtual => "virtual",
            RecipeStatus::Editable => "editable",
            RecipeStatus::Downloaded => "downloaded",
            RecipeStatus::InCache => "in_cache",
            RecipeStatus::Updated => "updated",
            RecipeStatus::Newer => "newer",
            RecipeStatus::Updateable => "updateable",
            RecipeStatus::NotInRemote => "not_in_remote",
            RecipeStatus::NoRemote => "no_remote",
        };
        write!(f, "{}", s)
    }
}

/// A directed requirement edge attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Requirement {
    pub reference: RecipeReference,
    /// Build-time requirement (tool), switches the target into the
    /// build context
    pub build: bool,
    /// Does not pull the package in by itself, but forces the version
    /// of any other path that does
    pub override_only: bool,
    /// Wins version conflicts against upstream declarations
    pub force: bool,
    /// Explicit option values imposed on the target package
    pub options: OptionsMap,
}

impl Requirement {
    /// A plain host requirement
    pub fn new(reference: RecipeReference) -> Self {
        Self {
            reference,
            build: false,
            override_only: false,
            force: false,
            options: OptionsMap::new(),
        }
    }

    /// A build-context requirement
    pub fn build_require(reference: RecipeReference) -> Self {
        Self {
            build: true,
            ..Self::new(reference)
        }
    }

    /// Mark as override-only
    pub fn as_override(mut self) -> Self {
        self.override_only = true;
        self
    }

    /// Mark as forced
    pub fn as_force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Two requirements compete for the same node when they name the
    /// same package identity in the same context class.
    pub fn same_target(&self, other: &Requirement) -> bool {
        self.build == other.build && self.reference.same_identity(&other.reference)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reference)?;
        if self.build {
            write!(f, " (build)")?;
        }
        if self.override_only {
            write!(f, " (override)")?;
        }
        Ok(())
    }
}

/// A node's view of one transitive requirement
#[derive(Debug, Clone, Serialize)]
pub struct TransitiveDep {
    pub require: Requirement,
    /// The node satisfying the requirement, once expanded
    pub node: Option<NodeId>,
}

/// Index of a node in the graph arena
pub type NodeId = usize;

/// A vertex in the dependency graph
#[derive(Debug, Serialize)]
pub struct Node {
    pub id: NodeId,
    /// `None` for a synthetic (virtual) root
    pub reference: Option<RecipeReference>,
    pub context: NodeContext,
    pub status: RecipeStatus,
    pub remote: Option<String>,
    pub settings: Settings,
    pub settings_build: Settings,
    pub options: OptionsMap,
    pub provides: Vec<String>,
    /// Hash of (settings, options, direct host-context deps), filled in
    /// after expansion completes
    pub package_id: Option<String>,
    pub transitive_deps: Vec<TransitiveDep>,
    /// Incoming edge sources (consumers of this node)
    pub dependants: Vec<NodeId>,
}

impl Node {
    /// Printable identity (the reference, or the root marker)
    pub fn ref_str(&self) -> String {
        match &self.reference {
            Some(r) => r.base_str(),
            None => "cli".to_string(),
        }
    }

    /// The transitive entry competing with `require`, if any
    pub fn transitive(&self, require: &Requirement) -> Option<&TransitiveDep> {
        self.transitive_deps.iter().find(|t| t.require.same_target(require))
    }

    fn transitive_mut(&mut self, require: &Requirement) -> Option<&mut TransitiveDep> {
        self.transitive_deps
            .iter_mut()
            .find(|t| t.require.same_target(require))
    }
}

/// A resolved edge of the graph
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub require: Requirement,
}

/// A requirement that could not be satisfied; expansion continues on
/// independent branches so one build reports every missing reference
#[derive(Debug, Clone, Serialize)]
pub struct MissingRequire {
    pub require: String,
    pub owner: String,
    pub message: String,
}

/// Result of a downstream walk for an incoming requirement
#[derive(Debug)]
pub(crate) enum Downstream {
    /// The requirement closes onto one of its own ancestors
    Loop(NodeId),
    /// An existing requirement for the same identity was found
    Found {
        require: Requirement,
        node: Option<NodeId>,
        owner: NodeId,
    },
    /// Nothing downstream competes
    Absent,
}

/// The dependency graph: an arena of nodes plus an edge list
#[derive(Debug, Default, Serialize)]
pub struct DepsGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub missing: Vec<MissingRequire>,
}

impl DepsGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root node (always inserted first)
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// Add a node, assigning its id
    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = self.nodes.len();
        node.id = id;
        self.nodes.push(node);
        id
    }

    /// Add an edge, recording the dependant link and resolving the
    /// source's transitive entry to the target.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, require: Requirement) {
        if !self.nodes[to].dependants.contains(&from) {
            self.nodes[to].dependants.push(from);
        }
        match self.nodes[from].transitive_mut(&require) {
            Some(entry) => {
                entry.require = require.clone();
                entry.node = Some(to);
            }
            None => self.nodes[from].transitive_deps.push(TransitiveDep {
                require: require.clone(),
                node: Some(to),
            }),
        }
        self.edges.push(Edge { from, to, require });
    }

    /// Push a resolved requirement into every consumer downstream of
    /// `from`, so later branches reaching the same identity find it at
    /// their shallowest shared consumer.
    pub(crate) fn propagate_downstream(&mut self, from: NodeId, require: &Requirement, target: NodeId) {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::from([from]);

        while let Some(id) = queue.pop_front() {
            let context = self.nodes[id].context;
            let dependants = self.nodes[id].dependants.clone();
            for parent in dependants {
                // Propagation stops at a context switch: a tool's
                // dependencies are invisible to its host-side consumers
                if self.nodes[parent].context != context {
                    continue;
                }
                if !visited.insert(parent) {
                    continue;
                }
                match self.nodes[parent].transitive_mut(require) {
                    Some(entry) => {
                        // A pending entry (overrides included) adopts the
                        // resolved node; its own reference stays untouched
                        if entry.node.is_none() {
                            entry.node = Some(target);
                        }
                    }
                    None => self.nodes[parent].transitive_deps.push(TransitiveDep {
                        require: require.clone(),
                        node: Some(target),
                    }),
                }
                queue.push_back(parent);
            }
        }
    }

    /// Walk downstream from the requiring node looking for a loop or an
    /// existing requirement for the same package identity.
    pub(crate) fn check_downstream_exists(&self, from: NodeId, require: &Requirement) -> Downstream {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::from([from]);

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let node = &self.nodes[id];

            if let Some(reference) = &node.reference {
                if reference.same_identity(&require.reference) {
                    return Downstream::Loop(id);
                }
            }

            if let Some(entry) = node.transitive(require) {
                // The requiring node's own un-expanded entry for this
                // very requirement is not a competitor
                let own_pending = id == from
                    && entry.node.is_none()
                    && !entry.require.override_only
                    && !entry.require.force
                    && entry.require.reference == require.reference;
                if !own_pending {
                    return Downstream::Found {
                        require: entry.require.clone(),
                        node: entry.node,
                        owner: id,
                    };
                }
            }

            for &parent in &node.dependants {
                // The walk stays within one context; entries across a
                // host/build switch are not competitors
                if self.nodes[parent].context == node.context {
                    queue.push_back(parent);
                }
            }
        }

        Downstream::Absent
    }

    /// The node that required `target` (the far endpoint of a conflict)
    pub(crate) fn first_dependant_str(&self, target: NodeId) -> String {
        self.nodes[target]
            .dependants
            .first()
            .map(|&id| self.nodes[id].ref_str())
            .unwrap_or_else(|| self.nodes[target].ref_str())
    }

    /// Drop override-only entries from every transitive map; they exist
    /// only to steer version resolution during expansion.
    pub(crate) fn remove_overrides(&mut self) {
        for node in &mut self.nodes {
            node.transitive_deps.retain(|t| !t.require.override_only);
        }
    }

    /// Nodes in one context, in insertion (expansion) order
    pub fn nodes_in_context(&self, context: NodeContext) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.context == context)
    }

    /// Find the unique node for a package name in a context
    pub fn find(&self, name: &str, context: NodeContext) -> Option<&Node> {
        self.nodes.iter().find(|n| {
            n.context == context && n.reference.as_ref().map(|r| r.name.as_str()) == Some(name)
        })
    }

    /// Deterministic serialization: identical inputs produce
    /// byte-identical output.
    pub fn serialize(&self) -> String {
        serde_json::to_string_pretty(self).expect("graph serialization cannot fail")
    }
}
