// src/graph/builder.rs

//! Breadth-first expansion of the dependency graph
//!
//! The builder seeds a FIFO with the root's requirements and expands
//! them in order, so diagnostics always reference the shallowest
//! offending edge. Each popped requirement either closes a diamond onto
//! an existing node (after conflict analysis), or resolves, fetches and
//! loads a new recipe node whose own requirements join the queue.
//!
//! Conflicts abort the build. Unsatisfiable requirements are recorded
//! on the graph and expansion continues on independent branches, so one
//! run reports every missing reference before failing.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::graph::resolver::VersionResolver;
use crate::graph::{
    DepsGraph, Downstream, MissingRequire, Node, NodeContext, NodeId, RecipeStatus, Requirement,
    Settings, TransitiveDep,
};
use crate::hash;
use crate::profile::Profile;
use crate::recipe::{DeclaredRecipe, Recipe};
use crate::reference::RecipeReference;
use crate::remote::proxy::RemoteProxy;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Flags steering one graph build
#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    /// Consult remotes for newer revisions without changing the cache
    pub check_updates: bool,
    /// Replace cached recipes when a remote has newer content
    pub update: bool,
    /// Restrict remote operations to one named remote
    pub selected_remote: Option<String>,
}

/// What the graph grows from
pub enum RootSpec {
    /// A consumer recipe file on disk
    Path(PathBuf),
    /// A synthetic root carrying command-line requirements
    Virtual(Vec<Requirement>),
}

/// Expands a root requirement set into a fully pinned dependency graph
pub struct GraphBuilder<'c> {
    ctx: &'c Context,
    options: GraphOptions,
    resolver: VersionResolver<'c>,
}

impl<'c> GraphBuilder<'c> {
    pub fn new(ctx: &'c Context, options: GraphOptions) -> Self {
        let resolver = VersionResolver::new(&ctx.cache, &ctx.sources);
        Self {
            ctx,
            options,
            resolver,
        }
    }

    /// Build the graph. Conflicts and unsatisfiable requirements fail
    /// the build; report-only statuses (`Updateable`, `Newer`) do not.
    pub fn load_graph(&mut self, root: RootSpec) -> Result<DepsGraph> {
        let mut graph = DepsGraph::new();
        let mut fifo: VecDeque<(Requirement, NodeId)> = VecDeque::new();

        let root_id = self.create_root(&mut graph, root, &mut fifo)?;
        debug!("root node {} created", graph.nodes[root_id].ref_str());

        while let Some((require, from)) = fifo.pop_front() {
            if require.override_only {
                continue;
            }
            match self.expand_require(&mut graph, require.clone(), from, &mut fifo) {
                Ok(()) => {}
                Err(e) if is_conflict(&e) => return Err(e),
                Err(e) if is_resolution_failure(&e) => {
                    let owner = graph.nodes[from].ref_str();
                    warn!("cannot satisfy '{}' required by '{}': {}", require, owner, e);
                    graph.missing.push(MissingRequire {
                        require: require.to_string(),
                        owner,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        graph.remove_overrides();
        check_provides(&graph)?;
        compute_package_ids(&mut graph);

        if let Some(first) = graph.missing.first() {
            let extra = graph.missing.len() - 1;
            let suffix = if extra > 0 {
                format!(" (and {} more unresolved requirements)", extra)
            } else {
                String::new()
            };
            return Err(Error::NotFound(format!(
                "{} (required by '{}'){}",
                first.message, first.owner, suffix
            )));
        }

        self.ctx
            .progress
            .finish_with_message(&format!("{} nodes resolved", graph.nodes.len()));
        info!(
            "graph complete: {} nodes, {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(graph)
    }

    fn create_root(
        &mut self,
        graph: &mut DepsGraph,
        root: RootSpec,
        fifo: &mut VecDeque<(Requirement, NodeId)>,
    ) -> Result<NodeId> {
        let (mut recipe, status): (Box<dyn Recipe>, RecipeStatus) = match root {
            RootSpec::Path(path) => (self.ctx.loader.load(&path)?, RecipeStatus::Consumer),
            RootSpec::Virtual(requires) => (
                Box::new(DeclaredRecipe::virtual_root(requires)),
                RecipeStatus::Virtual,
            ),
        };

        let reference = match (recipe.name(), recipe.version()) {
            (Some(name), Some(version)) => {
                Some(RecipeReference::new(name, version.clone()))
            }
            _ => None,
        };

        let settings = filter_settings(&self.ctx.profile_host.settings, recipe.settings());
        let mut options = recipe.default_options();
        if let Some(r) = &reference {
            for (key, value) in self.ctx.profile_host.options_for(&r.name) {
                options.insert(key, value);
            }
        }
        recipe.configure(&settings, &mut options)?;

        let node = Node {
            id: 0,
            reference: reference.clone(),
            context: NodeContext::Host,
            status,
            remote: None,
            settings,
            settings_build: self.ctx.profile_build.settings.clone(),
            options,
            provides: recipe.provides(),
            package_id: None,
            transitive_deps: Vec::new(),
            dependants: Vec::new(),
        };
        let root_id = graph.add_node(node);

        let ref_str = reference.as_ref().map(|r| r.base_str()).unwrap_or_default();
        let requires = self.node_requires(
            recipe.as_ref(),
            &ref_str,
            reference.as_ref().map(|r| r.name.as_str()),
            status == RecipeStatus::Consumer,
            NodeContext::Host,
        )?;
        for require in requires {
            graph.nodes[root_id].transitive_deps.push(TransitiveDep {
                require: require.clone(),
                node: None,
            });
            fifo.push_back((require, root_id));
        }
        Ok(root_id)
    }

    /// A node's full requirement list: declared host and build
    /// requirements, plus profile-injected tools. Profile injections
    /// override a declared requirement for the same tool and never
    /// introduce a self-loop.
    fn node_requires(
        &self,
        recipe: &dyn Recipe,
        ref_str: &str,
        name: Option<&str>,
        is_consumer: bool,
        context: NodeContext,
    ) -> Result<Vec<Requirement>> {
        let mut requires = recipe.requirements()?;
        requires.extend(recipe.build_requirements()?);

        let profile = self.profile_for(context);
        for tool in profile.matching_build_requires(ref_str, is_consumer) {
            if Some(tool.name.as_str()) == name {
                debug!("dropping self build-require {} on {}", tool, ref_str);
                continue;
            }
            let injected = Requirement::build_require(tool);
            match requires.iter_mut().find(|r| r.same_target(&injected)) {
                Some(declared) => declared.reference = injected.reference,
                None => requires.push(injected),
            }
        }
        Ok(requires)
    }

    fn profile_for(&self, context: NodeContext) -> &'c Profile {
        match context {
            NodeContext::Host => &self.ctx.profile_host,
            NodeContext::Build => &self.ctx.profile_build,
        }
    }

    /// Handle one requirement: close a diamond onto an existing node or
    /// create a new one.
    fn expand_require(
        &mut self,
        graph: &mut DepsGraph,
        mut require: Requirement,
        from: NodeId,
        fifo: &mut VecDeque<(Requirement, NodeId)>,
    ) -> Result<()> {
        match graph.check_downstream_exists(from, &require) {
            Downstream::Loop(ancestor) => {
                let ancestor_str = graph.nodes[ancestor].ref_str();
                Err(Error::VersionConflict {
                    require: require.reference.base_str(),
                    node: graph.nodes[from].ref_str(),
                    existing: format!("dependency loop: '{}' is an ancestor", ancestor_str),
                    prev_node: ancestor_str,
                })
            }
            Downstream::Found {
                require: prev_require,
                node: prev_node,
                owner,
            } => {
                if prev_require.force || prev_require.override_only {
                    // Downstream wins: rewrite the incoming reference
                    let winner = prev_node
                        .and_then(|id| graph.nodes[id].reference.clone())
                        .unwrap_or_else(|| prev_require.reference.clone());
                    debug!(
                        "requirement '{}' overridden downstream to '{}'",
                        require.reference, winner
                    );
                    require.reference = winner;
                } else {
                    conflicting_version(graph, &mut require, from, &prev_require, prev_node, owner)?;
                    if let Some(prev_id) = prev_node {
                        conflicting_options(graph, &require, from, prev_id)?;
                    }
                }

                match prev_node {
                    Some(prev_id) => {
                        // Close the diamond
                        graph.add_edge(from, prev_id, require.clone());
                        graph.propagate_downstream(from, &require, prev_id);
                        Ok(())
                    }
                    None => self.create_node(graph, require, from, fifo),
                }
            }
            Downstream::Absent => self.create_node(graph, require, from, fifo),
        }
    }

    fn create_node(
        &mut self,
        graph: &mut DepsGraph,
        mut require: Requirement,
        from: NodeId,
        fifo: &mut VecDeque<(Requirement, NodeId)>,
    ) -> Result<()> {
        // Build requirements switch into the build context and stay there
        let context = if require.build {
            NodeContext::Build
        } else {
            graph.nodes[from].context
        };

        let resolved = self.resolver.resolve(&require.reference, self.options.update)?;
        let proxy = RemoteProxy::new(&self.ctx.cache, &self.ctx.sources);
        let result = proxy.get_recipe(
            &resolved,
            self.options.check_updates,
            self.options.update,
            self.options.selected_remote.as_deref(),
        )?;

        let mut recipe = self.ctx.loader.load(&result.recipe_path)?;
        let pinned = result.reference.clone();

        let profile = self.profile_for(context);
        let settings = filter_settings(&profile.settings, recipe.settings());
        let mut options = recipe.default_options();
        for (key, value) in profile.options_for(&pinned.name) {
            options.insert(key, value);
        }
        for (key, value) in &require.options {
            options.insert(key.clone(), value.clone());
        }
        recipe.configure(&settings, &mut options)?;

        require.reference = pinned.clone();
        let node = Node {
            id: 0,
            reference: Some(pinned.clone()),
            context,
            status: result.status,
            remote: result.remote,
            settings,
            settings_build: self.ctx.profile_build.settings.clone(),
            options,
            provides: recipe.provides(),
            package_id: None,
            transitive_deps: Vec::new(),
            dependants: Vec::new(),
        };
        let id = graph.add_node(node);
        graph.add_edge(from, id, require.clone());
        graph.propagate_downstream(from, &require, id);
        self.ctx
            .progress
            .set_message(&format!("{} ({})", pinned, result.status));
        self.ctx.progress.increment(1);
        debug!(
            "new node {} [{}] ({})",
            pinned,
            context,
            result.status
        );

        let child_requires = self.node_requires(
            recipe.as_ref(),
            &pinned.base_str(),
            Some(&pinned.name),
            false,
            context,
        )?;
        for child in child_requires {
            graph.nodes[id].transitive_deps.push(TransitiveDep {
                require: child.clone(),
                node: None,
            });
            fifo.push_back((child, id));
        }
        Ok(())
    }
}

/// The version reconciliation rules for a closing diamond
fn conflicting_version(
    graph: &DepsGraph,
    require: &mut Requirement,
    from: NodeId,
    prev_require: &Requirement,
    prev_node: Option<NodeId>,
    owner: NodeId,
) -> Result<()> {
    let prev_ref = prev_node
        .and_then(|id| graph.nodes[id].reference.clone())
        .unwrap_or_else(|| prev_require.reference.clone());

    let conflict = || Error::VersionConflict {
        require: require.reference.base_str(),
        node: graph.nodes[from].ref_str(),
        existing: prev_ref.base_str(),
        prev_node: prev_node
            .map(|id| graph.first_dependant_str(id))
            .unwrap_or_else(|| graph.nodes[owner].ref_str()),
    };

    if let Some(range) = require.reference.version.as_range() {
        let prev_unresolved_range = prev_node.is_none() && prev_ref.version.is_range();
        if prev_unresolved_range {
            // Both still ranges: expand this one as if it were fixed;
            // memoized resolution keeps the two consistent
        } else if range.satisfies(&prev_ref.version) {
            require.reference = prev_ref;
        } else {
            return Err(conflict());
        }
    } else if prev_node.is_none() && prev_ref.version.is_range() {
        let prev_range = prev_ref.version.as_range().expect("checked above");
        if !prev_range.satisfies(&require.reference.version) {
            return Err(conflict());
        }
    } else {
        // Both concrete: only an unspecified revision may differ
        let incoming = &require.reference;
        let base_conflict = incoming.version != prev_ref.version
            || incoming.user != prev_ref.user
            || incoming.channel != prev_ref.channel;
        let revision_conflict = incoming.revision.is_some()
            && prev_ref.revision.is_some()
            && incoming.revision != prev_ref.revision;
        if base_conflict || revision_conflict {
            return Err(conflict());
        }
        if incoming.revision.is_none() {
            require.reference = prev_ref;
        }
    }
    Ok(())
}

/// Even when versions reconcile, explicitly requested option values must
/// agree with what the existing node was configured with.
fn conflicting_options(
    graph: &DepsGraph,
    require: &Requirement,
    from: NodeId,
    prev_id: NodeId,
) -> Result<()> {
    for (option, value) in &require.options {
        if let Some(prev_value) = graph.nodes[prev_id].options.get(option) {
            if prev_value != value {
                return Err(Error::OptionConflict {
                    option: option.clone(),
                    value: value.clone(),
                    prev_value: prev_value.clone(),
                    node: graph.nodes[from].ref_str(),
                    prev_node: graph.nodes[prev_id].ref_str(),
                });
            }
        }
    }
    Ok(())
}

/// No two packages in one context may claim the same provides
/// identifier (a package implicitly provides its own name).
fn check_provides(graph: &DepsGraph) -> Result<()> {
    let mut claims: HashMap<(NodeContext, String), NodeId> = HashMap::new();

    for node in &graph.nodes {
        let Some(reference) = &node.reference else {
            continue;
        };
        let mut identifiers = vec![reference.name.clone()];
        identifiers.extend(node.provides.iter().cloned());

        for identifier in identifiers {
            match claims.get(&(node.context, identifier.clone())) {
                Some(&other) if other != node.id => {
                    return Err(Error::ProvidesConflict {
                        provider: identifier,
                        node: node.ref_str(),
                        prev_node: graph.nodes[other].ref_str(),
                    });
                }
                _ => {
                    claims.insert((node.context, identifier), node.id);
                }
            }
        }
    }
    Ok(())
}

/// Package identity: SHA-1 over settings, options and the pinned
/// references of direct host-context dependencies. Build-context edges
/// never contribute to a consumer's package id.
fn compute_package_ids(graph: &mut DepsGraph) {
    for id in 0..graph.nodes.len() {
        if graph.nodes[id].reference.is_none() {
            continue;
        }

        let mut dep_refs: Vec<String> = graph
            .edges
            .iter()
            .filter(|e| e.from == id && !e.require.build)
            .filter_map(|e| graph.nodes[e.to].reference.as_ref().map(|r| r.full_str()))
            .collect();
        dep_refs.sort();
        dep_refs.dedup();

        let node = &graph.nodes[id];
        let mut text = String::new();
        for (key, value) in &node.settings {
            text.push_str(&format!("[settings] {}={}\n", key, value));
        }
        for (key, value) in &node.options {
            text.push_str(&format!("[options] {}={}\n", key, value));
        }
        for dep in &dep_refs {
            text.push_str(&format!("[requires] {}\n", dep));
        }

        graph.nodes[id].package_id = Some(hash::sha1(text.as_bytes()));
    }
}

fn filter_settings(profile_settings: &Settings, recipe_settings: &[String]) -> Settings {
    if recipe_settings.is_empty() {
        return profile_settings.clone();
    }
    profile_settings
        .iter()
        .filter(|(key, _)| recipe_settings.contains(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn is_conflict(error: &Error) -> bool {
    matches!(
        error,
        Error::VersionConflict { .. } | Error::OptionConflict { .. } | Error::ProvidesConflict { .. }
    )
}

fn is_resolution_failure(error: &Error) -> bool {
    matches!(
        error,
        Error::NotFound(_)
            | Error::Transport(_)
            | Error::AuthRequired(_)
            | Error::Forbidden(_)
            | Error::Truncated { .. }
            | Error::ChecksumMismatch { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_settings() {
        let mut profile = Settings::new();
        profile.insert("os".into(), "Linux".into());
        profile.insert("arch".into(), "x86_64".into());
        profile.insert("build_type".into(), "Release".into());

        let filtered = filter_settings(&profile, &["os".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("os"));

        let all = filter_settings(&profile, &[]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_error_classification() {
        assert!(is_conflict(&Error::OptionConflict {
            option: "shared".into(),
            value: "True".into(),
            prev_value: "False".into(),
            node: "a".into(),
            prev_node: "b".into(),
        }));
        assert!(!is_conflict(&Error::NotFound("x".into())));
        assert!(is_resolution_failure(&Error::NotFound("x".into())));
        assert!(!is_resolution_failure(&Error::RecipeError("x".into())));
    }
}
