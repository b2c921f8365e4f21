//! Module dependency resolution
//!
//! Builds the activation order of a requested module set. Expansion is a
//! depth-first walk from each requested name: hard dependencies first, then
//! optional dependencies that are themselves requested, then the module.
//! Built-in modules always come first.
//!
//! Every graph owns a node table keyed by module name, so asking for the same
//! module twice during one resolution yields the same node.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use tracing::debug;

use crate::module::registry::discovery::ModuleRegistry;
use crate::module::registry::manifest::ModuleDescriptor;
use crate::module::state::{ALL_MODULES, TESTS_MODULE};
use crate::module::traits::ResolutionError;

/// Index of a node inside its graph
pub type NodeId = usize;

/// One module inside a resolved graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub descriptor: ModuleDescriptor,
    /// Longest dependency path from any root
    pub depth: usize,
    /// Direct dependents, sorted by name
    pub children: Vec<NodeId>,
}

impl GraphNode {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Resolved, acyclic module graph with its activation order
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, NodeId>,
    order: Vec<NodeId>,
}

impl DependencyGraph {
    fn new() -> Self {
        Self::default()
    }

    /// Node for `descriptor.name`, creating it on first request
    fn node(&mut self, descriptor: &ModuleDescriptor) -> NodeId {
        if let Some(&id) = self.index.get(&descriptor.name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            descriptor: descriptor.clone(),
            depth: 0,
            children: Vec::new(),
        });
        self.index.insert(descriptor.name.clone(), id);
        id
    }

    /// Record `dependency -> dependent` and restore the depth invariant
    fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if !self.nodes[dependency].children.contains(&dependent) {
            self.nodes[dependency].children.push(dependent);
            let nodes = &self.nodes;
            let mut children = nodes[dependency].children.clone();
            children.sort_by(|a, b| nodes[*a].name().cmp(nodes[*b].name()));
            self.nodes[dependency].children = children;
        }

        // Work-list: raise depths until every edge satisfies
        // depth(child) >= depth(parent) + 1. Terminates because the graph
        // is acyclic.
        let mut queue = VecDeque::from([(dependency, dependent)]);
        while let Some((parent, child)) = queue.pop_front() {
            let required = self.nodes[parent].depth + 1;
            if self.nodes[child].depth < required {
                self.nodes[child].depth = required;
                for &grandchild in &self.nodes[child].children {
                    queue.push_back((child, grandchild));
                }
            }
        }
    }

    /// Descriptors in activation order
    pub fn ordered(&self) -> impl Iterator<Item = &ModuleDescriptor> + '_ {
        self.order.iter().map(move |&id| &self.nodes[id].descriptor)
    }

    /// Module names in activation order
    pub fn names(&self) -> Vec<String> {
        self.ordered().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|&id| &self.nodes[id])
    }

    pub fn depth(&self, name: &str) -> Option<usize> {
        self.get(name).map(|node| node.depth)
    }

    /// Direct dependents of `name`, sorted by name
    pub fn children_of(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|node| {
                node.children
                    .iter()
                    .map(|&id| self.nodes[id].descriptor.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transitive dependents of `name`, each once, in activation order
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = self.nodes[start].children.clone();
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.nodes[id].children.iter().copied());
            }
        }
        self.order
            .iter()
            .filter(|id| seen.contains(*id))
            .map(|&id| self.nodes[id].descriptor.name.clone())
            .collect()
    }

    /// Transitive dependencies of `name` inside this graph, in activation order
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            for (parent, node) in self.nodes.iter().enumerate() {
                if node.children.contains(&id) && seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        self.order
            .iter()
            .filter(|id| seen.contains(*id))
            .map(|&id| self.nodes[id].descriptor.name.clone())
            .collect()
    }

    /// Whether `descendant` depends on `name`, directly or not
    pub fn has_child(&self, name: &str, descendant: &str) -> bool {
        self.dependents_of(name).iter().any(|d| d == descendant)
    }

    /// Modules grouped by depth, shallowest first; names sorted per level
    pub fn levels(&self) -> Vec<Vec<String>> {
        let max_depth = self.nodes.iter().map(|n| n.depth).max();
        let Some(max_depth) = max_depth else {
            return Vec::new();
        };
        let mut levels = vec![Vec::new(); max_depth + 1];
        for node in &self.nodes {
            levels[node.depth].push(node.descriptor.name.clone());
        }
        for level in &mut levels {
            level.sort();
        }
        levels.retain(|level| !level.is_empty());
        levels
    }

    /// Indented tree rendering of the graph from its roots
    pub fn pprint(&self) -> String {
        let mut out = String::new();
        for &id in &self.order {
            if self.nodes[id].depth == 0 {
                self.pprint_node(id, 0, &mut out);
            }
        }
        out
    }

    fn pprint_node(&self, id: NodeId, indent: usize, out: &mut String) {
        let _ = writeln!(out, "{}", self.nodes[id].name());
        for &child in &self.nodes[id].children {
            let _ = write!(out, "{}`-> ", "    ".repeat(indent));
            self.pprint_node(child, indent + 1, out);
        }
    }
}

/// Dependency resolver
pub struct ModuleDependencies;

impl ModuleDependencies {
    /// Resolve `requested` over `registry` into an activation order.
    ///
    /// The sentinel `all` is ignored here; callers expand it beforehand.
    pub fn build_order(
        requested: &BTreeSet<String>,
        registry: &ModuleRegistry,
    ) -> Result<DependencyGraph, ResolutionError> {
        let mut resolver = Resolver {
            registry,
            requested,
            graph: DependencyGraph::new(),
            on_path: Vec::new(),
            done: BTreeSet::new(),
            builtins: registry.builtin_names(),
        };

        for builtin in registry.builtin_names() {
            resolver.visit(&builtin)?;
        }
        for name in requested {
            if name == ALL_MODULES {
                continue;
            }
            resolver.visit(name)?;
        }

        let graph = resolver.graph;
        debug!("Dependency resolution complete: {:?}", graph.names());
        Ok(graph)
    }

    /// Every catalogued module (minus `tests`) as a requested set
    pub fn expand_all(registry: &ModuleRegistry) -> BTreeSet<String> {
        registry
            .names()
            .into_iter()
            .filter(|name| name != TESTS_MODULE)
            .collect()
    }
}

struct Resolver<'a> {
    registry: &'a ModuleRegistry,
    requested: &'a BTreeSet<String>,
    graph: DependencyGraph,
    /// Modules on the current expansion path, outermost first
    on_path: Vec<String>,
    done: BTreeSet<String>,
    builtins: Vec<String>,
}

impl Resolver<'_> {
    fn visit(&mut self, name: &str) -> Result<NodeId, ResolutionError> {
        let descriptor = self.registry.descriptor(name)?;
        if self.done.contains(name) {
            return Ok(self.graph.node(descriptor));
        }
        if self.on_path.iter().any(|n| n == name) {
            return Err(ResolutionError::CircularDependency(name.to_string()));
        }
        self.on_path.push(name.to_string());

        let node = self.graph.node(descriptor);

        let mut deps: Vec<&String> = descriptor.depends.iter().collect();
        deps.extend(
            descriptor
                .optional_depends
                .iter()
                .filter(|dep| self.requested.contains(*dep) && !descriptor.depends.contains(*dep)),
        );

        for dep in deps {
            let dep_node = match self.visit(dep) {
                Ok(id) => id,
                Err(ResolutionError::ModuleNotFound(missing)) if missing == *dep => {
                    return Err(ResolutionError::MissingDependency {
                        module: name.to_string(),
                        missing,
                    });
                }
                Err(e) => return Err(e),
            };
            self.graph.add_edge(dep_node, node);
        }

        // Every module implicitly depends on the built-ins already resolved,
        // unless the built-in itself needs this module.
        if !self.builtins.iter().any(|b| b == name) {
            for builtin in &self.builtins {
                if !self.done.contains(builtin) || self.graph.has_child(name, builtin) {
                    continue;
                }
                if let Some(&builtin_node) = self.graph.index.get(builtin) {
                    self.graph.add_edge(builtin_node, node);
                }
            }
        }

        self.on_path.pop();
        self.done.insert(name.to_string());
        if !self.graph.order.contains(&node) {
            self.graph.order.push(node);
        }
        Ok(node)
    }
}
