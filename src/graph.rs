//! Module dependency graph
//!
//! Maps module ids to nodes, maintains forward (`imports`) and reverse
//! (`importers`) edges, and answers the reachability and cycle queries the
//! update planner needs.
//!
//! # Edge maintenance
//!
//! `update_module` is the only entry point that rewires edges. It diffs the
//! new import list against the old one and keeps `importers` consistent on
//! every touched node, so the invariant `b ∈ a.imports ⇔ a ∈ b.importers`
//! holds after every call. A module whose last importer disappears is
//! dropped from the graph unless it is a project entry or still loaded by a
//! connected client.
//!
//! # Cycles
//!
//! Cyclic imports are tolerated in every traversal. Strongly connected
//! components are computed with Tarjan over the forward graph and memoised
//! by graph revision.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{HmrError, Result};
use crate::tracker::{ExportTracker, TrackedExports};
use crate::transform::content_hash;

/// Canonical module identifier: project-relative path with forward slashes.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an id from a path relative to the project root.
    pub fn from_rel_path(path: &Path) -> Self {
        let joined = path
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Hot state a module has declared, as seen by the server.
///
/// `is_accepted` and `is_declined` are mutually exclusive; whichever was
/// set last wins.
#[derive(Debug, Clone, Default)]
pub struct HotState {
    /// Opaque user-controlled value carried across reloads
    pub data: Value,
    /// Number of registered accept callbacks
    pub accept_callbacks: usize,
    /// Number of registered dispose callbacks
    pub dispose_callbacks: usize,
    is_accepted: bool,
    is_declined: bool,
}

impl HotState {
    pub fn accept(&mut self) {
        self.is_accepted = true;
        self.is_declined = false;
    }

    pub fn accept_with_callback(&mut self) {
        self.accept_callbacks += 1;
        self.accept();
    }

    pub fn decline(&mut self) {
        self.is_declined = true;
        self.is_accepted = false;
    }

    /// Reset both declarations, e.g. after a re-transform found neither an
    /// accept nor a decline in the new source.
    pub fn clear_declarations(&mut self) {
        self.is_accepted = false;
        self.is_declined = false;
    }

    pub fn add_dispose_callback(&mut self) {
        self.dispose_callbacks += 1;
    }

    pub fn is_accepted(&self) -> bool {
        self.is_accepted
    }

    pub fn is_declined(&self) -> bool {
        self.is_declined
    }

    /// Whether an update propagating to this module stops here.
    pub fn can_absorb(&self) -> bool {
        self.is_accepted || self.accept_callbacks > 0
    }
}

/// One node per distinct module id seen while the server is alive.
#[derive(Debug, Default)]
pub struct ModuleNode {
    pub id: ModuleId,
    /// FNV-1a hex of the last successfully transformed content
    pub content_hash: Option<String>,
    pub transformed_code: Option<String>,
    /// Resolved static imports
    pub imports: BTreeSet<ModuleId>,
    /// Reverse edges, kept consistent with every other node's `imports`
    pub importers: BTreeSet<ModuleId>,
    /// Tracked view over the exports object; present iff HMR is enabled
    exports: Option<TrackedExports>,
    /// Hot state declared by the module; present iff HMR is enabled
    pub hot: Option<HotState>,
    /// Bumped every time `transformed_code` changes
    pub version: u64,
    /// Recorded parse/resolution error, if the module is a placeholder or
    /// its last transform failed
    pub error: Option<String>,
}

impl ModuleNode {
    fn new(id: ModuleId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// The tracked exports view, if HMR is enabled for this module.
    pub fn exports(&self) -> Option<&TrackedExports> {
        self.exports.as_ref()
    }

    /// Accessor for the set of export names consumed by importers since the
    /// last reset. Absent if HMR is disabled.
    pub fn dependency_tracker(&self) -> Option<ExportTracker> {
        self.exports.as_ref().map(|e| e.tracker())
    }

    pub fn hot_mut(&mut self) -> &mut HotState {
        self.hot.get_or_insert_with(HotState::default)
    }
}

type SccCache = Mutex<Option<(u64, Vec<Vec<ModuleId>>)>>;

/// The module dependency graph.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    nodes: BTreeMap<ModuleId, ModuleNode>,
    /// Project entries; never pruned
    entries: BTreeSet<ModuleId>,
    /// Client load refcounts; loaded modules are never pruned
    loaded: BTreeMap<ModuleId, usize>,
    /// Graph revision; bumped on every mutation, keys the SCC memos
    revision: u64,
    /// Modules dropped since the last `take_pruned`
    pruned: Vec<ModuleId>,
    scc_cache: SccCache,
    cycle_cache: SccCache,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Designate a project entry point.
    pub fn set_entry(&mut self, id: ModuleId) {
        self.ensure_node(id.clone());
        self.entries.insert(id);
    }

    pub fn is_entry(&self, id: &ModuleId) -> bool {
        self.entries.contains(id)
    }

    /// Record that a client instantiated this module. Creates the node on
    /// first load.
    pub fn mark_loaded(&mut self, id: &ModuleId) {
        self.ensure_node(id.clone());
        *self.loaded.entry(id.clone()).or_insert(0) += 1;
    }

    /// Record that a client dropped this module (disconnect or prune ack).
    pub fn mark_unloaded(&mut self, id: &ModuleId) {
        if let Some(count) = self.loaded.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.loaded.remove(id);
            }
        }
    }

    pub fn is_client_loaded(&self, id: &ModuleId) -> bool {
        self.loaded.contains_key(id)
    }

    pub fn get_module(&self, id: &ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(id)
    }

    pub fn get_module_mut(&mut self, id: &ModuleId) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(id)
    }

    /// Direct reverse edges of `id`.
    pub fn dependents(&self, id: &ModuleId) -> BTreeSet<ModuleId> {
        self.nodes
            .get(id)
            .map(|n| n.importers.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.values()
    }

    /// Revision counter keying the memoised cycle analysis.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn ensure_node(&mut self, id: ModuleId) -> &mut ModuleNode {
        self.nodes
            .entry(id.clone())
            .or_insert_with(|| ModuleNode::new(id))
    }

    /// Apply a successful transform to the graph.
    ///
    /// Creates the node on first use, diffs `imports` against the previous
    /// list, keeps reverse edges consistent, and bumps the node version.
    /// Returns `false` without mutating anything when the transformed
    /// content is identical to what the graph already holds.
    pub fn update_module(
        &mut self,
        id: &ModuleId,
        transformed_code: String,
        imports: &[ModuleId],
        hmr_enabled: bool,
    ) -> bool {
        let hash = content_hash(&transformed_code);

        // Self-loops collapse at insertion
        let new_imports: BTreeSet<ModuleId> =
            imports.iter().filter(|m| *m != id).cloned().collect();

        let node = self.ensure_node(id.clone());
        if node.content_hash.as_deref() == Some(hash.as_str()) {
            return false;
        }

        let old_imports = node.imports.clone();

        node.transformed_code = Some(transformed_code);
        node.content_hash = Some(hash);
        node.version += 1;
        node.error = None;
        node.imports = new_imports.clone();
        if hmr_enabled && node.hot.is_none() {
            node.hot = Some(HotState::default());
        }

        // Added edges: unresolved targets become placeholder nodes with
        // empty imports.
        for added in new_imports.difference(&old_imports) {
            let target = self.ensure_node(added.clone());
            target.importers.insert(id.clone());
        }

        // Removed edges: targets that just lost their last importer are
        // dropped, cascading through their own imports.
        let orphan_candidates: Vec<ModuleId> = old_imports
            .difference(&new_imports)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|removed| {
                let target = self.nodes.get_mut(&removed)?;
                target.importers.remove(id);
                target.importers.is_empty().then_some(removed)
            })
            .collect();
        for candidate in orphan_candidates {
            self.drop_if_unreferenced(&candidate);
        }

        self.touch();

        if let Err(e) = self.check_invariants() {
            debug_assert!(false, "{e}");
            tracing::error!("{e}");
        }

        true
    }

    /// Populate the tracked exports view for an HMR-enabled module.
    pub fn set_exports(&mut self, id: &ModuleId, names: &[String]) {
        if let Some(node) = self.nodes.get_mut(id) {
            let mut raw = serde_json::Map::new();
            for name in names {
                raw.insert(name.clone(), Value::Null);
            }
            node.exports = Some(TrackedExports::new(raw));
        }
    }

    /// Retain the previous node state but record a transform failure, so
    /// that fixing the syntax restores the previous graph without a reload.
    pub fn record_error(&mut self, id: &ModuleId, message: impl Into<String>) {
        let node = self.ensure_node(id.clone());
        node.error = Some(message.into());
    }

    /// Drop `id` if nothing references it: no importers, not an entry, not
    /// loaded by any client. Cascades through the dropped module's imports.
    fn drop_if_unreferenced(&mut self, id: &ModuleId) {
        let removable = match self.nodes.get(id) {
            Some(node) => {
                node.importers.is_empty()
                    && !self.entries.contains(id)
                    && !self.loaded.contains_key(id)
            }
            None => false,
        };
        if !removable {
            return;
        }

        let node = self.nodes.remove(id).expect("checked above");
        self.pruned.push(id.clone());
        for import in &node.imports {
            if let Some(target) = self.nodes.get_mut(import) {
                target.importers.remove(id);
                if target.importers.is_empty() {
                    let import = import.clone();
                    self.drop_if_unreferenced(&import);
                }
            }
        }
    }

    /// Modules dropped since the last call. Consumed by the planner.
    pub fn take_pruned(&mut self) -> Vec<ModuleId> {
        std::mem::take(&mut self.pruned)
    }

    fn touch(&mut self) {
        self.revision += 1;
        *self.scc_cache.lock() = None;
        *self.cycle_cache.lock() = None;
    }

    /// Reverse-reachability walk from `id` through `importers`, emitted in
    /// topological order: the changed module first, furthest importer last.
    /// Ties at the same rank break lexicographically. Cycles are tolerated;
    /// each reachable module appears exactly once.
    pub fn get_update_chain(&self, id: &ModuleId) -> Vec<ModuleId> {
        if !self.nodes.contains_key(id) {
            return Vec::new();
        }

        // Collect everything reachable through reverse edges
        let mut reachable = BTreeSet::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if !reachable.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for importer in &node.importers {
                    if !reachable.contains(importer) {
                        stack.push(importer.clone());
                    }
                }
            }
        }

        self.topo_order(&reachable)
    }

    /// Kahn's algorithm restricted to `set`, dependencies before dependents,
    /// smallest id first among ready nodes. When a cycle leaves no ready
    /// node, the smallest remaining id is forced out so the walk terminates
    /// with every member placed exactly once.
    pub(crate) fn topo_order(&self, set: &BTreeSet<ModuleId>) -> Vec<ModuleId> {
        let mut in_degree: BTreeMap<&ModuleId, usize> = BTreeMap::new();
        for id in set {
            let degree = self
                .nodes
                .get(id)
                .map(|n| n.imports.iter().filter(|i| set.contains(*i)).count())
                .unwrap_or(0);
            in_degree.insert(id, degree);
        }

        let mut ready: BTreeSet<&ModuleId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut remaining: BTreeSet<&ModuleId> = set.iter().collect();
        let mut chain = Vec::with_capacity(set.len());

        while !remaining.is_empty() {
            let next = match ready.iter().next().copied() {
                Some(id) => id,
                // Cycle: force the smallest remaining id
                None => *remaining.iter().next().expect("remaining is non-empty"),
            };
            ready.remove(next);
            remaining.remove(next);
            chain.push(next.clone());

            if let Some(node) = self.nodes.get(next) {
                for importer in &node.importers {
                    if !remaining.contains(importer) {
                        continue;
                    }
                    let now_ready = match in_degree.get_mut(importer) {
                        Some(degree) => {
                            *degree = degree.saturating_sub(1);
                            *degree == 0
                        }
                        None => false,
                    };
                    if now_ready {
                        if let Some((key, _)) = in_degree.get_key_value(importer) {
                            ready.insert(*key);
                        }
                    }
                }
            }
        }

        chain
    }

    /// Strongly connected components of the forward graph, Tarjan's
    /// algorithm. Only components of size ≥ 2 are returned (self-loops are
    /// collapsed at insertion, so cyclic singletons cannot occur). Memoised
    /// by graph revision.
    pub fn strongly_connected_components(&self) -> Vec<Vec<ModuleId>> {
        if let Some((revision, cached)) = self.scc_cache.lock().as_ref() {
            if *revision == self.revision {
                return cached.clone();
            }
        }
        let sccs = self.compute_sccs();
        *self.scc_cache.lock() = Some((self.revision, sccs.clone()));
        sccs
    }

    /// Same as [`strongly_connected_components`], memoised separately for
    /// callers that only want cycle reports.
    pub fn circular_dependencies(&self) -> Vec<Vec<ModuleId>> {
        if let Some((revision, cached)) = self.cycle_cache.lock().as_ref() {
            if *revision == self.revision {
                return cached.clone();
            }
        }
        let cycles = self.compute_sccs();
        *self.cycle_cache.lock() = Some((self.revision, cycles.clone()));
        cycles
    }

    fn compute_sccs(&self) -> Vec<Vec<ModuleId>> {
        let ids: Vec<&ModuleId> = self.nodes.keys().collect();
        let index_of: BTreeMap<&ModuleId, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let adjacency: Vec<Vec<usize>> = ids
            .iter()
            .map(|id| {
                self.nodes[*id]
                    .imports
                    .iter()
                    .filter_map(|import| index_of.get(import).copied())
                    .collect()
            })
            .collect();

        let mut tarjan = Tarjan::new(ids.len(), &adjacency);
        for v in 0..ids.len() {
            if tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }

        let mut components: Vec<Vec<ModuleId>> = tarjan
            .components
            .into_iter()
            .filter(|c| c.len() >= 2)
            .map(|c| {
                let mut members: Vec<ModuleId> =
                    c.into_iter().map(|v| ids[v].clone()).collect();
                members.sort();
                members
            })
            .collect();
        components.sort();
        components
    }

    /// Verify I1: for every pair `(a, b)`, `b ∈ a.imports ⇔ a ∈ b.importers`.
    pub fn check_invariants(&self) -> Result<()> {
        for (id, node) in &self.nodes {
            for import in &node.imports {
                let target = self.nodes.get(import).ok_or_else(|| {
                    HmrError::InvariantViolation {
                        message: format!("{id} imports {import}, which is not in the graph"),
                    }
                })?;
                if !target.importers.contains(id) {
                    return Err(HmrError::InvariantViolation {
                        message: format!("{id} imports {import}, but has no reverse edge"),
                    });
                }
            }
            for importer in &node.importers {
                let source = self.nodes.get(importer).ok_or_else(|| {
                    HmrError::InvariantViolation {
                        message: format!("{id} lists absent importer {importer}"),
                    }
                })?;
                if !source.imports.contains(id) {
                    return Err(HmrError::InvariantViolation {
                        message: format!("{id} lists importer {importer} with no forward edge"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Tarjan state over the index-mapped forward graph.
struct Tarjan<'a> {
    adjacency: &'a [Vec<usize>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    counter: usize,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn new(n: usize, adjacency: &'a [Vec<usize>]) -> Self {
        Self {
            adjacency,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            counter: 0,
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.counter);
        self.lowlink[v] = self.counter;
        self.counter += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for i in 0..self.adjacency[v].len() {
            let w = self.adjacency[v][i];
            if self.index[w].is_none() {
                self.visit(w);
                self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
            } else if self.on_stack[w] {
                self.lowlink[v] = self.lowlink[v].min(self.index[w].expect("visited"));
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            loop {
                let w = self.stack.pop().expect("stack holds the component");
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
