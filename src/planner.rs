//! Update planning
//!
//! Given a changed module, walks the reverse edges of the graph and decides
//! what to push: an ordered chain of modules to refresh, the accept
//! boundaries that absorbed the update, whether the page must fully reload,
//! and which modules fell out of the graph.
//!
//! Propagation stops at the nearest module willing to accept the update.
//! A declined module, or a propagation path that runs off the top of the
//! graph without meeting an accepting module, forces a full reload instead
//! of leaving stale state behind.

use std::collections::BTreeSet;

use crate::graph::{ModuleGraph, ModuleId};

/// Result of planning one change event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Modules to refresh, leaves-first: the changed module before its
    /// transitive importers. Empty when the change was a no-op.
    pub chain: Vec<ModuleId>,
    /// Modules at which propagation stopped because they accept updates
    pub boundary: BTreeSet<ModuleId>,
    /// True iff propagation reached a declined module or a module with no
    /// accepting ancestor
    pub requires_full_reload: bool,
    /// Modules no longer reachable from any entry point or client
    pub pruned_modules: BTreeSet<ModuleId>,
}

impl UpdatePlan {
    pub fn is_noop(&self) -> bool {
        self.chain.is_empty() && self.pruned_modules.is_empty()
    }
}

/// Stateless planner over a [`ModuleGraph`].
#[derive(Debug, Default)]
pub struct UpdatePlanner;

impl UpdatePlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan the push for a change to `changed`.
    ///
    /// Consumes the graph's pending prune list, so call once per applied
    /// `update_module`.
    pub fn plan(&self, graph: &mut ModuleGraph, changed: &ModuleId) -> UpdatePlan {
        let pruned_modules: BTreeSet<ModuleId> = graph.take_pruned().into_iter().collect();

        if graph.get_module(changed).is_none() {
            return UpdatePlan {
                pruned_modules,
                ..Default::default()
            };
        }

        let mut included = BTreeSet::new();
        let mut boundary = BTreeSet::new();
        let mut requires_full_reload = false;

        let mut visited = BTreeSet::new();
        let mut stack = vec![changed.clone()];
        'walk: while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let node = match graph.get_module(&current) {
                Some(node) => node,
                None => continue,
            };
            included.insert(current.clone());

            if let Some(hot) = node.hot.as_ref() {
                if hot.is_declined() {
                    requires_full_reload = true;
                    break 'walk;
                }
                if hot.can_absorb() {
                    boundary.insert(current);
                    continue;
                }
            }

            if node.importers.is_empty() {
                // Ran off the top of the graph without an accepting ancestor
                requires_full_reload = true;
                continue;
            }
            for importer in &node.importers {
                if !visited.contains(importer) {
                    stack.push(importer.clone());
                }
            }
        }

        // Under a full reload every transitive importer refreshes anyway,
        // so the chain covers the whole reverse closure.
        let chain = if requires_full_reload {
            graph.get_update_chain(changed)
        } else {
            graph.topo_order(&included)
        };

        UpdatePlan {
            chain,
            boundary,
            requires_full_reload,
            pruned_modules,
        }
    }
}
