//! Discovery of the component reference graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ocm_desc::{ComponentDescriptor, Identity};
use petgraph::algo::has_path_connecting;
use petgraph::graph::DiGraph;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::constructor::Constructor;
use crate::provider::ExternalComponentProvider;
use crate::{Error, Result};

/// Origin of a discovered graph node.
#[derive(Debug)]
#[non_exhaustive]
pub enum NodeKind {
    /// Declared in the constructor; holds the component's index there.
    Constructor(usize),
    /// Resolved through the external component provider.
    External(Box<ComponentDescriptor>),
}

/// The discovered DAG of constructor and external component versions.
///
/// Edges point from a referrer to the component versions it references;
/// edges that would close a cycle are refused during construction.
#[derive(Debug, Default)]
pub struct ComponentGraph {
    kinds: HashMap<Identity, NodeKind>,
    children: HashMap<Identity, Vec<Identity>>,
    parents: HashMap<Identity, Vec<Identity>>,
}

impl ComponentGraph {
    /// Discovers the graph rooted at the constructor's components.
    ///
    /// Traversal is breadth-first with at most `concurrency` external
    /// lookups in flight; nodes are memoized by identity, and a reference
    /// to an identity known neither to the constructor nor to the external
    /// provider fails discovery.
    pub async fn discover(
        constructor: &Constructor,
        external: &Arc<dyn ExternalComponentProvider>,
        concurrency: usize,
    ) -> Result<Self> {
        let by_identity: HashMap<Identity, usize> = constructor
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.identity(), i))
            .collect();

        let mut kinds = HashMap::new();
        let mut children: HashMap<Identity, Vec<Identity>> = HashMap::new();
        let mut seen: HashSet<Identity> = by_identity.keys().cloned().collect();
        let mut pending: VecDeque<Identity> = by_identity.keys().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        while !pending.is_empty() {
            let wave: Vec<Identity> = pending.drain(..).collect();
            let mut tasks: JoinSet<Result<(Identity, NodeKind, Vec<Identity>)>> = JoinSet::new();

            for identity in wave {
                if let Some(&index) = by_identity.get(&identity) {
                    let mut refs: Vec<Identity> = constructor.components[index]
                        .references
                        .iter()
                        .map(ocm_desc::Reference::component_identity)
                        .collect();
                    refs.sort_unstable();
                    refs.dedup();
                    for child in &refs {
                        if seen.insert(child.clone()) {
                            pending.push_back(child.clone());
                        }
                    }
                    kinds.insert(identity.clone(), NodeKind::Constructor(index));
                    children.insert(identity, refs);
                    continue;
                }

                let external = Arc::clone(external);
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Cancelled(e.to_string()))?;
                tasks.spawn(async move {
                    let _permit = permit;
                    let name = identity.name().unwrap_or_default().to_owned();
                    let version = identity.version().unwrap_or_default().to_owned();
                    let Some(descriptor) = external.lookup(&name, &version).await? else {
                        return Err(Error::MissingComponent(identity.to_string()));
                    };
                    let mut refs: Vec<Identity> = descriptor
                        .component
                        .references
                        .iter()
                        .map(ocm_desc::Reference::component_identity)
                        .collect();
                    refs.sort_unstable();
                    refs.dedup();
                    Ok((identity, NodeKind::External(Box::new(descriptor)), refs))
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (identity, kind, refs) = match joined {
                    Ok(Ok(resolved)) => resolved,
                    Ok(Err(e)) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Err(e) => {
                        tasks.abort_all();
                        return Err(Error::Cancelled(e.to_string()));
                    }
                };
                for child in &refs {
                    if seen.insert(child.clone()) {
                        pending.push_back(child.clone());
                    }
                }
                kinds.insert(identity.clone(), kind);
                children.insert(identity, refs);
            }
        }

        Self::assemble(kinds, children)
    }

    /// Builds the edge set, refusing edges that would close a cycle.
    fn assemble(
        kinds: HashMap<Identity, NodeKind>,
        children: HashMap<Identity, Vec<Identity>>,
    ) -> Result<Self> {
        let mut graph: DiGraph<(), ()> = DiGraph::new();
        let indices: HashMap<Identity, _> = kinds
            .keys()
            .map(|identity| (identity.clone(), graph.add_node(())))
            .collect();

        let mut parents: HashMap<Identity, Vec<Identity>> = HashMap::new();
        for (from, refs) in &children {
            for to in refs {
                let from_idx = indices[from];
                let to_idx = *indices.get(to).ok_or_else(|| {
                    Error::MissingComponent(to.to_string())
                })?;
                if from_idx == to_idx || has_path_connecting(&graph, to_idx, from_idx, None) {
                    return Err(Error::Cycle(from.to_string()));
                }
                graph.add_edge(from_idx, to_idx, ());
                parents.entry(to.clone()).or_default().push(from.clone());
            }
        }

        Ok(Self {
            kinds,
            children,
            parents,
        })
    }

    /// Number of discovered nodes.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns `true` when nothing was discovered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Origin of the node with the given identity.
    pub fn kind(&self, identity: &Identity) -> Option<&NodeKind> {
        self.kinds.get(identity)
    }

    /// Per-node count of outgoing references, the scheduling precondition:
    /// a node runs once all of its references have been processed.
    pub fn dependency_counts(&self) -> HashMap<Identity, usize> {
        self.children
            .iter()
            .map(|(identity, refs)| (identity.clone(), refs.len()))
            .collect()
    }

    /// Nodes referencing `identity`.
    pub fn dependents(&self, identity: &Identity) -> &[Identity] {
        self.parents.get(identity).map_or(&[], Vec::as_slice)
    }
}
