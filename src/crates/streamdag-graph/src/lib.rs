//! # streamdag-graph - Argument-Labelled DAG Storage
//!
//! The graph store underneath the streamdag engine: a directed acyclic graph
//! whose edges carry a *set* of argument names. An argument name is the field
//! label by which the destination vertex addresses the value arriving over
//! that edge, so a single edge between two vertices can feed several input
//! fields at once.
//!
//! The store is a thin layer over [`petgraph`]'s `StableDiGraph`, adding the
//! semantics the engine needs:
//!
//! - **Merge-on-add**: adding a second edge between the same endpoints merges
//!   its argument set into the existing edge slot instead of creating a
//!   parallel edge. Duplicate argument names are rejected.
//! - **Acyclicity**: self-loops and edges that would close a cycle are
//!   rejected *before* any mutation takes effect.
//! - **Handle semantics**: an [`Edge`] value is a handle. Clones share the
//!   handle's identity, and [`Dag::lookup_edge`] resolves a handle back to
//!   its endpoints even after later merges widened the stored slot.
//!
//! Vertices are opaque to this crate; any `Clone + Eq + Hash` key works. The
//! engine keys the graph by node handles compared by pointer identity.
//!
//! ```rust
//! use streamdag_graph::{Dag, Edge};
//!
//! let mut dag: Dag<&str> = Dag::new();
//! dag.add_edge(&"a", &"b", Edge::new(["x"]).unwrap()).unwrap();
//! dag.add_edge(&"a", &"b", Edge::new(["y"]).unwrap()).unwrap();
//!
//! let merged = dag.find_edge(&"a", &"b").unwrap();
//! assert_eq!(merged.args().len(), 2);
//!
//! // Closing a cycle is rejected up front.
//! assert!(dag.add_edge(&"b", &"a", Edge::new(["z"]).unwrap()).is_err());
//! ```

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Convenience result type using [`DagError`].
pub type Result<T> = std::result::Result<T, DagError>;

/// Errors from graph store operations.
///
/// These are structural errors: they are returned synchronously by the
/// mutating call and never leave the graph in a half-updated state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    /// An argument name appears twice, either within a single edge
    /// construction or across an existing edge slot and a merge into it.
    #[error("duplicate edge argument name '{0}'")]
    DuplicateArg(String),

    /// Source and destination are the same vertex.
    #[error("self-loop edges are not allowed")]
    SelfLoop,

    /// Inserting the edge would close a directed cycle.
    #[error("edge would create a cycle")]
    WouldCycle,

    /// The graph is not acyclic (reported by topological sort).
    #[error("graph contains a cycle")]
    Cycle,

    /// The edge handle does not resolve to a stored edge.
    #[error("edge not found in graph")]
    MissingEdge,

    /// The vertex is not present in the graph.
    #[error("vertex not found in graph")]
    MissingVertex,
}

static NEXT_EDGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_edge_id() -> u64 {
    NEXT_EDGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A directed edge carrying a set of argument names.
///
/// An `Edge` is a *handle*: its identity is a process-unique id allocated at
/// construction, and clones share it. Equality and hashing are by id, never
/// by argument set, so two independently constructed edges with the same
/// args are distinct handles. When an edge is merged into an existing slot
/// in a [`Dag`], the stored slot keeps its original id so handles held by
/// earlier callers continue to resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default = "next_edge_id")]
    id: u64,
    args: BTreeSet<String>,
}

impl Edge {
    /// Build an edge from a collection of argument names.
    ///
    /// Returns [`DagError::DuplicateArg`] if a name appears more than once.
    pub fn new<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for arg in args {
            let arg = arg.into();
            if !set.insert(arg.clone()) {
                return Err(DagError::DuplicateArg(arg));
            }
        }
        Ok(Edge {
            id: next_edge_id(),
            args: set,
        })
    }

    /// The argument names carried by this edge, in sorted order.
    pub fn args(&self) -> &BTreeSet<String> {
        &self.args
    }

    /// The handle id. Stable across clones and merges into a stored slot.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// A handle with the same id but a different argument set.
    ///
    /// Lets a caller that tracked which arguments it contributed to a shared
    /// slot name exactly those arguments while still resolving to the slot.
    pub fn with_args<I, S>(&self, args: I) -> Result<Edge>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for arg in args {
            let arg = arg.into();
            if !set.insert(arg.clone()) {
                return Err(DagError::DuplicateArg(arg));
            }
        }
        Ok(Edge { id: self.id, args: set })
    }

    /// Union of this edge's args into `slot`, keeping the slot's id.
    ///
    /// Fails with [`DagError::DuplicateArg`] if any argument is already
    /// present on the slot.
    fn merge_into(&self, slot: &Edge) -> Result<Edge> {
        let mut args = slot.args.clone();
        for arg in &self.args {
            if !args.insert(arg.clone()) {
                return Err(DagError::DuplicateArg(arg.clone()));
            }
        }
        Ok(Edge { id: slot.id, args })
    }
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Edge {}

impl Hash for Edge {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        write!(f, "{}", args.join(","))
    }
}

/// An adjacency-listed directed acyclic graph with argument-labelled edges.
///
/// `V` is the vertex key type. The engine uses pointer-identity node handles;
/// tests frequently use `&str` or integers. Cloning a `Dag` yields a fully
/// disconnected copy (the original spec's copy-for-cycle-testing operation),
/// though mutation paths already reject cycles before touching the graph.
#[derive(Debug, Clone)]
pub struct Dag<V>
where
    V: Clone + Eq + Hash,
{
    pg: StableDiGraph<V, Edge>,
    index: HashMap<V, NodeIndex>,
}

impl<V> Default for Dag<V>
where
    V: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Dag<V>
where
    V: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Dag {
            pg: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Insert a vertex. Returns `false` (without side effects) if it was
    /// already present.
    pub fn add_vertex(&mut self, v: V) -> bool {
        if self.index.contains_key(&v) {
            return false;
        }
        let idx = self.pg.add_node(v.clone());
        self.index.insert(v, idx);
        true
    }

    /// Remove a vertex and every edge incident to it. Returns `false` if the
    /// vertex was not present.
    pub fn delete_vertex(&mut self, v: &V) -> bool {
        match self.index.remove(v) {
            Some(idx) => {
                self.pg.remove_node(idx);
                true
            }
            None => false,
        }
    }

    pub fn has_vertex(&self, v: &V) -> bool {
        self.index.contains_key(v)
    }

    /// Add an edge from `from` to `to`, inserting missing endpoints.
    ///
    /// If an edge already exists between the endpoints, `edge`'s argument
    /// set is merged into the stored slot (which keeps its id) and the slot
    /// weight is replaced with the widened edge. Duplicate argument names
    /// across the stored set and the incoming set are rejected.
    ///
    /// Self-loops and edges that would close a cycle are rejected before
    /// any mutation, including the endpoint auto-insertion.
    pub fn add_edge(&mut self, from: &V, to: &V, edge: Edge) -> Result<()> {
        if from == to {
            return Err(DagError::SelfLoop);
        }

        match (self.index.get(from), self.index.get(to)) {
            (Some(&fi), Some(&ti)) => {
                if let Some(ei) = self.pg.find_edge(fi, ti) {
                    // Merge into the existing slot; id is preserved.
                    let merged = edge.merge_into(&self.pg[ei])?;
                    self.pg[ei] = merged;
                    return Ok(());
                }
                // A new edge can only close a cycle if `to` already reaches
                // `from`.
                if has_path_connecting(&self.pg, ti, fi, None) {
                    return Err(DagError::WouldCycle);
                }
                self.pg.add_edge(fi, ti, edge);
            }
            _ => {
                // At least one endpoint is new, so no path between them can
                // exist yet and no cycle is possible.
                let fi = self.ensure_vertex(from);
                let ti = self.ensure_vertex(to);
                self.pg.add_edge(fi, ti, edge);
            }
        }
        Ok(())
    }

    /// Whether adding a *new* edge `from -> to` would close a cycle.
    ///
    /// Returns `false` when either endpoint is absent (no path can exist)
    /// or when an edge already exists between the endpoints (adding again
    /// merges rather than inserting).
    pub fn would_cycle(&self, from: &V, to: &V) -> bool {
        let (Some(&fi), Some(&ti)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        if self.pg.find_edge(fi, ti).is_some() {
            return false;
        }
        has_path_connecting(&self.pg, ti, fi, None)
    }

    fn ensure_vertex(&mut self, v: &V) -> NodeIndex {
        match self.index.get(v) {
            Some(&idx) => idx,
            None => {
                let idx = self.pg.add_node(v.clone());
                self.index.insert(v.clone(), idx);
                idx
            }
        }
    }

    fn edge_index(&self, e: &Edge) -> Option<EdgeIndex> {
        self.pg
            .edge_references()
            .find(|er| er.weight().id == e.id)
            .map(|er| er.id())
    }

    /// Remove the edge resolved by the handle `e`.
    pub fn delete_edge(&mut self, e: &Edge) -> Result<()> {
        let ei = self.edge_index(e).ok_or(DagError::MissingEdge)?;
        self.pg.remove_edge(ei);
        Ok(())
    }

    /// Replace the argument set of the edge resolved by `e`, keeping its id.
    ///
    /// Used by the engine to shrink a slot when some of its argument
    /// references are released while others remain.
    pub fn update_edge_args(&mut self, e: &Edge, args: BTreeSet<String>) -> Result<()> {
        let ei = self.edge_index(e).ok_or(DagError::MissingEdge)?;
        let id = self.pg[ei].id;
        self.pg[ei] = Edge { id, args };
        Ok(())
    }

    /// The current edge between two vertices, if any. The returned handle
    /// resolves via [`Dag::lookup_edge`] and [`Dag::delete_edge`].
    pub fn find_edge(&self, from: &V, to: &V) -> Option<Edge> {
        let fi = *self.index.get(from)?;
        let ti = *self.index.get(to)?;
        let ei = self.pg.find_edge(fi, ti)?;
        Some(self.pg[ei].clone())
    }

    /// Resolve an edge handle back to its `(from, to)` endpoints.
    pub fn lookup_edge(&self, e: &Edge) -> Option<(V, V)> {
        let er = self.pg.edge_references().find(|er| er.weight().id == e.id)?;
        Some((self.pg[er.source()].clone(), self.pg[er.target()].clone()))
    }

    /// Incoming `(source, edge)` pairs for a vertex.
    pub fn incoming_edges(&self, v: &V) -> Vec<(V, Edge)> {
        let Some(&idx) = self.index.get(v) else {
            return Vec::new();
        };
        self.pg
            .edges_directed(idx, Direction::Incoming)
            .map(|er| (self.pg[er.source()].clone(), er.weight().clone()))
            .collect()
    }

    pub fn in_degree(&self, v: &V) -> usize {
        self.index
            .get(v)
            .map(|&idx| self.pg.edges_directed(idx, Direction::Incoming).count())
            .unwrap_or(0)
    }

    pub fn out_degree(&self, v: &V) -> usize {
        self.index
            .get(v)
            .map(|&idx| self.pg.edges_directed(idx, Direction::Outgoing).count())
            .unwrap_or(0)
    }

    /// Out-degree of every vertex, keyed by vertex.
    pub fn out_degree_map(&self) -> HashMap<V, usize> {
        self.index
            .iter()
            .map(|(v, &idx)| {
                (
                    v.clone(),
                    self.pg.edges_directed(idx, Direction::Outgoing).count(),
                )
            })
            .collect()
    }

    /// All vertices, in unspecified order.
    pub fn vertices(&self) -> Vec<V> {
        self.pg.node_weights().cloned().collect()
    }

    /// All `(from, to, edge)` triples, in unspecified order.
    pub fn edges(&self) -> Vec<(V, V, Edge)> {
        self.pg
            .edge_references()
            .map(|er| {
                (
                    self.pg[er.source()].clone(),
                    self.pg[er.target()].clone(),
                    er.weight().clone(),
                )
            })
            .collect()
    }

    /// A topological ordering of the vertices.
    ///
    /// The mutation paths keep the graph acyclic, so this only fails if a
    /// caller bypassed them; the error is still surfaced rather than
    /// panicking.
    pub fn topological_sort(&self) -> Result<Vec<V>> {
        let order = toposort(&self.pg, None).map_err(|_| DagError::Cycle)?;
        Ok(order.into_iter().map(|idx| self.pg[idx].clone()).collect())
    }

    pub fn num_vertices(&self) -> usize {
        self.pg.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.pg.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.pg.node_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(args: &[&str]) -> Edge {
        Edge::new(args.iter().copied()).unwrap()
    }

    #[test]
    fn test_edge_rejects_duplicate_args_at_construction() {
        let err = Edge::new(["a", "b", "a"]).unwrap_err();
        assert_eq!(err, DagError::DuplicateArg("a".to_string()));
    }

    #[test]
    fn test_edge_identity_is_by_handle_not_args() {
        let e1 = edge(&["a"]);
        let e2 = edge(&["a"]);
        assert_ne!(e1, e2, "same args, separately constructed: distinct handles");
        assert_eq!(e1, e1.clone(), "clones share identity");
    }

    #[test]
    fn test_add_vertex_is_idempotent() {
        let mut dag: Dag<&str> = Dag::new();
        assert!(dag.add_vertex("a"));
        assert!(!dag.add_vertex("a"));
        assert_eq!(dag.num_vertices(), 1);
    }

    #[test]
    fn test_add_edge_auto_inserts_endpoints() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["x"])).unwrap();
        assert!(dag.has_vertex(&"a"));
        assert!(dag.has_vertex(&"b"));
        assert_eq!(dag.num_edges(), 1);
    }

    #[test]
    fn test_add_edge_merges_argument_sets() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["x"])).unwrap();
        let first = dag.find_edge(&"a", &"b").unwrap();

        dag.add_edge(&"a", &"b", edge(&["y"])).unwrap();
        let merged = dag.find_edge(&"a", &"b").unwrap();

        assert_eq!(dag.num_edges(), 1, "merge must not create a parallel edge");
        assert_eq!(
            merged.args().iter().cloned().collect::<Vec<_>>(),
            vec!["x".to_string(), "y".to_string()]
        );
        assert_eq!(merged.id(), first.id(), "slot keeps its id across merges");
    }

    #[test]
    fn test_add_edge_rejects_duplicate_arg_across_merge() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["x"])).unwrap();
        let err = dag.add_edge(&"a", &"b", edge(&["x"])).unwrap_err();
        assert_eq!(err, DagError::DuplicateArg("x".to_string()));
        // Slot unchanged.
        assert_eq!(dag.find_edge(&"a", &"b").unwrap().args().len(), 1);
    }

    #[test]
    fn test_add_edge_rejects_self_loop() {
        let mut dag: Dag<&str> = Dag::new();
        assert_eq!(dag.add_edge(&"a", &"a", edge(&["x"])), Err(DagError::SelfLoop));
        assert!(!dag.has_vertex(&"a"), "rejected edge must not insert vertices");
    }

    #[test]
    fn test_add_edge_rejects_cycle_without_mutation() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["x"])).unwrap();
        dag.add_edge(&"b", &"c", edge(&["y"])).unwrap();

        let err = dag.add_edge(&"c", &"a", edge(&["z"])).unwrap_err();
        assert_eq!(err, DagError::WouldCycle);
        assert_eq!(dag.num_edges(), 2);
        assert!(dag.topological_sort().is_ok());
    }

    #[test]
    fn test_delete_vertex_drops_incident_edges() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["x"])).unwrap();
        dag.add_edge(&"b", &"c", edge(&["y"])).unwrap();

        assert!(dag.delete_vertex(&"b"));
        assert_eq!(dag.num_edges(), 0);
        assert_eq!(dag.num_vertices(), 2);
    }

    #[test]
    fn test_lookup_edge_resolves_old_handle_after_merge() {
        let mut dag: Dag<&str> = Dag::new();
        let original = edge(&["x"]);
        dag.add_edge(&"a", &"b", original.clone()).unwrap();
        dag.add_edge(&"a", &"b", edge(&["y"])).unwrap();

        let (from, to) = dag.lookup_edge(&original).expect("old handle resolves");
        assert_eq!((from, to), ("a", "b"));
    }

    #[test]
    fn test_delete_edge_by_handle() {
        let mut dag: Dag<&str> = Dag::new();
        let e = edge(&["x"]);
        dag.add_edge(&"a", &"b", e.clone()).unwrap();
        dag.delete_edge(&e).unwrap();
        assert_eq!(dag.num_edges(), 0);
        assert_eq!(dag.delete_edge(&e), Err(DagError::MissingEdge));
    }

    #[test]
    fn test_update_edge_args_keeps_handle() {
        let mut dag: Dag<&str> = Dag::new();
        let e = edge(&["x", "y"]);
        dag.add_edge(&"a", &"b", e.clone()).unwrap();

        let mut shrunk = BTreeSet::new();
        shrunk.insert("y".to_string());
        dag.update_edge_args(&e, shrunk).unwrap();

        let stored = dag.find_edge(&"a", &"b").unwrap();
        assert_eq!(stored.id(), e.id());
        assert_eq!(stored.args().iter().cloned().collect::<Vec<_>>(), vec!["y"]);
    }

    #[test]
    fn test_topological_sort_orders_diamond() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["e1"])).unwrap();
        dag.add_edge(&"a", &"c", edge(&["e2"])).unwrap();
        dag.add_edge(&"b", &"d", edge(&["e3"])).unwrap();
        dag.add_edge(&"c", &"d", edge(&["e4"])).unwrap();

        let order = dag.topological_sort().unwrap();
        let pos = |v: &str| order.iter().position(|x| *x == v).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_degree_queries() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["x"])).unwrap();
        dag.add_edge(&"a", &"c", edge(&["y"])).unwrap();

        assert_eq!(dag.out_degree(&"a"), 2);
        assert_eq!(dag.in_degree(&"b"), 1);
        assert_eq!(dag.out_degree_map()[&"b"], 0);

        let incoming = dag.incoming_edges(&"b");
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].0, "a");
    }

    #[test]
    fn test_clone_is_disconnected() {
        let mut dag: Dag<&str> = Dag::new();
        dag.add_edge(&"a", &"b", edge(&["x"])).unwrap();

        let copy = dag.clone();
        dag.delete_vertex(&"a");

        assert!(copy.has_vertex(&"a"));
        assert_eq!(copy.num_edges(), 1);
    }
}
