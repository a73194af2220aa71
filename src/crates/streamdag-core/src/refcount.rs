//! Reference counting of vertices and edge arguments.
//!
//! The transaction layer never adds or removes graph entities directly; it
//! increments and decrements counters here, and the 0→1 / 1→0 transitions
//! drive physical creation and destruction. Vertices and edge arguments are
//! counted independently: an edge argument key is the `(from, to, arg)`
//! triple, so merging edges and releasing individual arguments both fall out
//! of plain counter arithmetic.
//!
//! A count below zero means a caller released a reference it never took.
//! That is reported loudly (`tracing::error!` plus
//! [`Error::NegativeRefCount`]) and the counter is left untouched.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::func::FuncRef;

/// Key of an edge-argument counter.
pub(crate) type EdgeKey = (FuncRef, FuncRef, String);

/// The counter table. Callers hold the engine's ref-counter lock while
/// touching it; the struct itself is plain data.
#[derive(Default)]
pub(crate) struct RefCount {
    vertices: HashMap<FuncRef, i64>,
    edges: HashMap<EdgeKey, i64>,
}

impl RefCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a vertex count, returning the new count. A return of 1 is
    /// the creation transition.
    pub fn vertex_inc(&mut self, f: &FuncRef) -> i64 {
        let count = self.vertices.entry(f.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrement a vertex count, returning the new count. A return of 0 is
    /// the destruction transition.
    pub fn vertex_dec(&mut self, f: &FuncRef) -> Result<i64> {
        match self.vertices.get_mut(f) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(*count)
            }
            _ => {
                tracing::error!(func = %f, "vertex reference count would go negative");
                Err(Error::NegativeRefCount {
                    entity: format!("vertex {f}"),
                })
            }
        }
    }

    pub fn vertex_count(&self, f: &FuncRef) -> i64 {
        self.vertices.get(f).copied().unwrap_or(0)
    }

    pub fn edge_inc(&mut self, key: EdgeKey) -> i64 {
        let count = self.edges.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    pub fn edge_dec(&mut self, key: &EdgeKey) -> Result<i64> {
        match self.edges.get_mut(key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(*count)
            }
            _ => {
                tracing::error!(
                    from = %key.0,
                    to = %key.1,
                    arg = %key.2,
                    "edge argument reference count would go negative"
                );
                Err(Error::NegativeRefCount {
                    entity: format!("edge {} -> {} arg '{}'", key.0, key.1, key.2),
                })
            }
        }
    }

    pub fn edge_count(&self, from: &FuncRef, to: &FuncRef, arg: &str) -> i64 {
        self.edges
            .get(&(from.clone(), to.clone(), arg.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// The live (positive-count) argument names between two vertices.
    pub fn args_for(&self, from: &FuncRef, to: &FuncRef) -> BTreeSet<String> {
        self.edges
            .iter()
            .filter(|((f, t, _), count)| f == from && t == to && **count > 0)
            .map(|((_, _, arg), _)| arg.clone())
            .collect()
    }

    /// Zero every edge-argument counter whose key touches `f` (either
    /// endpoint). Called when a vertex's count returns to zero: its incident
    /// edges go with it.
    pub fn zero_edges_touching(&mut self, f: &FuncRef) {
        for ((from, to, _), count) in self.edges.iter_mut() {
            if from == f || to == f {
                *count = 0;
            }
        }
    }

    /// Drop zero-count vertex entries, returning their keys. Used by GC to
    /// sweep anything not already physically removed.
    pub fn take_zero_vertices(&mut self) -> Vec<FuncRef> {
        let zeroes: Vec<FuncRef> = self
            .vertices
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(f, _)| f.clone())
            .collect();
        for f in &zeroes {
            self.vertices.remove(f);
        }
        zeroes
    }

    /// Drop zero-count edge entries, returning the endpoint pairs whose
    /// *entire* live argument set is now empty.
    pub fn take_zero_edge_pairs(&mut self) -> Vec<(FuncRef, FuncRef)> {
        let mut pairs: Vec<(FuncRef, FuncRef)> = Vec::new();
        let zero_keys: Vec<EdgeKey> = self
            .edges
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &zero_keys {
            self.edges.remove(key);
        }
        for (from, to, _) in zero_keys {
            let pair = (from, to);
            if self.args_for(&pair.0, &pair.1).is_empty() && !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
        pairs
    }
}
