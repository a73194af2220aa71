//! Transactional graph mutation.
//!
//! A [`Txn`] is the only supported way to change a running graph. Operations
//! are queued (the queue methods chain), then [`Txn::commit`] applies them
//! in order while the engine is paused: it acquires the pause handshake and
//! the ref-counter lock, runs each op's forward action against the graph
//! store through the reference counter, records the exact inverse of every
//! op that succeeded, garbage-collects unreferenced entities, and resumes
//! the engine.
//!
//! Every op is represented as a tagged variant applied by a single
//! interpreter in the engine, with the inverse kept in an explicit log. An
//! op that fails applies nothing; a commit that fails midway keeps its
//! applied prefix and returns the error. There is no automatic rollback:
//! the caller decides whether to [`Txn::reverse`] the prefix.
//!
//! `reverse` replays the inverse log backwards. The inverses carry a
//! skip-on-reverse mark so reversing a reversal does not ping-pong: a
//! reverse commit produces no new inverses.
//!
//! Several handles can mutate one engine concurrently: [`Txn::copy`] gives
//! an independent queue pair sharing the engine's pause lock and reference
//! counter, which serialize the commits.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use streamdag_graph::Edge;

use crate::engine::EngineInner;
use crate::error::Result;
use crate::func::FuncRef;

/// The four mutation kinds.
///
/// A caller-queued `AddEdge` takes a reference on each endpoint (creating
/// it on the 0→1 transition) and a caller-queued `DeleteEdge` leaves the
/// endpoints alone; vertex lifetime is otherwise driven by the vertex ops.
/// The endpoint flags exist so each op's recorded inverse restores exactly
/// the references its forward action took: the inverse of an edge add also
/// releases the endpoints, while the inverse of an edge delete re-adds the
/// edge without re-taking them.
#[derive(Clone, Debug)]
pub(crate) enum OpKind {
    AddVertex(FuncRef),
    AddEdge {
        from: FuncRef,
        to: FuncRef,
        edge: Edge,
        ref_endpoints: bool,
    },
    DeleteVertex(FuncRef),
    DeleteEdge {
        edge: Edge,
        unref_endpoints: bool,
    },
}

/// A queued operation: the tagged mutation plus the skip-on-reverse mark
/// carried by inverse records.
#[derive(Clone, Debug)]
pub(crate) struct Op {
    pub kind: OpKind,
    pub skip_reverse: bool,
}

impl Op {
    pub fn new(kind: OpKind) -> Self {
        Op {
            kind,
            skip_reverse: false,
        }
    }

    /// An inverse record: applying it produces no further inverse.
    pub fn skipped(kind: OpKind) -> Self {
        Op {
            kind,
            skip_reverse: true,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::AddVertex(func) => write!(f, "AddVertex({func})"),
            OpKind::AddEdge { from, to, edge, .. } => {
                write!(f, "AddEdge({from} -> {to}, [{edge}])")
            }
            OpKind::DeleteVertex(func) => write!(f, "DeleteVertex({func})"),
            OpKind::DeleteEdge { edge, .. } => write!(f, "DeleteEdge([{edge}])"),
        }
    }
}

struct TxnState {
    ops: Vec<Op>,
    inverse: Vec<Op>,
    post_reverse_commit: bool,
}

/// A handle for batching reversible graph mutations. See the module docs.
///
/// Cloning a `Txn` shares its queues (the clone is the same transaction);
/// use [`Txn::copy`] for an independent transaction on the same engine.
#[derive(Clone)]
pub struct Txn {
    engine: Arc<EngineInner>,
    state: Arc<Mutex<TxnState>>,
}

impl Txn {
    pub(crate) fn new(engine: Arc<EngineInner>) -> Self {
        Txn {
            engine,
            state: Arc::new(Mutex::new(TxnState {
                ops: Vec::new(),
                inverse: Vec::new(),
                post_reverse_commit: false,
            })),
        }
    }

    /// Queue adding a vertex.
    pub fn add_vertex(&self, func: FuncRef) -> &Self {
        self.state.lock().ops.push(Op::new(OpKind::AddVertex(func)));
        self
    }

    /// Queue adding (or merging) an edge. Takes a reference on each
    /// endpoint, creating it if this is its first reference.
    pub fn add_edge(&self, from: FuncRef, to: FuncRef, edge: Edge) -> &Self {
        self.state.lock().ops.push(Op::new(OpKind::AddEdge {
            from,
            to,
            edge,
            ref_endpoints: true,
        }));
        self
    }

    /// Queue deleting a vertex (releasing one reference to it).
    pub fn delete_vertex(&self, func: FuncRef) -> &Self {
        self.state
            .lock()
            .ops
            .push(Op::new(OpKind::DeleteVertex(func)));
        self
    }

    /// Queue deleting an edge: releasing one reference to each of the
    /// handle's argument names. Endpoint vertices are not released; their
    /// lifetime is driven by their own reference counts.
    pub fn delete_edge(&self, edge: Edge) -> &Self {
        self.state.lock().ops.push(Op::new(OpKind::DeleteEdge {
            edge,
            unref_endpoints: false,
        }));
        self
    }

    /// Append the current inverse log (in rollback order) to the pending
    /// queue, so the next commit undoes the previous one.
    pub fn add_reverse(&self) -> &Self {
        let mut st = self.state.lock();
        let mut invs = st.inverse.clone();
        invs.reverse();
        st.ops.extend(invs);
        self
    }

    /// Whether a successful [`Txn::reverse`] immediately commits the ops
    /// that were queued when it was called. Off by default: queued ops are
    /// restored to the pending queue instead.
    pub fn set_post_reverse_commit(&self, on: bool) -> &Self {
        self.state.lock().post_reverse_commit = on;
        self
    }

    /// Drop all pending (uncommitted) operations.
    pub fn clear(&self) {
        self.state.lock().ops.clear();
    }

    /// Drop pending operations *and* the inverse log.
    pub fn erase(&self) {
        let mut st = self.state.lock();
        st.ops.clear();
        st.inverse.clear();
    }

    /// Release the transaction's bookkeeping. The handle may simply be
    /// dropped afterwards.
    pub fn free(&self) {
        self.erase();
    }

    /// Number of pending operations.
    pub fn pending(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// An independent transaction sharing this one's engine lock, graph and
    /// reference counter.
    pub fn copy(&self) -> Txn {
        let prc = self.state.lock().post_reverse_commit;
        Txn {
            engine: self.engine.clone(),
            state: Arc::new(Mutex::new(TxnState {
                ops: Vec::new(),
                inverse: Vec::new(),
                post_reverse_commit: prc,
            })),
        }
    }

    /// Apply the pending operations. An empty queue succeeds immediately.
    ///
    /// On failure the error of the first failing op is returned; the ops
    /// before it remain applied and their inverses are held for
    /// [`Txn::reverse`]. The pending queue is cleared either way.
    pub async fn commit(&self) -> Result<()> {
        let ops = {
            let mut st = self.state.lock();
            if st.ops.is_empty() {
                return Ok(());
            }
            st.inverse.clear();
            std::mem::take(&mut st.ops)
        };
        tracing::debug!(ops = ops.len(), "committing transaction");
        let (inverses, result) = self.engine.commit_ops(ops).await;
        self.state.lock().inverse = inverses;
        result
    }

    /// Undo the most recent commit by replaying its inverse log backwards.
    ///
    /// Ops queued but not yet committed are set aside first; on success
    /// they are either committed immediately (`post_reverse_commit`) or
    /// restored to the pending queue.
    pub async fn reverse(&self) -> Result<()> {
        let (queued, post_reverse_commit) = {
            let mut st = self.state.lock();
            let queued = std::mem::take(&mut st.ops);
            let mut invs = std::mem::take(&mut st.inverse);
            invs.reverse();
            st.ops = invs;
            (queued, st.post_reverse_commit)
        };

        let result = self.commit().await;

        if result.is_ok() && post_reverse_commit && !queued.is_empty() {
            self.state.lock().ops = queued;
            return self.commit().await;
        }
        if !queued.is_empty() {
            // Restore whatever the caller had queued before the reverse.
            self.state.lock().ops = queued;
        }
        result
    }
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Txn")
            .field("pending", &st.ops.len())
            .field("inverse", &st.inverse.len())
            .field("post_reverse_commit", &st.post_reverse_commit)
            .finish()
    }
}
