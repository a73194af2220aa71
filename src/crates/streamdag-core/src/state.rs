//! Per-vertex runtime state.
//!
//! One [`NodeState`] exists per vertex, created when the vertex's reference
//! count first reaches one and destroyed when it returns to zero. The record
//! lives in the engine's state table under the graph mutex; the flag block is
//! shared with the vertex's two tasks (stream runner and output consumer)
//! through an `Arc` of atomics so they never need the table lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::{Cancel, Context};
use crate::value::Value;

/// Lock-free flags shared between the engine loop and a vertex's tasks.
#[derive(Debug, Default)]
pub(crate) struct NodeFlags {
    loaded: AtomicBool,
    closed: AtomicBool,
    running: AtomicBool,
    is_leaf: AtomicBool,
    input_count: AtomicU64,
}

impl NodeFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True once the function has emitted at least one value. Monotonic for
    /// the lifetime of the vertex.
    pub fn loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn set_loaded(&self) {
        self.loaded.store(true, Ordering::SeqCst);
    }

    /// True once the engine has closed the input channel.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True between task start and the exit of both of the vertex's tasks;
    /// once false, no further value from this vertex can appear.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, v: bool) {
        self.running.store(v, Ordering::SeqCst);
    }

    /// Recomputed from out-degree on every iteration.
    pub fn is_leaf(&self) -> bool {
        self.is_leaf.load(Ordering::SeqCst)
    }

    pub fn set_is_leaf(&self, v: bool) {
        self.is_leaf.store(v, Ordering::SeqCst);
    }

    pub fn input_count(&self) -> u64 {
        self.input_count.load(Ordering::SeqCst)
    }

    pub fn inc_input_count(&self) {
        self.input_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// The per-vertex runtime record.
pub(crate) struct NodeState {
    pub flags: Arc<NodeFlags>,
    /// Sender half of the input channel. Taking and dropping it is the one
    /// and only way the input channel closes.
    pub input_tx: Option<mpsc::Sender<Value>>,
    /// Receiver half of the output channel, taken by the output consumer
    /// when the vertex starts.
    pub output_rx: Option<mpsc::Receiver<Value>>,
    /// Child of the engine context; cancelling it stops only this vertex.
    pub ctx: Context,
    pub cancel: Cancel,
    /// Task handles joined at shutdown (or deferred onto the cleanup list
    /// when the vertex is deleted early). Holds the stream runner, which
    /// itself joins the output consumer on exit.
    pub handles: Vec<JoinHandle<()>>,
}

impl NodeState {
    pub fn new(
        input_tx: mpsc::Sender<Value>,
        output_rx: mpsc::Receiver<Value>,
        ctx: Context,
        cancel: Cancel,
    ) -> Self {
        NodeState {
            flags: NodeFlags::new(),
            input_tx: Some(input_tx),
            output_rx: Some(output_rx),
            ctx,
            cancel,
            handles: Vec::new(),
        }
    }

    /// Close the input channel. Idempotent: only the first call drops the
    /// sender.
    pub fn close_input(&mut self) {
        if self.input_tx.take().is_some() {
            self.flags.set_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_input_is_idempotent() {
        let (in_tx, _in_rx) = mpsc::channel(1);
        let (_out_tx, out_rx) = mpsc::channel(1);
        let (ctx, cancel) = Context::new();
        let mut state = NodeState::new(in_tx, out_rx, ctx, cancel);

        assert!(!state.flags.closed());
        state.close_input();
        assert!(state.flags.closed());
        state.close_input(); // no-op
        assert!(state.flags.closed());
    }

    #[test]
    fn test_flags_defaults() {
        let flags = NodeFlags::new();
        assert!(!flags.loaded());
        assert!(!flags.running());
        assert!(!flags.is_leaf());
        assert_eq!(flags.input_count(), 0);

        flags.set_loaded();
        flags.inc_input_count();
        assert!(flags.loaded());
        assert_eq!(flags.input_count(), 1);
    }
}
