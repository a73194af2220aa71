//! The execution engine: graph, state table, loop, and public surface.
//!
//! An [`Engine`] owns a DAG of [`Func`] vertices and streams values along
//! its edges. The main loop wakes on a capacity-1 channel, walks the graph
//! in topological order, assembles struct-shaped inputs from the value
//! table, forwards them, and aggregates leaf activity into outward events.
//! Structural changes happen only through [`Txn`] commits, which quiesce the
//! loop via the pause/resume coordinator, mutate under the reference
//! counter, and restart any newly-added vertices on resume.
//!
//! # Lifecycle
//!
//! ```rust,no_run
//! use streamdag_core::{Context, Engine, FuncRef, Value};
//! use streamdag_core::funcs::ConstFunc;
//!
//! # async fn example() -> streamdag_core::Result<()> {
//! let engine = Engine::builder("example").build();
//! engine.setup()?;
//!
//! let (ctx, cancel) = Context::new();
//! let runner = {
//!     let engine = engine.clone();
//!     tokio::spawn(async move { engine.run(ctx).await })
//! };
//! engine.started().await;
//!
//! let mut events = engine.stream()?;
//! let f1 = FuncRef::new(ConstFunc::new("f1", Value::str("hello")));
//! let txn = engine.txn();
//! txn.add_vertex(f1.clone());
//! txn.commit().await?;
//!
//! events.recv().await; // first aggregate event
//! assert_eq!(engine.table()[&f1].to_string(), "hello");
//!
//! cancel.cancel();
//! runner.await.unwrap()?;
//! engine.cleanup()?;
//! # Ok(())
//! # }
//! ```

mod process;
#[cfg(test)]
mod tests;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use streamdag_graph::{Dag, DagError, Edge};

use crate::context::{Cancel, Context};
use crate::coordinator::{Coordinator, LoopSide, MutatorSide};
use crate::error::{Error, Result};
use crate::event::{Aggregator, Callback, Event};
use crate::func::{FuncRef, Init, World};
use crate::refcount::RefCount;
use crate::state::{NodeFlags, NodeState};
use crate::stats::{FuncStats, Stats};
use crate::txn::{Op, OpKind, Txn};
use crate::value::Value;

/// The graph store and the node state table, guarded together by the graph
/// mutex: whatever the DAG says exists has a matching runtime record.
pub(crate) struct Topology {
    pub dag: Dag<FuncRef>,
    pub nodes: HashMap<FuncRef, NodeState>,
}

pub(crate) struct EngineInner {
    pub name: String,
    pub hostname: String,
    pub debug: bool,
    pub world: Option<Arc<dyn World>>,

    pub topology: Mutex<Topology>,
    pub table: RwLock<HashMap<FuncRef, Value>>,
    pub refcount: Mutex<RefCount>,
    /// Vertices that emitted since the last aggregate event.
    pub activity: Mutex<HashSet<FuncRef>>,
    /// Vertices to re-notify after the next resume.
    pub resend: Mutex<Vec<FuncRef>>,
    /// Deferred joins of deleted vertices' tasks.
    pub cleanups: Mutex<Vec<JoinHandle<()>>>,

    pub wake_tx: mpsc::Sender<()>,
    pub wake_rx: Mutex<Option<mpsc::Receiver<()>>>,

    pub aggregator: Aggregator,
    pub coordinator: Coordinator,

    pub ctx: Context,
    pub cancel: Cancel,

    pub started_tx: watch::Sender<bool>,
    pub loaded_tx: watch::Sender<bool>,
    /// Engine-level loaded flag; resets whenever a new vertex starts, while
    /// the public `loaded()` signal stays resolved once it fired.
    pub loaded_flag: AtomicBool,

    pub is_setup: AtomicBool,
    pub is_running: AtomicBool,
    pub is_finished: AtomicBool,
}

impl EngineInner {
    /// Coalescing wake: at most one pending token, extra pokes are dropped.
    /// Safe because iteration work is idempotent.
    pub(crate) fn poke_wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn cancel_engine(&self) {
        self.cancel.cancel();
    }

    /// Create the runtime record for a vertex and add it to the graph.
    /// Called on the 0→1 reference transition, under the graph mutex.
    ///
    /// Validation and init run first; any failure leaves the engine
    /// untouched.
    fn create_vertex(self: &Arc<Self>, topo: &mut Topology, f: &FuncRef) -> Result<()> {
        if topo.nodes.contains_key(f) {
            return Ok(());
        }
        let info = f.info();
        info.sig.validate()?;
        f.validate()
            .map_err(|e| Error::validate(f.to_string(), e.to_string()))?;

        let (input_tx, input_rx) = mpsc::channel(1);
        let (output_tx, output_rx) = mpsc::channel(1);
        let (ctx, cancel) = self.ctx.child();
        let span = tracing::info_span!("func", name = %f);
        let init = Init {
            hostname: self.hostname.clone(),
            input: input_rx,
            output: output_tx,
            txn: Txn::new(self.clone()),
            world: self.world.clone(),
            debug: self.debug,
            span,
        };
        f.init(init)
            .map_err(|e| Error::init(f.to_string(), e.to_string()))?;

        topo.nodes
            .insert(f.clone(), NodeState::new(input_tx, output_rx, ctx, cancel));
        topo.dag.add_vertex(f.clone());
        self.resend.lock().push(f.clone());
        tracing::debug!(func = %f, "vertex created");
        Ok(())
    }

    /// Tear a vertex out of the state table and graph. The vertex's context
    /// is cancelled immediately, but its tasks are never awaited here: the
    /// stream may itself be committing a transaction on this engine, so the
    /// joins go onto the deferred cleanup list.
    fn destroy_vertex(&self, topo: &mut Topology, f: &FuncRef) {
        if let Some(mut state) = topo.nodes.remove(f) {
            state.cancel.cancel();
            self.cleanups.lock().extend(state.handles.drain(..));
        }
        self.table.write().remove(f);
        self.activity.lock().remove(f);
        self.resend.lock().retain(|x| x != f);
        topo.dag.delete_vertex(f);
        tracing::debug!(func = %f, "vertex destroyed");
    }

    /// Close a vertex's input channel (exactly once).
    pub(crate) fn close_input(&self, f: &FuncRef) {
        let mut topo = self.topology.lock();
        if let Some(state) = topo.nodes.get_mut(f) {
            state.close_input();
            tracing::trace!(func = %f, "input closed");
        }
    }

    /// Forward action of one op. Each op is atomic: every check runs before
    /// the first mutation, so a failing op contributes nothing and the
    /// returned inverse list stays exact.
    fn apply_op(self: &Arc<Self>, topo: &mut Topology, rc: &mut RefCount, op: &Op) -> Result<Op> {
        match &op.kind {
            OpKind::AddVertex(f) => {
                if rc.vertex_inc(f) == 1 {
                    if let Err(e) = self.create_vertex(topo, f) {
                        let _ = rc.vertex_dec(f);
                        return Err(e);
                    }
                }
                Ok(Op::skipped(OpKind::DeleteVertex(f.clone())))
            }
            OpKind::AddEdge {
                from,
                to,
                edge,
                ref_endpoints,
            } => {
                if from == to {
                    return Err(DagError::SelfLoop.into());
                }
                for arg in edge.args() {
                    if rc.edge_count(from, to, arg) > 0 {
                        return Err(DagError::DuplicateArg(arg.clone()).into());
                    }
                }
                if topo.dag.would_cycle(from, to) {
                    return Err(DagError::WouldCycle.into());
                }
                if !*ref_endpoints
                    && (!topo.nodes.contains_key(from) || !topo.nodes.contains_key(to))
                {
                    // Replayed inverse of an edge delete; the endpoints it
                    // relied on are gone.
                    return Err(DagError::MissingVertex.into());
                }

                if *ref_endpoints {
                    let created_from = rc.vertex_inc(from) == 1;
                    if created_from {
                        if let Err(e) = self.create_vertex(topo, from) {
                            let _ = rc.vertex_dec(from);
                            return Err(e);
                        }
                    }
                    let created_to = rc.vertex_inc(to) == 1;
                    if created_to {
                        if let Err(e) = self.create_vertex(topo, to) {
                            let _ = rc.vertex_dec(to);
                            let _ = rc.vertex_dec(from);
                            if created_from {
                                self.destroy_vertex(topo, from);
                            }
                            return Err(e);
                        }
                    }
                }
                for arg in edge.args() {
                    rc.edge_inc((from.clone(), to.clone(), arg.clone()));
                }
                if let Err(e) = topo.dag.add_edge(from, to, edge.clone()) {
                    // Unreachable given the checks above; undo and surface.
                    for arg in edge.args() {
                        let _ = rc.edge_dec(&(from.clone(), to.clone(), arg.clone()));
                    }
                    return Err(e.into());
                }
                self.resend.lock().push(to.clone());

                // The inverse names the stored slot (which keeps its id
                // across merges) restricted to exactly the args this op
                // added, and releases the endpoint references this op took.
                let slot = topo
                    .dag
                    .find_edge(from, to)
                    .ok_or(DagError::MissingEdge)?;
                let inv_edge = slot.with_args(edge.args().iter().cloned())?;
                Ok(Op::skipped(OpKind::DeleteEdge {
                    edge: inv_edge,
                    unref_endpoints: *ref_endpoints,
                }))
            }
            OpKind::DeleteVertex(f) => {
                if rc.vertex_count(f) == 0 {
                    return Err(Error::NegativeRefCount {
                        entity: format!("vertex {f}"),
                    });
                }
                if rc.vertex_dec(f)? == 0 {
                    rc.zero_edges_touching(f);
                    self.destroy_vertex(topo, f);
                }
                Ok(Op::skipped(OpKind::AddVertex(f.clone())))
            }
            OpKind::DeleteEdge {
                edge,
                unref_endpoints,
            } => {
                let (from, to) = topo.dag.lookup_edge(edge).ok_or(DagError::MissingEdge)?;
                for arg in edge.args() {
                    if rc.edge_count(&from, &to, arg) == 0 {
                        return Err(Error::NegativeRefCount {
                            entity: format!("edge {from} -> {to} arg '{arg}'"),
                        });
                    }
                }
                if *unref_endpoints
                    && (rc.vertex_count(&from) == 0 || rc.vertex_count(&to) == 0)
                {
                    return Err(Error::NegativeRefCount {
                        entity: format!("endpoints of edge {from} -> {to}"),
                    });
                }
                for arg in edge.args() {
                    rc.edge_dec(&(from.clone(), to.clone(), arg.clone()))?;
                }
                let live = rc.args_for(&from, &to);
                if live.is_empty() {
                    topo.dag.delete_edge(edge)?;
                } else {
                    // Shrink the slot so input assembly never reads a
                    // released arg.
                    topo.dag.update_edge_args(edge, live)?;
                }
                if *unref_endpoints {
                    // Undoing an edge add: give back the endpoint
                    // references the add took.
                    for v in [&from, &to] {
                        if rc.vertex_dec(v)? == 0 {
                            rc.zero_edges_touching(v);
                            self.destroy_vertex(topo, v);
                        }
                    }
                }
                Ok(Op::skipped(OpKind::AddEdge {
                    from,
                    to,
                    edge: edge.clone(),
                    ref_endpoints: *unref_endpoints,
                }))
            }
        }
    }

    /// Remove anything whose reference count is zero but which is still
    /// physically present.
    fn gc(&self, topo: &mut Topology, rc: &mut RefCount) {
        for f in rc.take_zero_vertices() {
            if topo.dag.has_vertex(&f) || topo.nodes.contains_key(&f) {
                tracing::debug!(func = %f, "gc removing vertex");
                self.destroy_vertex(topo, &f);
            }
        }
        for (from, to) in rc.take_zero_edge_pairs() {
            if let Some(slot) = topo.dag.find_edge(&from, &to) {
                tracing::debug!(from = %from, to = %to, "gc removing edge");
                let _ = topo.dag.delete_edge(&slot);
            }
        }
    }

    /// Apply a batch of ops under the engine pause and the ref-counter
    /// lock. Returns the inverses of the ops that succeeded (in application
    /// order) and the overall result.
    pub(crate) async fn commit_ops(self: &Arc<Self>, ops: Vec<Op>) -> (Vec<Op>, Result<()>) {
        if !self.is_setup.load(Ordering::SeqCst) {
            return (Vec::new(), Err(Error::NotSetup));
        }
        let mut side = match self.coordinator.lock(&self.ctx).await {
            Ok(side) => side,
            Err(e) => return (Vec::new(), Err(e)),
        };

        let (inverses, result) = {
            let mut rc = self.refcount.lock();
            let mut topo = self.topology.lock();
            let mut inverses = Vec::new();
            let mut result = Ok(());
            for op in &ops {
                tracing::debug!(op = %op, "applying");
                match self.apply_op(&mut topo, &mut rc, op) {
                    Ok(inverse) => {
                        if !op.skip_reverse {
                            inverses.push(inverse);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(op = %op, error = %e, "op failed, stopping commit");
                        result = Err(e);
                        break;
                    }
                }
            }
            self.gc(&mut topo, &mut rc);
            (inverses, result)
        };

        let unlock_result = self.coordinator.unlock(&mut side, &self.ctx).await;
        drop(side);
        (inverses, result.and(unlock_result))
    }

    /// Post-resume step: start every not-yet-running vertex (reverse
    /// topological order, so consumers are live before their producers) and
    /// poke the wake channel once per vertex marked for resend.
    fn start_pending(self: &Arc<Self>) {
        // Finished deferred joins can be dropped without waiting.
        self.cleanups.lock().retain(|h| !h.is_finished());

        let starts = {
            let mut topo = self.topology.lock();
            let order = match topo.dag.topological_sort() {
                Ok(order) => order,
                Err(e) => {
                    tracing::error!(error = %e, "topological sort failed during resume");
                    Vec::new()
                }
            };
            let mut starts = Vec::new();
            for f in order.into_iter().rev() {
                let Some(state) = topo.nodes.get_mut(&f) else {
                    continue;
                };
                if state.flags.running() {
                    continue;
                }
                let Some(output_rx) = state.output_rx.take() else {
                    // Already ran once and exited; vertices are not
                    // restartable without re-adding them.
                    continue;
                };
                state.flags.set_running(true);
                self.loaded_flag.store(false, Ordering::SeqCst);
                starts.push((f.clone(), state.flags.clone(), state.ctx.clone(), output_rx));
            }
            starts
        };

        for (f, flags, ctx, output_rx) in starts {
            tracing::debug!(func = %f, "starting");
            let consumer = tokio::spawn(consume_output(
                self.clone(),
                f.clone(),
                flags.clone(),
                ctx.clone(),
                output_rx,
            ));
            // The runner owns the consumer handle: it joins the consumer
            // after the stream exits, so there is a single handle per
            // vertex to defer or await.
            let runner = tokio::spawn(run_stream(self.clone(), f.clone(), flags, ctx, consumer));
            let mut topo = self.topology.lock();
            match topo.nodes.get_mut(&f) {
                Some(state) => state.handles.push(runner),
                None => self.cleanups.lock().push(runner),
            }
        }

        let resend: Vec<FuncRef> = std::mem::take(&mut *self.resend.lock());
        for f in &resend {
            tracing::trace!(func = %f, "resend poke");
            self.poke_wake();
        }
        // The topology changed shape; re-evaluate regardless.
        self.poke_wake();
    }

    /// One pause/resume handshake from the loop's side. Returns `false`
    /// when the loop should exit instead of resuming.
    async fn pause_cycle(self: &Arc<Self>, ls: &mut LoopSide) -> bool {
        tracing::debug!("paused");
        let _ = ls.paused.send(()).await;
        tokio::select! {
            biased;
            _ = self.ctx.done() => false,
            req = ls.resume_req.recv() => match req {
                None => false,
                Some(()) => {
                    self.start_pending();
                    let _ = ls.resumed.send(()).await;
                    tracing::debug!("resumed");
                    true
                }
            }
        }
    }

    /// The main loop. Blocks until the parent context or the engine context
    /// is done, then drains and returns the first fatal error if one
    /// occurred.
    pub(crate) async fn run_loop(self: &Arc<Self>, parent: Context) -> Result<()> {
        if !self.is_setup.load(Ordering::SeqCst) {
            return Err(Error::NotSetup);
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let mut wake_rx = self.wake_rx.lock().take().ok_or(Error::AlreadyRunning)?;
        let mut ls = self
            .coordinator
            .take_loop_side()
            .ok_or(Error::AlreadyRunning)?;
        let ag_rx = self.aggregator.take_events().ok_or(Error::AlreadyRunning)?;
        let aggregator = tokio::spawn(run_aggregator(self.clone(), ag_rx));

        self.started_tx.send_replace(true);
        self.poke_wake();
        tracing::debug!(name = %self.name, "engine running");

        loop {
            tokio::select! {
                biased;
                _ = parent.done() => {
                    self.cancel_engine();
                    break;
                }
                _ = self.ctx.done() => break,
                req = ls.pause_req.recv() => {
                    if req.is_none() || !self.pause_cycle(&mut ls).await {
                        break;
                    }
                }
                wake = wake_rx.recv() => {
                    if wake.is_none() {
                        break;
                    }
                    // User code runs under this iteration (value compares,
                    // table callbacks), so recover panics like a stream's.
                    match AssertUnwindSafe(self.process()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => self.aggregator.send_error(e, &self.ctx).await,
                        Err(payload) => {
                            let e = Error::Panic(panic_message(payload));
                            self.aggregator.send_error(e, &self.ctx).await;
                        }
                    }
                }
            }
        }

        tracing::debug!(name = %self.name, "engine draining");
        self.cancel_engine();

        let mut handles: Vec<JoinHandle<()>> = {
            let mut topo = self.topology.lock();
            topo.nodes
                .values_mut()
                .flat_map(|s| s.handles.drain(..))
                .collect()
        };
        handles.extend(self.cleanups.lock().drain(..));
        for handle in handles {
            let _ = handle.await;
        }

        // All producers are gone; let the aggregator drain and close the
        // outward stream.
        self.aggregator.close_input();
        let _ = aggregator.await;

        self.is_finished.store(true, Ordering::SeqCst);
        tracing::debug!(name = %self.name, "engine stopped");
        match self.aggregator.fatal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Stream runner task: hosts `Func::stream`, recovers panics, and forwards
/// the exit error (or the synthetic stopped-before-loaded error) through the
/// aggregate channel, subject to the vertex's context.
///
/// The stream closes its output by returning, so joining the consumer here
/// guarantees every emission has reached the value table before `loaded`
/// is consulted and before the vertex is marked terminal.
async fn run_stream(
    inner: Arc<EngineInner>,
    f: FuncRef,
    flags: Arc<NodeFlags>,
    ctx: Context,
    consumer: JoinHandle<()>,
) {
    tracing::debug!(func = %f, "stream starting");
    let result = AssertUnwindSafe(f.stream(ctx.clone())).catch_unwind().await;
    let _ = consumer.await;
    flags.set_running(false);

    let err = match result {
        Err(payload) => Some(Error::Panic(panic_message(payload))),
        Ok(Err(e)) => Some(e),
        Ok(Ok(())) => {
            if flags.loaded() {
                None
            } else {
                Some(Error::NotLoaded {
                    func: f.to_string(),
                })
            }
        }
    };
    match err {
        Some(err) => {
            tracing::debug!(func = %f, error = %err, "stream exited with error");
            inner.aggregator.send_error(err, &ctx).await;
        }
        None => tracing::debug!(func = %f, "stream exited"),
    }
    // The vertex just became terminal; let the loop re-evaluate downstream
    // input closing.
    inner.poke_wake();
}

/// Output consumer task: stores each new value in the table (setting
/// `loaded` after the store), drops values equal to the cached one without
/// waking, and records leaf activity for the aggregate step.
async fn consume_output(
    inner: Arc<EngineInner>,
    f: FuncRef,
    flags: Arc<NodeFlags>,
    ctx: Context,
    mut output_rx: mpsc::Receiver<Value>,
) {
    while let Some(value) = output_rx.recv().await {
        let stored = {
            let mut table = inner.table.write();
            // A deleted vertex keeps draining until its stream closes the
            // channel; the check happens under the table lock so a late
            // value can never race the vertex's removal back in.
            if ctx.is_done() {
                tracing::trace!(func = %f, "late value dropped");
                false
            } else if table.get(&f).is_some_and(|prev| prev.cmp(&value).is_ok()) {
                tracing::trace!(func = %f, "equal value suppressed");
                false
            } else {
                tracing::trace!(func = %f, value = %value, "value stored");
                table.insert(f.clone(), value);
                true
            }
        };
        if !stored {
            continue;
        }
        if !flags.loaded() {
            flags.set_loaded();
        }
        inner.activity.lock().insert(f.clone());
        inner.poke_wake();
    }
}

/// Aggregator task: the single consumer of the aggregate channel.
async fn run_aggregator(inner: Arc<EngineInner>, mut ag_rx: mpsc::Receiver<Option<Error>>) {
    while let Some(event) = ag_rx.recv().await {
        match event {
            None => inner.aggregator.forward_activity(&inner.ctx).await,
            Some(err) => {
                inner.aggregator.forward_error(err, &inner.ctx).await;
                // Runtime errors are fatal: stop the run.
                inner.cancel_engine();
            }
        }
    }
    inner.aggregator.close_stream();
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    name: String,
    hostname: String,
    debug: bool,
    world: Option<Arc<dyn World>>,
    callback: Option<Callback>,
}

impl EngineBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn world(mut self, world: Arc<dyn World>) -> Self {
        self.world = Some(world);
        self
    }

    /// Receive events through a callback instead of the event stream.
    pub fn callback(mut self, cb: Callback) -> Self {
        self.callback = Some(cb);
        self
    }

    pub fn build(self) -> Engine {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (ctx, cancel) = Context::new();
        Engine {
            inner: Arc::new(EngineInner {
                name: self.name,
                hostname: self.hostname,
                debug: self.debug,
                world: self.world,
                topology: Mutex::new(Topology {
                    dag: Dag::new(),
                    nodes: HashMap::new(),
                }),
                table: RwLock::new(HashMap::new()),
                refcount: Mutex::new(RefCount::new()),
                activity: Mutex::new(HashSet::new()),
                resend: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
                wake_tx,
                wake_rx: Mutex::new(Some(wake_rx)),
                aggregator: Aggregator::new(self.callback),
                coordinator: Coordinator::new(),
                ctx,
                cancel,
                started_tx: watch::Sender::new(false),
                loaded_tx: watch::Sender::new(false),
                loaded_flag: AtomicBool::new(false),
                is_setup: AtomicBool::new(false),
                is_running: AtomicBool::new(false),
                is_finished: AtomicBool::new(false),
            }),
        }
    }
}

/// Holds the engine quiesced between [`Engine::lock`] and
/// [`EngineGuard::unlock`]. While held, no process iteration is in flight
/// and the holder may inspect a consistent graph.
///
/// Dropping the guard without unlocking leaves the loop paused; a warning
/// is logged because nothing will run until another resume arrives.
pub struct EngineGuard {
    inner: Arc<EngineInner>,
    side: Option<OwnedMutexGuard<MutatorSide>>,
}

impl EngineGuard {
    /// Resume the engine. On return the loop has started any newly-added
    /// vertices and is running again.
    pub async fn unlock(mut self) -> Result<()> {
        let Some(mut side) = self.side.take() else {
            return Ok(());
        };
        self.inner.coordinator.unlock(&mut side, &self.inner.ctx).await
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if self.side.is_some() {
            tracing::warn!("engine guard dropped while paused; the loop stays quiesced");
        }
    }
}

/// The dynamic dataflow execution engine. Cheap to clone; all clones are
/// the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(name: impl Into<String>) -> EngineBuilder {
        EngineBuilder {
            name: name.into(),
            hostname: "localhost".to_string(),
            debug: false,
            world: None,
            callback: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// Prepare the engine. Must run before any transaction is created.
    pub fn setup(&self) -> Result<()> {
        if self.inner.is_setup.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        tracing::debug!(name = %self.inner.name, hostname = %self.inner.hostname, "setup");
        Ok(())
    }

    /// Run the main loop until `ctx` is done, the engine is shut down, or a
    /// fatal runtime error occurs (which is returned). Cancellation is not
    /// an error.
    pub async fn run(&self, ctx: Context) -> Result<()> {
        self.inner.run_loop(ctx).await
    }

    /// Release engine state. Must run after `run` has returned.
    pub fn cleanup(&self) -> Result<()> {
        if self.inner.is_running.load(Ordering::SeqCst)
            && !self.inner.is_finished.load(Ordering::SeqCst)
        {
            return Err(Error::AlreadyRunning);
        }
        self.inner.table.write().clear();
        self.inner.activity.lock().clear();
        self.inner.resend.lock().clear();
        self.inner.cleanups.lock().clear();
        tracing::debug!(name = %self.inner.name, "cleanup");
        Ok(())
    }

    /// Ask the engine to stop. `run` drains and returns.
    pub fn shutdown(&self) {
        self.inner.cancel_engine();
    }

    /// Resolves once the main loop is accepting work. Commits block until
    /// then, so drivers usually await this right after spawning `run`.
    pub async fn started(&self) {
        let mut rx = self.inner.started_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once every vertex has emitted at least one value. One-shot:
    /// stays resolved even if vertices added later have not loaded yet.
    pub async fn loaded(&self) {
        let mut rx = self.inner.loaded_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The outward event stream: `Ok(())` per burst of leaf activity, `Err`
    /// for the fatal error that ends the run, closed on shutdown.
    /// Single-consumer; the second call fails.
    pub fn stream(&self) -> Result<mpsc::Receiver<Event>> {
        self.inner.aggregator.take_stream().ok_or(Error::StreamTaken)
    }

    /// The same events as [`Engine::stream`], wrapped as a
    /// `futures::Stream` for combinator-based consumers.
    pub fn event_stream(&self) -> Result<ReceiverStream<Event>> {
        Ok(ReceiverStream::new(self.stream()?))
    }

    /// Quiesce the engine for external mutation. See [`EngineGuard`].
    pub async fn lock(&self) -> Result<EngineGuard> {
        if !self.inner.is_setup.load(Ordering::SeqCst) {
            return Err(Error::NotSetup);
        }
        let side = self.inner.coordinator.lock(&self.inner.ctx).await?;
        Ok(EngineGuard {
            inner: self.inner.clone(),
            side: Some(side),
        })
    }

    /// A new transaction on this engine.
    pub fn txn(&self) -> Txn {
        Txn::new(self.inner.clone())
    }

    /// A disconnected snapshot of the value table.
    pub fn table(&self) -> HashMap<FuncRef, Value> {
        self.inner.table.read().clone()
    }

    /// Run `f` while holding the value table's write lock.
    pub fn apply<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<FuncRef, Value>) -> R,
    {
        let mut table = self.inner.table.write();
        f(&mut table)
    }

    pub fn num_vertices(&self) -> usize {
        self.inner.topology.lock().dag.num_vertices()
    }

    pub fn has_vertex(&self, f: &FuncRef) -> bool {
        self.inner.topology.lock().dag.has_vertex(f)
    }

    pub fn find_edge(&self, from: &FuncRef, to: &FuncRef) -> Option<Edge> {
        self.inner.topology.lock().dag.find_edge(from, to)
    }

    pub fn lookup_edge(&self, edge: &Edge) -> Option<(FuncRef, FuncRef)> {
        self.inner.topology.lock().dag.lookup_edge(edge)
    }

    /// A snapshot of per-vertex runtime state.
    pub fn stats(&self) -> Stats {
        let topo = self.inner.topology.lock();
        let mut funcs = std::collections::BTreeMap::new();
        for (f, state) in &topo.nodes {
            let mut key = f.to_string();
            if funcs.contains_key(&key) {
                key = format!("{key}#{:x}", f.addr());
            }
            funcs.insert(
                key,
                FuncStats {
                    running: state.flags.running(),
                    loaded: state.flags.loaded(),
                    closed: state.flags.closed(),
                    is_leaf: state.flags.is_leaf(),
                    input_count: state.flags.input_count(),
                },
            );
        }
        Stats {
            name: self.inner.name.clone(),
            loaded: self.inner.loaded_flag.load(Ordering::SeqCst),
            num_vertices: topo.dag.num_vertices(),
            num_edges: topo.dag.num_edges(),
            funcs,
        }
    }
}
