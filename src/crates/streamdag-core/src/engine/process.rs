//! One iteration of the execution loop.
//!
//! `process` walks the graph in topological order, assembles each vertex's
//! input struct from the value table, and forwards it. The walk snapshots a
//! plan (order, edge args, flag handles, input senders) under the graph
//! mutex up front, then runs the preemptible sends without holding any lock,
//! so an iteration can block on a slow vertex without freezing
//! introspection.
//!
//! Iterations are restartable by design: an aborted send re-pokes the wake
//! channel and the next iteration recomputes readiness from the value table,
//! so the same input combination may be delivered more than once. Equality
//! deduplication on the output side of the next hop absorbs that.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::ActivitySend;
use crate::func::FuncRef;
use crate::state::NodeFlags;
use crate::value::Value;

use super::EngineInner;

struct PlanIncoming {
    upstream: FuncRef,
    args: Vec<String>,
    upstream_flags: Arc<NodeFlags>,
}

struct PlanNode {
    func: FuncRef,
    flags: Arc<NodeFlags>,
    ctx: Context,
    input_tx: Option<mpsc::Sender<Value>>,
    incoming: Vec<PlanIncoming>,
    sig_fields: Vec<String>,
    out_degree: usize,
}

enum SendOutcome {
    Sent,
    /// Preempted by the vertex's context, the engine context, or a pending
    /// pause; the iteration aborts and the wake channel is re-poked.
    Preempted,
    /// The vertex dropped its input receiver; stop feeding it.
    Gone,
}

impl EngineInner {
    /// Run one iteration. Fatal wiring errors (inconsistent input fields,
    /// a cycle that slipped past the mutation checks) are returned; an
    /// aborted send is not an error.
    pub(crate) async fn process(self: &Arc<Self>) -> Result<()> {
        let plan: Vec<PlanNode> = {
            let topo = self.topology.lock();
            let order = topo.dag.topological_sort()?;
            let out_degrees = topo.dag.out_degree_map();
            order
                .into_iter()
                .filter_map(|f| {
                    let state = topo.nodes.get(&f)?;
                    let incoming = topo
                        .dag
                        .incoming_edges(&f)
                        .into_iter()
                        .filter_map(|(upstream, edge)| {
                            let upstream_flags = topo.nodes.get(&upstream)?.flags.clone();
                            Some(PlanIncoming {
                                upstream,
                                args: edge.args().iter().cloned().collect(),
                                upstream_flags,
                            })
                        })
                        .collect();
                    Some(PlanNode {
                        flags: state.flags.clone(),
                        ctx: state.ctx.clone(),
                        input_tx: state.input_tx.clone(),
                        incoming,
                        sig_fields: f.info().sig.field_names(),
                        out_degree: out_degrees.get(&f).copied().unwrap_or(0),
                        func: f,
                    })
                })
                .collect()
        };

        for node in plan {
            if self.coordinator.pause_pending() {
                self.poke_wake();
                return Ok(());
            }
            node.flags.set_is_leaf(node.out_degree == 0);

            // A vertex with no incoming edges gets its input closed: no
            // input can ever arrive.
            if node.incoming.is_empty() {
                if !node.flags.closed() {
                    self.close_input(&node.func);
                }
                continue;
            }

            let mut ready = true;
            let mut all_upstreams_terminal = true;
            let mut fields: BTreeMap<String, Value> = BTreeMap::new();
            {
                let table = self.table.read();
                'incoming: for inc in &node.incoming {
                    let Some(value) = table.get(&inc.upstream) else {
                        // Upstream has not produced yet.
                        ready = false;
                        break 'incoming;
                    };
                    // Terminal means the upstream's input is closed *and*
                    // its tasks have exited: a source with a closed input
                    // may still be emitting.
                    if !inc.upstream_flags.closed() || inc.upstream_flags.running() {
                        all_upstreams_terminal = false;
                    }
                    for arg in &inc.args {
                        if !node.sig_fields.iter().any(|s| s == arg) {
                            return Err(Error::UnknownInputField {
                                func: node.func.to_string(),
                                field: arg.clone(),
                            });
                        }
                        if fields.insert(arg.clone(), value.clone()).is_some() {
                            return Err(Error::DuplicateInputField {
                                func: node.func.to_string(),
                                field: arg.clone(),
                            });
                        }
                    }
                }
            }
            if !ready {
                continue;
            }
            if node.sig_fields.iter().any(|s| !fields.contains_key(s)) {
                // A signature field has no feeding edge yet.
                continue;
            }
            if node.flags.closed() {
                continue;
            }
            let Some(input_tx) = node.input_tx.as_ref() else {
                continue;
            };

            let input = Value::Struct(fields);
            tracing::trace!(func = %node.func, input = %input, "sending input");
            let outcome = tokio::select! {
                biased;
                _ = self.ctx.done() => SendOutcome::Preempted,
                _ = node.ctx.done() => SendOutcome::Preempted,
                _ = self.coordinator.interrupt.notified() => SendOutcome::Preempted,
                res = input_tx.send(input) => match res {
                    Ok(()) => SendOutcome::Sent,
                    Err(_) => SendOutcome::Gone,
                },
            };
            match outcome {
                SendOutcome::Preempted => {
                    self.poke_wake();
                    return Ok(());
                }
                SendOutcome::Gone => {
                    self.close_input(&node.func);
                    continue;
                }
                SendOutcome::Sent => {}
            }
            node.flags.inc_input_count();
            if all_upstreams_terminal {
                // Nothing further can arrive.
                self.close_input(&node.func);
            }
        }

        // Engine-level loaded: every vertex has produced at least once.
        let all_loaded = {
            let topo = self.topology.lock();
            topo.nodes.values().all(|s| s.flags.loaded())
        };
        self.loaded_flag.store(all_loaded, Ordering::SeqCst);
        if !all_loaded {
            return Ok(());
        }
        self.loaded_tx.send_replace(true);

        let has_leaf_activity = {
            let activity = self.activity.lock();
            let topo = self.topology.lock();
            activity
                .iter()
                .any(|f| topo.nodes.get(f).is_some_and(|s| s.flags.is_leaf()))
        };
        if has_leaf_activity {
            match self.aggregator.try_send_activity() {
                ActivitySend::Sent => {
                    tracing::debug!("aggregate event emitted");
                    self.activity.lock().clear();
                }
                ActivitySend::Full => {
                    // Consumer has not caught up; retry on the next wake.
                    if !self.ctx.is_done() {
                        self.poke_wake();
                        tokio::task::yield_now().await;
                    }
                }
                ActivitySend::Closed => {}
            }
        }
        Ok(())
    }
}
