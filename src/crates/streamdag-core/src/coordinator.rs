//! The pause/resume coordinator: an inverted mutex over four channels.
//!
//! A plain lock cannot pause the execution loop, because the loop must keep
//! reacting to cancellation while paused. Instead, pausing is a four-phase
//! handshake over capacity-1 channels:
//!
//! ```text
//!   mutator                    loop
//!   -------                    ----
//!   pause_req ───────────────▶ (abort in-flight iteration)
//!             ◀─────────────── paused
//!   ... mutate graph store ...
//!   resume_req ──────────────▶ (start new vertices)
//!              ◀────────────── resumed
//! ```
//!
//! Between `paused` and `resume_req` the mutator owns the graph: no process
//! iteration is in flight and none will start. Concurrent mutators serialize
//! on an async mutex around the mutator side of the channels. Every phase
//! also selects on the engine context, so shutdown interrupts a waiting
//! mutator with [`Error::Closing`] instead of deadlocking it.
//!
//! `pause_req` alone cannot stop an iteration that is already blocked on an
//! input send, so [`Coordinator::lock`] additionally flips a pause-pending
//! flag and nudges a [`Notify`] that every input send selects on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

use crate::context::Context;
use crate::error::{Error, Result};

/// Channel ends used by external mutators (transactions, `Engine::lock`).
pub(crate) struct MutatorSide {
    pause_req: mpsc::Sender<()>,
    paused: mpsc::Receiver<()>,
    resume_req: mpsc::Sender<()>,
    resumed: mpsc::Receiver<()>,
}

/// Channel ends integrated into the execution loop's select.
pub(crate) struct LoopSide {
    pub pause_req: mpsc::Receiver<()>,
    pub paused: mpsc::Sender<()>,
    pub resume_req: mpsc::Receiver<()>,
    pub resumed: mpsc::Sender<()>,
}

pub(crate) struct Coordinator {
    mutator: Arc<Mutex<MutatorSide>>,
    loop_side: parking_lot::Mutex<Option<LoopSide>>,
    pause_pending: AtomicBool,
    /// Nudged on every pause request; preempts an in-flight input send.
    pub interrupt: Notify,
}

impl Coordinator {
    pub fn new() -> Self {
        let (pause_req_tx, pause_req_rx) = mpsc::channel(1);
        let (paused_tx, paused_rx) = mpsc::channel(1);
        let (resume_req_tx, resume_req_rx) = mpsc::channel(1);
        let (resumed_tx, resumed_rx) = mpsc::channel(1);

        Coordinator {
            mutator: Arc::new(Mutex::new(MutatorSide {
                pause_req: pause_req_tx,
                paused: paused_rx,
                resume_req: resume_req_tx,
                resumed: resumed_rx,
            })),
            loop_side: parking_lot::Mutex::new(Some(LoopSide {
                pause_req: pause_req_rx,
                paused: paused_tx,
                resume_req: resume_req_rx,
                resumed: resumed_tx,
            })),
            pause_pending: AtomicBool::new(false),
            interrupt: Notify::new(),
        }
    }

    /// The loop's channel ends, available exactly once (taken by `run`).
    pub fn take_loop_side(&self) -> Option<LoopSide> {
        self.loop_side.lock().take()
    }

    /// Whether a mutator is waiting for the loop to quiesce. Checked by the
    /// process iteration so it bails out between vertices.
    pub fn pause_pending(&self) -> bool {
        self.pause_pending.load(Ordering::SeqCst)
    }

    /// Quiesce the loop. On success the caller owns the graph until it
    /// calls [`Coordinator::unlock`] with the returned guard.
    pub async fn lock(&self, ctx: &Context) -> Result<OwnedMutexGuard<MutatorSide>> {
        let mut side = tokio::select! {
            guard = self.mutator.clone().lock_owned() => guard,
            _ = ctx.done() => return Err(Error::Closing),
        };

        self.pause_pending.store(true, Ordering::SeqCst);
        self.interrupt.notify_one();

        let sent = tokio::select! {
            res = side.pause_req.send(()) => res.is_ok(),
            _ = ctx.done() => false,
        };
        if !sent {
            self.pause_pending.store(false, Ordering::SeqCst);
            return Err(Error::Closing);
        }

        let acked = tokio::select! {
            ack = side.paused.recv() => ack.is_some(),
            _ = ctx.done() => false,
        };
        self.pause_pending.store(false, Ordering::SeqCst);
        if !acked {
            return Err(Error::Closing);
        }
        Ok(side)
    }

    /// Resume the loop. On success the loop has started any newly-added
    /// vertices and is running again.
    pub async fn unlock(&self, side: &mut MutatorSide, ctx: &Context) -> Result<()> {
        let sent = tokio::select! {
            res = side.resume_req.send(()) => res.is_ok(),
            _ = ctx.done() => false,
        };
        if !sent {
            return Err(Error::Closing);
        }

        let acked = tokio::select! {
            ack = side.resumed.recv() => ack.is_some(),
            _ = ctx.done() => false,
        };
        if !acked {
            return Err(Error::Closing);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stand-in for the loop end of the handshake: acknowledge one
    /// pause/resume cycle.
    async fn serve_one_cycle(mut ls: LoopSide) -> LoopSide {
        ls.pause_req.recv().await.expect("pause requested");
        ls.paused.send(()).await.expect("paused ack");
        ls.resume_req.recv().await.expect("resume requested");
        ls.resumed.send(()).await.expect("resumed ack");
        ls
    }

    #[tokio::test]
    async fn test_lock_unlock_round_trip() {
        let coord = Arc::new(Coordinator::new());
        let ls = coord.take_loop_side().unwrap();
        let server = tokio::spawn(serve_one_cycle(ls));

        let ctx = Context::background();
        let mut guard = coord.lock(&ctx).await.unwrap();
        assert!(
            !coord.pause_pending(),
            "flag clears once the pause is acknowledged"
        );
        coord.unlock(&mut guard, &ctx).await.unwrap();
        drop(guard);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_side_taken_once() {
        let coord = Coordinator::new();
        assert!(coord.take_loop_side().is_some());
        assert!(coord.take_loop_side().is_none());
    }

    #[tokio::test]
    async fn test_lock_aborts_on_cancel() {
        let coord = Arc::new(Coordinator::new());
        // Nobody serves the loop side, so the lock can only finish via the
        // context.
        let _ls = coord.take_loop_side().unwrap();

        let (ctx, cancel) = Context::new();
        let locker = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.lock(&ctx).await.map(|_| ()) })
        };
        cancel.cancel();
        let res = locker.await.unwrap();
        assert!(matches!(res, Err(Error::Closing)));
    }

    #[tokio::test]
    async fn test_mutators_serialize() {
        let coord = Arc::new(Coordinator::new());
        let ls = coord.take_loop_side().unwrap();

        // Serve two full cycles back to back.
        let server = tokio::spawn(async move {
            let ls = serve_one_cycle(ls).await;
            serve_one_cycle(ls).await;
        });

        let ctx = Context::background();
        for _ in 0..2 {
            let mut guard = coord.lock(&ctx).await.unwrap();
            coord.unlock(&mut guard, &ctx).await.unwrap();
        }
        server.await.unwrap();
    }
}
