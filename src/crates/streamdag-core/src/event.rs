//! Event aggregation: surfacing engine activity to the outside world.
//!
//! Functions and the execution loop do not talk to the driver directly; they
//! push onto an internal aggregate channel (`None` = "the leaves produced
//! new output", `Some(err)` = fatal runtime error). A single consumer task
//! forwards each event outward, either to the driver's callback or to the
//! event stream obtained from [`Engine::stream`](crate::engine::Engine::stream)
//! as `Ok(())` / `Err(e)` items.
//!
//! The first fatal error wins: it is recorded, forwarded once, and the
//! engine context is cancelled so everything drains. Structural errors from
//! transactions never travel this path. Cancellation is not an error: on
//! shutdown the stream simply closes.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::Error;

/// Outward event item: `Ok(())` is an aggregate activity event, `Err` is the
/// fatal runtime error that ended the run.
pub type Event = std::result::Result<(), Error>;

/// Driver callback, invoked instead of the stream when set. `None` marks an
/// activity event; `Some` carries the fatal error.
pub type Callback = Arc<dyn Fn(&Context, Option<&Error>) + Send + Sync>;

/// Result of a non-blocking activity send from the execution loop.
pub(crate) enum ActivitySend {
    Sent,
    /// The previous event has not been consumed yet; the loop re-pokes
    /// itself and retries on the next iteration.
    Full,
    Closed,
}

/// Channel plumbing for the aggregate path. Owned by the engine; the
/// consumer half runs as its own task for the lifetime of the run.
pub(crate) struct Aggregator {
    ag_tx: Mutex<Option<mpsc::Sender<Option<Error>>>>,
    ag_rx: Mutex<Option<mpsc::Receiver<Option<Error>>>>,
    stream_tx: Mutex<Option<mpsc::Sender<Event>>>,
    stream_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    callback: Option<Callback>,
    fatal: Mutex<Option<Error>>,
}

impl Aggregator {
    pub fn new(callback: Option<Callback>) -> Self {
        let (ag_tx, ag_rx) = mpsc::channel(1);
        let (stream_tx, stream_rx) = mpsc::channel(1);
        Aggregator {
            ag_tx: Mutex::new(Some(ag_tx)),
            ag_rx: Mutex::new(Some(ag_rx)),
            stream_tx: Mutex::new(Some(stream_tx)),
            stream_rx: Mutex::new(Some(stream_rx)),
            callback,
            fatal: Mutex::new(None),
        }
    }

    /// The consumer half of the aggregate channel, available once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Option<Error>>> {
        self.ag_rx.lock().take()
    }

    /// The outward event stream, available once.
    pub fn take_stream(&self) -> Option<mpsc::Receiver<Event>> {
        self.stream_rx.lock().take()
    }

    /// Non-blocking activity event from the execution loop.
    pub fn try_send_activity(&self) -> ActivitySend {
        let Some(tx) = self.ag_tx.lock().clone() else {
            return ActivitySend::Closed;
        };
        match tx.try_send(None) {
            Ok(()) => ActivitySend::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => ActivitySend::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => ActivitySend::Closed,
        }
    }

    /// Push a fatal error onto the aggregate channel, abandoning the send if
    /// `ctx` is done first. Stream runners call this with their node
    /// context, so errors from vertices being torn down are not reported.
    pub async fn send_error(&self, err: Error, ctx: &Context) {
        let Some(tx) = self.ag_tx.lock().clone() else {
            return;
        };
        tokio::select! {
            biased;
            _ = ctx.done() => {}
            _ = tx.send(Some(err)) => {}
        }
    }

    /// Forward an activity event outward.
    pub async fn forward_activity(&self, ctx: &Context) {
        if let Some(cb) = &self.callback {
            cb(ctx, None);
            return;
        }
        let Some(tx) = self.stream_tx.lock().clone() else {
            return;
        };
        tokio::select! {
            biased;
            _ = ctx.done() => {}
            _ = tx.send(Ok(())) => {}
        }
    }

    /// Record the first fatal error and forward it outward.
    pub async fn forward_error(&self, err: Error, ctx: &Context) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err.clone());
            }
        }
        tracing::error!(error = %err, "fatal engine error");
        if let Some(cb) = &self.callback {
            cb(ctx, Some(&err));
            return;
        }
        let Some(tx) = self.stream_tx.lock().clone() else {
            return;
        };
        tokio::select! {
            biased;
            _ = ctx.done() => {}
            _ = tx.send(Err(err)) => {}
        }
    }

    /// Drop the producer half so the consumer task drains and exits.
    pub fn close_input(&self) {
        self.ag_tx.lock().take();
    }

    /// Close the outward stream.
    pub fn close_stream(&self) {
        self.stream_tx.lock().take();
    }

    /// The first fatal error seen, if any.
    pub fn fatal(&self) -> Option<Error> {
        self.fatal.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_send_activity_coalesces() {
        let ag = Aggregator::new(None);
        assert!(matches!(ag.try_send_activity(), ActivitySend::Sent));
        assert!(
            matches!(ag.try_send_activity(), ActivitySend::Full),
            "second event must not block, the channel holds one"
        );
    }

    #[tokio::test]
    async fn test_first_fatal_error_wins() {
        let ag = Aggregator::new(None);
        let ctx = Context::background();
        let mut stream = ag.take_stream().unwrap();

        ag.forward_error(Error::custom("first"), &ctx).await;
        assert!(stream.recv().await.unwrap().is_err());
        ag.forward_error(Error::custom("second"), &ctx).await;

        assert_eq!(ag.fatal().unwrap().to_string(), "first");
    }

    #[tokio::test]
    async fn test_callback_replaces_stream() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb: Callback = {
            let seen = seen.clone();
            Arc::new(move |_ctx, err| {
                seen.lock().push(err.map(|e| e.to_string()));
            })
        };
        let ag = Aggregator::new(Some(cb));
        let ctx = Context::background();

        ag.forward_activity(&ctx).await;
        ag.forward_error(Error::custom("boom"), &ctx).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], None);
        assert_eq!(seen[1], Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_send_error_abandoned_when_ctx_done() {
        let ag = Aggregator::new(None);
        let (ctx, cancel) = Context::new();
        cancel.cancel();

        // Fill the channel so a real send would block.
        assert!(matches!(ag.try_send_activity(), ActivitySend::Sent));
        ag.send_error(Error::custom("late"), &ctx).await; // returns promptly
    }
}
