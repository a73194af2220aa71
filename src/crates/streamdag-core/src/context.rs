//! Cooperative cancellation contexts.
//!
//! A [`Context`] is an observable cancellation signal built on
//! `tokio::sync::watch`. Contexts form a tree: a child created with
//! [`Context::child`] becomes done when its own [`Cancel`] fires *or* when
//! any ancestor does. The engine holds the root; every function gets a child,
//! so cancelling the engine reaches every function, while cancelling one
//! function (when its vertex is deleted) affects only that function.
//!
//! Dropping a [`Cancel`] cancels, so forgetting a handle can never leak a
//! task waiting forever.

use tokio::sync::watch;

/// The cancelling half of a context pair. Not cloneable: exactly one owner
/// decides when the context is done.
#[derive(Debug)]
pub struct Cancel {
    tx: watch::Sender<bool>,
}

impl Cancel {
    /// Mark the paired [`Context`] (and all its children) done.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for Cancel {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// An observable cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct Context {
    // One receiver per ancestor level; done when any reports true.
    parents: Vec<watch::Receiver<bool>>,
}

impl Context {
    /// A fresh root context and its cancel handle.
    pub fn new() -> (Context, Cancel) {
        let (tx, rx) = watch::channel(false);
        (Context { parents: vec![rx] }, Cancel { tx })
    }

    /// A context that is never done. Useful as the outermost parent in
    /// tests and simple drivers.
    pub fn background() -> Context {
        Context {
            parents: Vec::new(),
        }
    }

    /// Derive a child: done when this context is done or when the returned
    /// [`Cancel`] fires.
    pub fn child(&self) -> (Context, Cancel) {
        let (tx, rx) = watch::channel(false);
        let mut parents = self.parents.clone();
        parents.push(rx);
        (Context { parents }, Cancel { tx })
    }

    /// Whether the context is already done.
    pub fn is_done(&self) -> bool {
        self.parents.iter().any(|rx| *rx.borrow())
    }

    /// Wait until the context is done. Never resolves for
    /// [`Context::background`].
    pub async fn done(&self) {
        if self.parents.is_empty() {
            std::future::pending::<()>().await;
        }
        let waits = self
            .parents
            .iter()
            .map(|rx| {
                let mut rx = rx.clone();
                Box::pin(async move {
                    loop {
                        if *rx.borrow() {
                            return;
                        }
                        // A dropped sender counts as cancelled.
                        if rx.changed().await.is_err() {
                            return;
                        }
                    }
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            })
            .collect::<Vec<_>>();
        futures::future::select_all(waits).await;
    }
}
