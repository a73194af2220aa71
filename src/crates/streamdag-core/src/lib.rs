//! # streamdag-core - Dynamic Dataflow Execution
//!
//! A runtime that holds a directed acyclic graph of *function* vertices,
//! streams values along its edges, and lets the graph be rewritten while
//! execution is in progress.
//!
//! ## Overview
//!
//! Each vertex is a long-lived producer implementing [`Func`]: it consumes
//! struct-shaped inputs whose fields are named by its incoming edge
//! arguments, and emits a sequence of output [`Value`]s. The engine:
//!
//! - **Assembles consistent inputs** - a vertex only receives a struct once
//!   every one of its signature fields has an upstream value, and the
//!   struct's key set always equals the incoming argument set
//! - **Deduplicates** - consecutive equal emissions (per [`Value::cmp`]) are
//!   dropped before they reach the value table
//! - **Aggregates leaf activity** - once every vertex has loaded, each burst
//!   of new leaf output becomes one event on the engine's stream (or
//!   callback)
//! - **Applies transactional rewrites** - [`Txn`] batches reversible
//!   add/delete operations, committed atomically between loop iterations
//!   via a pause/resume handshake, with vertices and edge arguments
//!   reference-counted across concurrent transaction holders
//!
//! ## Core Concepts
//!
//! ### 1. The execution loop
//!
//! A single loop task wakes on a coalescing channel, walks the graph in
//! topological order, forwards assembled inputs, and sleeps again. Every
//! vertex additionally owns two tasks: its stream (the user code) and an
//! output consumer feeding the value table. Iterations are preemptible and
//! restartable, so vertices must tolerate duplicate inputs.
//!
//! ### 2. Transactions
//!
//! ```rust,no_run
//! # async fn example(engine: streamdag_core::Engine,
//! #                  f1: streamdag_core::FuncRef,
//! #                  f2: streamdag_core::FuncRef) -> streamdag_core::Result<()> {
//! use streamdag_core::Edge;
//!
//! let txn = engine.txn();
//! txn.add_vertex(f1.clone())
//!    .add_edge(f1, f2, Edge::new(["input"])?);
//! txn.commit().await?;
//! // ...
//! txn.reverse().await?; // undo the commit
//! # Ok(())
//! # }
//! ```
//!
//! Commits fail synchronously on structural problems (cycles, duplicate
//! argument names, releasing references never taken); the applied prefix of
//! a failed commit stays in place until the caller reverses it.
//!
//! ### 3. Events and errors
//!
//! Structural errors come back from `commit`. Runtime errors (a stream
//! failing, exiting before it ever produced, or panicking) surface once
//! through [`Engine::stream`] and stop the run. Cancellation is silent: the
//! stream closes and [`Engine::run`] returns `Ok`.
//!
//! ## Crate Layout
//!
//! | module | contents |
//! |--------|----------|
//! | [`engine`] | the engine, its builder, guard, and loop |
//! | [`func`] | the [`Func`] contract, signatures, identity handles |
//! | [`funcs`] | built-in functions ([`funcs::ConstFunc`], [`funcs::MapFunc`]) |
//! | [`value`] | the [`Value`]/[`Kind`] model |
//! | [`txn`] | transactional graph mutation |
//! | [`context`] | cooperative cancellation |
//! | [`event`] | outward event types |
//! | [`stats`] | introspection snapshots |
//! | [`util`] | timer helpers |
//!
//! The graph store itself lives in the `streamdag-graph` crate and is
//! re-exported here as [`Dag`], [`Edge`] and [`DagError`].

pub mod context;
mod coordinator;
pub mod engine;
pub mod error;
pub mod event;
pub mod func;
pub mod funcs;
mod refcount;
mod state;
pub mod stats;
pub mod txn;
pub mod util;
pub mod value;

pub use context::{Cancel, Context};
pub use engine::{Engine, EngineBuilder, EngineGuard};
pub use error::{Error, Result};
pub use event::{Callback, Event};
pub use func::{Arg, Func, FuncRef, Info, Init, Sig, World};
pub use stats::{FuncStats, Stats};
pub use txn::Txn;
pub use value::{Kind, Value, ValueError};

pub use streamdag_graph::{Dag, DagError, Edge};
