//! End-to-end engine tests: build a graph through transactions, run the
//! loop, and observe the event stream and value table.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use streamdag_graph::{DagError, Edge};

use crate::context::{Cancel, Context};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::func::{Arg, Func, FuncRef, Info, Init, Sig};
use crate::funcs::{ConstFunc, MapFunc};
use crate::value::{Kind, Value};

const WAIT: Duration = Duration::from_secs(5);

async fn start(name: &str) -> (Engine, Cancel, JoinHandle<Result<()>>) {
    let engine = Engine::builder(name).hostname("testhost").build();
    engine.setup().unwrap();
    let (ctx, cancel) = Context::new();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(ctx).await })
    };
    timeout(WAIT, engine.started()).await.expect("engine must start");
    (engine, cancel, runner)
}

async fn recv_event(events: &mut mpsc::Receiver<Event>) -> Event {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed unexpectedly")
}

/// Poll the value table until `f`'s entry renders as `want`.
async fn wait_for_value(engine: &Engine, f: &FuncRef, want: &str) {
    timeout(WAIT, async {
        loop {
            if let Some(v) = engine.table().get(f) {
                if v.to_string() == want {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("table never showed {want} for {f}"));
}

fn edge(args: &[&str]) -> Edge {
    Edge::new(args.iter().copied()).unwrap()
}

fn const_str(name: &str, value: &str) -> FuncRef {
    FuncRef::new(ConstFunc::new(name, Value::str(value)))
}

/// Pass one string field through, optionally transformed.
fn map_str(name: &str, field: &str, f: impl Fn(String) -> String + Send + Sync + 'static) -> FuncRef {
    let field = field.to_string();
    FuncRef::new(MapFunc::from_fn(
        name,
        vec![Arg::new(field.clone(), Kind::Str)],
        Kind::Str,
        move |fields| {
            let Some(Value::Str(s)) = fields.get(&field) else {
                return Err(Error::custom("missing input field"));
            };
            Ok(Value::str(f(s.clone())))
        },
    ))
}

/// A source that emits a fixed sequence of values, then exits.
struct SeqFunc {
    name: String,
    values: Vec<Value>,
    init: Mutex<Option<Init>>,
}

impl SeqFunc {
    fn new(name: &str, values: Vec<Value>) -> Self {
        SeqFunc {
            name: name.to_string(),
            values,
            init: Mutex::new(None),
        }
    }
}

impl fmt::Display for SeqFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait]
impl Func for SeqFunc {
    fn info(&self) -> Info {
        Info {
            pure: false,
            memo: false,
            sig: Sig::source(Kind::Str),
        }
    }
    fn validate(&self) -> Result<()> {
        Ok(())
    }
    fn init(&self, init: Init) -> Result<()> {
        *self.init.lock() = Some(init);
        Ok(())
    }
    async fn stream(&self, ctx: Context) -> Result<()> {
        let Init {
            mut input, output, ..
        } = self.init.lock().take().ok_or_else(|| Error::Uninitialized {
            func: self.name.clone(),
        })?;
        tokio::select! {
            _ = ctx.done() => return Ok(()),
            _ = input.recv() => {}
        }
        for value in self.values.clone() {
            tokio::select! {
                _ = ctx.done() => return Ok(()),
                res = output.send(value) => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// A source whose stream misbehaves in a configurable way.
enum Misbehavior {
    ExitWithoutLoading,
    Fail(&'static str),
    Panic(&'static str),
}

struct BadFunc {
    name: String,
    mode: Misbehavior,
    init: Mutex<Option<Init>>,
}

impl BadFunc {
    fn new(name: &str, mode: Misbehavior) -> Self {
        BadFunc {
            name: name.to_string(),
            mode,
            init: Mutex::new(None),
        }
    }
}

impl fmt::Display for BadFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait]
impl Func for BadFunc {
    fn info(&self) -> Info {
        Info {
            pure: false,
            memo: false,
            sig: Sig::source(Kind::Str),
        }
    }
    fn validate(&self) -> Result<()> {
        Ok(())
    }
    fn init(&self, init: Init) -> Result<()> {
        *self.init.lock() = Some(init);
        Ok(())
    }
    async fn stream(&self, _ctx: Context) -> Result<()> {
        let _init = self.init.lock().take();
        match self.mode {
            Misbehavior::ExitWithoutLoading => Ok(()),
            Misbehavior::Fail(msg) => Err(Error::custom(msg)),
            Misbehavior::Panic(msg) => panic!("{}", msg),
        }
    }
}

#[tokio::test]
async fn test_empty_graph_runs_and_exits_cleanly() {
    let (engine, cancel, runner) = start("empty").await;
    let mut events = engine.stream().unwrap();

    // Lock then unlock with no edits.
    let guard = engine.lock().await.unwrap();
    guard.unlock().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        events.try_recv().is_err(),
        "an empty graph must emit no aggregate events"
    );

    cancel.cancel();
    runner.await.unwrap().unwrap();
    engine.cleanup().unwrap();
}

#[tokio::test]
async fn test_single_vertex_emits_and_loads() {
    let (engine, cancel, runner) = start("single").await;
    let mut events = engine.stream().unwrap();

    let f1 = const_str("f1", "hello");
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();

    assert!(recv_event(&mut events).await.is_ok());
    timeout(WAIT, engine.loaded()).await.expect("engine must load");
    assert_eq!(engine.table()[&f1].to_string(), "hello");
    assert_eq!(engine.num_vertices(), 1);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_single_edge_feeds_downstream() {
    let (engine, cancel, runner) = start("edge").await;
    let mut events = engine.stream().unwrap();

    let f1 = const_str("f1", "hello");
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(recv_event(&mut events).await.is_ok());

    // Connect a second vertex later, while the engine runs.
    let f2 = map_str("f2", "e1", |s| format!("{s}world"));
    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["e1"]));
    txn.commit().await.unwrap();

    assert!(recv_event(&mut events).await.is_ok());
    wait_for_value(&engine, &f2, "helloworld").await;

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_diamond_assembles_exact_field_set() {
    let (engine, cancel, runner) = start("diamond").await;
    let mut events = engine.stream().unwrap();

    let seen_fields: Arc<Mutex<Option<Vec<String>>>> = Arc::new(Mutex::new(None));

    let f1 = const_str("f1", "v");
    let f2 = map_str("f2", "e1", |s| format!("{s}2"));
    let f3 = map_str("f3", "e2", |s| format!("{s}3"));
    let f4 = {
        let seen = seen_fields.clone();
        FuncRef::new(MapFunc::from_fn(
            "f4",
            vec![Arg::new("e3", Kind::Str), Arg::new("e4", Kind::Str)],
            Kind::Str,
            move |fields| {
                *seen.lock() = Some(fields.keys().cloned().collect());
                let (Some(Value::Str(a)), Some(Value::Str(b))) =
                    (fields.get("e3"), fields.get("e4"))
                else {
                    return Err(Error::custom("missing diamond inputs"));
                };
                Ok(Value::str(format!("{a}+{b}")))
            },
        ))
    };

    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["e1"]))
        .add_edge(f1.clone(), f3.clone(), edge(&["e2"]))
        .add_edge(f2.clone(), f4.clone(), edge(&["e3"]))
        .add_edge(f3.clone(), f4.clone(), edge(&["e4"]));
    txn.commit().await.unwrap();

    assert!(recv_event(&mut events).await.is_ok());
    wait_for_value(&engine, &f4, "v2+v3").await;
    assert_eq!(
        seen_fields.lock().clone().unwrap(),
        vec!["e3".to_string(), "e4".to_string()],
        "the input struct keys must be exactly the incoming arg names"
    );

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_add_then_delete_vertex_does_not_deadlock() {
    let (engine, cancel, runner) = start("add-delete").await;
    let mut events = engine.stream().unwrap();

    let f1 = const_str("f1", "x");
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(recv_event(&mut events).await.is_ok());

    let txn = engine.txn();
    txn.delete_vertex(f1.clone());
    timeout(WAIT, txn.commit())
        .await
        .expect("delete commit must not deadlock")
        .unwrap();

    assert!(!engine.table().contains_key(&f1));
    assert!(!engine.has_vertex(&f1));
    assert_eq!(engine.num_vertices(), 0);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cycle_is_rejected_and_graph_unchanged() {
    let (engine, cancel, runner) = start("cycle").await;

    let f1 = const_str("f1", "x");
    let f2 = map_str("f2", "e1", |s| s);

    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();

    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["e1"]));
    txn.commit().await.unwrap();

    let txn = engine.txn();
    txn.add_edge(f2.clone(), f1.clone(), edge(&["e2"]));
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, Error::Dag(DagError::WouldCycle)));

    assert!(engine.has_vertex(&f1));
    assert!(engine.has_vertex(&f2));
    assert!(engine.find_edge(&f1, &f2).is_some());
    assert!(engine.find_edge(&f2, &f1).is_none());

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicate_arg_merge() {
    let (engine, cancel, runner) = start("merge").await;

    let f1 = const_str("f1", "x");
    let f2 = FuncRef::new(MapFunc::from_fn(
        "f2",
        vec![Arg::new("a", Kind::Str), Arg::new("b", Kind::Str)],
        Kind::Str,
        |fields| {
            Ok(Value::str(format!(
                "{}{}",
                fields.get("a").unwrap(),
                fields.get("b").unwrap()
            )))
        },
    ));

    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["a"]));
    txn.commit().await.unwrap();

    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["b"]));
    txn.commit().await.unwrap();

    let merged = engine.find_edge(&f1, &f2).expect("one merged edge");
    assert_eq!(
        merged.args().iter().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "b".to_string()]
    );

    // Re-adding an existing arg must fail.
    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["a"]));
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, Error::Dag(DagError::DuplicateArg(ref a)) if a == "a"));

    wait_for_value(&engine, &f2, "xx").await;

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_equal_values_are_suppressed() {
    let (engine, cancel, runner) = start("dedup").await;
    let mut events = engine.stream().unwrap();

    let f1 = FuncRef::new(SeqFunc::new(
        "f1",
        vec![Value::str("x"), Value::str("x")],
    ));
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();

    assert!(recv_event(&mut events).await.is_ok());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        events.try_recv().is_err(),
        "an equal value must not produce a second aggregate event"
    );
    assert_eq!(engine.table()[&f1].to_string(), "x");

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_distinct_values_produce_more_events() {
    use futures::StreamExt;

    let (engine, cancel, runner) = start("seq").await;
    let mut events = engine.event_stream().unwrap();

    let f1 = FuncRef::new(SeqFunc::new(
        "f1",
        vec![Value::str("x"), Value::str("y")],
    ));
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();

    let event = timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed unexpectedly");
    assert!(event.is_ok());
    wait_for_value(&engine, &f1, "y").await;

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stream_error_is_fatal() {
    let (engine, _cancel, runner) = start("fail").await;
    let mut events = engine.stream().unwrap();

    let f1 = FuncRef::new(BadFunc::new("f1", Misbehavior::Fail("boom")));
    let txn = engine.txn();
    txn.add_vertex(f1);
    txn.commit().await.unwrap();

    let event = recv_event(&mut events).await;
    assert!(matches!(event, Err(Error::Custom(ref m)) if m == "boom"));

    let run_result = timeout(WAIT, runner).await.unwrap().unwrap();
    assert!(matches!(run_result, Err(Error::Custom(ref m)) if m == "boom"));
}

#[tokio::test]
async fn test_exit_before_loading_is_synthesized_into_an_error() {
    let (engine, _cancel, runner) = start("notloaded").await;
    let mut events = engine.stream().unwrap();

    let f1 = FuncRef::new(BadFunc::new("f1", Misbehavior::ExitWithoutLoading));
    let txn = engine.txn();
    txn.add_vertex(f1);
    txn.commit().await.unwrap();

    let event = recv_event(&mut events).await;
    assert!(matches!(event, Err(Error::NotLoaded { ref func }) if func == "f1"));

    let run_result = timeout(WAIT, runner).await.unwrap().unwrap();
    assert!(matches!(run_result, Err(Error::NotLoaded { .. })));
}

#[tokio::test]
async fn test_panic_in_stream_is_recovered() {
    let (engine, _cancel, runner) = start("panic").await;
    let mut events = engine.stream().unwrap();

    let f1 = FuncRef::new(BadFunc::new("f1", Misbehavior::Panic("kaboom")));
    let txn = engine.txn();
    txn.add_vertex(f1);
    txn.commit().await.unwrap();

    let event = recv_event(&mut events).await;
    assert!(matches!(event, Err(Error::Panic(ref m)) if m.contains("kaboom")));

    let run_result = timeout(WAIT, runner).await.unwrap().unwrap();
    assert!(matches!(run_result, Err(Error::Panic(_))));
}

#[tokio::test]
async fn test_reverse_undoes_a_commit() {
    let (engine, cancel, runner) = start("reverse").await;

    let f1 = const_str("f1", "x");
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(engine.has_vertex(&f1));

    txn.reverse().await.unwrap();
    assert!(!engine.has_vertex(&f1));
    assert!(!engine.table().contains_key(&f1));

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reverse_releases_vertices_created_by_add_edge() {
    let (engine, cancel, runner) = start("reverse-edge").await;

    let f1 = const_str("f1", "x");
    let f2 = map_str("f2", "e1", |s| s);

    // Both endpoints are created by the edge add itself.
    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["e1"]));
    txn.commit().await.unwrap();
    assert!(engine.has_vertex(&f1));
    assert!(engine.has_vertex(&f2));

    txn.reverse().await.unwrap();
    assert!(engine.find_edge(&f1, &f2).is_none());
    assert!(
        !engine.has_vertex(&f1),
        "reverse must release the endpoint the add created"
    );
    assert!(
        !engine.has_vertex(&f2),
        "reverse must release the endpoint the add created"
    );
    assert_eq!(engine.num_vertices(), 0);
    assert!(engine.table().is_empty());

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reverse_of_edge_keeps_separately_referenced_vertex() {
    let (engine, cancel, runner) = start("reverse-edge-held").await;

    let f1 = const_str("f1", "x");
    let holder = engine.txn();
    holder.add_vertex(f1.clone());
    holder.commit().await.unwrap();

    let f2 = map_str("f2", "e1", |s| s);
    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["e1"]));
    txn.commit().await.unwrap();

    txn.reverse().await.unwrap();
    assert!(engine.find_edge(&f1, &f2).is_none());
    assert!(
        engine.has_vertex(&f1),
        "the vertex add's reference must survive the edge reversal"
    );
    assert!(!engine.has_vertex(&f2));

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_commit_keeps_prefix_until_reversed() {
    let (engine, cancel, runner) = start("partial").await;

    let f1 = const_str("f1", "x");
    let txn = engine.txn();
    // The second op is a self-loop and fails; the first stays applied.
    txn.add_vertex(f1.clone())
        .add_edge(f1.clone(), f1.clone(), edge(&["a"]));
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, Error::Dag(DagError::SelfLoop)));
    assert!(engine.has_vertex(&f1), "applied prefix remains");

    txn.reverse().await.unwrap();
    assert!(!engine.has_vertex(&f1), "reverse rolls the prefix back");

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_vertex_refcount_survives_double_add() {
    let (engine, cancel, runner) = start("refcount").await;

    let f1 = const_str("f1", "x");
    let txn_a = engine.txn();
    txn_a.add_vertex(f1.clone());
    txn_a.commit().await.unwrap();

    let txn_b = txn_a.copy();
    txn_b.add_vertex(f1.clone());
    txn_b.commit().await.unwrap();

    // First release: still referenced by the other holder.
    let txn = engine.txn();
    txn.delete_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(engine.has_vertex(&f1));

    // Second release destroys it.
    let txn = engine.txn();
    txn.delete_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(!engine.has_vertex(&f1));

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_partial_arg_release_shrinks_edge() {
    let (engine, cancel, runner) = start("shrink").await;

    let f1 = const_str("f1", "x");
    let f2 = FuncRef::new(MapFunc::from_fn(
        "f2",
        vec![Arg::new("a", Kind::Str), Arg::new("b", Kind::Str)],
        Kind::Str,
        |_| Ok(Value::str("unused")),
    ));

    let txn = engine.txn();
    txn.add_edge(f1.clone(), f2.clone(), edge(&["a", "b"]));
    txn.commit().await.unwrap();

    let slot = engine.find_edge(&f1, &f2).unwrap();
    let txn = engine.txn();
    txn.delete_edge(slot.with_args(["a"]).unwrap());
    txn.commit().await.unwrap();

    let remaining = engine.find_edge(&f1, &f2).expect("edge still present");
    assert_eq!(
        remaining.args().iter().cloned().collect::<Vec<_>>(),
        vec!["b".to_string()]
    );

    let txn = engine.txn();
    txn.delete_edge(slot.with_args(["b"]).unwrap());
    txn.commit().await.unwrap();
    assert!(
        engine.find_edge(&f1, &f2).is_none(),
        "releasing the last arg removes the edge"
    );

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stats_snapshot() {
    let (engine, cancel, runner) = start("stats").await;
    let mut events = engine.stream().unwrap();

    let f1 = const_str("f1", "x");
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(recv_event(&mut events).await.is_ok());

    let stats = engine.stats();
    assert_eq!(stats.num_vertices, 1);
    let fs = &stats.funcs["f1"];
    assert!(fs.loaded);
    assert!(fs.is_leaf);
    let text = stats.to_string();
    assert!(text.contains("f1:"));

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_delete_then_readd_same_identity() {
    let (engine, cancel, runner) = start("readd").await;

    let f1 = const_str("f1", "x");
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();
    wait_for_value(&engine, &f1, "x").await;

    let txn = engine.txn();
    txn.delete_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(!engine.has_vertex(&f1));

    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();
    assert!(engine.has_vertex(&f1));
    wait_for_value(&engine, &f1, "x").await;

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_commit_from_inside_a_stream() {
    // A function that uses its Init txn to grow the graph while running.
    struct GrowFunc {
        name: String,
        init: Mutex<Option<Init>>,
    }

    impl fmt::Display for GrowFunc {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.name)
        }
    }

    #[async_trait]
    impl Func for GrowFunc {
        fn info(&self) -> Info {
            Info {
                pure: false,
                memo: false,
                sig: Sig::source(Kind::Str),
            }
        }
        fn validate(&self) -> Result<()> {
            Ok(())
        }
        fn init(&self, init: Init) -> Result<()> {
            *self.init.lock() = Some(init);
            Ok(())
        }
        async fn stream(&self, ctx: Context) -> Result<()> {
            let Init {
                mut input,
                output,
                txn,
                ..
            } = self.init.lock().take().ok_or_else(|| Error::Uninitialized {
                func: self.name.clone(),
            })?;
            tokio::select! {
                _ = ctx.done() => return Ok(()),
                _ = input.recv() => {}
            }
            tokio::select! {
                _ = ctx.done() => return Ok(()),
                res = output.send(Value::str("grown")) => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
            }
            // Rewrite the graph from inside the graph.
            let child = const_str("child", "leafvalue");
            txn.add_vertex(child);
            txn.commit().await?;
            Ok(())
        }
    }

    let (engine, cancel, runner) = start("grow").await;

    let f1 = FuncRef::new(GrowFunc {
        name: "grower".to_string(),
        init: Mutex::new(None),
    });
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    timeout(WAIT, txn.commit())
        .await
        .expect("outer commit must not deadlock")
        .unwrap();

    // The child vertex shows up once the grower's own commit lands.
    timeout(WAIT, async {
        loop {
            if engine.num_vertices() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("vertex added from inside a stream must appear");

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_callback_mode_receives_events() {
    let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let engine = {
        let seen = seen.clone();
        Engine::builder("callback")
            .callback(Arc::new(move |_ctx, err| {
                seen.lock().push(err.map(|e| e.to_string()));
            }))
            .build()
    };
    engine.setup().unwrap();
    let (ctx, cancel) = Context::new();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(ctx).await })
    };
    timeout(WAIT, engine.started()).await.unwrap();

    let f1 = const_str("f1", "x");
    let txn = engine.txn();
    txn.add_vertex(f1.clone());
    txn.commit().await.unwrap();
    wait_for_value(&engine, &f1, "x").await;

    timeout(WAIT, async {
        loop {
            if !seen.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("callback must fire");
    assert_eq!(seen.lock()[0], None, "activity events carry no error");

    cancel.cancel();
    runner.await.unwrap().unwrap();
}
