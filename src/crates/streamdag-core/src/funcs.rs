//! Built-in functions.
//!
//! Two small node implementations ship with the engine: [`ConstFunc`] emits
//! one constant value, and [`MapFunc`] recomputes a closure over every
//! assembled input struct. They are the wiring bricks for demos and tests;
//! real applications implement [`Func`] directly.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::func::{Arg, Func, Info, Init, Sig};
use crate::value::Value;

/// A source function that emits a single constant value and exits.
///
/// It waits until the engine closes its (empty) input, sends the constant,
/// closes its output and returns cleanly.
pub struct ConstFunc {
    name: String,
    value: Value,
    init: Mutex<Option<Init>>,
}

impl ConstFunc {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        ConstFunc {
            name: name.into(),
            value,
            init: Mutex::new(None),
        }
    }
}

impl fmt::Display for ConstFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait]
impl Func for ConstFunc {
    fn info(&self) -> Info {
        Info {
            pure: true,
            memo: true,
            sig: Sig::source(self.value.kind()),
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
        let init = self.init.lock().take().ok_or_else(|| Error::Uninitialized {
            func: self.name.clone(),
        })?;
        let Init {
            mut input,
            output,
            span,
            ..
        } = init;
        let value = self.value.clone();

        async move {
            // No input fields exist, so the engine closes the channel right
            // away; wait for that before emitting.
            tokio::select! {
                biased;
                _ = ctx.done() => return Ok(()),
                _ = input.recv() => {}
            }
            tokio::select! {
                biased;
                _ = ctx.done() => {}
                res = output.send(value) => {
                    if res.is_err() {
                        tracing::trace!("output consumer gone before send");
                    }
                }
            }
            // Dropping `output` here closes it before we return.
            Ok(())
        }
        .instrument(span)
        .await
    }
}

/// The computation run by a [`MapFunc`] over each input struct.
pub type MapFn = Arc<dyn Fn(&BTreeMap<String, Value>) -> Result<Value> + Send + Sync>;

/// A function that applies a closure to every assembled input struct and
/// emits the result.
///
/// Equal consecutive results are deduplicated downstream by the engine, so
/// the closure may be called more often than new values appear.
pub struct MapFunc {
    name: String,
    sig: Sig,
    map: MapFn,
    init: Mutex<Option<Init>>,
}

impl MapFunc {
    pub fn new(name: impl Into<String>, sig: Sig, map: MapFn) -> Self {
        MapFunc {
            name: name.into(),
            sig,
            map,
            init: Mutex::new(None),
        }
    }

    /// Convenience constructor from field descriptions and a plain closure.
    pub fn from_fn<F>(name: impl Into<String>, args: Vec<Arg>, out: crate::value::Kind, f: F) -> Self
    where
        F: Fn(&BTreeMap<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(name, Sig::new(args, out), Arc::new(f))
    }
}

impl fmt::Display for MapFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait]
impl Func for MapFunc {
    fn info(&self) -> Info {
        Info {
            pure: true,
            memo: false,
            sig: self.sig.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        self.sig.validate()
    }

    fn init(&self, init: Init) -> Result<()> {
        *self.init.lock() = Some(init);
        Ok(())
    }

    async fn stream(&self, ctx: Context) -> Result<()> {
        let init = self.init.lock().take().ok_or_else(|| Error::Uninitialized {
            func: self.name.clone(),
        })?;
        let Init {
            mut input,
            output,
            span,
            ..
        } = init;
        let map = self.map.clone();
        let name = self.name.clone();

        async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = ctx.done() => break,
                    v = input.recv() => v,
                };
                let Some(value) = received else { break };
                let Value::Struct(fields) = value else {
                    return Err(Error::custom(format!(
                        "func '{name}' received a non-struct input"
                    )));
                };
                let out = map(&fields)?;
                tokio::select! {
                    biased;
                    _ = ctx.done() => break,
                    res = output.send(out) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Kind;

    #[test]
    fn test_const_func_info() {
        let f = ConstFunc::new("hello", Value::str("hello"));
        let info = f.info();
        assert!(info.pure);
        assert!(info.sig.args.is_empty());
        assert_eq!(info.sig.out, Kind::Str);
        assert_eq!(f.to_string(), "hello");
    }

    #[test]
    fn test_map_func_validates_signature() {
        let f = MapFunc::from_fn(
            "dup",
            vec![Arg::new("a", Kind::Int), Arg::new("a", Kind::Int)],
            Kind::Int,
            |_| Ok(Value::Int(0)),
        );
        assert!(f.validate().is_err());
    }

    #[tokio::test]
    async fn test_stream_without_init_fails() {
        let f = ConstFunc::new("f", Value::Int(1));
        let err = f.stream(Context::background()).await.unwrap_err();
        assert!(matches!(err, Error::Uninitialized { .. }));
    }
}
