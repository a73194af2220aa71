//! The function contract: the node type executed by the engine.
//!
//! A [`Func`] is a long-lived producer. The engine assembles struct-shaped
//! inputs from its incoming edges and sends them on the input channel handed
//! over in [`Init`]; the function emits any number of output values on the
//! output channel, and the engine stores the latest one, deduplicates equal
//! consecutive values, and fans it out downstream.
//!
//! The contract, in order:
//!
//! 1. [`Func::info`] describes the signature (named input fields, output
//!    kind) plus advisory purity/memoization hints.
//! 2. [`Func::validate`] checks static parameters before the function joins
//!    a graph.
//! 3. [`Func::init`] receives the runtime handles ([`Init`]). It is invoked
//!    exactly once per time the function's vertex is (re-)created; a
//!    function added again after deletion is initialized again with fresh
//!    channels.
//! 4. [`Func::stream`] runs as its own task until its context is cancelled
//!    or its input closes. It must close its output channel before
//!    returning (dropping the sender does this). Returning `Ok(())` is
//!    normal termination; an error is fatal to the engine run.
//!
//! Functions are compared by *handle identity*, never by content: two
//! separately created functions with identical descriptions are distinct
//! vertices. [`FuncRef`] implements that identity.

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::txn::Txn;
use crate::value::{Kind, Value};

/// A named input field of a function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: String,
    pub kind: Kind,
}

impl Arg {
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        Arg {
            name: name.into(),
            kind,
        }
    }
}

/// A function signature: an ordered set of named input fields and an output
/// kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sig {
    pub args: Vec<Arg>,
    pub out: Kind,
}

impl Sig {
    /// A signature with no inputs (a source function).
    pub fn source(out: Kind) -> Self {
        Sig {
            args: Vec::new(),
            out,
        }
    }

    pub fn new(args: Vec<Arg>, out: Kind) -> Self {
        Sig { args, out }
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> Vec<String> {
        self.args.iter().map(|a| a.name.clone()).collect()
    }

    /// Reject signatures that declare a field name twice.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for arg in &self.args {
            if !seen.insert(arg.name.as_str()) {
                return Err(Error::DuplicateSigField(arg.name.clone()));
            }
        }
        Ok(())
    }
}

/// Static description of a function: signature plus advisory hints.
///
/// `pure` and `memo` are hints for front-ends and optimizers; the engine
/// itself does not act on them.
#[derive(Debug, Clone)]
pub struct Info {
    pub pure: bool,
    pub memo: bool,
    pub sig: Sig,
}

/// Opaque handle to the surrounding world (filesystem, cluster, whatever the
/// embedding application provides). The engine passes it through to
/// functions untouched; functions downcast it to the concrete type they
/// expect.
pub trait World: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Runtime handles passed to [`Func::init`].
///
/// Implementations typically store the whole record behind interior
/// mutability and take it at the top of [`Func::stream`].
pub struct Init {
    /// Hostname of the machine the engine runs on.
    pub hostname: String,
    /// Assembled input structs arrive here. Closed by the engine once all
    /// upstream functions are terminal.
    pub input: mpsc::Receiver<Value>,
    /// Output values leave here. The function must close it (drop it)
    /// before `stream` returns.
    pub output: mpsc::Sender<Value>,
    /// A transaction handle scoped to the owning engine, letting a running
    /// function rewrite the graph it is part of.
    pub txn: Txn,
    /// World handle, if the driver supplied one.
    pub world: Option<Arc<dyn World>>,
    /// Engine debug flag.
    pub debug: bool,
    /// A tracing span named after this function; implementations instrument
    /// their stream with it.
    pub span: tracing::Span,
}

impl fmt::Debug for Init {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Init")
            .field("hostname", &self.hostname)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

/// The node contract. See the module docs for the lifecycle.
#[async_trait]
pub trait Func: Send + Sync + fmt::Display {
    /// Signature and advisory hints.
    fn info(&self) -> Info;

    /// Static sanity of parameters; runs before the function joins a graph.
    fn validate(&self) -> Result<()>;

    /// Receive runtime handles. Called once per vertex creation; must not
    /// block and must not commit transactions.
    fn init(&self, init: Init) -> Result<()>;

    /// Run until cancelled or until the input channel closes. Must close
    /// the output channel before returning.
    async fn stream(&self, ctx: Context) -> Result<()>;
}

/// A shared, identity-comparing handle to a [`Func`].
///
/// Equality and hashing use the address of the underlying allocation, so a
/// `FuncRef` and its clones are one vertex while a separately constructed
/// function with identical content is another.
#[derive(Clone)]
pub struct FuncRef(Arc<dyn Func>);

impl FuncRef {
    pub fn new(func: impl Func + 'static) -> Self {
        FuncRef(Arc::new(func))
    }

    pub fn from_arc(func: Arc<dyn Func>) -> Self {
        FuncRef(func)
    }

    // Thin data pointer of the allocation; stable for the Arc's lifetime.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl Deref for FuncRef {
    type Target = dyn Func;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for FuncRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for FuncRef {}

impl Hash for FuncRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Display for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Debug adds the handle address so log lines can distinguish same-named
// vertices.
impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FuncRef({} @ {:#x})", self.0, self.addr())
    }
}
