//! Operators and the table the engine looks them up in.
//!
//! An [`Operator`] is a pluggable computation step. It receives the resolved
//! arguments of a node (literal strings, or the output directories of the
//! nodes it references) and a scratch directory to write its results into.
//! The engine never looks inside the scratch directory; once the operator
//! returns successfully the directory is published as the node's output.
//!
//! Operators are collected in a [`Registry`] before anything runs. The
//! registry is a plain value, so independent engines can carry different
//! operator tables.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cancel::Cancellation;
use crate::error::{Interrupt, RegistryError};
use crate::graph::is_valid_operator_name;

/// Result of a single operator invocation.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// A resolved node argument, as seen by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Literal string from the graph.
    Literal(String),
    /// Output directory of a referenced node.
    Dir(Utf8PathBuf),
}

impl Value {
    pub fn as_str(&self) -> &str {
        match self {
            Value::Literal(value) => value,
            Value::Dir(dir) => dir.as_str(),
        }
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Value::Literal(value) => Some(value),
            Value::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&Utf8Path> {
        match self {
            Value::Dir(dir) => Some(dir),
            Value::Literal(_) => None,
        }
    }
}

/// The context passed to every operator invocation.
pub struct OpContext<'a> {
    pub(crate) node: &'a str,
    pub(crate) args: &'a [Value],
    pub(crate) scratch: &'a Utf8Path,
    pub(crate) cancellation: &'a Cancellation,
}

impl<'a> OpContext<'a> {
    /// Name of the node being built.
    pub fn node(&self) -> &str {
        self.node
    }

    pub fn args(&self) -> &[Value] {
        self.args
    }

    /// Directory the operator writes its outputs into.
    pub fn scratch(&self) -> &Utf8Path {
        self.scratch
    }

    /// Returns the literal at `index`, or a descriptive error.
    pub fn literal(&self, index: usize) -> TaskResult<&str> {
        match self.args.get(index) {
            Some(Value::Literal(value)) => Ok(value),
            Some(Value::Dir(_)) => anyhow::bail!("argument {index} must be a literal"),
            None => anyhow::bail!("missing argument {index}"),
        }
    }

    /// Returns the input directory at `index`, or a descriptive error.
    pub fn dir(&self, index: usize) -> TaskResult<&Utf8Path> {
        match self.args.get(index) {
            Some(Value::Dir(dir)) => Ok(dir),
            Some(Value::Literal(_)) => anyhow::bail!("argument {index} must be a node"),
            None => anyhow::bail!("missing argument {index}"),
        }
    }

    /// Fails once the run was cancelled or ran past its deadline. Long
    /// running operators should call this between units of work.
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        self.cancellation.check()
    }
}

/// A named, pluggable computation step.
pub trait Operator: Send + Sync {
    fn run(&self, ctx: &OpContext<'_>) -> TaskResult<()>;

    /// Optional version identifier. When present it becomes part of the
    /// fingerprint of every node using this operator, so bumping it
    /// invalidates previously cached outputs.
    fn version(&self) -> Option<&str> {
        None
    }
}

/// Wraps a plain closure as an [`Operator`].
struct FnOperator<F> {
    callback: F,
    version: Option<String>,
}

impl<F> Operator for FnOperator<F>
where
    F: Fn(&[Value], &Utf8Path) -> TaskResult<()> + Send + Sync,
{
    fn run(&self, ctx: &OpContext<'_>) -> TaskResult<()> {
        (self.callback)(ctx.args(), ctx.scratch())
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Name to operator table.
#[derive(Default, Clone)]
pub struct Registry {
    operators: BTreeMap<String, Arc<dyn Operator>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `operator` under `name`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use memodag::{Registry, Value};
    ///
    /// let mut registry = Registry::new();
    /// registry.register_fn("Const", |args: &[Value], scratch: &camino::Utf8Path| {
    ///     std::fs::write(scratch.join("value.txt"), args[0].as_str())?;
    ///     Ok(())
    /// })?;
    /// # Ok::<(), memodag::RegistryError>(())
    /// ```
    pub fn register<O>(&mut self, name: impl Into<String>, operator: O) -> Result<&mut Self, RegistryError>
    where
        O: Operator + 'static,
    {
        self.insert(name.into(), Arc::new(operator))
    }

    /// Registers a closure taking the resolved arguments and the scratch
    /// directory.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, callback: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(&[Value], &Utf8Path) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.register(
            name,
            FnOperator {
                callback,
                version: None,
            },
        )
    }

    /// Like [`Registry::register_fn`], with a version that is hashed into
    /// fingerprints.
    pub fn register_fn_versioned<F>(
        &mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        callback: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(&[Value], &Utf8Path) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.register(
            name,
            FnOperator {
                callback,
                version: Some(version.into()),
            },
        )
    }

    fn insert(&mut self, name: String, operator: Arc<dyn Operator>) -> Result<&mut Self, RegistryError> {
        if !is_valid_operator_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }

        if self.operators.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        self.operators.insert(name, operator);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Operator>> {
        self.operators.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub(crate) fn version_of(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|operator| operator.version())
            .map(str::to_string)
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.operators.keys()).finish()
    }
}
