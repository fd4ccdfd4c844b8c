use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as OperatorError;

/// Structural problems with a node graph. These are detected before any
/// operator runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected in node graph at '{0}'")]
    Cycle(String),

    #[error("Node '{node}' references undefined node '{reference}'")]
    Dangling { node: String, reference: String },

    #[error("Node '{0}' is already defined")]
    Duplicate(String),

    #[error("Node '{node}' is malformed: {reason}")]
    Malformed { node: String, reason: &'static str },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Operator '{0}' is already registered")]
    Duplicate(String),

    #[error("Operator name '{0}' can't be used as a cache directory name")]
    InvalidName(String),
}

/// Filesystem failure inside the cache materializer.
#[derive(Debug, Error)]
#[error("Couldn't {action} '{path}'.\n{cause}")]
pub struct StoreError {
    pub(crate) action: &'static str,
    pub(crate) path: Utf8PathBuf,
    #[source]
    pub(crate) cause: io::Error,
}

impl StoreError {
    pub(crate) fn new(action: &'static str, path: impl Into<Utf8PathBuf>, cause: io::Error) -> Self {
        Self {
            action,
            path: path.into(),
            cause,
        }
    }

    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }
}

/// Reason an execution stopped before every node was ready.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Execution deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Node '{node}' uses unknown operator '{operator}'")]
    UnknownOperator { node: String, operator: String },

    #[error("Node '{node}' ({operator}) failed:\n{cause:#}")]
    Operator {
        node: String,
        operator: String,
        cause: OperatorError,
    },

    #[error("Node '{node}' ({operator}):\n{cause}")]
    Store {
        node: String,
        operator: String,
        #[source]
        cause: StoreError,
    },

    /// `node` is the node whose operator was stopped, or `None` when the run
    /// stopped between nodes.
    #[error("{}{interrupt}", in_node(.node))]
    Interrupted {
        node: Option<String>,
        interrupt: Interrupt,
    },

    #[error("Couldn't build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Execution thread panicked: {0}")]
    Panicked(String),
}

impl ExecError {
    /// Name of the node the error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            ExecError::UnknownOperator { node, .. }
            | ExecError::Operator { node, .. }
            | ExecError::Store { node, .. } => Some(node),
            ExecError::Interrupted { node, .. } => node.as_deref(),
            _ => None,
        }
    }
}

impl From<Interrupt> for ExecError {
    fn from(interrupt: Interrupt) -> Self {
        ExecError::Interrupted {
            node: None,
            interrupt,
        }
    }
}

fn in_node(node: &Option<String>) -> String {
    match node {
        Some(node) => format!("Node '{node}': "),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Another execution is already running")]
    Busy,

    #[error("Couldn't spawn the execution thread.\n{0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, io::Error),

    #[error("Couldn't parse config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),
}

/// Query text that couldn't be turned into a graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("expected `name = Operator(...)`")]
    MissingAssignment,

    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    #[error("missing '(' after operator name")]
    MissingOpenParen,

    #[error("missing ')' to close the argument list")]
    MissingCloseParen,

    #[error("unexpected input after argument list: '{0}'")]
    TrailingInput(String),

    #[error("empty argument")]
    EmptyArgument,

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected input after string literal: '{0}'")]
    TrailingLiteral(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
