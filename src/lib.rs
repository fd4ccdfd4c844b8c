#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cancel;
mod config;
mod core;
mod error;
mod executor;
mod fingerprint;
mod graph;
mod parser;
mod process;
mod registry;
mod store;
mod supervisor;
mod utils;

#[cfg(feature = "server")]
pub mod server;

pub use crate::cancel::CancelToken;
pub use crate::config::Config;
pub use crate::core::Fingerprint;
pub use crate::error::*;
pub use crate::executor::{Engine, NodeRun, Outputs, Planned, Report};
pub use crate::fingerprint::Fingerprints;
pub use crate::graph::{Argument, Graph, Node};
pub use crate::parser::parse;
pub use crate::process::Process;
pub use crate::registry::{OpContext, Operator, Registry, TaskResult, Value};
pub use crate::store::{Failure, Materialized, Store};
pub use crate::supervisor::{Status, Supervisor};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::utils::as_overhead;
