use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use tracing::Dispatch;

use crate::registry::{OpContext, Operator, TaskResult, Value};

/// Operator running an external program.
///
/// The program is called with its fixed arguments, then every resolved node
/// argument (literal text, or the input directory path), then the scratch
/// directory to write outputs into. Output lines are forwarded to the log.
#[derive(Debug, Clone)]
pub struct Process {
    program: String,
    args: Vec<String>,
    poll: Duration,
    version: Option<String>,
}

impl Process {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            poll: Duration::from_millis(50),
            version: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// How often the child is checked for exit and the run for cancellation.
    pub fn poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl Operator for Process {
    fn run(&self, ctx: &OpContext<'_>) -> TaskResult<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(ctx.args().iter().map(Value::as_str))
            .arg(ctx.scratch())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Couldn't start '{}'", self.program))?;

        let forwarders = [
            forward(child.stdout.take(), "stdout"),
            forward(child.stderr.take(), "stderr"),
        ];

        let status = loop {
            if let Err(interrupt) = ctx.checkpoint() {
                tracing::warn!(program = %self.program, "killing child process");
                let _ = child.kill();
                let _ = child.wait();
                return Err(interrupt.into());
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }

            thread::sleep(self.poll);
        };

        // The pipes close once the child exits; wait for the last lines so
        // they're logged inside this node's span.
        for handle in forwarders.into_iter().flatten() {
            if handle.join().is_err() {
                tracing::warn!(program = %self.program, "output forwarding panicked");
            }
        }

        if !status.success() {
            anyhow::bail!("'{}' failed with {status}", self.program);
        }

        Ok(())
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Logs every line read from `reader` under the current span, with the
/// current subscriber.
fn forward<R>(reader: Option<R>, stream: &'static str) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let reader = reader?;
    let span = tracing::Span::current();
    let dispatch = tracing::dispatcher::get_default(Dispatch::clone);

    let spawned = thread::Builder::new()
        .name(format!("memodag-{stream}"))
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let _enter = span.enter();
                for line in BufReader::new(reader).lines().map_while(Result::ok) {
                    tracing::info!(stream, "{line}");
                }
            })
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!("Couldn't forward {stream}: {err}");
            None
        }
    }
}
