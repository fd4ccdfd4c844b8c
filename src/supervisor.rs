//! Single-flight gate around an [`Engine`].
//!
//! At most one execution runs at a time. Starting while another execution is
//! in flight fails immediately with [`GateError::Busy`] and leaves the running
//! execution untouched. Executions run on a background thread so the caller
//! (for example an HTTP handler) stays responsive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::error::{ExecError, GateError};
use crate::executor::{Engine, Outputs, Report};
use crate::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
}

type Execution = JoinHandle<Result<Report, ExecError>>;

#[derive(Default)]
struct Slot {
    handle: Option<Execution>,
    token: CancelToken,
}

pub struct Supervisor {
    engine: Arc<Engine>,
    running: Arc<AtomicBool>,
    slot: Mutex<Slot>,
    last: Arc<Mutex<Option<Outputs>>>,
}

/// Flips the gate back to idle however the execution thread ends.
struct IdleOnDrop(Arc<AtomicBool>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Supervisor {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
            running: Arc::default(),
            slot: Mutex::default(),
            last: Arc::default(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Starts executing `graph` in the background.
    pub fn start(&self, graph: Graph) -> Result<(), GateError> {
        let mut slot = lock(&self.slot);

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GateError::Busy);
        }

        let guard = IdleOnDrop(self.running.clone());
        let token = CancelToken::new();

        let engine = self.engine.clone();
        let last = self.last.clone();
        let cancel = token.clone();

        let handle = thread::Builder::new()
            .name("memodag-execution".into())
            .spawn(move || {
                let _guard = guard;
                let result = engine.run_with(&graph, &cancel);

                match &result {
                    Ok(report) => {
                        *lock(&last) = Some(report.outputs());
                    }
                    Err(err) => {
                        tracing::error!("Execution failed: {err}");
                    }
                }

                result
            })?;

        slot.handle = Some(handle);
        slot.token = token;

        tracing::info!("Execution started");
        Ok(())
    }

    /// Current state of the gate. Never blocks.
    pub fn status(&self) -> Status {
        if self.running.load(Ordering::Acquire) {
            Status::Running
        } else {
            Status::Idle
        }
    }

    /// Asks the current execution to stop. Returns `false` if nothing was
    /// running.
    pub fn cancel(&self) -> bool {
        let slot = lock(&self.slot);

        if self.status() == Status::Idle {
            return false;
        }

        tracing::info!("Cancelling the current execution");
        slot.token.cancel();
        true
    }

    /// Blocks until the most recently started execution finishes and returns
    /// its result. Returns `None` if there is nothing left to wait for.
    pub fn wait(&self) -> Option<Result<Report, ExecError>> {
        let handle = lock(&self.slot).handle.take()?;

        Some(handle.join().unwrap_or_else(|panic| {
            Err(ExecError::Panicked(crate::utils::panic_message(panic.as_ref())))
        }))
    }

    /// Outputs of the last execution that completed successfully.
    pub fn last_outputs(&self) -> Option<Outputs> {
        lock(&self.last).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{Receiver, channel};
    use std::time::Duration;

    use camino::{Utf8Path, Utf8PathBuf};
    use tempfile::TempDir;

    use crate::config::Config;
    use crate::error::Interrupt;
    use crate::graph::{Argument, Node};
    use crate::registry::{OpContext, Operator, Registry, TaskResult, Value};

    /// Blocks until released through its channel, or until cancelled.
    struct Gate(Mutex<Receiver<()>>);

    impl Operator for Gate {
        fn run(&self, ctx: &OpContext<'_>) -> TaskResult<()> {
            let receiver = lock(&self.0);
            loop {
                ctx.checkpoint()?;
                if receiver.recv_timeout(Duration::from_millis(5)).is_ok() {
                    std::fs::write(ctx.scratch().join("value.txt"), ctx.literal(0)?)?;
                    return Ok(());
                }
            }
        }
    }

    fn supervisor() -> (TempDir, Supervisor, std::sync::mpsc::Sender<()>) {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let (sender, receiver) = channel();

        let mut registry = Registry::new();
        registry.register("Gate", Gate(Mutex::new(receiver))).unwrap();
        registry
            .register_fn("Const", |args: &[Value], scratch: &Utf8Path| {
                std::fs::write(scratch.join("value.txt"), args[0].as_str())?;
                Ok(())
            })
            .unwrap();

        let engine = Engine::new(&Config::new(root.join("cache")), Arc::new(registry));
        (dir, Supervisor::new(engine), sender)
    }

    fn gated(literal: &str) -> Graph {
        [Node::new("g", "Gate", [Argument::literal(literal)])]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_second_start_is_rejected() {
        let (_dir, supervisor, release) = supervisor();

        supervisor.start(gated("first")).unwrap();
        assert_eq!(supervisor.status(), Status::Running);

        let other: Graph = [Node::new("c", "Const", [Argument::literal("x")])]
            .into_iter()
            .collect();
        assert!(matches!(supervisor.start(other), Err(GateError::Busy)));
        assert_eq!(supervisor.status(), Status::Running);

        release.send(()).unwrap();
        let outputs = supervisor.wait().unwrap().unwrap().outputs();

        assert_eq!(supervisor.status(), Status::Idle);
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            std::fs::read_to_string(outputs["g"].join("value.txt")).unwrap(),
            "first"
        );
        assert_eq!(supervisor.last_outputs(), Some(outputs));
    }

    #[test]
    fn test_cancel_stops_execution() {
        let (_dir, supervisor, _release) = supervisor();

        supervisor.start(gated("never")).unwrap();
        assert!(supervisor.cancel());

        let err = supervisor.wait().unwrap().unwrap_err();
        assert!(matches!(
            err,
            ExecError::Interrupted { interrupt: Interrupt::Cancelled, .. }
        ));
        assert_eq!(supervisor.status(), Status::Idle);
        assert!(supervisor.last_outputs().is_none());
        assert!(!supervisor.cancel());
    }

    #[test]
    fn test_failure_returns_to_idle() {
        let (_dir, supervisor, _release) = supervisor();
        let broken: Graph = [Node::new("m", "Missing", [])].into_iter().collect();

        supervisor.start(broken).unwrap();
        let err = supervisor.wait().unwrap().unwrap_err();
        assert!(matches!(err, ExecError::UnknownOperator { .. }));
        assert_eq!(supervisor.status(), Status::Idle);

        let fine: Graph = [Node::new("c", "Const", [Argument::literal("x")])]
            .into_iter()
            .collect();
        supervisor.start(fine).unwrap();
        assert!(supervisor.wait().unwrap().is_ok());
    }

    #[test]
    fn test_wait_without_start() {
        let (_dir, supervisor, _release) = supervisor();

        assert!(supervisor.wait().is_none());
        assert_eq!(supervisor.status(), Status::Idle);
    }
}
