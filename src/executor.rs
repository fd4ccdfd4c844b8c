mod report;

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cancel::{CancelToken, Cancellation};
use crate::config::Config;
use crate::core::Fingerprint;
use crate::error::{ExecError, GraphError, Interrupt};
use crate::fingerprint::Fingerprints;
use crate::graph::{Argument, Graph, Node};
use crate::registry::{OpContext, Operator, Registry, TaskResult, Value};
use crate::store::{Failure, Materialized, Store};

pub use report::{NodeRun, Outputs, Report};

/// Runs node graphs against an operator registry and an output cache.
///
/// An engine is cheap to share; it holds no per-run state.
#[derive(Debug)]
pub struct Engine {
    registry: Arc<Registry>,
    store: Store,
    jobs: NonZeroUsize,
    timeout: Option<Duration>,
}

/// A node as it will be run: its operator resolved and its output location
/// fixed.
struct Step<'g> {
    node: &'g Node,
    operator: Arc<dyn Operator>,
    fingerprint: Fingerprint,
    location: Utf8PathBuf,
}

/// One entry of [`Engine::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Planned {
    pub name: String,
    pub operator: String,
    pub fingerprint: Fingerprint,
    pub dir: Utf8PathBuf,
    /// The output directory already exists, so the operator won't run.
    pub cached: bool,
}

impl Engine {
    pub fn new(config: &Config, registry: Arc<Registry>) -> Self {
        Self {
            registry,
            store: Store::new(config.cache_dir.clone()).with_locking(config.lock),
            jobs: config.jobs,
            timeout: config.timeout,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs `graph` and returns the output directory of every node.
    pub fn execute(&self, graph: &Graph) -> Result<Outputs, ExecError> {
        self.run(graph).map(|report| report.outputs())
    }

    /// Runs `graph` and returns a per-node report.
    pub fn run(&self, graph: &Graph) -> Result<Report, ExecError> {
        self.run_with(graph, &CancelToken::new())
    }

    /// Runs `graph`, stopping early once `token` is cancelled.
    pub fn run_with(&self, graph: &Graph, token: &CancelToken) -> Result<Report, ExecError> {
        let steps = self.prepare(graph)?;
        let cancellation = Cancellation::new(token.clone(), self.timeout);
        let start = Instant::now();

        let root_span = tracing::span!(Level::INFO, "execute", nodes = steps.len());
        root_span.pb_set_length(steps.len() as u64);
        root_span.pb_set_style(&crate::utils::STYLE_BAR);
        root_span.pb_set_message("Running nodes...");
        let _enter = root_span.enter();

        let runs = self.schedule(&steps, &cancellation, &root_span)?;
        let report = Report::new(runs);

        tracing::info!(
            built = report.built().count(),
            cached = report.cached().count(),
            "execution finished {}",
            crate::utils::as_overhead(start)
        );

        Ok(report)
    }

    /// Resolves fingerprints and output locations without running anything.
    pub fn plan(&self, graph: &Graph) -> Result<Vec<Planned>, ExecError> {
        let steps = self.prepare(graph)?;

        Ok(steps
            .into_iter()
            .map(|step| Planned {
                name: step.node.name().to_string(),
                operator: step.node.operator().to_string(),
                fingerprint: step.fingerprint,
                cached: step.location.is_dir(),
                dir: step.location,
            })
            .collect())
    }

    /// Validates the graph, looks up every operator and computes every
    /// location, so that nothing runs unless everything can.
    fn prepare<'g>(&self, graph: &'g Graph) -> Result<Vec<Step<'g>>, ExecError> {
        let order = graph.toposort()?;

        let operators = order
            .iter()
            .map(|node| {
                self.registry
                    .get(node.operator())
                    .cloned()
                    .ok_or_else(|| ExecError::UnknownOperator {
                        node: node.name().to_string(),
                        operator: node.operator().to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fingerprints = Fingerprints::from_order(&order, |name| self.registry.version_of(name));

        Ok(order
            .into_iter()
            .zip(operators)
            .map(|(node, operator)| {
                let fingerprint = fingerprints[node.name()];
                Step {
                    node,
                    operator,
                    fingerprint,
                    location: self.store.location(node.operator(), fingerprint),
                }
            })
            .collect())
    }

    /// Executes the steps on a pool of `jobs` workers. A step is dispatched
    /// as soon as all the steps it depends on are materialized.
    ///
    /// 1. Every step starts with a count of its distinct dependencies. A step
    ///    whose location an earlier step already owns also depends on that
    ///    step, so each location is built at most once.
    /// 2. Steps with a count of zero are queued and sent to the workers.
    /// 3. The calling thread waits for results. A successful result
    ///    decrements the counts of the step's dependents, queueing those that
    ///    reach zero.
    /// 4. The first failure stops dispatching and halts in-flight operators;
    ///    the loop drains what is still running and returns that failure.
    fn schedule(
        &self,
        steps: &[Step<'_>],
        cancellation: &Cancellation,
        root_span: &tracing::Span,
    ) -> Result<Vec<NodeRun>, ExecError> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.node.name(), i))
            .collect();

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        let mut counts: Vec<usize> = vec![0; steps.len()];

        // Nodes with equal fingerprints share an output directory. Every
        // later one waits for the first, then finds its output cached.
        let mut owners: HashMap<&Utf8Path, usize> = HashMap::new();

        for (i, step) in steps.iter().enumerate() {
            let mut unique: HashSet<usize> = step.node.dependencies().map(|dep| index[dep]).collect();
            let owner = *owners.entry(step.location.as_path()).or_insert(i);
            if owner != i {
                unique.insert(owner);
            }
            counts[i] = unique.len();
            for dep in unique {
                dependents[dep].push(i);
            }
        }

        for list in &mut dependents {
            list.sort_unstable();
        }

        let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| counts[i] == 0).collect();
        let mut runs: Vec<Option<NodeRun>> = vec![None; steps.len()];
        let mut failure: Option<ExecError> = None;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs.get())
            .thread_name(|i| format!("memodag-worker-{i}"))
            .build()?;

        let store = &self.store;
        let (sender, receiver) = channel::<(usize, Result<NodeRun, ExecError>)>();

        // The scheduler loop stays on the calling thread, so every pool
        // thread is free to run operators.
        pool.in_place_scope(|s| {
            let mut in_flight = 0usize;

            loop {
                while failure.is_none() {
                    let Some(i) = ready.pop_front() else { break };

                    if let Err(interrupt) = cancellation.check() {
                        cancellation.halt();
                        failure = Some(interrupt.into());
                        break;
                    }

                    let step = &steps[i];
                    let args = resolve(step.node, steps, &index);
                    let sender = sender.clone();
                    in_flight += 1;

                    s.spawn(move |_| {
                        let result = run_step(store, step, &args, cancellation);
                        let _ = sender.send((i, result));
                    });
                }

                if in_flight == 0 {
                    break;
                }

                let Ok((i, result)) = receiver.recv() else {
                    break;
                };

                in_flight -= 1;
                root_span.pb_inc(1);

                match result {
                    Ok(run) => {
                        for &dependent in &dependents[i] {
                            counts[dependent] -= 1;
                            if counts[dependent] == 0 {
                                ready.push_back(dependent);
                            }
                        }
                        runs[i] = Some(run);
                    }
                    Err(err) => {
                        if failure.is_none() {
                            tracing::error!(node = steps[i].node.name(), "{err}");
                            cancellation.halt();
                            failure = Some(err);
                        }
                    }
                }
            }
        });

        if let Some(err) = failure {
            return Err(err);
        }

        if let Some(i) = runs.iter().position(Option::is_none) {
            // Only reachable if the graph changed shape under us.
            return Err(GraphError::Cycle(steps[i].node.name().to_string()).into());
        }

        Ok(runs.into_iter().flatten().collect())
    }
}

/// Literals pass through, node references become the referenced node's
/// output directory.
fn resolve(node: &Node, steps: &[Step<'_>], index: &HashMap<&str, usize>) -> Vec<Value> {
    node.arguments()
        .iter()
        .map(|argument| match argument {
            Argument::Literal(value) => Value::Literal(value.clone()),
            Argument::Node(name) => Value::Dir(steps[index[name.as_str()]].location.clone()),
        })
        .collect()
}

fn run_step(
    store: &Store,
    step: &Step<'_>,
    args: &[Value],
    cancellation: &Cancellation,
) -> Result<NodeRun, ExecError> {
    let node = step.node;

    let span = tracing::span!(
        Level::INFO,
        "node",
        name = node.name(),
        operator = node.operator()
    );
    span.pb_set_style(&crate::utils::STYLE_TASK);
    span.pb_set_message(&format!("Running {}", node.name()));
    let _enter = span.enter();

    let start = Instant::now();

    let outcome = store
        .materialize(&step.location, |scratch: &Utf8Path| -> Result<(), ExecError> {
            cancellation.check().map_err(|interrupt| interrupted(node, interrupt))?;

            let ctx = OpContext {
                node: node.name(),
                args,
                scratch,
                cancellation,
            };

            invoke(step.operator.as_ref(), &ctx).map_err(|cause| match cancellation.check() {
                Err(interrupt) => interrupted(node, interrupt),
                Ok(()) => ExecError::Operator {
                    node: node.name().to_string(),
                    operator: node.operator().to_string(),
                    cause,
                },
            })
        })
        .map_err(|failure| match failure {
            Failure::Store(cause) => ExecError::Store {
                node: node.name().to_string(),
                operator: node.operator().to_string(),
                cause,
            },
            Failure::Build(err) => err,
        })?;

    let elapsed = start.elapsed();

    match outcome {
        Materialized::Cached => tracing::info!(dir = %step.location, "cached"),
        Materialized::Built => {
            tracing::info!(dir = %step.location, "built {}", crate::utils::as_overhead(start))
        }
    }

    Ok(NodeRun {
        name: node.name().to_string(),
        operator: node.operator().to_string(),
        fingerprint: step.fingerprint,
        dir: step.location.clone(),
        outcome,
        start,
        elapsed,
    })
}

fn interrupted(node: &Node, interrupt: Interrupt) -> ExecError {
    ExecError::Interrupted {
        node: Some(node.name().to_string()),
        interrupt,
    }
}

fn invoke(operator: &dyn Operator, ctx: &OpContext<'_>) -> TaskResult<()> {
    // The operator only sees shared references and its own scratch
    // directory, and a panicking build is never published.
    match catch_unwind(AssertUnwindSafe(|| operator.run(ctx))) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "Operator panicked: {}",
            crate::utils::panic_message(panic.as_ref())
        )),
    }
}
