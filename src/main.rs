use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use memodag::{Config, Engine, Graph, Process, Registry, Supervisor};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a query file and print the output directory of every node.
    Run {
        query: Utf8PathBuf,
        #[command(flatten)]
        common: Common,
        /// Write an SVG timeline of the nodes that were built.
        #[arg(long, value_name = "FILE")]
        waterfall: Option<Utf8PathBuf>,
    },
    /// Show which nodes of a query are cached without running anything.
    Plan {
        query: Utf8PathBuf,
        #[command(flatten)]
        common: Common,
    },
    /// Accept queries over HTTP.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(clap::Args, Debug)]
struct Common {
    /// JSON config file; flags take precedence over it.
    #[arg(long, value_name = "FILE")]
    config: Option<Utf8PathBuf>,
    /// Cache root directory.
    #[arg(long, value_name = "DIR")]
    cache: Option<Utf8PathBuf>,
    /// Number of operators allowed to run at once.
    #[arg(long)]
    jobs: Option<usize>,
    /// Deadline for a whole execution, in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,
    /// Register an external program as an operator.
    #[arg(long = "op", value_name = "NAME=PROGRAM [ARGS...]")]
    ops: Vec<String>,
}

impl Common {
    fn engine(&self) -> anyhow::Result<Engine> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(cache) = &self.cache {
            config.cache_dir = cache.clone();
        }
        if let Some(jobs) = self.jobs {
            config = config.jobs(jobs);
        }
        if let Some(timeout) = self.timeout {
            let timeout = Duration::try_from_secs_f64(timeout).context("Invalid --timeout")?;
            config = config.timeout(timeout);
        }

        let mut registry = Registry::new();
        for op in &self.ops {
            let (name, process) = parse_op(op)?;
            registry.register(name, process)?;
        }

        Ok(Engine::new(&config, Arc::new(registry)))
    }
}

/// `NAME=PROGRAM ARGS...`, split on whitespace.
fn parse_op(op: &str) -> anyhow::Result<(String, Process)> {
    let (name, command) = op
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected NAME=PROGRAM in --op '{op}'"))?;

    let mut words = command.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| anyhow!("Missing program in --op '{op}'"))?;

    Ok((name.trim().to_string(), Process::new(program).args(words)))
}

fn read_query(path: &Utf8Path) -> anyhow::Result<Graph> {
    let text = fs::read_to_string(path).with_context(|| format!("Couldn't read query '{path}'"))?;
    Ok(memodag::parse(&text)?)
}

fn main() -> anyhow::Result<()> {
    memodag::init_logging()?;

    let args = Args::parse();

    match args.command {
        Command::Run {
            query,
            common,
            waterfall,
        } => {
            let engine = common.engine()?;
            let graph = read_query(&query)?;
            let report = engine.run(&graph)?;

            if let Some(path) = waterfall {
                fs::write(&path, report.render_waterfall())
                    .with_context(|| format!("Couldn't write '{path}'"))?;
            }

            for (name, dir) in report.outputs().iter() {
                println!("{name}\t{dir}");
            }
        }
        Command::Plan { query, common } => {
            let engine = common.engine()?;
            let graph = read_query(&query)?;

            for planned in engine.plan(&graph)? {
                let state = if planned.cached { "cached" } else { "pending" };
                println!("{state}\t{}\t{}", planned.name, planned.dir);
            }
        }
        Command::Serve { port, common } => {
            let supervisor = Arc::new(Supervisor::new(common.engine()?));

            memodag::server::start(supervisor, port)
                .join()
                .map_err(|_| anyhow!("HTTP server thread panicked"))??;
        }
    }

    Ok(())
}
