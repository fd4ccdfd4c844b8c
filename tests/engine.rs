use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use memodag::{Config, Engine, ExecError, Fingerprints, Registry, Value};
use tempfile::TempDir;

struct Setup {
    _dir: TempDir,
    cache: Utf8PathBuf,
    calls: Arc<AtomicUsize>,
}

impl Setup {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cache = Utf8PathBuf::try_from(dir.path().join("cache")).unwrap();

        Self {
            _dir: dir,
            cache,
            calls: Arc::default(),
        }
    }

    fn engine(&self) -> Engine {
        let mut registry = Registry::new();

        let calls = self.calls.clone();
        registry
            .register_fn("Const", move |args: &[Value], scratch: &Utf8Path| {
                calls.fetch_add(1, Ordering::SeqCst);
                // long enough for concurrent runs to overlap
                thread::sleep(Duration::from_millis(20));
                fs::write(scratch.join("value.txt"), args[0].as_str())?;
                Ok(())
            })
            .unwrap();

        let calls = self.calls.clone();
        registry
            .register_fn("Upper", move |args: &[Value], scratch: &Utf8Path| {
                calls.fetch_add(1, Ordering::SeqCst);
                let input = args[0].as_dir().ok_or_else(|| anyhow::anyhow!("expected a node"))?;
                let text = fs::read_to_string(input.join("value.txt"))?;
                fs::write(scratch.join("value.txt"), text.to_uppercase())?;
                Ok(())
            })
            .unwrap();

        Engine::new(&Config::new(self.cache.clone()).jobs(4), Arc::new(registry))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

const QUERY: &str = r#"
# two independent chains
a = Const("hello")
b = Upper(a)
c = Const("world")
d = Upper(c)
"#;

#[test]
fn query_runs_and_reruns_from_cache() {
    let setup = Setup::new();
    let engine = setup.engine();
    let graph = memodag::parse(QUERY).unwrap();

    let outputs = engine.execute(&graph).unwrap();
    assert_eq!(setup.calls(), 4);
    assert_eq!(outputs.len(), 4);
    assert_eq!(
        fs::read_to_string(outputs["d"].join("value.txt")).unwrap(),
        "WORLD"
    );

    let again = engine.execute(&graph).unwrap();
    assert_eq!(setup.calls(), 4);
    assert_eq!(again, outputs);
}

#[test]
fn output_directories_are_named_by_fingerprint() {
    let setup = Setup::new();
    let graph = memodag::parse(QUERY).unwrap();

    let outputs = setup.engine().execute(&graph).unwrap();
    let fingerprints = Fingerprints::compute(&graph).unwrap();

    for (name, dir) in outputs.iter() {
        let node = graph.get(name).unwrap();
        let expected = format!("{}.{}", node.operator(), fingerprints[name]);

        assert_eq!(dir.parent(), Some(setup.cache.as_path()));
        assert_eq!(dir.file_name(), Some(expected.as_str()));
    }
}

#[test]
fn editing_one_literal_rebuilds_its_chain_only() {
    let setup = Setup::new();
    let engine = setup.engine();

    engine.execute(&memodag::parse(QUERY).unwrap()).unwrap();
    let before = setup.calls();

    let edited = QUERY.replace("\"world\"", "\"there\"");
    let report = engine.run(&memodag::parse(&edited).unwrap()).unwrap();

    assert_eq!(setup.calls() - before, 2);

    let mut built: Vec<&str> = report.built().map(|run| run.name.as_str()).collect();
    built.sort_unstable();
    assert_eq!(built, ["c", "d"]);
}

#[test]
fn concurrent_engines_share_one_build() {
    let setup = Setup::new();
    let graph = memodag::parse("a = Const(\"shared\")").unwrap();

    let first = setup.engine();
    let second = setup.engine();

    let (left, right) = thread::scope(|s| {
        let left = s.spawn(|| first.execute(&graph).unwrap());
        let right = s.spawn(|| second.execute(&graph).unwrap());
        (left.join().unwrap(), right.join().unwrap())
    });

    assert_eq!(left, right);
    assert_eq!(setup.calls(), 1);
}

#[test]
fn missing_operator_is_reported_before_running() {
    let setup = Setup::new();
    let graph = memodag::parse("a = Const(\"x\")\nb = Shout(a)").unwrap();

    let err = setup.engine().execute(&graph).unwrap_err();

    assert!(matches!(err, ExecError::UnknownOperator { .. }));
    assert_eq!(err.node(), Some("b"));
    assert_eq!(setup.calls(), 0);
}
