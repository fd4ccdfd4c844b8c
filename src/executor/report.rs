use std::collections::BTreeMap;
use std::fmt::{self, Display, Write};
use std::ops::Index;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::core::Fingerprint;
use crate::store::Materialized;

/// Output directory of every node in an executed graph, keyed by node name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Outputs(BTreeMap<String, Utf8PathBuf>);

impl Outputs {
    pub fn get(&self, name: &str) -> Option<&Utf8Path> {
        self.0.get(name).map(Utf8PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Utf8Path)> {
        self.0
            .iter()
            .map(|(name, dir)| (name.as_str(), dir.as_path()))
    }

    pub fn into_inner(self) -> BTreeMap<String, Utf8PathBuf> {
        self.0
    }
}

impl Index<&str> for Outputs {
    type Output = Utf8PathBuf;

    fn index(&self, name: &str) -> &Utf8PathBuf {
        &self.0[name]
    }
}

impl FromIterator<(String, Utf8PathBuf)> for Outputs {
    fn from_iter<T: IntoIterator<Item = (String, Utf8PathBuf)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What happened to a single node during a run.
#[derive(Debug, Clone)]
pub struct NodeRun {
    pub name: String,
    pub operator: String,
    pub fingerprint: Fingerprint,
    pub dir: Utf8PathBuf,
    pub outcome: Materialized,
    pub start: Instant,
    pub elapsed: Duration,
}

/// Per-node account of a successful run.
#[derive(Debug, Clone, Default)]
pub struct Report {
    runs: BTreeMap<String, NodeRun>,
}

impl Report {
    pub(crate) fn new(runs: impl IntoIterator<Item = NodeRun>) -> Self {
        Self {
            runs: runs.into_iter().map(|run| (run.name.clone(), run)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeRun> {
        self.runs.get(name)
    }

    /// All nodes, by name.
    pub fn runs(&self) -> impl Iterator<Item = &NodeRun> {
        self.runs.values()
    }

    /// Nodes whose operator actually ran.
    pub fn built(&self) -> impl Iterator<Item = &NodeRun> {
        self.runs().filter(|run| run.outcome == Materialized::Built)
    }

    /// Nodes satisfied from the cache.
    pub fn cached(&self) -> impl Iterator<Item = &NodeRun> {
        self.runs().filter(|run| run.outcome == Materialized::Cached)
    }

    pub fn outputs(&self) -> Outputs {
        self.runs
            .values()
            .map(|run| (run.name.clone(), run.dir.clone()))
            .collect()
    }

    /// Renders the nodes that were built as an SVG timeline: one row per
    /// node, ordered by start, with a bar spanning its build.
    pub fn render_waterfall(&self) -> String {
        const ROW: u32 = 24;
        const NAMES: u32 = 160;
        const OPERATORS: u32 = 120;
        const CHART: u32 = 640;

        let mut built: Vec<&NodeRun> = self.built().collect();
        built.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.name.cmp(&b.name)));

        let Some(origin) = built.first().map(|run| run.start) else {
            return r#"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="24"><text y="16">Nothing was built</text></svg>"#.to_string();
        };

        let total = built
            .iter()
            .map(|run| (run.start + run.elapsed).duration_since(origin))
            .max()
            .unwrap_or_default()
            .max(Duration::from_micros(1));
        let scale = |d: Duration| d.as_secs_f64() / total.as_secs_f64() * f64::from(CHART);

        let left = NAMES + OPERATORS;
        let width = left + CHART + 80;
        let height = (built.len() as u32 + 1) * ROW;

        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" font-family="monospace" font-size="12">
<text x="{left}" y="16" fill="gray">0</text><text x="{end}" y="16" fill="gray" text-anchor="end">{total:.2?}</text>
"#,
            end = left + CHART,
        );

        // Writing into a String can't fail.
        for (row, run) in built.iter().enumerate() {
            let bar = scale(run.elapsed).max(1.0);
            let x = f64::from(left) + scale(run.start.duration_since(origin));

            let _ = writeln!(
                svg,
                r#"<g transform="translate(0,{y})"><text y="16">{name}</text><text x="{NAMES}" y="16" fill="gray">{operator}</text><rect x="{x:.1}" y="4" width="{bar:.1}" height="16" fill="steelblue"><title>{name}: {elapsed:.2?}</title></rect><text x="{after:.1}" y="16">{elapsed:.2?}</text></g>"#,
                y = (row as u32 + 1) * ROW,
                name = escape_xml(&run.name),
                operator = escape_xml(&run.operator),
                elapsed = run.elapsed,
                after = x + bar + 4.0,
            );
        }

        svg.push_str("</svg>");
        svg
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for run in self.runs.values() {
            let outcome = match run.outcome {
                Materialized::Built => "built",
                Materialized::Cached => "cached",
            };

            writeln!(
                f,
                "{:<6} {} {:>10.2?} {}",
                outcome, run.name, run.elapsed, run.dir
            )?;
        }

        write!(
            f,
            "{} built, {} cached",
            self.built().count(),
            self.cached().count()
        )
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, outcome: Materialized, start: Instant, millis: u64) -> NodeRun {
        NodeRun {
            name: name.to_string(),
            operator: "Op".to_string(),
            fingerprint: Fingerprint::default(),
            dir: Utf8PathBuf::from(format!("/cache/Op.{name}")),
            outcome,
            start,
            elapsed: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_counts_and_outputs() {
        let now = Instant::now();
        let report = Report::new([
            run("b", Materialized::Built, now, 3),
            run("a", Materialized::Cached, now, 0),
        ]);

        assert_eq!(report.built().count(), 1);
        assert_eq!(report.cached().count(), 1);

        let outputs = report.outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.get("a"), Some(Utf8Path::new("/cache/Op.a")));
        assert_eq!(
            outputs.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_outputs_serialize_as_map() {
        let outputs: Outputs = [("a".to_string(), Utf8PathBuf::from("/cache/Op.a"))]
            .into_iter()
            .collect();

        assert_eq!(
            serde_json::to_string(&outputs).unwrap(),
            r#"{"a":"/cache/Op.a"}"#
        );
    }

    #[test]
    fn test_display_summary() {
        let now = Instant::now();
        let report = Report::new([
            run("x", Materialized::Built, now, 1),
            run("y", Materialized::Cached, now, 0),
        ]);

        let text = report.to_string();
        assert!(text.lines().next().unwrap().starts_with("built"));
        assert!(text.ends_with("1 built, 1 cached"));
    }

    #[test]
    fn test_waterfall_lists_built_nodes() {
        let now = Instant::now();
        let report = Report::new([
            run("first", Materialized::Built, now, 5),
            run("<second>", Materialized::Built, now + Duration::from_millis(5), 5),
            run("skipped", Materialized::Cached, now, 0),
        ]);

        let svg = report.render_waterfall();
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains(">first<"));
        assert!(svg.contains("&lt;second&gt;"));
        assert!(!svg.contains("skipped"));
        assert!(svg.find(">first<").unwrap() < svg.find("&lt;second&gt;").unwrap());
        assert_eq!(svg.matches("<rect").count(), 2);
    }

    #[test]
    fn test_waterfall_empty() {
        assert!(Report::default().render_waterfall().contains("Nothing was built"));
    }
}
