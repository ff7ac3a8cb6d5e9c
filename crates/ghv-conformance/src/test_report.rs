#![forbid(unsafe_code)]

//! Markdown release-note section built from a `go test -json` style event
//! stream and a `go tool cover -func` summary.

use crate::HarnessError;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

const SLOWEST_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestAction {
    Pass,
    Fail,
    Skip,
}

impl TestAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Package", default)]
    package: String,
    #[serde(rename = "Test", default)]
    test: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Elapsed", default)]
    elapsed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub package: String,
    pub test: String,
    pub action: TestAction,
    pub elapsed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageCounts {
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
}

impl PackageCounts {
    fn bump(&mut self, action: TestAction) {
        match action {
            TestAction::Pass => self.pass += 1,
            TestAction::Fail => self.fail += 1,
            TestAction::Skip => self.skip += 1,
        }
    }
}

/// Terminal outcomes keyed by `(package, test)`, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSummary {
    pub outcomes: Vec<TestOutcome>,
    pub packages: BTreeMap<String, PackageCounts>,
}

impl TestSummary {
    #[must_use]
    pub fn totals(&self) -> PackageCounts {
        self.packages
            .values()
            .fold(PackageCounts::default(), |acc, c| PackageCounts {
                pass: acc.pass + c.pass,
                fail: acc.fail + c.fail,
                skip: acc.skip + c.skip,
            })
    }
}

/// Later terminal events for the same test replace earlier ones in the
/// listing, but every terminal event is counted for its package.
#[must_use]
pub fn parse_events(raw: &str) -> TestSummary {
    let mut summary = TestSummary::default();
    let mut slots: HashMap<(String, String), usize> = HashMap::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<RawEvent>(line) else {
            continue;
        };
        if event.test.is_empty() {
            continue;
        }
        let Some(action) = TestAction::parse(&event.action) else {
            continue;
        };

        summary
            .packages
            .entry(event.package.clone())
            .or_default()
            .bump(action);

        let outcome = TestOutcome {
            package: event.package.clone(),
            test: event.test.clone(),
            action,
            elapsed: event.elapsed.unwrap_or(0.0),
        };
        match slots.get(&(event.package.clone(), event.test.clone())) {
            Some(&slot) => summary.outcomes[slot] = outcome,
            None => {
                slots.insert((event.package, event.test), summary.outcomes.len());
                summary.outcomes.push(outcome);
            }
        }
    }
    summary
}

/// Last token of the first `total:` line, or `?`.
#[must_use]
pub fn parse_coverage(raw: &str) -> String {
    raw.lines()
        .find(|line| line.contains("total:"))
        .and_then(|line| line.split_whitespace().last())
        .unwrap_or("?")
        .to_string()
}

/// A missing events file is an empty stream.
pub fn load_events(path: &Path) -> Result<TestSummary, HarnessError> {
    Ok(read_optional(path)?.map_or_else(TestSummary::default, |raw| parse_events(&raw)))
}

pub fn load_coverage(path: &Path) -> Result<String, HarnessError> {
    Ok(read_optional(path)?.map_or_else(|| "?".to_string(), |raw| parse_coverage(&raw)))
}

fn read_optional(path: &Path) -> Result<Option<String>, HarnessError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(HarnessError::io(path, err)),
    }
}

fn status_icon(failed: usize) -> &'static str {
    if failed == 0 { "✅" } else { "❌" }
}

#[must_use]
pub fn render_markdown(summary: &TestSummary, coverage: &str, version: &str) -> String {
    let totals = summary.totals();
    let run = totals.pass + totals.fail + totals.skip;

    let mut lines: Vec<String> = vec![
        format!("## {} Test Report — {version}", status_icon(totals.fail)),
        String::new(),
        "| Metric | Value |".to_string(),
        "|--------|-------|".to_string(),
        format!("| Tests run | {run} |"),
        format!("| ✅ Passed | {} |", totals.pass),
    ];
    if totals.fail > 0 {
        lines.push(format!("| ❌ Failed | {} |", totals.fail));
    }
    if totals.skip > 0 {
        lines.push(format!("| ⏭ Skipped | {} |", totals.skip));
    }
    lines.push(format!("| Coverage | {coverage} |"));
    lines.push(String::new());

    if !summary.packages.is_empty() {
        lines.push("### Package breakdown".to_string());
        lines.push(String::new());
        lines.push("| Package | Pass | Fail | Skip |".to_string());
        lines.push("|---------|------|------|------|".to_string());
        for (package, counts) in &summary.packages {
            let short = package
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(package);
            lines.push(format!(
                "| {} `{short}` | {} | {} | {} |",
                status_icon(counts.fail),
                counts.pass,
                counts.fail,
                counts.skip
            ));
        }
        lines.push(String::new());
    }

    let mut failing: Vec<&TestOutcome> = summary
        .outcomes
        .iter()
        .filter(|o| o.action == TestAction::Fail)
        .collect();
    if !failing.is_empty() {
        failing.sort_by(|a, b| (&a.package, &a.test).cmp(&(&b.package, &b.test)));
        lines.push("### ❌ Failing tests".to_string());
        lines.push(String::new());
        for outcome in failing {
            lines.push(format!("- `{}` ({})", outcome.test, outcome.package));
        }
        lines.push(String::new());
    }

    let mut slowest: Vec<&TestOutcome> = summary
        .outcomes
        .iter()
        .filter(|o| !o.test.contains('/') && o.elapsed > 0.0)
        .collect();
    // stable: ties keep first-seen order
    slowest.sort_by(|a, b| b.elapsed.total_cmp(&a.elapsed));
    slowest.truncate(SLOWEST_LIMIT);
    if !slowest.is_empty() {
        lines.push("### Slowest tests".to_string());
        lines.push(String::new());
        lines.push("| Test | Time |".to_string());
        lines.push("|------|------|".to_string());
        for outcome in slowest {
            let mut row = String::new();
            let _ = write!(row, "| `{}` | {:.3}s |", outcome.test, outcome.elapsed);
            lines.push(row);
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{TestAction, load_coverage, load_events, parse_coverage, parse_events, render_markdown};

    const EVENTS: &str = r#"
{"Action":"run","Package":"github.com/geal-ai/grib2hrrr","Test":"TestDecode"}
{"Action":"pass","Package":"github.com/geal-ai/grib2hrrr","Test":"TestDecode","Elapsed":1.25}
{"Action":"pass","Package":"github.com/geal-ai/grib2hrrr","Test":"TestLookup/edge","Elapsed":3.0}
{"Action":"fail","Package":"github.com/geal-ai/grib2hrrr","Test":"TestLookup","Elapsed":0.5}
not json at all
{"Action":"skip","Package":"github.com/geal-ai/grib2hrrr/cmd/hrrrpt","Test":"TestNetwork","Elapsed":0}
{"Action":"pass","Package":"github.com/geal-ai/grib2hrrr","Elapsed":4.2}
{"Action":"output","Package":"github.com/geal-ai/grib2hrrr","Test":"TestDecode","Output":"ok\n"}
"#;

    #[test]
    fn events_are_filtered_and_counted() {
        let summary = parse_events(EVENTS);
        assert_eq!(summary.outcomes.len(), 4);
        let totals = summary.totals();
        assert_eq!((totals.pass, totals.fail, totals.skip), (2, 1, 1));
        assert_eq!(summary.packages.len(), 2);
    }

    #[test]
    fn rerun_replaces_listing_but_counts_twice() {
        let raw = r#"{"Action":"fail","Package":"p","Test":"TestFlaky","Elapsed":0.1}
{"Action":"pass","Package":"p","Test":"TestFlaky","Elapsed":0.2}"#;
        let summary = parse_events(raw);
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].action, TestAction::Pass);
        let counts = summary.packages["p"];
        assert_eq!((counts.pass, counts.fail), (1, 1));
    }

    #[test]
    fn coverage_takes_last_token_of_total_line() {
        let raw = "github.com/geal-ai/grib2hrrr/decode.go:12:\tDecodeMessage\t91.3%\ntotal:\t\t\t(statements)\t87.4%\n";
        assert_eq!(parse_coverage(raw), "87.4%");
        assert_eq!(parse_coverage("no summary here"), "?");
    }

    #[test]
    fn renders_full_report() {
        let markdown = render_markdown(&parse_events(EVENTS), "87.4%", "v0.3.1");
        let expected = "\
## ❌ Test Report — v0.3.1

| Metric | Value |
|--------|-------|
| Tests run | 4 |
| ✅ Passed | 2 |
| ❌ Failed | 1 |
| ⏭ Skipped | 1 |
| Coverage | 87.4% |

### Package breakdown

| Package | Pass | Fail | Skip |
|---------|------|------|------|
| ❌ `grib2hrrr` | 2 | 1 | 0 |
| ✅ `hrrrpt` | 0 | 0 | 1 |

### ❌ Failing tests

- `TestLookup` (github.com/geal-ai/grib2hrrr)

### Slowest tests

| Test | Time |
|------|------|
| `TestDecode` | 1.250s |
| `TestLookup` | 0.500s |
";
        assert_eq!(markdown, expected);
    }

    #[test]
    fn clean_run_has_no_failure_sections() {
        let raw = r#"{"Action":"pass","Package":"p","Test":"TestA","Elapsed":0.01}"#;
        let markdown = render_markdown(&parse_events(raw), "?", "dev");
        assert!(markdown.starts_with("## ✅ Test Report — dev\n"));
        assert!(!markdown.contains("Failed"));
        assert!(!markdown.contains("Skipped"));
        assert!(!markdown.contains("Failing tests"));
    }

    #[test]
    fn slowest_list_is_capped_at_ten() {
        let raw: String = (1..=12)
            .map(|n| format!("{{\"Action\":\"pass\",\"Package\":\"p\",\"Test\":\"Test{n:02}\",\"Elapsed\":{n}}}\n"))
            .collect();
        let markdown = render_markdown(&parse_events(&raw), "?", "dev");
        let slow_section = markdown.split("### Slowest tests").nth(1).expect("section");
        assert_eq!(slow_section.matches("| `Test").count(), 10);
        assert!(slow_section.find("Test12").expect("slowest") < slow_section.find("Test11").expect("next"));
        assert!(!slow_section.contains("Test02"));
    }

    #[test]
    fn missing_inputs_render_empty_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = load_events(&dir.path().join("absent.jsonl")).expect("missing ok");
        let coverage = load_coverage(&dir.path().join("absent.txt")).expect("missing ok");
        let markdown = render_markdown(&summary, &coverage, "v0");
        assert!(markdown.contains("| Tests run | 0 |"));
        assert!(markdown.contains("| Coverage | ? |"));
        assert!(!markdown.contains("Package breakdown"));
    }
}
