#![forbid(unsafe_code)]

use clap::Parser;
use ghv_conformance::HarnessError;
use ghv_conformance::test_report::{load_coverage, load_events, render_markdown};
use std::path::PathBuf;

/// Render a gotestsum event stream and coverage summary as release-note
/// markdown on stdout.
#[derive(Debug, Parser)]
#[command(name = "render_test_report")]
struct Args {
    /// `go test -json` event stream, one JSON object per line.
    events: PathBuf,
    /// `go tool cover -func` output; a missing file renders without coverage.
    coverage: PathBuf,
    /// Release tag shown in the heading.
    version: String,
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(if err.use_stderr() { 1 } else { 0 });
    });

    match run(&args) {
        Ok(markdown) => println!("{markdown}"),
        Err(err) => {
            eprintln!("render_test_report failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<String, HarnessError> {
    let summary = load_events(&args.events)?;
    let coverage = load_coverage(&args.coverage)?;
    Ok(render_markdown(&summary, &coverage, &args.version))
}
