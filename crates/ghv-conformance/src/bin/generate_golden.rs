#![forbid(unsafe_code)]

use clap::Parser;
use ghv_conformance::fixture_store::FixtureStore;
use ghv_conformance::golden::{
    CONTROL_POINTS, GoldenProvenance, build_golden, check_golden, load_golden, write_golden,
};
use ghv_conformance::reference::{FieldSelector, ReferenceAdapter};
use ghv_conformance::{HarnessConfig, HarnessError, init_tracing};
use std::path::PathBuf;

/// Regenerate (or re-check) the golden control-point values from cfgrib.
#[derive(Debug, Parser)]
#[command(name = "generate_golden")]
struct Args {
    #[arg(long, env = "GRIB2HRRR_FIXTURE")]
    fixture: Option<PathBuf>,
    #[arg(long, env = "GRIB2HRRR_GOLDEN")]
    golden: Option<PathBuf>,
    /// Compare the existing golden file instead of rewriting it.
    #[arg(long)]
    check: bool,
    /// Allowed value drift in Kelvin for --check.
    #[arg(long = "tol", default_value_t = 1e-6)]
    tolerance: f64,
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(if err.use_stderr() { 1 } else { 0 });
    });
    init_tracing();

    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("generate_golden failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<bool, HarnessError> {
    let mut cfg = HarnessConfig::from_env();
    if let Some(fixture) = &args.fixture {
        cfg.fixture_path = fixture.clone();
    }
    if let Some(golden) = &args.golden {
        cfg.golden_path = golden.clone();
    }

    let provenance = GoldenProvenance::hrrr_tmp700mb();
    let status = FixtureStore::http().ensure(&provenance.fixture_source(), &cfg.fixture_path)?;
    eprintln!(
        "fixture {} ({} bytes)",
        cfg.fixture_path.display(),
        status.bytes()
    );

    let field = ReferenceAdapter::new(FieldSelector::default()).open(&cfg.fixture_path)?;

    if args.check {
        let golden = load_golden(&cfg.golden_path)?;
        let drift = check_golden(&golden, &field, args.tolerance);
        for entry in &drift {
            eprintln!("DRIFT {entry}");
        }
        eprintln!(
            "{}/{} golden points unchanged",
            golden.points.len() - drift.len(),
            golden.points.len()
        );
        return Ok(drift.is_empty());
    }

    let golden = build_golden(&field, &provenance, &CONTROL_POINTS)?;
    for point in &golden.points {
        eprintln!(
            "  {}: {:.6} K  (i={}, j={})",
            point.name, point.value_k, point.grid_i, point.grid_j
        );
    }
    write_golden(&cfg.golden_path, &golden)?;
    let rendered = serde_json::to_string_pretty(&golden)
        .map_err(|err| HarnessError::json("golden fixture", err))?;
    println!("{rendered}");
    eprintln!("wrote {}", cfg.golden_path.display());
    Ok(true)
}
