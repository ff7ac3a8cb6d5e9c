#![forbid(unsafe_code)]

use clap::Parser;
use ghv_conformance::reference::{FieldSelector, ReferenceAdapter};
use ghv_conformance::subject_bridge::SubjectBridge;
use ghv_conformance::validation::{
    DEFAULT_N_POINTS, DEFAULT_TOLERANCE_K, ValidationParams, render_summary, validate_fixture,
    write_validation_report,
};
use ghv_conformance::{HarnessConfig, HarnessError, init_tracing, set_validation_log_path};
use ghv_random::DEFAULT_SAMPLING_SEED;
use std::path::{Path, PathBuf};

/// Cross-validate the grib2hrrr decoder against cfgrib at random interior
/// points of the committed fixture.
#[derive(Debug, Parser)]
#[command(name = "validate_random")]
struct Args {
    /// Number of random interior points to sample.
    #[arg(long, env = "GRIB2HRRR_N_POINTS", default_value_t = DEFAULT_N_POINTS)]
    n_points: usize,
    /// Tolerance in Kelvin.
    #[arg(long = "tol", env = "GRIB2HRRR_TOLERANCE", default_value_t = DEFAULT_TOLERANCE_K)]
    tolerance: f64,
    /// GRIB2 fixture shared by both decoders.
    #[arg(long, env = "GRIB2HRRR_FIXTURE")]
    fixture: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_SAMPLING_SEED)]
    seed: u64,
    /// Module root the Go helper runs in.
    #[arg(long, env = "GRIB2HRRR_SUBJECT_ROOT")]
    subject_root: Option<PathBuf>,
    /// Write the validation report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Append one JSON line per run.
    #[arg(long, env = "GRIB2HRRR_VALIDATION_LOG_PATH")]
    log_path: Option<PathBuf>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };
    init_tracing();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("ERROR: {err}");
            if matches!(err, HarnessError::MissingFixture { .. }) {
                eprintln!("Run: generate_golden (or fetch_fixture) to download it");
            }
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32, HarnessError> {
    let mut cfg = HarnessConfig::from_env();
    if let Some(fixture) = args.fixture {
        cfg.fixture_path = fixture;
    }
    if let Some(root) = args.subject_root {
        cfg.subject_root = root;
    }
    set_validation_log_path(args.log_path);

    let params = ValidationParams::new(args.n_points, args.tolerance, args.seed);
    let adapter = ReferenceAdapter::new(FieldSelector::default());
    let subject = SubjectBridge::go_helper(&cfg.subject_root)
        .with_fixture_path(absolute(&cfg.fixture_path).display().to_string());

    eprintln!(
        "Validating {} points (seed={}, tol={} K) against {}",
        params.n_points,
        params.seed,
        params.tolerance,
        cfg.fixture_path.display()
    );
    let report = validate_fixture(&cfg, &params, &adapter, &subject)?;
    eprint!("{}", render_summary(&report));

    if let Some(path) = args.report {
        write_validation_report(&path, &report)?;
        eprintln!("wrote {}", path.display());
    }
    Ok(report.verdict.exit_code())
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
