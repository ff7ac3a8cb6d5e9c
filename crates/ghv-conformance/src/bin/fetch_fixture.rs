#![forbid(unsafe_code)]

use clap::Parser;
use ghv_conformance::fixture_store::{FixtureSource, FixtureStore, HRRR_BASE_URL, hrrr_urls};
use ghv_conformance::{DEFAULT_FIXTURE_FILE, HarnessConfig, HarnessError, init_tracing};
use std::path::PathBuf;

/// Download one HRRR GRIB2 message by resolving its byte range from the
/// remote `.idx` file.
#[derive(Debug, Parser)]
#[command(name = "fetch_fixture")]
struct Args {
    /// Run date, YYYYMMDD.
    #[arg(long, default_value = "20260219")]
    date: String,
    /// Cycle hour (UTC).
    #[arg(long, default_value_t = 12)]
    cycle: u8,
    /// Forecast hour.
    #[arg(long, default_value_t = 0)]
    fxx: u8,
    /// Index search string, `VAR:level`.
    #[arg(long = "var", default_value = "TMP:700 mb")]
    var_level: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = HRRR_BASE_URL)]
    base_url: String,
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(if err.use_stderr() { 1 } else { 0 });
    });
    init_tracing();

    if let Err(err) = run(&args) {
        eprintln!("fetch_fixture failed: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), HarnessError> {
    let out = args
        .out
        .clone()
        .unwrap_or_else(|| HarnessConfig::from_env().testdata_root.join(DEFAULT_FIXTURE_FILE));

    let urls = hrrr_urls(&args.base_url, &args.date, args.cycle, args.fxx)?;
    let store = FixtureStore::http();
    let range = store.fetch_byte_range(&urls.index, &args.var_level)?;
    println!("{} -> {}", args.var_level, range.header_value());

    let source = FixtureSource {
        url: urls.grib,
        range,
    };
    let status = store.ensure(&source, &out)?;
    println!("{} bytes at {}", status.bytes(), out.display());
    Ok(())
}
