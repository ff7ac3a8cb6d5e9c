#![forbid(unsafe_code)]

use crate::fixture_store::fixture_digest;
use crate::reference::ReferenceAdapter;
use crate::subject_bridge::SubjectDecoder;
use crate::{HarnessConfig, HarnessError, append_validation_log, now_unix_ms, round_to_decimals};
use ghv_grid::{BoundingBox, GridField, QueryPoint, locate};
use ghv_random::{DEFAULT_SAMPLING_SEED, DeterministicRng};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_N_POINTS: usize = 50;
pub const DEFAULT_TOLERANCE_K: f64 = 0.01;
pub const LAT_MARGIN_DEG: f64 = 1.0;
pub const LON_MARGIN_DEG: f64 = 2.0;
pub const POINT_DECIMALS: i32 = 4;
/// Upper bound on points per run; the subject receives them in one batch.
pub const MAX_N_POINTS: usize = 100_000;
pub const VALIDATION_REPORT_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationParams {
    pub n_points: usize,
    pub tolerance: f64,
    pub seed: u64,
    pub lat_margin: f64,
    pub lon_margin: f64,
}

impl ValidationParams {
    #[must_use]
    pub fn new(n_points: usize, tolerance: f64, seed: u64) -> Self {
        Self {
            n_points,
            tolerance,
            seed,
            lat_margin: LAT_MARGIN_DEG,
            lon_margin: LON_MARGIN_DEG,
        }
    }

    #[must_use]
    pub fn with_margins(mut self, lat_margin: f64, lon_margin: f64) -> Self {
        self.lat_margin = lat_margin;
        self.lon_margin = lon_margin;
        self
    }
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self::new(DEFAULT_N_POINTS, DEFAULT_TOLERANCE_K, DEFAULT_SAMPLING_SEED)
    }
}

/// Draws `n_points` interior points from `bbox` shrunk by the margins.
/// Each point consumes one latitude draw then one longitude draw.
pub fn sample_points(
    bbox: BoundingBox,
    params: &ValidationParams,
) -> Result<Vec<QueryPoint>, HarnessError> {
    if params.n_points == 0 {
        return Err(HarnessError::Contract(
            "n_points must be at least 1".to_string(),
        ));
    }
    if params.n_points > MAX_N_POINTS {
        return Err(HarnessError::Contract(format!(
            "n_points {} exceeds the limit of {MAX_N_POINTS}",
            params.n_points
        )));
    }
    let interior = bbox
        .shrink(params.lat_margin, params.lon_margin)
        .ok_or_else(|| {
            HarnessError::Contract(format!(
                "sampling box is empty after margins lat={} lon={} on lat [{}, {}] lon [{}, {}]",
                params.lat_margin,
                params.lon_margin,
                bbox.lat_min,
                bbox.lat_max,
                bbox.lon_min,
                bbox.lon_max
            ))
        })?;

    let mut rng = DeterministicRng::new(params.seed);
    let mut points = Vec::with_capacity(params.n_points);
    for _ in 0..params.n_points {
        let lat = rng.uniform(interior.lat_min, interior.lat_max)?;
        let lon = rng.uniform(interior.lon_min, interior.lon_max)?;
        points.push(QueryPoint::new(
            round_to_decimals(lat, POINT_DECIMALS),
            round_to_decimals(lon, POINT_DECIMALS),
        ));
    }
    Ok(points)
}

/// `|a - b|`, with two NaNs counting as agreement and a single NaN as an
/// infinite difference.
#[must_use]
pub fn absolute_difference(reference: f64, subject: f64) -> f64 {
    match (reference.is_nan(), subject.is_nan()) {
        (true, true) => 0.0,
        (true, false) | (false, true) => f64::INFINITY,
        (false, false) => (reference - subject).abs(),
    }
}

#[must_use]
pub fn exceeds_tolerance(diff: f64, tolerance: f64) -> bool {
    !(diff <= tolerance)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidationRecord {
    pub point: QueryPoint,
    pub reference_value: f64,
    pub subject_value: f64,
    pub absolute_difference: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixtureProvenance {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub schema_version: u8,
    pub seed: u64,
    pub n_points: usize,
    pub tolerance: f64,
    pub total_points: usize,
    pub passed_points: usize,
    pub max_diff: f64,
    pub verdict: Verdict,
    pub failures: Vec<ValidationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixture: Option<FixtureProvenance>,
}

impl ValidationReport {
    #[must_use]
    pub fn failed_points(&self) -> usize {
        self.failures.len()
    }
}

/// Samples, looks every point up on the reference field, asks the subject
/// for the whole batch in one call, then compares.
pub fn run_validation(
    field: &GridField,
    subject: &dyn SubjectDecoder,
    params: &ValidationParams,
) -> Result<ValidationReport, HarnessError> {
    if !(params.tolerance >= 0.0) {
        return Err(HarnessError::Contract(format!(
            "tolerance must be a non-negative number, got {}",
            params.tolerance
        )));
    }
    let bbox = field.bounding_box().ok_or_else(|| {
        HarnessError::Contract("reference field has no finite coordinates".to_string())
    })?;
    let points = sample_points(bbox, params)?;

    let reference_values: Vec<f64> = points
        .iter()
        .map(|&point| locate(field, point).value)
        .collect();

    info!(points = points.len(), "requesting subject values");
    let subject_values = subject.lookup_many(&points)?;
    if subject_values.len() != points.len() {
        return Err(HarnessError::Contract(format!(
            "subject returned {} values for {} query points",
            subject_values.len(),
            points.len()
        )));
    }

    let mut max_diff = 0.0_f64;
    let mut failures = Vec::new();
    for ((&point, &reference_value), &subject_value) in
        points.iter().zip(&reference_values).zip(&subject_values)
    {
        let diff = absolute_difference(reference_value, subject_value);
        if diff > max_diff {
            max_diff = diff;
        }
        if exceeds_tolerance(diff, params.tolerance) {
            failures.push(ValidationRecord {
                point,
                reference_value,
                subject_value,
                absolute_difference: diff,
            });
        }
    }

    let total_points = points.len();
    let verdict = if failures.is_empty() {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    if verdict == Verdict::Fail {
        warn!(failed = failures.len(), total = total_points, max_diff, "tolerance exceeded");
    }

    Ok(ValidationReport {
        schema_version: VALIDATION_REPORT_SCHEMA_VERSION,
        seed: params.seed,
        n_points: params.n_points,
        tolerance: params.tolerance,
        total_points,
        passed_points: total_points - failures.len(),
        max_diff,
        verdict,
        failures,
        fixture: None,
    })
}

/// Human summary printed to stderr at the end of a run.
#[must_use]
pub fn render_summary(report: &ValidationReport) -> String {
    let mut out = String::new();
    for record in &report.failures {
        let _ = writeln!(
            out,
            "FAIL ({:.4}, {:.4}): subject={:.6} K  reference={:.6} K  diff={:.6} K  (tol={})",
            record.point.lat,
            record.point.lon,
            record.subject_value,
            record.reference_value,
            record.absolute_difference,
            report.tolerance
        );
    }
    let _ = writeln!(
        out,
        "\nResults: {}/{} points within {} K tolerance",
        report.passed_points, report.total_points, report.tolerance
    );
    let _ = writeln!(out, "Max diff: {:.6} K", report.max_diff);
    match report.verdict {
        Verdict::Pass => out.push_str("PASS\n"),
        Verdict::Fail => {
            let _ = writeln!(
                out,
                "FAIL: {} point(s) exceeded tolerance",
                report.failed_points()
            );
        }
    }
    out
}

pub fn write_validation_report(path: &Path, report: &ValidationReport) -> Result<(), HarnessError> {
    crate::write_json_pretty(path, report)
}

/// One line of the JSONL run log.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationLogEntry {
    pub ts_unix_ms: u128,
    pub seed: u64,
    pub n_points: usize,
    pub tolerance: f64,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_diff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_points: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixture_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationLogEntry {
    #[must_use]
    pub fn from_report(report: &ValidationReport) -> Self {
        Self {
            ts_unix_ms: now_unix_ms(),
            seed: report.seed,
            n_points: report.n_points,
            tolerance: report.tolerance,
            outcome: report.verdict.as_str().to_string(),
            max_diff: Some(report.max_diff),
            failed_points: Some(report.failed_points()),
            fixture_sha256: report.fixture.as_ref().map(|f| f.sha256.clone()),
            error_kind: None,
            error: None,
        }
    }

    #[must_use]
    pub fn from_error(params: &ValidationParams, err: &HarnessError) -> Self {
        Self {
            ts_unix_ms: now_unix_ms(),
            seed: params.seed,
            n_points: params.n_points,
            tolerance: params.tolerance,
            outcome: "ERROR".to_string(),
            max_diff: None,
            failed_points: None,
            fixture_sha256: None,
            error_kind: Some(err.kind()),
            error: Some(err.to_string()),
        }
    }
}

/// Full run against the fixture on disk: reference decode, sampling,
/// subject batch, comparison. Every outcome, including errors, is appended
/// to the run log.
pub fn validate_fixture(
    config: &HarnessConfig,
    params: &ValidationParams,
    adapter: &ReferenceAdapter,
    subject: &dyn SubjectDecoder,
) -> Result<ValidationReport, HarnessError> {
    let outcome = validate_fixture_inner(config, params, adapter, subject);
    let entry = match &outcome {
        Ok(report) => ValidationLogEntry::from_report(report),
        Err(err) => ValidationLogEntry::from_error(params, err),
    };
    if let Err(log_err) = append_validation_log(&entry) {
        warn!(error = %log_err, "could not append validation log entry");
    }
    outcome
}

fn validate_fixture_inner(
    config: &HarnessConfig,
    params: &ValidationParams,
    adapter: &ReferenceAdapter,
    subject: &dyn SubjectDecoder,
) -> Result<ValidationReport, HarnessError> {
    let fixture_path = &config.fixture_path;
    if !fixture_path.is_file() {
        return Err(HarnessError::MissingFixture {
            path: fixture_path.clone(),
        });
    }
    let sha256 = fixture_digest(fixture_path)?;
    info!(fixture = %fixture_path.display(), %sha256, "validating fixture");

    let field = adapter.open(fixture_path)?;
    let mut report = run_validation(&field, subject, params)?;
    report.fixture = Some(FixtureProvenance {
        path: fixture_path.clone(),
        sha256,
    });
    Ok(report)
}
