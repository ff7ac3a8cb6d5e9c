#![forbid(unsafe_code)]

use crate::fixture_store::{ByteRange, FixtureSource};
use crate::{HarnessError, round_to_decimals};
use ghv_grid::{GridField, QueryPoint, locate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

pub const GOLDEN_SOURCE: &str = "herbie/cfgrib";
pub const GOLDEN_VALUE_DECIMALS: i32 = 6;

pub const HRRR_TMP700_URL: &str =
    "https://noaa-hrrr-bdp-pds.s3.amazonaws.com/hrrr.20260219/conus/hrrr.t12z.wrfsfcf00.grib2";
pub const HRRR_TMP700_BYTE_START: u64 = 11_928_132;
pub const HRRR_TMP700_BYTE_END: u64 = 12_500_283;

/// A named place checked into the golden file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub name: &'static str,
    pub lat: f64,
    pub lon: f64,
}

impl ControlPoint {
    #[must_use]
    pub fn query(self) -> QueryPoint {
        QueryPoint::new(self.lat, self.lon)
    }
}

pub const CONTROL_POINTS: [ControlPoint; 3] = [
    ControlPoint {
        name: "Vail Pass CO",
        lat: 39.54,
        lon: -106.19,
    },
    ControlPoint {
        name: "Denver CO",
        lat: 39.74,
        lon: -104.98,
    },
    ControlPoint {
        name: "Seattle WA",
        lat: 47.61,
        lon: -122.33,
    },
];

/// Where the decoded message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenProvenance {
    pub grib_url: String,
    pub byte_start: u64,
    pub byte_end: u64,
    pub field: String,
    pub run: String,
    pub fxx: u32,
}

impl GoldenProvenance {
    #[must_use]
    pub fn hrrr_tmp700mb() -> Self {
        Self {
            grib_url: HRRR_TMP700_URL.to_string(),
            byte_start: HRRR_TMP700_BYTE_START,
            byte_end: HRRR_TMP700_BYTE_END,
            field: "TMP:700 mb".to_string(),
            run: "2026-02-19T12:00:00Z".to_string(),
            fxx: 0,
        }
    }

    #[must_use]
    pub fn fixture_source(&self) -> FixtureSource {
        FixtureSource {
            url: self.grib_url.clone(),
            range: ByteRange::closed(self.byte_start, self.byte_end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenPoint {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(rename = "value_K")]
    pub value_k: f64,
    pub grid_i: usize,
    pub grid_j: usize,
}

/// On-disk golden document. Field order is the serialized key order and is
/// part of the file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenFixture {
    pub source: String,
    pub grib_url: String,
    pub byte_start: u64,
    pub byte_end: u64,
    pub field: String,
    pub run: String,
    pub fxx: u32,
    pub points: Vec<GoldenPoint>,
}

/// Looks up every control point on the reference field. Values are rounded
/// to six decimals; a control point landing on a missing value is an error.
pub fn build_golden(
    field: &GridField,
    provenance: &GoldenProvenance,
    control_points: &[ControlPoint],
) -> Result<GoldenFixture, HarnessError> {
    let mut points = Vec::with_capacity(control_points.len());
    for cp in control_points {
        let hit = locate(field, cp.query());
        if !hit.value.is_finite() {
            return Err(HarnessError::Contract(format!(
                "control point {} ({}, {}) selects non-finite value at i={} j={}",
                cp.name, cp.lat, cp.lon, hit.grid_i, hit.grid_j
            )));
        }
        info!(
            point = cp.name,
            value_k = hit.value,
            grid_i = hit.grid_i,
            grid_j = hit.grid_j,
            "golden point"
        );
        points.push(GoldenPoint {
            name: cp.name.to_string(),
            lat: cp.lat,
            lon: cp.lon,
            value_k: round_to_decimals(hit.value, GOLDEN_VALUE_DECIMALS),
            grid_i: hit.grid_i,
            grid_j: hit.grid_j,
        });
    }

    Ok(GoldenFixture {
        source: GOLDEN_SOURCE.to_string(),
        grib_url: provenance.grib_url.clone(),
        byte_start: provenance.byte_start,
        byte_end: provenance.byte_end,
        field: provenance.field.clone(),
        run: provenance.run.clone(),
        fxx: provenance.fxx,
        points,
    })
}

pub fn write_golden(path: &Path, golden: &GoldenFixture) -> Result<(), HarnessError> {
    crate::write_json_pretty(path, golden)
}

pub fn load_golden(path: &Path) -> Result<GoldenFixture, HarnessError> {
    let raw = fs::read_to_string(path).map_err(|err| HarnessError::io(path, err))?;
    serde_json::from_str(&raw).map_err(|err| HarnessError::json(path.display().to_string(), err))
}

/// A control point whose recomputed lookup no longer matches the file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoldenDrift {
    pub name: String,
    pub expected_value_k: f64,
    pub actual_value_k: f64,
    pub expected_grid: (usize, usize),
    pub actual_grid: (usize, usize),
}

impl std::fmt::Display for GoldenDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: value {:.6} K -> {:.6} K, (i, j) {:?} -> {:?}",
            self.name,
            self.expected_value_k,
            self.actual_value_k,
            self.expected_grid,
            self.actual_grid
        )
    }
}

/// Re-runs every golden point against `field`. An empty result means the
/// file still holds.
#[must_use]
pub fn check_golden(golden: &GoldenFixture, field: &GridField, tolerance: f64) -> Vec<GoldenDrift> {
    golden
        .points
        .iter()
        .filter_map(|point| {
            let hit = locate(field, QueryPoint::new(point.lat, point.lon));
            let actual_value = round_to_decimals(hit.value, GOLDEN_VALUE_DECIMALS);
            let expected_grid = (point.grid_i, point.grid_j);
            let actual_grid = (hit.grid_i, hit.grid_j);
            let drifted = !((actual_value - point.value_k).abs() <= tolerance)
                || expected_grid != actual_grid;
            drifted.then(|| GoldenDrift {
                name: point.name.clone(),
                expected_value_k: point.value_k,
                actual_value_k: actual_value,
                expected_grid,
                actual_grid,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        CONTROL_POINTS, ControlPoint, GoldenProvenance, build_golden, check_golden, load_golden,
        write_golden,
    };
    use ghv_grid::{FieldMetadata, GridField};

    fn field(bump: f64) -> GridField {
        let lat: Vec<Vec<f64>> = (0..40)
            .map(|j| (0..60).map(|_| 30.0 + j as f64 * 0.5).collect())
            .collect();
        let lon: Vec<Vec<f64>> = (0..40)
            .map(|_| (0..60).map(|i| -125.0 + i as f64 * 0.5).collect())
            .collect();
        let value: Vec<Vec<f64>> = (0..40)
            .map(|j| {
                (0..60)
                    .map(|i| 255.123_456_789 + j as f64 * 0.1 - i as f64 * 0.03 + bump)
                    .collect()
            })
            .collect();
        GridField::from_rows(&lat, &lon, &value, FieldMetadata::default()).expect("grid")
    }

    #[test]
    fn golden_document_keeps_key_order_and_names() {
        let golden =
            build_golden(&field(0.0), &GoldenProvenance::hrrr_tmp700mb(), &CONTROL_POINTS)
                .expect("build");
        let json = serde_json::to_string_pretty(&golden).expect("encode");
        let keys = [
            "\"source\"",
            "\"grib_url\"",
            "\"byte_start\"",
            "\"byte_end\"",
            "\"field\"",
            "\"run\"",
            "\"fxx\"",
            "\"points\"",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|key| json.find(key).expect("key present"))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");
        assert!(json.contains("\"value_K\""));
        assert!(json.contains("\"byte_start\": 11928132"));
        assert_eq!(golden.points.len(), 3);
        assert_eq!(golden.points[1].name, "Denver CO");
    }

    #[test]
    fn values_are_rounded_to_six_decimals() {
        let golden =
            build_golden(&field(0.0), &GoldenProvenance::hrrr_tmp700mb(), &CONTROL_POINTS)
                .expect("build");
        for point in &golden.points {
            let scaled = point.value_k * 1e6;
            assert!((scaled - scaled.round()).abs() < 1e-3, "{}", point.value_k);
        }
    }

    #[test]
    fn file_roundtrip_reproduces_points_exactly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("golden_tmp700mb.json");
        let golden =
            build_golden(&field(0.0), &GoldenProvenance::hrrr_tmp700mb(), &CONTROL_POINTS)
                .expect("build");
        write_golden(&path, &golden).expect("write");

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("}\n"));
        assert_eq!(load_golden(&path).expect("load"), golden);
    }

    #[test]
    fn check_passes_on_same_field_and_reports_drift() {
        let golden =
            build_golden(&field(0.0), &GoldenProvenance::hrrr_tmp700mb(), &CONTROL_POINTS)
                .expect("build");
        assert!(check_golden(&golden, &field(0.0), 1e-6).is_empty());

        let drift = check_golden(&golden, &field(0.5), 0.01);
        assert_eq!(drift.len(), 3);
        assert_eq!(drift[0].expected_grid, drift[0].actual_grid);
        assert!(drift[0].to_string().starts_with("Vail Pass CO: value"));

        let mut moved = golden.clone();
        moved.points[2].grid_i += 1;
        let drift = check_golden(&moved, &field(0.0), 0.01);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].name, "Seattle WA");
    }

    #[test]
    fn missing_value_at_control_point_is_rejected() {
        let lat = vec![vec![39.0, 39.0], vec![40.0, 40.0]];
        let lon = vec![vec![-107.0, -106.0], vec![-107.0, -106.0]];
        let value = vec![vec![f64::NAN, 250.0], vec![251.0, 252.0]];
        let field = GridField::from_rows(&lat, &lon, &value, FieldMetadata::default()).expect("grid");
        let cp = ControlPoint {
            name: "corner",
            lat: 39.1,
            lon: -106.9,
        };
        let err = build_golden(&field, &GoldenProvenance::hrrr_tmp700mb(), &[cp]).expect_err("nan");
        assert!(err.to_string().contains("corner"));
    }

    #[test]
    fn provenance_maps_to_closed_byte_range() {
        let source = GoldenProvenance::hrrr_tmp700mb().fixture_source();
        assert_eq!(source.range.header_value(), "bytes=11928132-12500283");
        assert_eq!(source.range.expected_len(), Some(572_152));
    }
}
