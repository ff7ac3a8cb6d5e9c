#![forbid(unsafe_code)]

use crate::{HarnessError, env_string};
use ghv_grid::{FieldMetadata, GridField, GridShape, LonConvention};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

pub const ENV_REFERENCE_PYTHON: &str = "GRIB2HRRR_REFERENCE_PYTHON";
pub const REFERENCE_DUMP_SCHEMA_VERSION: u8 = 1;
const FIELD_ABSENT_EXIT_CODE: i32 = 3;

const PY_REFERENCE_SCRIPT: &str = r#"
import json
import math
import sys

fixture_path, output_path, short_name, type_of_level, level = sys.argv[1:6]

try:
    import cfgrib
except Exception as exc:
    print(f'cfgrib unavailable: {exc}', file=sys.stderr)
    sys.exit(2)

filter_keys = {'shortName': short_name}
if type_of_level:
    filter_keys['typeOfLevel'] = type_of_level
if level:
    filter_keys['level'] = int(level)

ds = cfgrib.open_dataset(fixture_path, indexpath='', filter_by_keys=filter_keys)
if short_name not in ds.data_vars:
    present = ', '.join(sorted(ds.data_vars)) or 'none'
    print(f'field {short_name} not found in message (variables: {present})', file=sys.stderr)
    sys.exit(3)

values = ds[short_name].values
lats = ds.coords['latitude'].values
lons = ds.coords['longitude'].values
if values.ndim != 2:
    print(f'expected a 2-D field, got shape {list(values.shape)}', file=sys.stderr)
    sys.exit(4)

def flat(arr):
    return [None if math.isnan(v) else v for v in arr.astype(float).reshape(-1).tolist()]

valid_time = ''
if 'valid_time' in ds.coords:
    valid_time = str(ds.coords['valid_time'].values)

payload = {
    'schema_version': 1,
    'source': 'cfgrib',
    'field': short_name,
    'type_of_level': type_of_level,
    'level': level,
    'valid_time': valid_time,
    'shape': [int(values.shape[0]), int(values.shape[1])],
    'latitude': flat(lats),
    'longitude': flat(lons),
    'values': flat(values),
}

with open(output_path, 'w', encoding='utf-8') as fh:
    json.dump(payload, fh, allow_nan=False)
"#;

/// Which message in the fixture the reference decodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    pub short_name: String,
    pub type_of_level: String,
    pub level: String,
}

impl FieldSelector {
    #[must_use]
    pub fn new(
        short_name: impl Into<String>,
        type_of_level: impl Into<String>,
        level: impl Into<String>,
    ) -> Self {
        Self {
            short_name: short_name.into(),
            type_of_level: type_of_level.into(),
            level: level.into(),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> String {
        format!("{}:{} {}", self.short_name, self.level, self.type_of_level)
    }
}

impl Default for FieldSelector {
    fn default() -> Self {
        Self::new("t", "isobaricInhPa", "700")
    }
}

/// Flat arrays written by the reference script. Missing values arrive as
/// `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDump {
    pub schema_version: u8,
    pub source: String,
    pub field: String,
    #[serde(default)]
    pub type_of_level: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub valid_time: String,
    pub shape: [usize; 2],
    pub latitude: Vec<Option<f64>>,
    pub longitude: Vec<Option<f64>>,
    pub values: Vec<Option<f64>>,
}

/// Wraps the cfgrib decoder behind a Python child process.
#[derive(Debug, Clone)]
pub struct ReferenceAdapter {
    python: String,
    selector: FieldSelector,
}

impl ReferenceAdapter {
    #[must_use]
    pub fn new(selector: FieldSelector) -> Self {
        Self {
            python: env_string(ENV_REFERENCE_PYTHON, "python3"),
            selector,
        }
    }

    #[must_use]
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    #[must_use]
    pub fn selector(&self) -> &FieldSelector {
        &self.selector
    }

    /// Decodes the selected field; longitudes come back in the signed
    /// -180..+180 convention.
    pub fn open(&self, local_path: &Path) -> Result<GridField, HarnessError> {
        if !local_path.is_file() {
            return Err(HarnessError::MissingFixture {
                path: local_path.to_path_buf(),
            });
        }

        let scratch = tempfile::Builder::new()
            .prefix("ghv-reference-")
            .tempdir()
            .map_err(|err| HarnessError::io(std::env::temp_dir(), err))?;
        let dump_path = default_dump_path(scratch.path());

        info!(
            fixture = %local_path.display(),
            field = %self.selector.descriptor(),
            "decoding reference field with cfgrib"
        );
        let output = Command::new(&self.python)
            .arg("-c")
            .arg(PY_REFERENCE_SCRIPT)
            .arg(local_path)
            .arg(&dump_path)
            .arg(&self.selector.short_name)
            .arg(&self.selector.type_of_level)
            .arg(&self.selector.level)
            .output()
            .map_err(|err| HarnessError::Spawn {
                program: self.python.clone(),
                source: err,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if output.status.code() == Some(FIELD_ABSENT_EXIT_CODE) {
                format!("field {} absent from message: {stderr}", self.selector.descriptor())
            } else {
                format!(
                    "interpreter={} status={} stderr={stderr}",
                    self.python, output.status
                )
            };
            return Err(HarnessError::Decode(detail));
        }

        let dump = load_reference_dump(&dump_path)?;
        debug!(rows = dump.shape[0], cols = dump.shape[1], "reference dump loaded");
        field_from_dump(dump)
    }
}

impl Default for ReferenceAdapter {
    fn default() -> Self {
        Self::new(FieldSelector::default())
    }
}

pub fn load_reference_dump(path: &Path) -> Result<ReferenceDump, HarnessError> {
    let raw = fs::read_to_string(path).map_err(|err| HarnessError::io(path, err))?;
    serde_json::from_str(&raw).map_err(|err| HarnessError::json(path.display().to_string(), err))
}

pub fn write_reference_dump(path: &Path, dump: &ReferenceDump) -> Result<(), HarnessError> {
    crate::write_json_pretty(path, dump)
}

pub fn field_from_dump(dump: ReferenceDump) -> Result<GridField, HarnessError> {
    if dump.schema_version != REFERENCE_DUMP_SCHEMA_VERSION {
        return Err(HarnessError::Contract(format!(
            "unsupported reference dump schema_version={}",
            dump.schema_version
        )));
    }

    let convention = LonConvention::Signed180;
    let lat = unmask(dump.latitude);
    let lon: Vec<f64> = unmask(dump.longitude)
        .into_iter()
        .map(|value| convention.normalize(value))
        .collect();
    let values = unmask(dump.values);

    let metadata = FieldMetadata {
        name: dump.field,
        level: [dump.level, dump.type_of_level]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        valid_time: dump.valid_time,
        byte_start: None,
        byte_end: None,
    };
    let shape = GridShape::new(dump.shape[0], dump.shape[1]);
    Ok(GridField::from_flat(shape, lat, lon, values, metadata)?.with_lon_convention(convention))
}

fn unmask(values: Vec<Option<f64>>) -> Vec<f64> {
    values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect()
}

#[must_use]
pub fn default_dump_path(dir: &Path) -> PathBuf {
    dir.join("reference_dump.json")
}
