#![forbid(unsafe_code)]

pub mod fixture_store;
pub mod golden;
pub mod reference;
pub mod subject_bridge;
pub mod test_report;
pub mod validation;

use ghv_grid::GridError;
use ghv_random::RandomError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FIXTURE_FILE: &str = "hrrr_tmp700mb.grib2";
pub const DEFAULT_GOLDEN_FILE: &str = "golden_tmp700mb.json";

pub const ENV_FIXTURE: &str = "GRIB2HRRR_FIXTURE";
pub const ENV_GOLDEN: &str = "GRIB2HRRR_GOLDEN";
pub const ENV_SUBJECT_ROOT: &str = "GRIB2HRRR_SUBJECT_ROOT";
pub const ENV_VALIDATION_LOG_PATH: &str = "GRIB2HRRR_VALIDATION_LOG_PATH";

static VALIDATION_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("acquisition failed for {url}: {detail}")]
    Acquisition { url: String, detail: String },
    #[error("fixture not found: {}", .path.display())]
    MissingFixture { path: PathBuf },
    #[error("reference decode failed: {0}")]
    Decode(String),
    #[error("contract violation: {0}")]
    Contract(String),
    #[error("grid shape contract violated: {0}")]
    Grid(#[from] GridError),
    #[error("query point sampling failed: {0}")]
    Sampling(#[from] RandomError),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}; stderr:\n{stderr}")]
    Subprocess {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HarnessError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Stable category name used in structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Acquisition { .. } | Self::MissingFixture { .. } => "acquisition",
            Self::Decode(_) => "decode",
            Self::Contract(_) | Self::Grid(_) | Self::Sampling(_) | Self::Json { .. } => {
                "contract"
            }
            Self::Spawn { .. } | Self::Subprocess { .. } | Self::Timeout { .. } => "subprocess",
            Self::Io { .. } => "io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub repo_root: PathBuf,
    pub testdata_root: PathBuf,
    pub fixture_path: PathBuf,
    pub golden_path: PathBuf,
    pub subject_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let testdata_root = repo_root.join("testdata");
        Self {
            fixture_path: testdata_root.join(DEFAULT_FIXTURE_FILE),
            golden_path: testdata_root.join(DEFAULT_GOLDEN_FILE),
            subject_root: repo_root.clone(),
            testdata_root,
            repo_root,
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default_paths();
        if let Some(path) = env_path(ENV_FIXTURE) {
            cfg.fixture_path = path;
        }
        if let Some(path) = env_path(ENV_GOLDEN) {
            cfg.golden_path = path;
        }
        if let Some(path) = env_path(ENV_SUBJECT_ROOT) {
            cfg.subject_root = path;
        }
        cfg
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub(crate) fn env_string(name: &str, fallback: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Installs the stderr `fmt` subscriber used by the binaries. `RUST_LOG`
/// overrides the default `info` filter. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn set_validation_log_path(path: Option<PathBuf>) {
    let cell = VALIDATION_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

/// Appends one JSON line to the configured run log; a no-op when neither
/// [`set_validation_log_path`] nor `GRIB2HRRR_VALIDATION_LOG_PATH` names one.
pub fn append_validation_log<T: Serialize>(entry: &T) -> Result<(), HarnessError> {
    let configured = VALIDATION_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let Some(path) = configured.or_else(|| env_path(ENV_VALIDATION_LOG_PATH)) else {
        return Ok(());
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| HarnessError::io(parent, err))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| HarnessError::io(&path, err))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| HarnessError::json("validation log entry", err))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| HarnessError::io(&path, err))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| HarnessError::io(parent, err))?;
    }
    let mut raw = serde_json::to_string_pretty(value)
        .map_err(|err| HarnessError::json(path.display().to_string(), err))?;
    raw.push('\n');
    fs::write(path, raw).map_err(|err| HarnessError::io(path, err))
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

pub(crate) fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Rounds half away from zero to `decimals` places.
#[must_use]
pub fn round_to_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::{
        HarnessConfig, HarnessError, append_validation_log, round_to_decimals,
        set_validation_log_path, sha256_hex,
    };
    use serde::Serialize;
    use std::fs;

    #[derive(Serialize)]
    struct Entry {
        seed: u64,
    }

    #[test]
    fn default_paths_point_into_testdata() {
        let cfg = HarnessConfig::default_paths();
        assert!(cfg.fixture_path.ends_with("testdata/hrrr_tmp700mb.grib2"));
        assert!(cfg.golden_path.ends_with("testdata/golden_tmp700mb.json"));
        assert_eq!(cfg.subject_root, cfg.repo_root);
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn rounding_keeps_requested_decimals() {
        assert_eq!(round_to_decimals(39.123_456, 4), 39.1235);
        assert_eq!(round_to_decimals(-104.987_66, 4), -104.9877);
        assert_eq!(round_to_decimals(271.123_456_7, 6), 271.123_457);
    }

    #[test]
    fn validation_log_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/validation.jsonl");
        set_validation_log_path(Some(path.clone()));
        append_validation_log(&Entry { seed: 1 }).expect("first entry");
        append_validation_log(&Entry { seed: 2 }).expect("second entry");
        set_validation_log_path(None);

        let raw = fs::read_to_string(&path).expect("log written");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines, vec![r#"{"seed":1}"#, r#"{"seed":2}"#]);
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        let err = HarnessError::Subprocess {
            program: "go".to_string(),
            status: "exit status: 2".to_string(),
            stderr: "panic".to_string(),
        };
        assert_eq!(err.kind(), "subprocess");
        assert!(err.to_string().contains("panic"));
        assert_eq!(HarnessError::Decode("x".to_string()).kind(), "decode");
    }

    #[test]
    fn sub_second_timeouts_keep_their_unit() {
        let err = HarnessError::Timeout {
            program: "go".to_string(),
            timeout: std::time::Duration::from_millis(300),
        };
        assert_eq!(err.to_string(), "go timed out after 300ms");
        assert_eq!(err.kind(), "subprocess");
    }
}
