#![forbid(unsafe_code)]

use crate::{HarnessError, env_string};
use ghv_grid::QueryPoint;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const SUBJECT_TIMEOUT: Duration = Duration::from_secs(120);
pub const ENV_SUBJECT_GO: &str = "GRIB2HRRR_SUBJECT_GO";
pub const SUBJECT_FIXTURE_RELATIVE_PATH: &str = "testdata/hrrr_tmp700mb.grib2";
pub const FIXTURE_PLACEHOLDER: &str = "{{FIXTURE_PATH}}";
pub const POINTS_PLACEHOLDER: &str = "{{POINTS_JSON}}";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ECHO_TOLERANCE_DEG: f64 = 1e-9;

const GO_HELPER_TEMPLATE: &str = r#"package main

import (
	"encoding/json"
	"fmt"
	"os"

	"github.com/geal-ai/grib2hrrr"
)

type queryPoint struct {
	Lat float64 `json:"lat"`
	Lon float64 `json:"lon"`
}

type sample struct {
	Lat   float64 `json:"lat"`
	Lon   float64 `json:"lon"`
	Value float64 `json:"value"`
}

func main() {
	raw, err := os.ReadFile({{FIXTURE_PATH}})
	if err != nil {
		fmt.Fprintln(os.Stderr, "read fixture:", err)
		os.Exit(1)
	}
	field, err := grib2hrrr.DecodeMessage(raw)
	if err != nil {
		fmt.Fprintln(os.Stderr, "decode:", err)
		os.Exit(1)
	}
	var points []queryPoint
	if err := json.Unmarshal([]byte(`{{POINTS_JSON}}`), &points); err != nil {
		fmt.Fprintln(os.Stderr, "points:", err)
		os.Exit(1)
	}
	out := make([]sample, len(points))
	for i, p := range points {
		out[i] = sample{Lat: p.Lat, Lon: p.Lon, Value: field.Lookup(p.Lat, p.Lon)}
	}
	encoded, err := json.Marshal(out)
	if err != nil {
		fmt.Fprintln(os.Stderr, "encode:", err)
		os.Exit(1)
	}
	fmt.Println(string(encoded))
}
"#;

/// Anything that can decode the fixture at a batch of points, in order.
pub trait SubjectDecoder {
    fn lookup_many(&self, points: &[QueryPoint]) -> Result<Vec<f64>, HarnessError>;
}

impl<F> SubjectDecoder for F
where
    F: Fn(&[QueryPoint]) -> Result<Vec<f64>, HarnessError>,
{
    fn lookup_many(&self, points: &[QueryPoint]) -> Result<Vec<f64>, HarnessError> {
        self(points)
    }
}

/// One element of the subject's stdout array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubjectSample {
    pub lat: f64,
    pub lon: f64,
    pub value: f64,
}

/// Runs the decoder under test as a child process.
///
/// The child gets no arguments beyond its generated source file and no
/// stdin: the fixture path and the point list are embedded in the source
/// rendered from `template`. `{{FIXTURE_PATH}}` expands to a quoted,
/// escaped string literal and `{{POINTS_JSON}}` to a bare JSON array. The
/// child must print a single JSON array of [`SubjectSample`] in input order
/// and exit 0. On Unix it runs in its own process group so a timeout takes
/// down anything it launched.
#[derive(Debug, Clone)]
pub struct SubjectBridge {
    program: String,
    args: Vec<String>,
    source_file_name: String,
    template: String,
    fixture_path: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl SubjectBridge {
    pub fn new(
        program: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            source_file_name: "subject_source".to_string(),
            template: template.into(),
            fixture_path: SUBJECT_FIXTURE_RELATIVE_PATH.to_string(),
            working_dir: working_dir.into(),
            timeout: SUBJECT_TIMEOUT,
        }
    }

    /// `go run main.go` inside the subject module.
    #[must_use]
    pub fn go_helper(subject_root: &Path) -> Self {
        Self::new(
            env_string(ENV_SUBJECT_GO, "go"),
            subject_root,
            GO_HELPER_TEMPLATE,
        )
        .with_args(["run"])
        .with_source_file_name("main.go")
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_source_file_name(mut self, name: impl Into<String>) -> Self {
        self.source_file_name = name.into();
        self
    }

    #[must_use]
    pub fn with_fixture_path(mut self, path: impl Into<String>) -> Self {
        self.fixture_path = path.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn render_source(&self, points: &[QueryPoint]) -> Result<String, HarnessError> {
        if !self.template.contains(POINTS_PLACEHOLDER) {
            return Err(HarnessError::Contract(format!(
                "subject template lacks {POINTS_PLACEHOLDER}"
            )));
        }
        let points_json = serde_json::to_string(points)
            .map_err(|err| HarnessError::json("subject query points", err))?;
        // JSON string escapes are a subset of Go's interpreted-literal escapes.
        let fixture_literal = serde_json::to_string(&self.fixture_path)
            .map_err(|err| HarnessError::json("subject fixture path", err))?;
        Ok(self
            .template
            .replace(FIXTURE_PLACEHOLDER, &fixture_literal)
            .replace(POINTS_PLACEHOLDER, &points_json))
    }

    fn spawn(&self, source_path: &Path, stdout: File, stderr: File) -> Result<Child, HarnessError> {
        let mut command = Command::new(&self.program);
        own_process_group(&mut command);
        command
            .args(&self.args)
            .arg(source_path)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| HarnessError::Spawn {
                program: self.program.clone(),
                source: err,
            })
    }
}

impl SubjectDecoder for SubjectBridge {
    fn lookup_many(&self, points: &[QueryPoint]) -> Result<Vec<f64>, HarnessError> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let scratch = tempfile::Builder::new()
            .prefix("ghv-subject-")
            .tempdir()
            .map_err(|err| HarnessError::io(std::env::temp_dir(), err))?;
        let source_path = scratch.path().join(&self.source_file_name);
        let stdout_path = scratch.path().join("stdout.txt");
        let stderr_path = scratch.path().join("stderr.txt");

        fs::write(&source_path, self.render_source(points)?)
            .map_err(|err| HarnessError::io(&source_path, err))?;
        let stdout_file =
            File::create(&stdout_path).map_err(|err| HarnessError::io(&stdout_path, err))?;
        let stderr_file =
            File::create(&stderr_path).map_err(|err| HarnessError::io(&stderr_path, err))?;

        info!(
            program = %self.program,
            points = points.len(),
            cwd = %self.working_dir.display(),
            "invoking subject decoder"
        );
        let started = Instant::now();
        let mut child = self.spawn(&source_path, stdout_file, stderr_file)?;
        let status = wait_with_timeout(&mut child, self.timeout).map_err(|err| match err {
            WaitError::TimedOut => HarnessError::Timeout {
                program: self.program.clone(),
                timeout: self.timeout,
            },
            WaitError::Io(source) => HarnessError::Spawn {
                program: self.program.clone(),
                source,
            },
        })?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            %status,
            "subject exited"
        );

        let stdout = read_lossy(&stdout_path)?;
        if !status.success() {
            let stderr = read_lossy(&stderr_path)?;
            return Err(HarnessError::Subprocess {
                program: self.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        parse_subject_output(&stdout, points)
    }
}

fn read_lossy(path: &Path) -> Result<String, HarnessError> {
    let bytes = fs::read(path).map_err(|err| HarnessError::io(path, err))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

enum WaitError {
    TimedOut,
    Io(std::io::Error),
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus, WaitError> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if started.elapsed() >= timeout {
                    kill_tree(child);
                    return Err(WaitError::TimedOut);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => return Err(WaitError::Io(err)),
        }
    }
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Kills the child and, on Unix, every process left in its group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        // Group id equals the child's pid; the shell builtin takes `-pgid`.
        let group = format!("-{}", child.id());
        let _ = Command::new("sh")
            .args(["-c", "kill -s KILL -- \"$1\"", "sh", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Decodes the subject's stdout: exactly one JSON array, one sample per
/// query point, echoing each point's coordinates in order.
pub fn parse_subject_output(raw: &str, points: &[QueryPoint]) -> Result<Vec<f64>, HarnessError> {
    let samples: Vec<SubjectSample> = serde_json::from_str(raw.trim()).map_err(|err| {
        HarnessError::Contract(format!(
            "subject stdout is not a JSON array of {{lat, lon, value}}: {err}"
        ))
    })?;

    if samples.len() != points.len() {
        return Err(HarnessError::Contract(format!(
            "subject returned {} samples for {} query points",
            samples.len(),
            points.len()
        )));
    }

    for (idx, (sample, point)) in samples.iter().zip(points).enumerate() {
        if (sample.lat - point.lat).abs() > ECHO_TOLERANCE_DEG {
            return Err(HarnessError::Contract(format!(
                "subject sample {idx} lat={} does not echo query lat={}",
                sample.lat, point.lat
            )));
        }
        if (sample.lon - point.lon).abs() > ECHO_TOLERANCE_DEG {
            return Err(HarnessError::Contract(format!(
                "subject sample {idx} lon={} does not echo query lon={}",
                sample.lon, point.lon
            )));
        }
    }

    Ok(samples.into_iter().map(|sample| sample.value).collect())
}
