#![forbid(unsafe_code)]

use crate::{HarnessError, sha256_hex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// A cached file larger than this is trusted as-is. Size only, no checksum.
pub const MIN_PLAUSIBLE_FIXTURE_BYTES: u64 = 500_000;
pub const MAX_FIXTURE_BYTES: u64 = 50 << 20;
pub const MAX_INDEX_BYTES: u64 = 10 << 20;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(120);
pub const HRRR_BASE_URL: &str = "https://noaa-hrrr-bdp-pds.s3.amazonaws.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive; `None` reads to the end of the object.
    pub end: Option<u64>,
}

impl ByteRange {
    #[must_use]
    pub const fn closed(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    #[must_use]
    pub const fn open_ended(start: u64) -> Self {
        Self { start, end: None }
    }

    #[must_use]
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{end}", self.start),
            None => format!("bytes={}-", self.start),
        }
    }

    #[must_use]
    pub fn expected_len(&self) -> Option<u64> {
        self.end
            .and_then(|end| end.checked_sub(self.start))
            .map(|span| span + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSource {
    pub url: String,
    pub range: ByteRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureStatus {
    Reused { bytes: u64 },
    Downloaded { bytes: u64 },
}

impl FixtureStatus {
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            Self::Reused { bytes } | Self::Downloaded { bytes } => bytes,
        }
    }
}

pub trait RangeFetcher {
    fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Vec<u8>, HarnessError>;

    fn fetch_text(&self, url: &str) -> Result<String, HarnessError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
        limit: u64,
    ) -> Result<Vec<u8>, HarnessError> {
        let mut request = self.agent.get(url);
        if let Some(range) = range {
            request = request.set("Range", &range.header_value());
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(HarnessError::Acquisition {
                    url: url.to_string(),
                    detail: format!("HTTP {code}"),
                });
            }
            Err(err) => {
                return Err(HarnessError::Acquisition {
                    url: url.to_string(),
                    detail: err.to_string(),
                });
            }
        };
        let status = response.status();
        if status != 200 && status != 206 {
            return Err(HarnessError::Acquisition {
                url: url.to_string(),
                detail: format!("unexpected HTTP status {status}"),
            });
        }

        let mut body = Vec::new();
        response
            .into_reader()
            .take(limit + 1)
            .read_to_end(&mut body)
            .map_err(|err| HarnessError::Acquisition {
                url: url.to_string(),
                detail: format!("failed reading body: {err}"),
            })?;
        if body.len() as u64 > limit {
            return Err(HarnessError::Acquisition {
                url: url.to_string(),
                detail: format!("response body exceeds {limit} bytes"),
            });
        }
        Ok(body)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeFetcher for HttpFetcher {
    fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Vec<u8>, HarnessError> {
        self.get(url, Some(range), MAX_FIXTURE_BYTES)
    }

    fn fetch_text(&self, url: &str) -> Result<String, HarnessError> {
        let body = self.get(url, None, MAX_INDEX_BYTES)?;
        String::from_utf8(body).map_err(|err| HarnessError::Acquisition {
            url: url.to_string(),
            detail: format!("index is not utf-8: {err}"),
        })
    }
}

/// Sole writer of the on-disk fixture cache. Concurrent runs against the
/// same path are not coordinated.
#[derive(Debug, Clone)]
pub struct FixtureStore<F> {
    fetcher: F,
    min_plausible_bytes: u64,
}

impl FixtureStore<HttpFetcher> {
    #[must_use]
    pub fn http() -> Self {
        Self::new(HttpFetcher::new())
    }
}

impl<F: RangeFetcher> FixtureStore<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            min_plausible_bytes: MIN_PLAUSIBLE_FIXTURE_BYTES,
        }
    }

    #[must_use]
    pub fn with_min_plausible_bytes(mut self, bytes: u64) -> Self {
        self.min_plausible_bytes = bytes;
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Reuses `local_path` when it is larger than the plausibility threshold,
    /// otherwise downloads the byte range once. Errors propagate; no retry.
    pub fn ensure(
        &self,
        source: &FixtureSource,
        local_path: &Path,
    ) -> Result<FixtureStatus, HarnessError> {
        if let Ok(meta) = fs::metadata(local_path)
            && meta.is_file()
            && meta.len() > self.min_plausible_bytes
        {
            info!(
                path = %local_path.display(),
                bytes = meta.len(),
                "fixture already present"
            );
            return Ok(FixtureStatus::Reused { bytes: meta.len() });
        }

        info!(
            url = %source.url,
            range = %source.range.header_value(),
            "downloading fixture"
        );
        let body = self.fetcher.fetch_range(&source.url, source.range)?;
        write_atomically(local_path, &body)?;
        let bytes = body.len() as u64;
        info!(path = %local_path.display(), bytes, "wrote fixture");
        Ok(FixtureStatus::Downloaded { bytes })
    }

    /// Looks `var_level` up in the remote `.idx` file.
    pub fn fetch_byte_range(
        &self,
        index_url: &str,
        var_level: &str,
    ) -> Result<ByteRange, HarnessError> {
        let index = self.fetcher.fetch_text(index_url)?;
        resolve_byte_range(&index, var_level).ok_or_else(|| HarnessError::Acquisition {
            url: index_url.to_string(),
            detail: format!("variable {var_level:?} not found in index"),
        })
    }
}

pub fn ensure(source: &FixtureSource, local_path: &Path) -> Result<FixtureStatus, HarnessError> {
    FixtureStore::http().ensure(source, local_path)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), HarnessError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|err| HarnessError::io(parent, err))?;

    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| HarnessError::io(parent, err))?;
    std::io::Write::write_all(&mut staged, bytes).map_err(|err| HarnessError::io(path, err))?;
    staged
        .persist(path)
        .map_err(|err| HarnessError::io(path, err.error))?;
    Ok(())
}

/// Byte range of the first index line containing `var_level`.
///
/// Index lines look like `71:11928132:d=2026021912:TMP:700 mb:anl:`. The
/// end is one before the next line's offset; the last message is open-ended.
#[must_use]
pub fn resolve_byte_range(index_text: &str, var_level: &str) -> Option<ByteRange> {
    let lines: Vec<&str> = index_text.trim().lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        if !line.contains(var_level) {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 3 {
            continue;
        }
        let Ok(start) = parts[1].trim().parse::<u64>() else {
            continue;
        };
        let end = lines
            .get(idx + 1)
            .and_then(|next| next.split(':').nth(1))
            .and_then(|field| field.trim().parse::<u64>().ok())
            .and_then(|next_start| next_start.checked_sub(1));
        return Some(ByteRange { start, end });
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrrrUrls {
    pub index: String,
    pub grib: String,
}

/// CONUS surface-file URLs for a run date (`YYYYMMDD`), cycle hour and
/// forecast hour.
pub fn hrrr_urls(
    base_url: &str,
    date: &str,
    cycle_hour: u8,
    fxx: u8,
) -> Result<HrrrUrls, HarnessError> {
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HarnessError::Contract(format!(
            "run date must be YYYYMMDD, got {date:?}"
        )));
    }
    if cycle_hour > 23 {
        return Err(HarnessError::Contract(format!(
            "cycle hour must be 0-23, got {cycle_hour}"
        )));
    }
    let base = format!(
        "{}/hrrr.{date}/conus/hrrr.t{cycle_hour:02}z.wrfsfcf{fxx:02}",
        base_url.trim_end_matches('/')
    );
    Ok(HrrrUrls {
        index: format!("{base}.grib2.idx"),
        grib: format!("{base}.grib2"),
    })
}

pub fn fixture_digest(path: &Path) -> Result<String, HarnessError> {
    let bytes = fs::read(path).map_err(|err| HarnessError::io(path, err))?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::{
        ByteRange, FixtureSource, FixtureStatus, FixtureStore, HRRR_BASE_URL, RangeFetcher,
        fixture_digest, hrrr_urls, resolve_byte_range,
    };
    use crate::HarnessError;
    use std::cell::Cell;
    use std::fs;

    struct FakeFetcher {
        body: Option<Vec<u8>>,
        index: String,
        calls: Cell<usize>,
    }

    impl FakeFetcher {
        fn serving(body: &[u8]) -> Self {
            Self {
                body: Some(body.to_vec()),
                index: String::new(),
                calls: Cell::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                body: None,
                index: String::new(),
                calls: Cell::new(0),
            }
        }
    }

    impl RangeFetcher for FakeFetcher {
        fn fetch_range(&self, url: &str, _range: ByteRange) -> Result<Vec<u8>, HarnessError> {
            self.calls.set(self.calls.get() + 1);
            self.body.clone().ok_or_else(|| HarnessError::Acquisition {
                url: url.to_string(),
                detail: "connection reset".to_string(),
            })
        }

        fn fetch_text(&self, _url: &str) -> Result<String, HarnessError> {
            Ok(self.index.clone())
        }
    }

    fn source() -> FixtureSource {
        FixtureSource {
            url: "https://example.invalid/hrrr.grib2".to_string(),
            range: ByteRange::closed(100, 199),
        }
    }

    const SAMPLE_INDEX: &str = "\
70:11300000:d=2026021912:HGT:700 mb:anl:
71:11928132:d=2026021912:TMP:700 mb:anl:
72:12500284:d=2026021912:DPT:700 mb:anl:
73:13100000:d=2026021912:VVEL:700 mb:anl:
";

    #[test]
    fn range_header_formats() {
        assert_eq!(ByteRange::closed(5, 9).header_value(), "bytes=5-9");
        assert_eq!(ByteRange::open_ended(5).header_value(), "bytes=5-");
        assert_eq!(ByteRange::closed(5, 9).expected_len(), Some(5));
        assert_eq!(ByteRange::open_ended(5).expected_len(), None);
    }

    #[test]
    fn reuses_file_above_threshold_without_fetching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fixture.grib2");
        fs::write(&path, vec![7u8; 64]).expect("seed cache");

        let store = FixtureStore::new(FakeFetcher::failing()).with_min_plausible_bytes(32);
        let status = store.ensure(&source(), &path).expect("reuse");
        assert_eq!(status, FixtureStatus::Reused { bytes: 64 });
        assert_eq!(store.fetcher().calls.get(), 0);
    }

    #[test]
    fn downloads_when_cached_file_is_too_small() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/fixture.grib2");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, b"GRIB").expect("truncated cache");

        let store = FixtureStore::new(FakeFetcher::serving(b"GRIB-fresh-bytes"))
            .with_min_plausible_bytes(8);
        let status = store.ensure(&source(), &path).expect("download");
        assert_eq!(status, FixtureStatus::Downloaded { bytes: 16 });
        assert_eq!(fs::read(&path).expect("read back"), b"GRIB-fresh-bytes");
        assert_eq!(store.fetcher().calls.get(), 1);
    }

    #[test]
    fn fetch_failure_leaves_no_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fixture.grib2");
        let store = FixtureStore::new(FakeFetcher::failing());
        let err = store.ensure(&source(), &path).expect_err("fetch fails");
        assert_eq!(err.kind(), "acquisition");
        assert!(!path.exists());
        let leftovers = fs::read_dir(dir.path()).expect("list").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn index_lookup_uses_next_line_offset() {
        let range = resolve_byte_range(SAMPLE_INDEX, "TMP:700 mb").expect("found");
        assert_eq!(range, ByteRange::closed(11_928_132, 12_500_283));
    }

    #[test]
    fn index_lookup_last_message_is_open_ended() {
        let range = resolve_byte_range(SAMPLE_INDEX, "VVEL:700 mb").expect("found");
        assert_eq!(range, ByteRange::open_ended(13_100_000));
    }

    #[test]
    fn index_lookup_skips_malformed_lines() {
        let index = "garbage TMP:700 mb\n9:notanumber:TMP:700 mb\n10:42:d=1:TMP:700 mb:anl:\n";
        assert_eq!(
            resolve_byte_range(index, "TMP:700 mb"),
            Some(ByteRange::open_ended(42))
        );
        assert_eq!(resolve_byte_range(SAMPLE_INDEX, "REFC:entire atmosphere"), None);
    }

    #[test]
    fn missing_variable_is_an_acquisition_error() {
        let fetcher = FakeFetcher {
            body: None,
            index: SAMPLE_INDEX.to_string(),
            calls: std::cell::Cell::new(0),
        };
        let store = FixtureStore::new(fetcher);
        let found = store
            .fetch_byte_range("https://example.invalid/x.idx", "TMP:700 mb")
            .expect("present");
        assert_eq!(found.start, 11_928_132);
        let err = store
            .fetch_byte_range("https://example.invalid/x.idx", "CAPE:surface")
            .expect_err("absent");
        assert!(err.to_string().contains("CAPE:surface"));
    }

    #[test]
    fn hrrr_urls_follow_bucket_layout() {
        let urls = hrrr_urls(HRRR_BASE_URL, "20260219", 12, 0).expect("valid");
        assert_eq!(
            urls.grib,
            "https://noaa-hrrr-bdp-pds.s3.amazonaws.com/hrrr.20260219/conus/hrrr.t12z.wrfsfcf00.grib2"
        );
        assert_eq!(urls.index, format!("{}.idx", urls.grib));
        assert!(hrrr_urls(HRRR_BASE_URL, "2026-02-19", 12, 0).is_err());
        assert!(hrrr_urls(HRRR_BASE_URL, "20260219", 24, 0).is_err());
    }

    #[test]
    fn digest_matches_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f.bin");
        fs::write(&path, b"").expect("write");
        assert_eq!(
            fixture_digest(&path).expect("digest"),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
