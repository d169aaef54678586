use std::{
    ffi::OsStr,
    io::{BufRead, BufReader, Cursor, Read, Seek},
};

use ci_insights_core::models::TestReportData;
use time::OffsetDateTime;
use zip::ZipArchive;

use crate::junit::{PEEK_LINES, looks_like_junit, parse_junit};

/// What a job's artifact archive contained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactsContentsInfo {
    /// Merged test results of every JUnit file; `None` when no test was found.
    pub test_report: Option<TestReportData>,
    pub has_code_quality_report: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("invalid artifact archive")]
    Archive(#[from] zip::result::ZipError),
    #[error("failed to read artifact entry")]
    Io(#[from] std::io::Error),
}

/// Scan an artifact archive for JUnit XML reports and code-quality JSON.
///
/// Entries that are not JUnit or fail to parse are skipped; a corrupt archive
/// fails the whole extraction.
pub fn extract_artifacts_contents(
    bytes: &[u8],
    fallback_start_time: OffsetDateTime,
) -> Result<ArtifactsContentsInfo, ReportError> {
    extract_from_archive(Cursor::new(bytes), fallback_start_time)
}

fn extract_from_archive<R: Read + Seek>(
    reader: R,
    fallback_start_time: OffsetDateTime,
) -> Result<ArtifactsContentsInfo, ReportError> {
    let mut archive = ZipArchive::new(reader)?;
    let mut merged = TestReportData::default();
    let mut has_code_quality_report = false;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(path) = file.enclosed_name() else {
            continue;
        };
        let name = path.display().to_string();
        let extension = path.extension().and_then(OsStr::to_str).map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("xml") => {
                if let Some(report) = read_junit_entry(&mut file, &name, fallback_start_time)? {
                    tracing::debug!(
                        "Parsed {} test cases ({} failed) from {}",
                        report.counters.total,
                        report.counters.failed,
                        name
                    );
                    merged = merged.merge(report);
                }
            }
            Some("json") if !has_code_quality_report => {
                let mut contents = Vec::with_capacity(capacity_hint(file.size()));
                file.read_to_end(&mut contents)?;
                if is_code_quality_report(&String::from_utf8_lossy(&contents)) {
                    tracing::debug!("Found code quality report {}", name);
                    has_code_quality_report = true;
                }
            }
            _ => {}
        }
    }
    Ok(ArtifactsContentsInfo {
        test_report: (!merged.is_empty()).then_some(merged),
        has_code_quality_report,
    })
}

/// Upper bound on what an entry's declared size may preallocate; the header is
/// not trusted.
const MAX_PREALLOCATION: u64 = 1 << 20;

fn capacity_hint(declared_size: u64) -> usize { declared_size.min(MAX_PREALLOCATION) as usize }

fn read_junit_entry<R: Read>(
    file: R,
    name: &str,
    fallback_start_time: OffsetDateTime,
) -> Result<Option<TestReportData>, ReportError> {
    let mut reader = BufReader::new(file);
    let mut head = Vec::new();
    for _ in 0..PEEK_LINES {
        if reader.read_until(b'\n', &mut head)? == 0 {
            break;
        }
    }
    if !looks_like_junit(&head) {
        return Ok(None);
    }
    match parse_junit(Cursor::new(head).chain(reader), fallback_start_time) {
        Ok(Some(report)) => Ok(Some(report)),
        Ok(None) => {
            tracing::debug!("Skipping {}: root element is not <testsuites>", name);
            Ok(None)
        }
        Err(e) => {
            tracing::warn!("Skipping malformed JUnit report {}: {}", name, e);
            Ok(None)
        }
    }
}

/// Literal-substring check for a code-quality (Code Climate) report.
///
/// Upstream tools emit JSON that does not always parse, so no parsing is done.
pub fn is_code_quality_report(contents: &str) -> bool {
    ["\"fingerprint\"", "\"check_name\"", "\"severity\""].iter().all(|key| contents.contains(key))
}
