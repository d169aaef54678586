use std::{
    fmt,
    ops::{Add, AddAssign},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    Success,
    Failed,
    Skipped,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for TestResult {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One test execution extracted from a JUnit report.
///
/// Failure fields are only ever populated for non-successful runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRun {
    pub test_id: String,
    pub result: TestResult,
    pub duration_ms: u64,
    pub start_time: OffsetDateTime,
    pub failure_message: Option<String>,
    pub failure_output: Option<String>,
    pub system_output: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TestCount {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl TestCount {
    pub fn record(&mut self, result: TestResult) {
        self.total += 1;
        match result {
            TestResult::Success => self.success += 1,
            TestResult::Failed => self.failed += 1,
            TestResult::Skipped => self.skipped += 1,
        }
    }
}

impl Add for TestCount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            total: self.total + rhs.total,
            success: self.success + rhs.success,
            failed: self.failed + rhs.failed,
            skipped: self.skipped + rhs.skipped,
        }
    }
}

impl AddAssign for TestCount {
    fn add_assign(&mut self, rhs: Self) { *self = *self + rhs; }
}

/// Test runs of one report (or several merged reports) with their totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestReportData {
    pub counters: TestCount,
    pub runs: Vec<TestRun>,
}

impl TestReportData {
    pub fn push(&mut self, run: TestRun) {
        self.counters.record(run.result);
        self.runs.push(run);
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.counters += other.counters;
        self.runs.extend(other.runs);
        self
    }

    pub fn is_empty(&self) -> bool { self.counters.total == 0 }
}

/// Terminal state of a job run as stored locally.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failed,
    Canceled,
    Timeouted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Timeouted => "timeouted",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "timeouted" => Ok(Self::Timeouted),
            _ => Err(()),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Lineage of an ancestor commit relative to the commit being resolved.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchType {
    Main,
    Side,
}

impl BranchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Side => "side",
        }
    }
}

impl FromStr for BranchType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Main),
            "side" => Ok(Self::Side),
            _ => Err(()),
        }
    }
}

/// Identity of a job run; every stored row of the run carries it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct JobRunInfo {
    /// Job name, stable across runs of the same job.
    pub job_id: String,
    pub project_id: u64,
    pub pipeline_id: u64,
    pub job_run_id: u64,
    pub branch_name: String,
    pub agent_name: String,
    pub agent_os: String,
    pub job_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullJobInfo {
    pub run: JobRunInfo,
    pub state: JobStatus,
    pub duration_ms: u64,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub triggered_by: Option<String>,
    pub pipeline_source: Option<String>,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub counters: TestCount,
    pub custom_status_message: Option<String>,
    pub has_code_quality_report: bool,
    pub changes_since_last_run: Vec<CommitParentsChangesEntry>,
}

/// Snapshot of a job that is still running, for "currently running" views.
#[derive(Debug, Clone, PartialEq)]
pub struct InProgressJobInfo {
    pub run: JobRunInfo,
    pub started_at: Option<OffsetDateTime>,
    pub triggered_by: Option<String>,
    pub pipeline_source: Option<String>,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub changes_since_last_run: Vec<CommitParentsChangesEntry>,
}

/// One ancestor of `commit_sha`; depth 0 is the commit itself.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommitParentsEntry {
    pub project_id: u64,
    pub commit_sha: String,
    pub parent_commit_sha: String,
    pub depth: u32,
    pub author_name: String,
    pub author_email: String,
    pub message_preview: String,
    pub branch_type: BranchType,
}

/// An ancestor commit that landed since the previous run of a job.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommitParentsChangesEntry {
    pub parent_commit_sha: String,
    pub depth: u32,
    pub author_name: String,
    pub author_email: String,
    pub message_preview: String,
    pub branch_type: BranchType,
}

impl From<CommitParentsEntry> for CommitParentsChangesEntry {
    fn from(entry: CommitParentsEntry) -> Self {
        Self {
            parent_commit_sha: entry.parent_commit_sha,
            depth: entry.depth,
            author_name: entry.author_name,
            author_email: entry.author_email,
            message_preview: entry.message_preview,
            branch_type: entry.branch_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(results: &[TestResult]) -> TestReportData {
        let mut data = TestReportData::default();
        for (i, &result) in results.iter().enumerate() {
            data.push(TestRun {
                test_id: format!("suite: case{i}"),
                result,
                duration_ms: 0,
                start_time: OffsetDateTime::UNIX_EPOCH,
                failure_message: None,
                failure_output: None,
                system_output: None,
            });
        }
        data
    }

    #[test]
    fn test_count_add_is_associative() {
        let a = TestCount { total: 3, success: 1, failed: 1, skipped: 1 };
        let b = TestCount { total: 2, success: 2, failed: 0, skipped: 0 };
        let c = TestCount { total: 5, success: 0, failed: 5, skipped: 0 };
        assert_eq!((a + b) + c, a + (b + c));
        assert_eq!(a + b, b + a);
        assert_eq!(a + TestCount::default(), a);
    }

    #[test]
    fn test_report_merge_order_independent_counts() {
        use TestResult::*;
        let parts =
            [report(&[Success, Failed]), report(&[Skipped]), report(&[Success, Success, Failed])];
        let forward = parts.iter().cloned().fold(TestReportData::default(), TestReportData::merge);
        let backward =
            parts.iter().rev().cloned().fold(TestReportData::default(), TestReportData::merge);
        assert_eq!(forward.counters, backward.counters);
        assert_eq!(forward.counters, TestCount { total: 6, success: 3, failed: 2, skipped: 1 });
        assert_eq!(forward.runs.len(), 6);
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in
            [JobStatus::Success, JobStatus::Failed, JobStatus::Canceled, JobStatus::Timeouted]
        {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert_eq!("running".parse::<JobStatus>(), Err(()));
    }
}
