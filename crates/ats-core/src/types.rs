use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*};

/// Name used for the single aggregate outcome produced by the test procedure.
pub const AGGREGATE_TEST_NAME: &str = "test_execution";

/// Per-invocation inputs. Built once when a run starts and only read afterwards.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub workspace: PathBuf,
    pub results_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_version: u32,
    pub artifact_name: String,
    pub build_number: String,
    pub device_target: String,
    pub test_plan: Vec<String>,
    /// Port pinned by the caller, used as given. `None` leaves discovery to the
    /// locator, which only honours a configured override that exists.
    pub port: Option<String>,
}

impl RunContext {
    /// Firmware image location: the artifact is expected next to the workspace root.
    pub fn artifact_path(&self) -> PathBuf {
        self.workspace.join(&self.artifact_name)
    }

    pub fn manifest_summary(&self) -> ManifestSummary {
        ManifestSummary {
            build_number: self.build_number.clone(),
            device_target: self.device_target.clone(),
        }
    }
}

/// Bytes read from the device after a reset that belongs to the current run.
#[derive(Clone, Debug)]
pub struct BootEvidence {
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    pub since_reset: Duration,
}

impl BootEvidence {
    pub fn new(bytes: Vec<u8>, since_reset: Duration) -> Self {
        Self { bytes, captured_at: Utc::now(), since_reset }
    }

    pub fn since_reset_ms(&self) -> u64 {
        u64::try_from(self.since_reset.as_millis()).unwrap_or(u64::MAX)
    }

    /// Summary kept in the run details once the bytes are on disk.
    pub fn record(&self, tokens: &[String]) -> BootRecord {
        BootRecord {
            captured_at: self.captured_at,
            since_reset_ms: self.since_reset_ms(),
            bytes: self.bytes.len(),
            token: self.first_token(tokens).map(str::to_string),
        }
    }

    /// Returns the first token from `tokens` that occurs in the captured bytes.
    pub fn first_token<'a>(&self, tokens: &'a [String]) -> Option<&'a str> {
        find_boot_token(&self.bytes, tokens)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootRecord {
    pub captured_at: DateTime<Utc>,
    pub since_reset_ms: u64,
    pub bytes: usize,
    /// First recognised boot token, if any.
    pub token: Option<String>,
}

/// Byte-level substring search; boot logs are not guaranteed to be valid UTF-8.
pub fn find_boot_token<'a>(haystack: &[u8], tokens: &'a [String]) -> Option<&'a str> {
    tokens
        .iter()
        .map(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .find(|t| haystack.windows(t.len()).any(|w| w == t.as_bytes()))
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestOutcome {
    pub name: String,
    pub status: TestStatus,
    #[serde(rename = "failure", default)]
    pub detail: String,
}

impl TestOutcome {
    pub fn pass(name: impl Into<String>) -> Self {
        Self { name: name.into(), status: TestStatus::Pass, detail: String::new() }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { name: name.into(), status: TestStatus::Fail, detail: detail.into() }
    }

    pub fn skip(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { name: name.into(), status: TestStatus::Skip, detail: detail.into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestSummary {
    pub build_number: String,
    pub device_target: String,
}

/// Bookkeeping gathered during a run; consumed by the metadata and metrics reports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunDetails {
    pub port: Option<String>,
    pub flash_attempts: u32,
    /// Set when flashing was attempted and gave up; unknown targets never get here.
    pub flash_error: Option<String>,
    pub port_repairs: u32,
    pub recaptured: bool,
    pub reconciled: bool,
    pub evidence_path: Option<PathBuf>,
    pub boot: Option<BootRecord>,
    pub image_sha256: Option<String>,
    pub diagnostics: Vec<String>,
}

/// Final result of a run. Built once, then handed unchanged to every report emitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub flashed: bool,
    pub tests: Vec<TestOutcome>,
    pub manifest: ManifestSummary,
    pub manifest_version: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub details: RunDetails,
}

impl RunResult {
    /// Overall PASS iff flashing succeeded and no outcome failed.
    pub fn verdict(flashed: bool, tests: &[TestOutcome]) -> RunStatus {
        if flashed && !tests.iter().any(|t| t.status == TestStatus::Fail) {
            RunStatus::Pass
        } else {
            RunStatus::Fail
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.tests.iter().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Vec<String> {
        vec!["rst:0x".into(), "I (".into()]
    }

    #[test]
    fn finds_token_in_binary_log() {
        let mut bytes = vec![0xff, 0x00, 0xfe];
        bytes.extend_from_slice(b"ets Jun  8 2016 rst:0x1 (POWERON_RESET)");
        assert_eq!(find_boot_token(&bytes, &tokens()), Some("rst:0x"));
    }

    #[test]
    fn empty_tokens_never_match() {
        assert_eq!(find_boot_token(b"anything", &[String::new()]), None);
    }

    #[test]
    fn verdict_requires_flash_and_no_failures() {
        let pass = vec![TestOutcome::pass(AGGREGATE_TEST_NAME)];
        let skip = vec![TestOutcome::skip(AGGREGATE_TEST_NAME, "Test runner not found")];
        let fail = vec![TestOutcome::pass("a"), TestOutcome::fail("b", "boom")];
        assert_eq!(RunResult::verdict(true, &pass), RunStatus::Pass);
        assert_eq!(RunResult::verdict(true, &skip), RunStatus::Pass);
        assert_eq!(RunResult::verdict(true, &fail), RunStatus::Fail);
        assert_eq!(RunResult::verdict(false, &skip), RunStatus::Fail);
    }

    #[test]
    fn outcome_serializes_detail_as_failure() {
        let json = serde_json::to_value(TestOutcome::fail("t", "bad")).unwrap();
        assert_eq!(json["status"], "FAIL");
        assert_eq!(json["failure"], "bad");
    }
}
