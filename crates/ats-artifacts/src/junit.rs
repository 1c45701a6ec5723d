use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ats_core::{RunResult, TestStatus};
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};

use crate::ReportEmitter;

pub const JUNIT_FILE: &str = "junit.xml";
pub const SUITE_NAME: &str = "ATS Hardware Tests";
pub const CLASSNAME: &str = "HardwareTest";

pub fn junit_report(result: &RunResult) -> Report {
    let mut suite = TestSuite::new(SUITE_NAME);
    for t in &result.tests {
        let status = match t.status {
            TestStatus::Pass => TestCaseStatus::success(),
            TestStatus::Fail => {
                let mut s = TestCaseStatus::non_success(NonSuccessKind::Failure);
                s.set_message(t.detail.as_str());
                s
            }
            TestStatus::Skip => {
                let mut s = TestCaseStatus::skipped();
                s.set_message(t.detail.as_str());
                s
            }
        };
        let mut case = TestCase::new(t.name.as_str(), status);
        case.set_classname(CLASSNAME);
        suite.add_test_case(case);
    }

    let mut report = Report::new("ats");
    report.add_test_suite(suite);
    report
}

pub struct JunitWriter;

impl ReportEmitter for JunitWriter {
    fn kind(&self) -> &'static str {
        "junit"
    }

    fn emit(&self, results_dir: &Path, result: &RunResult) -> Result<PathBuf> {
        let path = results_dir.join(JUNIT_FILE);
        let xml = junit_report(result).to_string().context("serialize junit report")?;
        std::fs::write(&path, xml).with_context(|| format!("write junit {}", path.display()))?;
        Ok(path)
    }
}
