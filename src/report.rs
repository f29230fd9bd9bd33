//! Test report parsing
//!
//! Reports are JUnit-style XML files (as written by maven surefire and most
//! other test runners): `testcase` elements, each failing when it carries a
//! `failure` or `error` child.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CiError, Result};

/// One `testcase` element
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCase {
    pub name: String,
    pub classname: Option<String>,
    pub time: Option<f64>,
    pub failed: bool,
}

/// The test cases of one report file, in document order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestSuiteReport {
    pub name: Option<String>,
    pub cases: Vec<TestCase>,
}

impl TestSuiteReport {
    pub fn failed_cases(&self) -> usize {
        self.cases.iter().filter(|case| case.failed).count()
    }
}

/// Every report that could be read and parsed from one report directory
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportCollection {
    pub reports: Vec<TestSuiteReport>,
    /// Report files skipped because they could not be read or parsed.
    pub dropped: usize,
}

impl ReportCollection {
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn total_cases(&self) -> usize {
        self.reports.iter().map(|report| report.cases.len()).sum()
    }

    pub fn failed_cases(&self) -> usize {
        self.reports.iter().map(TestSuiteReport::failed_cases).sum()
    }

    /// Names of failing test cases across all reports, in collection order.
    pub fn failing_tests(&self) -> Vec<String> {
        self.reports.iter().flat_map(extract_failing_tests).collect()
    }
}

/// Parses report XML. Malformed, empty and whitespace-only content yields `None`.
pub fn parse_report(content: &str) -> Option<TestSuiteReport> {
    let document = match roxmltree::Document::parse(content) {
        Ok(document) => document,
        Err(e) => {
            debug!("Failed to parse report content: {}", e);
            return None;
        }
    };

    let root = document.root_element();
    let name = if root.has_tag_name("testsuite") {
        root.attribute("name").map(String::from)
    } else {
        None
    };

    let cases = document
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "testcase")
        .map(|node| TestCase {
            name: node.attribute("name").unwrap_or_default().to_string(),
            classname: node.attribute("classname").map(String::from),
            time: node.attribute("time").and_then(|t| t.parse().ok()),
            failed: node.children().any(|child| {
                child.is_element() && matches!(child.tag_name().name(), "failure" | "error")
            }),
        })
        .collect();

    Some(TestSuiteReport { name, cases })
}

/// Names of the failing cases of one report, in document order.
pub fn extract_failing_tests(report: &TestSuiteReport) -> Vec<String> {
    report
        .cases
        .iter()
        .filter(|case| case.failed)
        .map(|case| case.name.clone())
        .collect()
}

/// Reads and parses a single report file.
pub fn load_report_file(path: &Path) -> Result<TestSuiteReport> {
    let content = std::fs::read_to_string(path).map_err(|e| CiError::ParseFailure {
        path: path.to_path_buf(),
        message: format!("unreadable: {}", e),
    })?;

    parse_report(&content).ok_or_else(|| CiError::ParseFailure {
        path: path.to_path_buf(),
        message: "not a well-formed XML document".to_string(),
    })
}

/// Collects every `.xml` report below `dir`.
///
/// Files that fail to read or parse are skipped and counted in
/// [`ReportCollection::dropped`]; a missing directory yields an empty collection.
pub fn load_reports(dir: &Path) -> ReportCollection {
    let mut collection = ReportCollection::default();

    if !dir.is_dir() {
        warn!(path = ?dir, "Report directory does not exist");
        return collection;
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable report entry: {}", e);
                collection.dropped += 1;
                continue;
            }
        };
        if entry.file_type().is_file() && has_xml_extension(entry.path()) {
            paths.push(entry.into_path());
        }
    }

    for path in paths {
        match load_report_file(&path) {
            Ok(report) => collection.reports.push(report),
            Err(e) => {
                warn!("Dropping report: {}", e);
                collection.dropped += 1;
            }
        }
    }

    debug!(
        path = ?dir,
        reports = collection.reports.len(),
        dropped = collection.dropped,
        "Loaded test reports"
    );
    collection
}

fn has_xml_extension(path: &Path) -> bool {
    path.to_string_lossy().to_lowercase().ends_with(".xml")
}
