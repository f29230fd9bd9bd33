//! Compile and test phases for one workspace

use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::BuildConfig;
use crate::error::{CiError, Result};
use crate::process::run_captured;
use crate::report::{ReportCollection, load_reports};
use crate::snapshot::Workspace;

/// Lifecycle of a [`BuildVerifier`]; each phase runs exactly once, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierState {
    Created,
    Compiled,
    Tested,
}

/// Runs the compile and test commands of one workspace and keeps their results.
#[derive(Debug)]
pub struct BuildVerifier {
    workspace: Workspace,
    compile_command: String,
    test_command: String,
    report_dir_pattern: Regex,
    fallback_report_dir: Option<String>,
    state: VerifierState,
    compilation_output: Option<String>,
    test_output: Option<String>,
    report_dir: Option<PathBuf>,
    reports: Option<ReportCollection>,
}

impl BuildVerifier {
    pub fn new(workspace: Workspace, config: &BuildConfig) -> Result<Self> {
        let report_dir_pattern = Regex::new(&config.report_dir_pattern).map_err(|e| {
            CiError::ConfigError(format!(
                "Invalid report_dir_pattern '{}': {}",
                config.report_dir_pattern, e
            ))
        })?;

        Ok(Self {
            workspace,
            compile_command: config.compile_command.clone(),
            test_command: config.test_command.clone(),
            report_dir_pattern,
            fallback_report_dir: config.fallback_report_dir.clone(),
            state: VerifierState::Created,
            compilation_output: None,
            test_output: None,
            report_dir: None,
            reports: None,
        })
    }

    /// Opens an existing project directory and wraps it in a verifier.
    pub fn open(path: impl Into<PathBuf>, config: &BuildConfig) -> Result<Self> {
        let workspace = Workspace::open(path, "", &config.build_descriptor)?;
        Self::new(workspace, config)
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn state(&self) -> VerifierState {
        self.state
    }

    /// Runs the compile command; `true` when it exits with code 0.
    ///
    /// The captured output ends with an `Exit Code: <n>` line. Calling this a
    /// second time is a [`CiError::StateViolation`].
    pub async fn verify_compilation(&mut self) -> Result<bool> {
        self.require(VerifierState::Created, "The code has already been compiled.")?;

        let root = self.workspace.root();
        info!(path = ?root, "Compiling: {}", self.compile_command);
        let captured = run_captured(&self.compile_command, root, |_| {}).await?;

        let passed = captured.success();
        let mut output = captured.output;
        output.push_str(&format!("Exit Code: {}\n", captured.exit_code));
        info!(exit_code = captured.exit_code, "Compilation finished");

        self.compilation_output = Some(output);
        self.state = VerifierState::Compiled;
        Ok(passed)
    }

    pub fn compilation_output(&self) -> Result<&str> {
        match &self.compilation_output {
            Some(output) => Ok(output),
            None => Err(CiError::StateViolation(
                "No compilation has been done yet.".to_string(),
            )),
        }
    }

    /// Runs the test command and collects the reports it announces.
    ///
    /// Returns `true` when the command exits with code 0. Must follow
    /// [`verify_compilation`](Self::verify_compilation) and runs only once.
    pub async fn run_tests(&mut self) -> Result<bool> {
        match self.state {
            VerifierState::Created => {
                return Err(CiError::StateViolation(
                    "The code must be compiled before running tests.".to_string(),
                ));
            }
            VerifierState::Tested => {
                return Err(CiError::StateViolation(
                    "The tests have already been run.".to_string(),
                ));
            }
            VerifierState::Compiled => {}
        }

        let root = self.workspace.root();
        info!(path = ?root, "Testing: {}", self.test_command);
        let pattern = &self.report_dir_pattern;
        let mut announced: Option<String> = None;
        let captured = run_captured(&self.test_command, root, |line| {
            if announced.is_none() {
                announced = announced_report_dir(pattern, line);
            }
        })
        .await?;
        info!(exit_code = captured.exit_code, "Tests finished");

        let report_dir = match announced {
            Some(dir) => Some(resolve(root, &dir)),
            None => match &self.fallback_report_dir {
                Some(fallback) => {
                    warn!("Test output announced no report directory, using {}", fallback);
                    Some(resolve(root, fallback))
                }
                None => {
                    warn!("Test output announced no report directory, no reports collected");
                    None
                }
            },
        };

        let reports = match &report_dir {
            Some(dir) => load_reports(dir),
            None => ReportCollection::default(),
        };
        info!(
            reports = reports.reports.len(),
            dropped = reports.dropped,
            failed_cases = reports.failed_cases(),
            "Collected test reports"
        );

        let passed = captured.success();
        self.test_output = Some(captured.output);
        self.report_dir = report_dir;
        self.reports = Some(reports);
        self.state = VerifierState::Tested;
        Ok(passed)
    }

    /// Parsed reports of the test phase.
    pub fn test_reports(&self) -> Result<&ReportCollection> {
        self.reports.as_ref().ok_or_else(not_tested)
    }

    pub fn test_output(&self) -> Result<&str> {
        self.test_output.as_deref().ok_or_else(not_tested)
    }

    /// Directory the reports were collected from, if any was found.
    pub fn report_directory(&self) -> Result<Option<&Path>> {
        self.require(VerifierState::Tested, "No test has been run yet.")?;
        Ok(self.report_dir.as_deref())
    }

    fn require(&self, expected: VerifierState, message: &str) -> Result<()> {
        if self.state != expected {
            return Err(CiError::StateViolation(message.to_string()));
        }
        Ok(())
    }
}

fn not_tested() -> CiError {
    CiError::StateViolation("No test has been run yet.".to_string())
}

/// Report directory named by a line of test output, if it is an announcement.
fn announced_report_dir(pattern: &Regex, line: &str) -> Option<String> {
    let captures = pattern.captures(line)?;
    let path = captures.name("path").or_else(|| captures.get(1))?;
    Some(path.as_str().trim().to_string())
}

fn resolve(root: &Path, dir: &str) -> PathBuf {
    let dir = Path::new(dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}
