use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::commit::CommitDescriptor;

/// Maximum size for captured compilation output before truncation (1MB)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Represents the status of a CI job
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    /// Compiled and every test passed.
    Success,
    /// Compilation or tests failed.
    Failed,
    /// The build could not be carried out (clone, checkout or process failure).
    Error,
}

impl JobStatus {
    pub fn parse(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Error)
    }
}

/// What a verification concluded about a commit
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BuildOutcome {
    CompilationFailed {
        output: String,
    },
    TestsFailed {
        failing_tests: Vec<String>,
        total_cases: usize,
        dropped_reports: usize,
    },
    Passed {
        total_cases: usize,
        dropped_reports: usize,
    },
}

impl BuildOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }
}

/// Represents a CI job with its commit and execution details
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub commit: CommitDescriptor,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<BuildOutcome>,
    pub output_truncated: bool,
    pub error: Option<String>,
}

impl Job {
    /// Create a new job in Queued status
    pub fn new(commit: CommitDescriptor) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            commit,
            status: JobStatus::Queued,
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
            output_truncated: false,
            error: None,
        }
    }

    /// Mark job as running
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    /// Record the outcome of a finished build (truncates compilation output if too large)
    pub fn mark_finished(&mut self, mut outcome: BuildOutcome) {
        self.status = if outcome.passed() {
            JobStatus::Success
        } else {
            JobStatus::Failed
        };
        self.completed_at = Some(Utc::now());

        if let BuildOutcome::CompilationFailed { output } = &mut outcome {
            if output.len() > MAX_OUTPUT_SIZE {
                let mut cut = MAX_OUTPUT_SIZE;
                while !output.is_char_boundary(cut) {
                    cut -= 1;
                }
                output.truncate(cut);
                output.push_str("\n... (output truncated)");
                self.output_truncated = true;
            }
        }

        self.outcome = Some(outcome);
    }

    /// Mark job as errored
    pub fn mark_error(&mut self, error: String) {
        self.status = JobStatus::Error;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }
}

/// Bounded in-memory history of jobs, newest last
pub struct JobStore {
    jobs: VecDeque<Job>,
    max_jobs: usize,
}

impl JobStore {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_jobs: max_jobs.max(1),
        }
    }

    /// Add a job, evicting the oldest finished jobs once the store is full
    pub fn add_job(&mut self, job: Job) {
        while self.jobs.len() >= self.max_jobs {
            match self.jobs.iter().position(|j| j.status.is_finished()) {
                Some(idx) => {
                    self.jobs.remove(idx);
                }
                None => {
                    self.jobs.pop_front();
                }
            }
        }
        self.jobs.push_back(job);
    }

    pub fn get_job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// Apply `update` to the job with `id`; returns false if it is no longer stored
    pub fn update_job<F>(&mut self, id: &str, update: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        match self.jobs.iter_mut().find(|job| job.id == id) {
            Some(job) => {
                update(job);
                true
            }
            None => false,
        }
    }

    /// Most recent jobs first
    pub fn recent_jobs(&self, limit: usize) -> Vec<Job> {
        self.jobs.iter().rev().take(limit).cloned().collect()
    }

    pub fn jobs_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.jobs
            .iter()
            .rev()
            .filter(|job| job.status == status)
            .cloned()
            .collect()
    }

    pub fn jobs_by_branch(&self, branch: &str) -> Vec<Job> {
        self.jobs
            .iter()
            .rev()
            .filter(|job| job.commit.branch_name == branch)
            .cloned()
            .collect()
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
