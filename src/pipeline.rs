//! The build pipeline: snapshot, compile, test, report, notify

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::commit::CommitDescriptor;
use crate::error::{CiError, Result, SnapshotError};
use crate::job::BuildOutcome;
use crate::notify::Notification;
use crate::snapshot::RepositorySnapshotter;
use crate::verifier::BuildVerifier;
use crate::{BuildConfig, SharedState};

/// Snapshots `commit`, compiles it and, if that succeeds, runs its tests.
///
/// A failing compile or test command is an `Ok` outcome; only snapshot,
/// configuration and process failures are errors.
pub async fn verify_commit(
    snapshotter: &RepositorySnapshotter,
    config: &BuildConfig,
    commit: &CommitDescriptor,
) -> Result<BuildOutcome> {
    let workspace = snapshotter.snapshot_commit(commit).await?;
    let mut verifier = BuildVerifier::new(workspace, config)?;

    if !verifier.verify_compilation().await? {
        info!(commit = %commit.short_hash(), "Compilation failed");
        return Ok(BuildOutcome::CompilationFailed {
            output: verifier.compilation_output()?.to_string(),
        });
    }

    let passed = verifier.run_tests().await?;
    let reports = verifier.test_reports()?;
    let total_cases = reports.total_cases();
    let dropped_reports = reports.dropped;

    if passed {
        info!(commit = %commit.short_hash(), total_cases, "Tests passed");
        Ok(BuildOutcome::Passed {
            total_cases,
            dropped_reports,
        })
    } else {
        let failing_tests = reports.failing_tests();
        info!(
            commit = %commit.short_hash(),
            failing = failing_tests.len(),
            "Tests failed"
        );
        Ok(BuildOutcome::TestsFailed {
            failing_tests,
            total_cases,
            dropped_reports,
        })
    }
}

/// Runs the job `job_id` to completion, recording its result and notifying the committer.
pub async fn run_job(state: SharedState, job_id: String) {
    let commit = {
        let mut store = state.job_store.lock().await;
        let mut commit = None;
        store.update_job(&job_id, |job| {
            job.mark_running();
            commit = Some(job.commit.clone());
        });
        commit
    };
    let Some(commit) = commit else {
        error!("Job {} is not in the job store", job_id);
        return;
    };

    info!(
        "Job {} - Verifying commit {} on branch '{}'",
        job_id, commit.commit_hash, commit.branch_name
    );

    let result = verify_commit(&state.snapshotter, &state.config.build, &commit).await;

    let notification = match result {
        Ok(outcome) => {
            info!("Job {} finished: passed = {}", job_id, outcome.passed());
            let notification = Notification::for_outcome(&commit, &outcome);
            let mut store = state.job_store.lock().await;
            if !store.update_job(&job_id, |job| job.mark_finished(outcome)) {
                warn!("Job {} was evicted before it finished; its outcome is lost", job_id);
            }
            notification
        }
        Err(e) => {
            error!("Job {} failed: {}", job_id, e);
            let notification = Notification::for_error(&commit, &e.to_string());
            let mut store = state.job_store.lock().await;
            if !store.update_job(&job_id, |job| job.mark_error(e.to_string())) {
                warn!("Job {} was evicted before it finished; its error is lost", job_id);
            }
            notification
        }
    };

    // Delivery may block on the network
    let notifier = Arc::clone(&state.notifier);
    let recipient = notification.recipient.clone();
    match tokio::task::spawn_blocking(move || notifier.notify(&notification)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Job {} - failed to notify {}: {}", job_id, recipient, e),
        Err(e) => error!("Job {} - notifier task failed: {}", job_id, e),
    }

    if state.config.cleanup_workspaces() {
        match state.snapshotter.remove_workspace(&commit.commit_hash).await {
            Ok(()) => {}
            Err(CiError::Snapshot(SnapshotError::NotFound(path))) => {
                debug!("Job {} - no build directory to clean up at {:?}", job_id, path);
            }
            Err(e) => warn!("Job {} - failed to clean up build directory: {}", job_id, e),
        }
    }
}
