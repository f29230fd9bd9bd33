//! Server status endpoint

use axum::{
    Json,
    extract::{Query, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::SharedState;
use crate::job::{Job, JobStatus};

const DEFAULT_LIMIT: usize = 10;

/// Query parameters for the status listing
#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Filter by status (queued, running, success, failed, error)
    pub status: Option<String>,
    /// Filter by branch
    pub branch: Option<String>,
    /// Number of jobs returned without filters (default: 10)
    pub limit: Option<usize>,
}

/// Job counts per status
#[derive(Debug, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub error: usize,
}

/// GET /status - Server status with job information
/// Supports query parameters: ?status=failed or ?branch=main
pub async fn status(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<StatusQuery>,
) -> impl IntoResponse {
    let store = state.job_store.lock().await;

    let jobs: Vec<Job> = if let Some(branch) = &params.branch {
        store.jobs_by_branch(branch)
    } else if let Some(status_str) = &params.status {
        match JobStatus::parse(status_str) {
            Some(status) => store.jobs_by_status(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "Invalid status. Use: queued, running, success, failed, error"
                    })),
                )
                    .into_response();
            }
        }
    } else {
        store.recent_jobs(params.limit.unwrap_or(DEFAULT_LIMIT))
    };

    let stats = JobStats {
        total: store.len(),
        queued: store.count_by_status(JobStatus::Queued),
        running: store.count_by_status(JobStatus::Running),
        success: store.count_by_status(JobStatus::Success),
        failed: store.count_by_status(JobStatus::Failed),
        error: store.count_by_status(JobStatus::Error),
    };

    Json(json!({
        "server": {
            "name": "commit_ci",
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
        },
        "jobs": {
            "stats": stats,
            "filtered": jobs,
            "filtered_count": jobs.len(),
        },
        "build": {
            "base_dir": state.snapshotter.base_dir(),
            "compile_command": state.config.build.compile_command,
            "test_command": state.config.build.test_command,
        }
    }))
    .into_response()
}
