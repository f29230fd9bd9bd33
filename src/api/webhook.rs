//! Webhook handler for GitHub push events

use axum::{
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
};
use tracing::{error, info};

use crate::SharedState;
use crate::job::Job;
use crate::pipeline::run_job;
use crate::webhook::{parse_push_payload, verify_github_signature};

/// Handles the GitHub webhook POST request.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // Only handle "push" events.
    let event_opt = headers.get("X-GitHub-Event").and_then(|v| v.to_str().ok());
    if event_opt != Some("push") {
        info!("Not push event; Received {:?} event", event_opt);
        return StatusCode::NO_CONTENT;
    }

    if state.config.needs_webhook_secret() {
        let Some(signature) = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
        else {
            error!("Webhook secret required, but no signature header supplied.");
            return StatusCode::UNAUTHORIZED;
        };
        if !state.config.has_valid_secret() {
            error!("Webhook secret required, but none was configured.");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        let secret = state.config.webhook_secret.as_deref().unwrap_or_default();
        if !verify_github_signature(secret, &body, signature) {
            error!("Signature verification failed!");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let commit = match parse_push_payload(&body) {
        Ok(Some(commit)) => commit,
        Ok(None) => {
            info!("Push event without head commit (branch deletion), skipping.");
            return StatusCode::NO_CONTENT;
        }
        Err(e) => {
            error!("{}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let job = Job::new(commit);
    let job_id = job.id.clone();
    info!(
        "Created job {} for {} branch '{}' commit {}",
        job_id, job.commit.repo_url, job.commit.branch_name, job.commit.commit_hash
    );

    {
        let mut store = state.job_store.lock().await;
        store.add_job(job);
    }

    // Respond right away; the build runs in the background
    tokio::spawn(run_job(state.clone(), job_id));

    StatusCode::OK
}
