//! HTTP surface: webhook intake and job status

pub mod jobs;
pub mod stats;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

pub use jobs::{get_job, root};
pub use stats::status;
pub use webhook::handle_webhook;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", routing::get(root))
        .route("/webhook", routing::post(handle_webhook))
        .route("/status", routing::get(status))
        .route("/job/{id}", routing::get(get_job))
        .with_state(state)
}
