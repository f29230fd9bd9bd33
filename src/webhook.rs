//! Webhook payload extraction and signature verification

use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error};

use crate::commit::CommitDescriptor;
use crate::error::{CiError, Result};

type HmacSha256 = Hmac<Sha256>;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// The subset of a GitHub push payload a build needs
#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: Repository,
    head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    id: String,
    message: String,
    committer: Committer,
}

#[derive(Debug, Deserialize)]
struct Committer {
    email: String,
    name: String,
}

/// Strips a leading `refs/heads/` from a push ref.
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(git_ref)
}

/// Extracts the commit to build from a push event body.
///
/// Returns `Ok(None)` for pushes without a head commit (branch deletions).
pub fn parse_push_payload(body: &[u8]) -> Result<Option<CommitDescriptor>> {
    let payload: PushPayload = serde_json::from_slice(body).map_err(|e| {
        CiError::WebhookValidationFailed(format!("Could not parse push payload: {}", e))
    })?;

    let Some(head_commit) = payload.head_commit else {
        debug!("Push to '{}' has no head commit", payload.git_ref);
        return Ok(None);
    };

    Ok(Some(CommitDescriptor {
        repo_url: payload.repository.html_url,
        branch_name: branch_from_ref(&payload.git_ref).to_string(),
        commit_hash: head_commit.id,
        committer_email: head_commit.committer.email,
        committer_name: head_commit.committer.name,
        message: head_commit.message,
    }))
}

/// Helper function for verifying GitHub webhook signature
pub fn verify_github_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    // Expected format: "sha256=..."
    let Some(git_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    match hex_decode(git_signature) {
        Ok(git_signature_bytes) => mac.verify_slice(&git_signature_bytes).is_ok(),
        Err(_) => {
            error!("Signature verification failed");
            false
        }
    }
}
