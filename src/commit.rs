//! Identity of the commit a build is run for

use serde::Serialize;

/// The normalized fields of one push event that a build needs.
/// Built once per webhook delivery and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitDescriptor {
    pub repo_url: String,
    pub branch_name: String,
    pub commit_hash: String,
    pub committer_email: String,
    pub committer_name: String,
    pub message: String,
}

impl CommitDescriptor {
    /// First seven characters of the hash, for subjects and log lines.
    pub fn short_hash(&self) -> &str {
        let end = self
            .commit_hash
            .char_indices()
            .nth(7)
            .map(|(idx, _)| idx)
            .unwrap_or(self.commit_hash.len());
        &self.commit_hash[..end]
    }

    /// First line of the commit message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}
