//! Commit-exact working copies of remote repositories
//!
//! Every commit gets its own `build-<commit>` directory below a configured
//! base directory. Snapshotting the same commit again wipes that directory
//! first, so a retriggered build always starts from a clean clone.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::commit::CommitDescriptor;
use crate::error::{CiError, Result, SnapshotError};

const BUILD_DIR_PREFIX: &str = "build-";
const REMOTE_REF_PREFIX: &str = "refs/remotes/";
const LOCAL_REF_PREFIX: &str = "refs/heads/";

/// A local directory holding the tree of one commit.
///
/// Workspaces produced by [`RepositorySnapshotter::snapshot`] hold the lock of
/// their commit until dropped, so no other snapshot of the same commit can
/// replace the directory while it is being built.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    commit_hash: String,
    _lease: Option<OwnedMutexGuard<()>>,
}

impl Workspace {
    /// Opens an existing directory as a workspace.
    ///
    /// Fails with [`CiError::ConfigError`] when `root` does not exist, is not a
    /// directory, or has no `build_descriptor` file at its top level.
    pub fn open(
        root: impl Into<PathBuf>,
        commit_hash: impl Into<String>,
        build_descriptor: &str,
    ) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            return Err(CiError::ConfigError(format!(
                "Workspace path {:?} does not exist",
                root
            )));
        }
        if !root.is_dir() {
            return Err(CiError::ConfigError(format!(
                "Workspace path {:?} is not a directory",
                root
            )));
        }
        if !root.join(build_descriptor).is_file() {
            return Err(CiError::ConfigError(format!(
                "No {} found in {:?}",
                build_descriptor, root
            )));
        }

        Ok(Self {
            root,
            commit_hash: commit_hash.into(),
            _lease: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn commit_hash(&self) -> &str {
        &self.commit_hash
    }

    fn with_lease(mut self, lease: OwnedMutexGuard<()>) -> Self {
        self._lease = Some(lease);
        self
    }
}

/// Per-commit mutual exclusion for build directories
#[derive(Debug, Clone, Default)]
pub struct CommitLocks {
    locks: Arc<StdMutex<HashMap<String, Weak<Mutex<()>>>>>,
}

impl CommitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no one else holds the lock of `commit_hash`.
    pub async fn acquire(&self, commit_hash: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(commit_hash).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(commit_hash.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Number of commits whose lock is currently held or awaited.
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|lock| lock.strong_count() > 0).count()
    }
}

/// Clones repositories into per-commit build directories
#[derive(Debug, Clone)]
pub struct RepositorySnapshotter {
    base_dir: PathBuf,
    build_descriptor: String,
    locks: CommitLocks,
}

impl RepositorySnapshotter {
    pub fn new(base_dir: impl Into<PathBuf>, build_descriptor: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            build_descriptor: build_descriptor.into(),
            locks: CommitLocks::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Build directory of `commit_hash`; the same hash always maps to the same path.
    pub fn workspace_path(&self, commit_hash: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}{}", BUILD_DIR_PREFIX, commit_hash))
    }

    pub async fn snapshot_commit(&self, commit: &CommitDescriptor) -> Result<Workspace> {
        self.snapshot(&commit.repo_url, &commit.commit_hash, &commit.branch_name)
            .await
    }

    /// Materializes `commit_hash` of `repo_url` into a fresh build directory.
    ///
    /// Clones the repository, checks out the first branch candidate that
    /// exists on the remote and hard-resets the working tree to the commit.
    pub async fn snapshot(
        &self,
        repo_url: &str,
        commit_hash: &str,
        branch_name: &str,
    ) -> Result<Workspace> {
        validate_commit_hash(commit_hash)?;
        let lease = self.locks.acquire(commit_hash).await;
        let dir = self.workspace_path(commit_hash);

        info!(commit = %commit_hash, branch = %branch_name, path = ?dir, "Creating snapshot");
        prepare_directory(&dir).await?;

        git(&dir, &["clone", "--quiet", "--", repo_url, "."])
            .await
            .map_err(|message| SnapshotError::Clone {
                url: repo_url.to_string(),
                message,
            })?;

        let known = known_branches(&dir).await?;
        let reference = resolve_branch(branch_name, &known).ok_or_else(|| {
            SnapshotError::BranchNotFound {
                branch: branch_name.to_string(),
                candidates: branch_candidates(branch_name),
            }
        })?;
        let local = short_branch_name(branch_name);
        debug!("Resolved branch '{}' to '{}'", branch_name, reference);

        git(&dir, &["checkout", "--quiet", "-B", local, reference.as_str()])
            .await
            .map_err(|message| SnapshotError::Checkout {
                reference: reference.clone(),
                message,
            })?;

        git(&dir, &["reset", "--quiet", "--hard", commit_hash])
            .await
            .map_err(|message| SnapshotError::Reset {
                commit: commit_hash.to_string(),
                message,
            })?;

        info!(commit = %commit_hash, path = ?dir, "Snapshot ready");
        let workspace = Workspace::open(&dir, commit_hash, &self.build_descriptor)?;
        Ok(workspace.with_lease(lease))
    }

    /// Deletes the build directory of `commit_hash`.
    pub async fn remove_workspace(&self, commit_hash: &str) -> Result<()> {
        validate_commit_hash(commit_hash)?;
        let _lease = self.locks.acquire(commit_hash).await;
        let dir = self.workspace_path(commit_hash);
        if !dir.exists() {
            return Err(SnapshotError::NotFound(dir).into());
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|source| SnapshotError::Workspace {
                path: dir.clone(),
                source,
            })?;
        info!(commit = %commit_hash, path = ?dir, "Removed build directory");
        Ok(())
    }
}

/// Branch references tried in order when checking out `branch_name`.
///
/// A qualified name (`refs/heads/main`, `origin/main`) is tried as given
/// first, then through the chain of its short name.
pub fn branch_candidates(branch_name: &str) -> Vec<String> {
    let chain = |name: &str| {
        [
            name.to_string(),
            format!("refs/heads/{}", name),
            format!("refs/remotes/origin/{}", name),
            format!("origin/{}", name),
        ]
    };

    let mut candidates = chain(branch_name).to_vec();
    let short = short_branch_name(branch_name);
    if short != branch_name {
        for candidate in chain(short) {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// First candidate of `branch_name` present in `known`.
pub fn resolve_branch(branch_name: &str, known: &HashSet<String>) -> Option<String> {
    if branch_name.is_empty() {
        return None;
    }
    branch_candidates(branch_name)
        .into_iter()
        .find(|candidate| known.contains(candidate))
}

/// Local branch name for a possibly qualified reference.
fn short_branch_name(branch_name: &str) -> &str {
    [LOCAL_REF_PREFIX, "refs/remotes/origin/", "origin/"]
        .iter()
        .find_map(|prefix| branch_name.strip_prefix(prefix))
        .unwrap_or(branch_name)
}

fn validate_commit_hash(commit_hash: &str) -> Result<()> {
    if commit_hash.is_empty() || !commit_hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SnapshotError::InvalidCommitHash(commit_hash.to_string()).into());
    }
    Ok(())
}

async fn prepare_directory(dir: &Path) -> Result<()> {
    let workspace_error = |source| SnapshotError::Workspace {
        path: dir.to_path_buf(),
        source,
    };

    if tokio::fs::try_exists(dir).await.map_err(workspace_error)? {
        debug!(path = ?dir, "Removing previous build directory");
        tokio::fs::remove_dir_all(dir).await.map_err(workspace_error)?;
    }
    tokio::fs::create_dir_all(dir).await.map_err(workspace_error)?;
    Ok(())
}

/// Local and remote-tracking branches of a clone, by full
/// (`refs/heads/main`, `refs/remotes/origin/main`) and short
/// (`main`, `origin/main`) name.
async fn known_branches(dir: &Path) -> Result<HashSet<String>> {
    let listing = git(
        dir,
        &[
            "for-each-ref",
            "--format=%(refname)",
            LOCAL_REF_PREFIX,
            REMOTE_REF_PREFIX,
        ],
    )
    .await
    .map_err(|message| SnapshotError::Checkout {
        reference: format!("{} {}", LOCAL_REF_PREFIX, REMOTE_REF_PREFIX),
        message,
    })?;

    let mut known = HashSet::new();
    for refname in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let short = refname
            .strip_prefix(LOCAL_REF_PREFIX)
            .or_else(|| refname.strip_prefix(REMOTE_REF_PREFIX));
        if let Some(short) = short {
            known.insert(short.to_string());
        }
        known.insert(refname.to_string());
    }
    Ok(known)
}

/// Runs git inside `cwd`, returning stdout or the failure message.
async fn git(cwd: &Path, args: &[&str]) -> std::result::Result<String, String> {
    info!("Running (cwd = {:?}): git {}", cwd, args.join(" "));
    let output = Command::new("git")
        .current_dir(cwd)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .map_err(|e| {
            error!("git {} failed to start: {}", args[0], e);
            format!("git {} failed to start: {}", args[0], e)
        })?;

    if !output.status.success() {
        let msg = format!(
            "git {} failed: {}",
            args[0],
            String::from_utf8_lossy(&output.stderr).trim()
        );
        error!("{}", msg);
        return Err(msg);
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use std::time::Duration;
    use tempfile::TempDir;

    fn run_git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit_file(dir: &Path, file: &str, content: &str, message: &str) -> String {
        std::fs::write(dir.join(file), content).unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "--quiet", "-m", message]);
        run_git(dir, &["rev-parse", "HEAD"])
    }

    /// Origin repository: two commits on `main`, one more on `feature`.
    struct Origin {
        dir: TempDir,
        first: String,
        second: String,
        feature: String,
    }

    impl Origin {
        fn create() -> Self {
            let dir = TempDir::new().expect("failed to create temp dir");
            let path = dir.path();
            run_git(path, &["init", "--quiet"]);
            run_git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
            run_git(path, &["config", "user.email", "test@test.com"]);
            run_git(path, &["config", "user.name", "Test User"]);
            run_git(path, &["config", "commit.gpgsign", "false"]);

            std::fs::write(path.join("pom.xml"), "<project/>").unwrap();
            let first = commit_file(path, "Main.java", "v1", "first");
            let second = commit_file(path, "Main.java", "v2", "second");

            run_git(path, &["checkout", "--quiet", "-b", "feature"]);
            let feature = commit_file(path, "Feature.java", "feature", "feature work");
            run_git(path, &["checkout", "--quiet", "main"]);

            Self {
                dir,
                first,
                second,
                feature,
            }
        }

        fn url(&self) -> &str {
            self.dir.path().to_str().unwrap()
        }
    }

    fn snapshotter(base: &TempDir) -> RepositorySnapshotter {
        RepositorySnapshotter::new(base.path().join("builds"), "pom.xml")
    }

    #[tokio::test]
    async fn snapshot_resets_to_requested_commit() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();
        let snapshotter = snapshotter(&base);

        let workspace = snapshotter
            .snapshot(origin.url(), &origin.first, "main")
            .await
            .unwrap();

        assert_eq!(workspace.root(), snapshotter.workspace_path(&origin.first));
        assert!(workspace.root().ends_with(format!("build-{}", origin.first)));
        assert_eq!(workspace.commit_hash(), origin.first);
        assert_eq!(
            std::fs::read_to_string(workspace.root().join("Main.java")).unwrap(),
            "v1"
        );
        assert_eq!(run_git(workspace.root(), &["rev-parse", "HEAD"]), origin.first);
        assert_eq!(
            run_git(workspace.root(), &["rev-parse", "--abbrev-ref", "HEAD"]),
            "main"
        );
    }

    #[tokio::test]
    async fn resnapshot_replaces_previous_contents() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();
        let snapshotter = snapshotter(&base);

        let workspace = snapshotter
            .snapshot(origin.url(), &origin.second, "main")
            .await
            .unwrap();
        std::fs::write(workspace.root().join("stray.txt"), "left over").unwrap();
        std::fs::create_dir(workspace.root().join("target")).unwrap();
        drop(workspace);

        let workspace = snapshotter
            .snapshot(origin.url(), &origin.second, "main")
            .await
            .unwrap();
        assert!(!workspace.root().join("stray.txt").exists());
        assert!(!workspace.root().join("target").exists());
        assert_eq!(
            std::fs::read_to_string(workspace.root().join("Main.java")).unwrap(),
            "v2"
        );
    }

    #[tokio::test]
    async fn fully_qualified_remote_ref_resolves() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();
        let snapshotter = snapshotter(&base);

        let workspace = snapshotter
            .snapshot(origin.url(), &origin.feature, "refs/remotes/origin/feature")
            .await
            .unwrap();

        assert!(workspace.root().join("Feature.java").exists());
        assert_eq!(
            run_git(workspace.root(), &["rev-parse", "--abbrev-ref", "HEAD"]),
            "feature"
        );
    }

    #[tokio::test]
    async fn fully_qualified_local_ref_resolves() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();
        let snapshotter = snapshotter(&base);

        let workspace = snapshotter
            .snapshot(origin.url(), &origin.second, "refs/heads/main")
            .await
            .unwrap();
        assert_eq!(
            run_git(workspace.root(), &["rev-parse", "--abbrev-ref", "HEAD"]),
            "main"
        );
        assert_eq!(run_git(workspace.root(), &["rev-parse", "HEAD"]), origin.second);
        drop(workspace);

        // Not the clone's default branch, so only the remote-tracking ref exists.
        let workspace = snapshotter
            .snapshot(origin.url(), &origin.feature, "refs/heads/feature")
            .await
            .unwrap();
        assert_eq!(
            run_git(workspace.root(), &["rev-parse", "--abbrev-ref", "HEAD"]),
            "feature"
        );
        assert!(workspace.root().join("Feature.java").exists());
    }

    #[tokio::test]
    async fn option_like_repository_url_is_not_parsed_as_a_flag() {
        let base = TempDir::new().unwrap();
        let marker = base.path().join("uploaded");

        let err = snapshotter(&base)
            .snapshot(
                &format!("--upload-pack=touch {}", marker.display()),
                "abc1234",
                "main",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CiError::Snapshot(SnapshotError::Clone { .. })));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn unknown_branch_is_a_typed_failure() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();

        let err = snapshotter(&base)
            .snapshot(origin.url(), &origin.first, "does-not-exist")
            .await
            .unwrap_err();
        match err {
            CiError::Snapshot(SnapshotError::BranchNotFound { branch, candidates }) => {
                assert_eq!(branch, "does-not-exist");
                assert_eq!(candidates.len(), 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_commit_fails_reset() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();

        let err = snapshotter(&base)
            .snapshot(origin.url(), "0123456789abcdef0123456789abcdef01234567", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::Snapshot(SnapshotError::Reset { .. })));
    }

    #[tokio::test]
    async fn unreachable_repository_fails_clone() {
        let base = TempDir::new().unwrap();
        let missing = base.path().join("no-such-repo");

        let err = snapshotter(&base)
            .snapshot(missing.to_str().unwrap(), "abc123", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::Snapshot(SnapshotError::Clone { .. })));
    }

    #[tokio::test]
    async fn path_like_commit_hashes_are_rejected() {
        let base = TempDir::new().unwrap();
        let snapshotter = snapshotter(&base);

        for hash in ["", "../escape", "a/b", "-rf"] {
            let err = snapshotter.snapshot("unused", hash, "main").await.unwrap_err();
            assert!(
                matches!(err, CiError::Snapshot(SnapshotError::InvalidCommitHash(_))),
                "{hash:?} was accepted"
            );
        }
    }

    #[tokio::test]
    async fn missing_build_descriptor_is_a_configuration_error() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();
        let snapshotter = RepositorySnapshotter::new(base.path().join("builds"), "Cargo.toml");

        let err = snapshotter
            .snapshot(origin.url(), &origin.first, "main")
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::ConfigError(_)));
    }

    #[tokio::test]
    async fn remove_workspace_deletes_build_directory() {
        let origin = Origin::create();
        let base = TempDir::new().unwrap();
        let snapshotter = snapshotter(&base);

        let workspace = snapshotter
            .snapshot(origin.url(), &origin.first, "main")
            .await
            .unwrap();
        let root = workspace.root().to_path_buf();
        drop(workspace);

        snapshotter.remove_workspace(&origin.first).await.unwrap();
        assert!(!root.exists());

        let err = snapshotter.remove_workspace(&origin.first).await.unwrap_err();
        assert!(matches!(err, CiError::Snapshot(SnapshotError::NotFound(_))));
    }

    #[tokio::test]
    async fn commit_lock_serializes_same_hash() {
        let locks = CommitLocks::new();
        let guard = locks.acquire("abc").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire("abc")).await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire("def")).await;
        assert!(other.is_ok());
        drop(other);

        drop(guard);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.acquire("abc")).await;
        assert!(reacquired.is_ok());
        drop(reacquired);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn resolve_branch_stops_at_first_match() {
        let known: HashSet<String> = ["main", "refs/remotes/origin/main", "origin/main"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(resolve_branch("main", &known).as_deref(), Some("main"));
    }

    #[test]
    fn resolve_branch_falls_back_to_remote_refs() {
        let known: HashSet<String> = ["refs/remotes/origin/main", "origin/main"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            resolve_branch("main", &known).as_deref(),
            Some("refs/remotes/origin/main")
        );
        assert_eq!(
            resolve_branch("refs/remotes/origin/main", &known).as_deref(),
            Some("refs/remotes/origin/main")
        );
        assert_eq!(resolve_branch("origin/main", &known).as_deref(), Some("origin/main"));
        assert_eq!(resolve_branch("dev", &known), None);
        assert_eq!(resolve_branch("", &known), None);
    }

    #[test]
    fn qualified_names_fall_back_to_their_short_chain() {
        assert_eq!(branch_candidates("main").len(), 4);
        assert_eq!(
            branch_candidates("refs/heads/main"),
            vec![
                "refs/heads/main",
                "refs/heads/refs/heads/main",
                "refs/remotes/origin/refs/heads/main",
                "origin/refs/heads/main",
                "main",
                "refs/remotes/origin/main",
                "origin/main",
            ]
        );

        let known: HashSet<String> = ["refs/remotes/origin/feature", "origin/feature"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            resolve_branch("refs/heads/feature", &known).as_deref(),
            Some("refs/remotes/origin/feature")
        );
    }

    #[test]
    fn short_branch_name_strips_qualifiers() {
        assert_eq!(short_branch_name("main"), "main");
        assert_eq!(short_branch_name("refs/heads/main"), "main");
        assert_eq!(short_branch_name("refs/remotes/origin/feature/x"), "feature/x");
        assert_eq!(short_branch_name("origin/main"), "main");
    }

    #[test]
    fn open_accepts_directory_with_descriptor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        let workspace = Workspace::open(dir.path(), "abc", "pom.xml").unwrap();
        assert_eq!(workspace.root(), dir.path());
        assert_eq!(workspace.commit_hash(), "abc");
    }

    #[test]
    fn open_rejects_invalid_paths() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        let empty = TempDir::new().unwrap();

        for path in [
            empty.path().to_path_buf(),
            dir.path().join("pom.xml"),
            dir.path().join("qwerty"),
        ] {
            let err = Workspace::open(&path, "abc", "pom.xml").unwrap_err();
            assert!(matches!(err, CiError::ConfigError(_)), "{path:?} was accepted");
        }
    }
}
