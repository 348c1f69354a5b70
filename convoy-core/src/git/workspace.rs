//! Git workspace management
//!
//! Owns the shared repository and one worktree per track. Every operation
//! that mutates shared repository metadata (branch create, worktree
//! add/remove, merge, reset, push) runs under the in-process `git_mutex`;
//! the orchestrator's merge-verify lock is a separate, longer-lived concern.
//!
//! Coordination files (the feature list, the progress log) live inside the
//! repository but are written by the orchestrator, not by commits, so every
//! history-changing operation snapshots their bytes first and writes them
//! back afterwards, including on the abort path.

use std::path::{Path, PathBuf};
use std::process::Command;

use git2::Repository;

use super::slug::feature_branch_name;
use crate::config::WorkspaceConfig;
use crate::lock::FifoMutex;
use crate::{Error, Result};

/// Ahead-of-base state of a feature branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchStatus {
    /// Commits on the branch that are not on the base branch
    pub ahead_count: usize,
    /// Whether the working tree has no uncommitted changes
    pub clean: bool,
}

/// Snapshot of preserved file contents, taken before a git operation
struct PreservedSnapshot {
    /// Relative path and bytes; `None` bytes mean the file did not exist
    files: Vec<(String, Option<Vec<u8>>)>,
    tree_root: PathBuf,
}

/// Manager for the shared repository and per-track worktrees
pub struct GitWorkspace {
    project_root: PathBuf,
    base_branch: String,
    policies: WorkspaceConfig,
    git_mutex: FifoMutex,
}

impl std::fmt::Debug for GitWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWorkspace")
            .field("project_root", &self.project_root)
            .field("base_branch", &self.base_branch)
            .finish_non_exhaustive()
    }
}

impl GitWorkspace {
    /// Open the workspace manager over an existing repository
    pub fn new(
        project_root: impl Into<PathBuf>,
        base_branch: impl Into<String>,
        policies: WorkspaceConfig,
    ) -> Result<Self> {
        let project_root = project_root.into();

        let repo = Repository::discover(&project_root).map_err(|e| {
            Error::Config(format!(
                "not a git repository: {} ({})",
                project_root.display(),
                e
            ))
        })?;
        if repo.is_bare() {
            return Err(Error::Config(
                "bare repositories are not supported".to_string(),
            ));
        }

        Ok(Self {
            project_root,
            base_branch: base_branch.into(),
            policies,
            git_mutex: FifoMutex::new(),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Worktree directory for a track
    pub fn worktree_path(&self, track: &str) -> PathBuf {
        self.project_root
            .join(&self.policies.worktrees_dir)
            .join(track)
    }

    /// Prepare the shared repository for a run
    ///
    /// Prunes stale worktrees, stashes leftover modifications, ensures the
    /// base branch exists and is checked out, pulls when a tracking branch
    /// exists. Preserved files are restored last.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.git_mutex.lock().await;
        let snapshot = self.snapshot_preserved(&self.project_root);

        let result = (|| {
            self.git(&self.project_root, &["worktree", "prune"])?;
            self.ensure_excludes()?;

            if !self.is_clean(&self.project_root)? {
                tracing::info!("stashing leftover modifications before startup");
                // Failure here just means nothing stashable remained after
                // the preserved files were snapshotted
                let _ = self.git(
                    &self.project_root,
                    &["stash", "push", "--include-untracked", "-m", "convoy-startup"],
                );
            }

            if !self.branch_exists(&self.base_branch)? {
                tracing::info!(branch = %self.base_branch, "creating base branch from HEAD");
                self.git(&self.project_root, &["branch", &self.base_branch])?;
            }
            self.git(&self.project_root, &["checkout", &self.base_branch])?;

            if self.has_upstream(&self.base_branch) {
                if let Err(e) = self.git(&self.project_root, &["pull", "--ff-only"]) {
                    tracing::warn!("pull of base branch failed: {}", e);
                }
            }
            Ok(())
        })();

        self.restore_preserved(&snapshot)?;
        result
    }

    /// Create the branch and worktree for a feature
    ///
    /// The branch name is deterministic, so a retry lands on the same branch
    /// and keeps its earlier commits.
    pub async fn prepare_branch(
        &self,
        track: &str,
        feature_id: u64,
        feature_name: &str,
        is_retry: bool,
    ) -> Result<(String, PathBuf)> {
        let _guard = self.git_mutex.lock().await;

        let branch = feature_branch_name(feature_id, feature_name);
        let path = self.worktree_path(track);

        self.remove_worktree_inner(track)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.display().to_string();
        if self.branch_exists(&branch)? {
            tracing::debug!(branch = %branch, retry = is_retry, "reusing existing branch");
            self.git(&self.project_root, &["worktree", "add", &path_str, &branch])?;
        } else {
            self.git(
                &self.project_root,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    &path_str,
                    &self.base_branch,
                ],
            )?;
        }

        self.post_setup(track, &path)?;

        Ok((branch, path))
    }

    /// Remove a track's worktree and prune metadata
    pub async fn cleanup_worktree(&self, track: &str) -> Result<()> {
        let _guard = self.git_mutex.lock().await;
        self.remove_worktree_inner(track)?;
        self.git(&self.project_root, &["worktree", "prune"])?;
        Ok(())
    }

    /// Commit everything (including untracked files) if the tree is dirty
    ///
    /// Returns whether a commit was made.
    pub fn commit_all_if_dirty(&self, worktree: &Path, message: &str) -> Result<bool> {
        if self.is_clean(worktree)? {
            return Ok(false);
        }
        self.git(worktree, &["add", "-A"])?;
        self.git(worktree, &["commit", "-m", message])?;
        Ok(true)
    }

    /// Ahead count relative to base, and working tree cleanliness
    pub fn branch_status(&self, branch: &str, worktree: &Path) -> Result<BranchStatus> {
        let range = format!("{}..{}", self.base_branch, branch);
        let count = self.git(worktree, &["rev-list", "--count", &range])?;
        let ahead_count = count.trim().parse::<usize>().map_err(|_| {
            Error::Git(format!("unexpected rev-list output: {:?}", count))
        })?;

        Ok(BranchStatus {
            ahead_count,
            clean: self.is_clean(worktree)?,
        })
    }

    /// Merge the latest base branch into the feature branch, inside its
    /// worktree
    ///
    /// On conflict the merge is aborted and an error is raised; the worktree
    /// is never left in a merging state.
    pub async fn update_feature_branch(&self, worktree: &Path) -> Result<()> {
        let _guard = self.git_mutex.lock().await;
        let snapshot = self.snapshot_preserved(worktree);
        self.revert_preserved(worktree);

        let result = self.git(worktree, &["merge", "--no-edit", &self.base_branch]);
        if result.is_err() {
            let _ = self.git(worktree, &["merge", "--abort"]);
        }

        self.restore_preserved(&snapshot)?;
        result.map(|_| ()).map_err(|e| {
            Error::Git(format!("refreshing feature branch from base failed: {}", e))
        })
    }

    /// Merge a feature branch into the base branch in the main repository
    ///
    /// Returns the commit the base branch pointed at before the merge.
    pub async fn merge_locally(&self, branch: &str) -> Result<String> {
        let _guard = self.git_mutex.lock().await;
        let snapshot = self.snapshot_preserved(&self.project_root);
        self.revert_preserved(&self.project_root);

        let result = (|| {
            self.git(&self.project_root, &["checkout", &self.base_branch])?;
            if self.has_upstream(&self.base_branch) {
                if let Err(e) = self.git(&self.project_root, &["pull", "--ff-only"]) {
                    tracing::warn!("pull before merge failed: {}", e);
                }
            }

            let pre_merge = self.git(&self.project_root, &["rev-parse", "HEAD"])?;

            if let Err(e) = self.git(
                &self.project_root,
                &["merge", "--no-ff", "--no-edit", branch],
            ) {
                let _ = self.git(&self.project_root, &["merge", "--abort"]);
                return Err(Error::Git(format!(
                    "merging {} into {} failed: {}",
                    branch, self.base_branch, e
                )));
            }

            Ok(pre_merge)
        })();

        self.restore_preserved(&snapshot)?;
        result
    }

    /// Push the base branch to origin
    ///
    /// A repository without an origin remote is a local-only pipeline; the
    /// push is skipped so the run can still advance.
    pub async fn push_base_branch(&self) -> Result<()> {
        let _guard = self.git_mutex.lock().await;

        if self
            .git(&self.project_root, &["remote", "get-url", "origin"])
            .is_err()
        {
            tracing::debug!("no origin remote; skipping push");
            return Ok(());
        }

        self.git(
            &self.project_root,
            &["push", "origin", &self.base_branch],
        )?;
        Ok(())
    }

    /// Reset the base branch to a pre-merge commit
    pub async fn revert_merge(&self, pre_merge_commit: &str) -> Result<()> {
        let _guard = self.git_mutex.lock().await;
        let snapshot = self.snapshot_preserved(&self.project_root);
        self.revert_preserved(&self.project_root);

        let result = (|| {
            self.git(&self.project_root, &["checkout", &self.base_branch])?;
            self.git(&self.project_root, &["reset", "--hard", pre_merge_commit])?;
            Ok(())
        })();

        self.restore_preserved(&snapshot)?;
        result
    }

    // ---- internals ----

    fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| Error::Git(format!("failed to run git {}: {}", args.join(" "), e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    fn is_clean(&self, cwd: &Path) -> Result<bool> {
        Ok(self.git(cwd, &["status", "--porcelain"])?.is_empty())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        Ok(Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &reference])
            .current_dir(&self.project_root)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false))
    }

    fn has_upstream(&self, branch: &str) -> bool {
        let spec = format!("{}@{{upstream}}", branch);
        Command::new("git")
            .args(["rev-parse", "--abbrev-ref", &spec])
            .current_dir(&self.project_root)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn remove_worktree_inner(&self, track: &str) -> Result<()> {
        let path = self.worktree_path(track);
        if !path.exists() {
            return Ok(());
        }

        let path_str = path.display().to_string();
        if self
            .git(
                &self.project_root,
                &["worktree", "remove", "--force", &path_str],
            )
            .is_err()
        {
            // The worktree may not be registered (e.g. a crashed run); remove
            // the directory directly and let prune clean the metadata.
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Keep convoy-managed paths (worktrees, linked dependency dirs) out of
    /// git status without touching the project's .gitignore
    fn ensure_excludes(&self) -> Result<()> {
        let mut wanted = vec![
            format!("{}/", self.policies.worktrees_dir),
            // Orchestrator state (session db, prompt overrides) lives here
            ".convoy/".to_string(),
        ];
        for dir in &self.policies.symlink_dirs {
            wanted.push(dir.clone());
        }

        let exclude = self.git_common_dir().join("info").join("exclude");
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        let missing: Vec<&String> = wanted
            .iter()
            .filter(|w| !existing.lines().any(|l| l == w.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        if let Some(parent) = exclude.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        for entry in missing {
            contents.push_str(entry);
            contents.push('\n');
        }
        std::fs::write(&exclude, contents)?;
        Ok(())
    }

    fn git_common_dir(&self) -> PathBuf {
        self.git(&self.project_root, &["rev-parse", "--git-common-dir"])
            .map(|s| {
                let p = PathBuf::from(s);
                if p.is_absolute() {
                    p
                } else {
                    self.project_root.join(p)
                }
            })
            .unwrap_or_else(|_| self.project_root.join(".git"))
    }

    fn post_setup(&self, track: &str, worktree: &Path) -> Result<()> {
        for dir in &self.policies.symlink_dirs {
            self.link_dependency_dir(worktree, dir)?;
        }

        for file in &self.policies.copy_files {
            let source = self.project_root.join(file);
            if !source.exists() {
                continue;
            }
            let dest = worktree.join(file);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &dest)?;
        }

        // A crashed agent can leave a stale index.lock in this track's
        // worktree metadata, which would block every later git command.
        let meta_dir = self.git_common_dir().join("worktrees").join(track);
        if meta_dir.exists() {
            let stale_lock = meta_dir.join("index.lock");
            if stale_lock.exists() {
                tracing::warn!(path = %stale_lock.display(), "removing stale index.lock");
                let _ = std::fs::remove_file(&stale_lock);
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    &meta_dir,
                    std::fs::Permissions::from_mode(0o755),
                );
            }
        }

        if self.policies.container_image.is_some() {
            self.write_setup_script(worktree)?;
        }

        Ok(())
    }

    /// Symlink a dependency directory from the project root into the
    /// worktree, with a relative target so the link still resolves when the
    /// worktree is mounted into a container at a different absolute path
    fn link_dependency_dir(&self, worktree: &Path, dir: &str) -> Result<()> {
        let source = self.project_root.join(dir);
        if !source.is_dir() {
            return Ok(());
        }

        let link = worktree.join(dir);
        if link.exists() || link.symlink_metadata().is_ok() {
            return Ok(());
        }
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Hops up from the link location to the project root: the worktrees
        // dir, the track dir, plus any nesting of the dependency dir itself.
        let dir_path = Path::new(dir);
        let ups = Path::new(&self.policies.worktrees_dir).components().count()
            + 1
            + dir_path.components().count().saturating_sub(1);
        let target: PathBuf = std::iter::repeat("..")
            .take(ups)
            .collect::<PathBuf>()
            .join(dir_path);

        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link)?;
        #[cfg(not(unix))]
        tracing::warn!(dir, "dependency dir symlinks are unix-only; skipping");

        Ok(())
    }

    fn write_setup_script(&self, worktree: &Path) -> Result<()> {
        let name = self
            .policies
            .setup_script
            .clone()
            .unwrap_or_else(|| ".convoy-setup.sh".to_string());

        let image = self.policies.container_image.as_deref().unwrap_or("");
        let container_workdir = self
            .policies
            .container_workdir
            .as_deref()
            .unwrap_or("/workspace");

        let script = format!(
            "#!/bin/sh\n\
             # Generated by convoy; mounts this worktree into the project container.\n\
             set -e\n\
             exec docker run --rm -v \"$(pwd)\":{workdir} -w {workdir} {image} \"$@\"\n",
            workdir = container_workdir,
            image = image,
        );

        let script_path = worktree.join(&name);
        std::fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
        }

        // Keep the generated script out of diffs without touching .gitignore
        let exclude = self.git_common_dir().join("info").join("exclude");
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        if !existing.lines().any(|l| l == name) {
            if let Some(parent) = exclude.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&exclude, format!("{}{}\n", existing, name))?;
        }

        Ok(())
    }

    fn snapshot_preserved(&self, tree_root: &Path) -> PreservedSnapshot {
        let files = self
            .policies
            .preserve_files
            .iter()
            .map(|rel| {
                let bytes = std::fs::read(tree_root.join(rel)).ok();
                (rel.clone(), bytes)
            })
            .collect();

        PreservedSnapshot {
            files,
            tree_root: tree_root.to_path_buf(),
        }
    }

    /// Drop working-tree modifications to preserved paths so the following
    /// operation sees a clean tree; untracked preserved files are removed
    fn revert_preserved(&self, tree_root: &Path) {
        for rel in &self.policies.preserve_files {
            if self.git(tree_root, &["checkout", "--", rel]).is_err() {
                // Untracked: take it out of the way entirely
                let _ = std::fs::remove_file(tree_root.join(rel));
            }
        }
    }

    fn restore_preserved(&self, snapshot: &PreservedSnapshot) -> Result<()> {
        for (rel, bytes) in &snapshot.files {
            if let Some(bytes) = bytes {
                let path = snapshot.tree_root.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, bytes)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn git_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// Temp repository with one commit on `main` and identity configured
    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        git_in(&root, &["init"]);
        git_in(&root, &["config", "user.email", "convoy@test"]);
        git_in(&root, &["config", "user.name", "convoy"]);
        git_in(&root, &["config", "commit.gpgsign", "false"]);
        std::fs::write(root.join("README.md"), "hello\n").unwrap();
        std::fs::write(root.join("features.json"), "[]\n").unwrap();
        git_in(&root, &["add", "-A"]);
        git_in(&root, &["commit", "-m", "initial"]);
        git_in(&root, &["checkout", "-B", "main"]);

        (dir, root)
    }

    fn workspace(root: &Path) -> GitWorkspace {
        let mut policies = WorkspaceConfig::default();
        policies.preserve_files = vec!["features.json".to_string()];
        policies.symlink_dirs = vec![];
        policies.copy_files = vec![];
        GitWorkspace::new(root, "main", policies).unwrap()
    }

    #[tokio::test]
    async fn test_init_checks_out_base() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);

        git_in(&root, &["checkout", "-b", "scratch"]);
        ws.init().await.unwrap();

        let head = ws.git(&root, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        assert_eq!(head, "main");
    }

    #[tokio::test]
    async fn test_init_creates_missing_base_branch() {
        let (_dir, root) = fixture();
        let mut policies = WorkspaceConfig::default();
        policies.preserve_files = vec![];
        let ws = GitWorkspace::new(&root, "develop", policies).unwrap();

        ws.init().await.unwrap();
        let head = ws.git(&root, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        assert_eq!(head, "develop");
    }

    #[tokio::test]
    async fn test_prepare_branch_creates_worktree() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();

        let (branch, path) = ws
            .prepare_branch("ui", 3, "Add Login Page!", false)
            .await
            .unwrap();

        assert_eq!(branch, "feature/3-add-login-page");
        assert!(path.join("README.md").exists());

        let head = ws.git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        assert_eq!(head, "feature/3-add-login-page");

        ws.cleanup_worktree("ui").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_prepare_branch_reuses_existing_branch() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();

        let (branch, path) = ws.prepare_branch("ui", 3, "thing", false).await.unwrap();
        std::fs::write(path.join("work.txt"), "wip\n").unwrap();
        ws.commit_all_if_dirty(&path, "wip").unwrap();
        ws.cleanup_worktree("ui").await.unwrap();

        // A retry lands on the same branch with the earlier commit intact
        let (branch2, path2) = ws.prepare_branch("ui", 3, "thing", true).await.unwrap();
        assert_eq!(branch, branch2);
        assert!(path2.join("work.txt").exists());
        ws.cleanup_worktree("ui").await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_all_if_dirty_and_branch_status() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();

        let (branch, path) = ws.prepare_branch("ui", 1, "one", false).await.unwrap();

        let status = ws.branch_status(&branch, &path).unwrap();
        assert_eq!(status.ahead_count, 0);
        assert!(status.clean);
        assert!(!ws.commit_all_if_dirty(&path, "noop").unwrap());

        std::fs::write(path.join("new.txt"), "data\n").unwrap();
        assert!(ws.commit_all_if_dirty(&path, "add new.txt").unwrap());

        let status = ws.branch_status(&branch, &path).unwrap();
        assert_eq!(status.ahead_count, 1);
        assert!(status.clean);

        ws.cleanup_worktree("ui").await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_locally_and_revert() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();

        let (branch, path) = ws.prepare_branch("ui", 1, "one", false).await.unwrap();
        std::fs::write(path.join("feature.txt"), "feature\n").unwrap();
        ws.commit_all_if_dirty(&path, "feature work").unwrap();

        let pre = ws.merge_locally(&branch).await.unwrap();
        assert!(root.join("feature.txt").exists());

        ws.revert_merge(&pre).await.unwrap();
        assert!(!root.join("feature.txt").exists());

        ws.cleanup_worktree("ui").await.unwrap();
    }

    #[tokio::test]
    async fn test_preserved_file_survives_merge() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();

        let (branch, path) = ws.prepare_branch("ui", 1, "one", false).await.unwrap();
        std::fs::write(path.join("feature.txt"), "feature\n").unwrap();
        ws.commit_all_if_dirty(&path, "feature work").unwrap();

        // Orchestrator-written state that no commit knows about
        let marker = b"[{\"id\": 1, \"status\": \"verifying\"}]\n";
        std::fs::write(root.join("features.json"), marker).unwrap();

        ws.merge_locally(&branch).await.unwrap();

        assert_eq!(std::fs::read(root.join("features.json")).unwrap(), marker);
        ws.cleanup_worktree("ui").await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_conflict_aborts_cleanly() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();

        let (branch, path) = ws.prepare_branch("ui", 1, "one", false).await.unwrap();
        std::fs::write(path.join("README.md"), "feature version\n").unwrap();
        ws.commit_all_if_dirty(&path, "feature edit").unwrap();

        // Conflicting change on base
        std::fs::write(root.join("README.md"), "base version\n").unwrap();
        ws.git(&root, &["add", "-A"]).unwrap();
        ws.git(&root, &["commit", "-m", "base edit"]).unwrap();

        let err = ws.merge_locally(&branch).await.unwrap_err();
        assert!(matches!(err, Error::Git(_)));

        // Base is clean and not mid-merge
        assert!(ws.is_clean(&root).unwrap());
        assert!(!root.join(".git").join("MERGE_HEAD").exists());

        ws.cleanup_worktree("ui").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_feature_branch_pulls_in_base() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();

        let (_branch, path) = ws.prepare_branch("ui", 1, "one", false).await.unwrap();

        // Advance base after the branch was cut
        std::fs::write(root.join("base.txt"), "base\n").unwrap();
        ws.git(&root, &["add", "-A"]).unwrap();
        ws.git(&root, &["commit", "-m", "advance base"]).unwrap();

        ws.update_feature_branch(&path).await.unwrap();
        assert!(path.join("base.txt").exists());

        ws.cleanup_worktree("ui").await.unwrap();
    }

    #[tokio::test]
    async fn test_push_skipped_without_remote() {
        let (_dir, root) = fixture();
        let ws = workspace(&root);
        ws.init().await.unwrap();
        ws.push_base_branch().await.unwrap();
    }

    #[tokio::test]
    async fn test_symlink_and_copy_post_setup() {
        let (_dir, root) = fixture();

        let mut policies = WorkspaceConfig::default();
        policies.preserve_files = vec![];
        policies.symlink_dirs = vec!["node_modules".to_string()];
        policies.copy_files = vec![".env".to_string()];
        let ws = GitWorkspace::new(&root, "main", policies).unwrap();
        ws.init().await.unwrap();

        // Dependency tree and local env appear after startup, as they would
        // from an install step
        std::fs::create_dir_all(root.join("node_modules").join("pkg")).unwrap();
        std::fs::write(root.join(".env"), "KEY=1\n").unwrap();

        let (_branch, path) = ws.prepare_branch("ui", 1, "one", false).await.unwrap();

        #[cfg(unix)]
        {
            let link = path.join("node_modules");
            let meta = std::fs::symlink_metadata(&link).unwrap();
            assert!(meta.file_type().is_symlink());
            let target = std::fs::read_link(&link).unwrap();
            assert!(target.is_relative());
            // Resolves to the shared dependency tree
            assert!(link.join("pkg").exists());
        }
        assert_eq!(
            std::fs::read_to_string(path.join(".env")).unwrap(),
            "KEY=1\n"
        );

        ws.cleanup_worktree("ui").await.unwrap();
    }
}
