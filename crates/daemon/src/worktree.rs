//! Git plumbing: repository validation, branches, per-task worktrees.
//!
//! Everything shells out to `git`. Mutating operations are serialised per
//! repository; reads run concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use clickup_orchestrator_core::model::Task;
use clickup_orchestrator_core::validation::{slugify, validate_branch_name, BranchNameError};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Path does not exist")]
    PathMissing,
    #[error("Path is not a directory")]
    NotADirectory,
    #[error("Not a git repository")]
    NotARepository,
    #[error(transparent)]
    BranchName(#[from] BranchNameError),
    /// git ran and failed; carries its stderr verbatim.
    #[error("{0}")]
    Command(String),
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory names never descended into when searching the disk.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    "__pycache__",
    "venv",
    "Library",
];
const COMMON_DEV_DIRS: &[&str] = &[
    "Projects", "projects", "Developer", "dev", "code", "Code", "src", "repos", "workspace",
    "Documents", "Desktop",
];
const DETECT_MAX_DEPTH: usize = 10;

#[derive(Default)]
pub struct WorktreeManager {
    locks: parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo_lock(&self, repo: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = std::fs::canonicalize(repo).unwrap_or_else(|_| repo.to_path_buf());
        self.locks.lock().entry(key).or_default().clone()
    }

    pub async fn validate(&self, path: &Path) -> Result<(), GitError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(GitError::PathMissing),
            Err(e) => return Err(GitError::Io(e)),
        };
        if !meta.is_dir() {
            return Err(GitError::NotADirectory);
        }
        match git(path, &["rev-parse", "--is-inside-work-tree"]).await {
            Ok(out) if out == "true" => Ok(()),
            Ok(_) | Err(GitError::Command(_)) => Err(GitError::NotARepository),
            Err(e) => Err(e),
        }
    }

    /// Local branch names and the currently checked out one (`None` when detached).
    pub async fn branches(&self, repo: &Path) -> Result<(Vec<String>, Option<String>), GitError> {
        self.validate(repo).await?;
        let out = git(repo, &["branch", "--format=%(refname:short)"]).await?;
        let branches = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let current = git(repo, &["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await
            .ok()
            .filter(|b| !b.is_empty());
        Ok((branches, current))
    }

    pub async fn create_branch(
        &self,
        repo: &Path,
        name: &str,
        from: Option<&str>,
        checkout: bool,
    ) -> Result<(), GitError> {
        validate_branch_name(name)?;
        if let Some(from) = from {
            validate_branch_name(from)?;
        }
        self.validate(repo).await?;

        let lock = self.repo_lock(repo);
        let _guard = lock.lock().await;
        let mut args = if checkout {
            vec!["checkout", "-b", name]
        } else {
            vec!["branch", name]
        };
        args.extend(from);
        git(repo, &args).await?;
        tracing::info!(repo = %repo.display(), branch = name, checkout, "branch created");
        Ok(())
    }

    pub async fn checkout(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        validate_branch_name(name)?;
        self.validate(repo).await?;

        let lock = self.repo_lock(repo);
        let _guard = lock.lock().await;
        git(repo, &["checkout", name]).await?;
        tracing::info!(repo = %repo.display(), branch = name, "checked out");
        Ok(())
    }

    pub async fn fetch(&self, repo: &Path) -> Result<(), GitError> {
        self.validate(repo).await?;
        git(repo, &["fetch", "--all", "--prune"]).await.map(|_| ())
    }

    /// Creates `path` as a worktree of `repo` on `branch`, branching from
    /// `base` if the branch does not exist yet. An existing `path` is reused.
    pub async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), GitError> {
        validate_branch_name(branch)?;
        self.validate(repo).await?;

        let lock = self.repo_lock(repo);
        let _guard = lock.lock().await;

        if path.is_dir() {
            tracing::debug!(worktree = %path.display(), "reusing existing worktree");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = git(repo, &["fetch", "--all"]).await {
            tracing::warn!(repo = %repo.display(), error = %e, "fetch before worktree creation failed; continuing");
        }

        let path_arg = path.to_string_lossy();
        if ref_exists(repo, &format!("refs/heads/{branch}")).await {
            git(repo, &["worktree", "add", &path_arg, branch]).await?;
        } else {
            let start = resolve_base(repo, base).await?;
            git(repo, &["worktree", "add", "-b", branch, &path_arg, &start]).await?;
        }
        tracing::info!(repo = %repo.display(), worktree = %path.display(), branch, "worktree created");
        Ok(())
    }

    /// Removes the worktree; falls back to deleting the directory when git
    /// no longer knows about it.
    pub async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let lock = self.repo_lock(repo);
        let _guard = lock.lock().await;

        let path_arg = path.to_string_lossy();
        match git(repo, &["worktree", "remove", "--force", &path_arg]).await {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(worktree = %path.display(), error = %e, "git worktree remove failed; deleting directory");
                match tokio::fs::remove_dir_all(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(GitError::Io(e)),
                }
                if repo.is_dir() {
                    let _ = git(repo, &["worktree", "prune"]).await;
                }
            }
        }
        tracing::info!(worktree = %path.display(), "worktree removed");
        Ok(())
    }
}

/// Worktree location and branch for a task: `{repo}/worktrees/task-{id}-{slug}`
/// on `task/{clickup_id}-{slug}`.
pub fn task_worktree(repo: &Path, task: &Task) -> (PathBuf, String) {
    let slug = slugify(&task.name);
    let path = repo.join("worktrees").join(format!("task-{}-{slug}", task.id));
    let branch = format!("task/{}-{slug}", task.clickup_task_id);
    (path, branch)
}

/// Searches the home directory (common dev folders first) for `marker` and
/// returns the directory containing it.
pub async fn detect_path(marker: &str) -> Option<PathBuf> {
    let home = PathBuf::from(std::env::var_os("HOME")?);
    let mut roots: Vec<PathBuf> = COMMON_DEV_DIRS
        .iter()
        .map(|d| home.join(d))
        .filter(|p| p.is_dir())
        .collect();
    roots.push(home);
    let marker = marker.to_string();
    tokio::task::spawn_blocking(move || find_marker(&roots, &marker))
        .await
        .ok()
        .flatten()
}

pub fn find_marker(roots: &[PathBuf], marker: &str) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        WalkDir::new(root)
            .max_depth(DETECT_MAX_DEPTH)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !e.file_type().is_dir() || !skip_dir(&e.file_name().to_string_lossy())
            })
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == marker)
            .and_then(|e| e.path().parent().map(Path::to_path_buf))
    })
}

fn skip_dir(name: &str) -> bool {
    name.starts_with('.') || SKIP_DIRS.contains(&name)
}

async fn ref_exists(repo: &Path, reference: &str) -> bool {
    git(repo, &["rev-parse", "--verify", "--quiet", reference])
        .await
        .is_ok()
}

/// `base` itself, or its `origin/` counterpart when only the remote has it.
async fn resolve_base(repo: &Path, base: &str) -> Result<String, GitError> {
    if ref_exists(repo, &format!("{base}^{{commit}}")).await {
        return Ok(base.to_string());
    }
    let remote = format!("origin/{base}");
    if ref_exists(repo, &format!("{remote}^{{commit}}")).await {
        return Ok(remote);
    }
    Err(GitError::Command(format!("Base branch '{base}' not found")))
}

/// Runs git in `dir`; stdout (trimmed) on success, stderr verbatim on failure.
async fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        tracing::debug!(dir = %dir.display(), ?args, %stderr, "git failed");
        return Err(GitError::Command(stderr));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_search_skips_hidden_and_dependency_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("node_modules/pkg/.clickup-orchestrator-path-a"), "").unwrap();
        std::fs::create_dir_all(root.join(".cache/x")).unwrap();
        std::fs::write(root.join(".cache/x/.clickup-orchestrator-path-a"), "").unwrap();
        assert_eq!(find_marker(&[root.to_path_buf()], ".clickup-orchestrator-path-a"), None);

        std::fs::create_dir_all(root.join("work/app")).unwrap();
        std::fs::write(root.join("work/app/.clickup-orchestrator-path-a"), "").unwrap();
        assert_eq!(
            find_marker(&[root.to_path_buf()], ".clickup-orchestrator-path-a"),
            Some(root.join("work/app"))
        );
    }
}
