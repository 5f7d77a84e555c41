//! Git operations for bb.
//!
//! A narrow, deterministic contract over the `git` binary. Reads are
//! best-effort: when git exits non-zero the caller gets the error and must
//! treat the value as unknown, never as an authoritative negative. Mutating
//! operations propagate failures as tagged [`GitError`] values.
//!
//! All invocations use argv directly; nothing is ever shell-evaluated.

use std::path::{Path, PathBuf};
use std::process::Command;

use bb_types::OperationKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Tagged failure from a git invocation.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("i/o failure invoking git: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {command:?} in {path} exited with {code}: {stderr}")]
    Exit {
        command: String,
        path: PathBuf,
        code: i32,
        stderr: String,
    },
    #[error("unexpected output from git {command:?}: {output:?}")]
    Parse { command: String, output: String },
    #[error("git binary not found on PATH")]
    MissingBinary,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Options for [`GitInvoker::clone_repo`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloneOptions {
    /// Depth-1 clone.
    #[serde(default)]
    pub shallow: bool,
    /// Partial-clone filter, e.g. `blob:none`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Restrict a sparse checkout to these pathspecs.
    #[serde(default)]
    pub only: Vec<String>,
}

impl CloneOptions {
    /// `git clone` arguments for these options. `only` is de-duplicated
    /// here, preserving first occurrence order.
    pub fn clone_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.shallow {
            args.push("--depth".to_string());
            args.push("1".to_string());
        }
        if let Some(filter) = &self.filter {
            args.push(format!("--filter={filter}"));
        }
        if !self.only.is_empty() {
            args.push("--sparse".to_string());
        }
        args
    }

    /// Unique sparse pathspecs, first occurrence wins.
    pub fn sparse_paths(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        self.only
            .iter()
            .filter(|p| seen.insert(p.as_str()))
            .cloned()
            .collect()
    }
}

/// The contract the convergence engine drives git through.
///
/// Methods take the working copy path and, where relevant, the preferred
/// remote name. Implementations must be safe to call from observation
/// worker threads.
pub trait GitInvoker: Send + Sync {
    fn is_git_repo(&self, path: &Path) -> bool;
    fn init_repo(&self, path: &Path) -> Result<()>;
    fn add_origin(&self, path: &Path, url: &str) -> Result<()>;
    fn repo_origin(&self, path: &Path, remote: &str) -> Result<String>;
    fn current_branch(&self, path: &Path) -> Result<String>;
    fn head_sha(&self, path: &Path) -> Result<String>;
    /// Upstream ref of the current branch, `""` when none is configured.
    fn upstream(&self, path: &Path) -> Result<String>;
    /// Tip of the preferred remote's ref for the current branch.
    fn remote_head_sha(&self, path: &Path, remote: &str) -> Result<String>;
    /// `(ahead, behind, diverged)` of HEAD relative to its upstream.
    fn ahead_behind(&self, path: &Path) -> Result<(u32, u32, bool)>;
    /// `(dirty_tracked, has_untracked)`.
    fn dirty(&self, path: &Path) -> Result<(bool, bool)>;
    fn operation_in_progress(&self, path: &Path) -> Result<OperationKind>;
    /// Default branch the preferred remote reports, falling back to
    /// `main`, then `master`.
    fn default_branch(&self, path: &Path, remote: &str) -> Result<String>;
    fn fetch_prune(&self, path: &Path, remote: &str) -> Result<()>;
    fn pull_ff_only(&self, path: &Path) -> Result<()>;
    fn push(&self, path: &Path, remote: &str) -> Result<()>;
    fn push_upstream(&self, path: &Path, remote: &str, branch: &str) -> Result<()>;
    fn checkout(&self, path: &Path, branch: &str) -> Result<()>;
    /// Make `branch` current: checkout when it exists locally, track the
    /// preferred remote's branch when it exists there, create it otherwise.
    fn ensure_branch(&self, path: &Path, branch: &str, remote: &str) -> Result<()>;
    fn clone_repo(&self, origin: &str, path: &Path, options: &CloneOptions) -> Result<()>;
}

/// [`GitInvoker`] backed by the system `git` binary.
#[derive(Debug, Clone)]
pub struct SystemGit {
    program: PathBuf,
}

impl Default for SystemGit {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl SystemGit {
    /// Resolve `git` on PATH up front so a missing binary fails once,
    /// loudly, instead of once per repository.
    pub fn locate() -> Result<Self> {
        let program = which::which("git").map_err(|_| GitError::MissingBinary)?;
        Ok(Self { program })
    }

    fn run(&self, path: &Path, args: &[&str]) -> Result<RawOutput> {
        debug!(path = %path.display(), ?args, "git");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(path)
            .output()?;
        Ok(RawOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and demand success; returns trimmed stdout.
    fn run_ok(&self, path: &Path, args: &[&str]) -> Result<String> {
        let out = self.run(path, args)?;
        if out.code != 0 {
            return Err(GitError::Exit {
                command: args.join(" "),
                path: path.to_path_buf(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }

    fn ref_exists(&self, path: &Path, reference: &str) -> bool {
        self.run(path, &["rev-parse", "--verify", "--quiet", reference])
            .map(|o| o.code == 0)
            .unwrap_or(false)
    }

    fn git_dir(&self, path: &Path) -> Result<PathBuf> {
        let dir = self.run_ok(path, &["rev-parse", "--git-dir"])?;
        let dir = PathBuf::from(dir);
        if dir.is_absolute() {
            Ok(dir)
        } else {
            Ok(path.join(dir))
        }
    }
}

#[derive(Debug)]
struct RawOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

impl GitInvoker for SystemGit {
    fn is_git_repo(&self, path: &Path) -> bool {
        path.join(".git").exists()
            && self
                .run(path, &["rev-parse", "--is-inside-work-tree"])
                .map(|o| o.code == 0)
                .unwrap_or(false)
    }

    fn init_repo(&self, path: &Path) -> Result<()> {
        self.run_ok(path, &["init"]).map(|_| ())
    }

    fn add_origin(&self, path: &Path, url: &str) -> Result<()> {
        self.run_ok(path, &["remote", "add", "origin", url]).map(|_| ())
    }

    fn repo_origin(&self, path: &Path, remote: &str) -> Result<String> {
        self.run_ok(path, &["remote", "get-url", remote])
    }

    fn current_branch(&self, path: &Path) -> Result<String> {
        let branch = self.run_ok(path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        // Detached HEAD reports the literal string "HEAD".
        if branch == "HEAD" {
            return Ok(String::new());
        }
        Ok(branch)
    }

    fn head_sha(&self, path: &Path) -> Result<String> {
        self.run_ok(path, &["rev-parse", "HEAD"])
    }

    fn upstream(&self, path: &Path) -> Result<String> {
        let out = self.run(
            path,
            &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
        )?;
        if out.code != 0 {
            // No upstream configured is a normal state, not a failure.
            return Ok(String::new());
        }
        Ok(out.stdout.trim().to_string())
    }

    fn remote_head_sha(&self, path: &Path, remote: &str) -> Result<String> {
        let branch = self.current_branch(path)?;
        if branch.is_empty() {
            return Ok(String::new());
        }
        let reference = format!("refs/remotes/{remote}/{branch}");
        if !self.ref_exists(path, &reference) {
            return Ok(String::new());
        }
        self.run_ok(path, &["rev-parse", &reference])
    }

    fn ahead_behind(&self, path: &Path) -> Result<(u32, u32, bool)> {
        if self.upstream(path)?.is_empty() {
            return Ok((0, 0, false));
        }
        let command = ["rev-list", "--left-right", "--count", "@{u}...HEAD"];
        let out = self.run_ok(path, &command)?;
        let mut parts = out.split_whitespace();
        let parse = |value: Option<&str>| -> Result<u32> {
            value
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| GitError::Parse {
                    command: command.join(" "),
                    output: out.clone(),
                })
        };
        let behind = parse(parts.next())?;
        let ahead = parse(parts.next())?;
        Ok((ahead, behind, ahead > 0 && behind > 0))
    }

    fn dirty(&self, path: &Path) -> Result<(bool, bool)> {
        let out = self.run_ok(path, &["status", "--porcelain"])?;
        let mut tracked = false;
        let mut untracked = false;
        for line in out.lines() {
            if line.starts_with("??") {
                untracked = true;
            } else if !line.trim().is_empty() {
                tracked = true;
            }
        }
        Ok((tracked, untracked))
    }

    fn operation_in_progress(&self, path: &Path) -> Result<OperationKind> {
        let git_dir = self.git_dir(path)?;
        let kind = if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists()
        {
            OperationKind::Rebase
        } else if git_dir.join("MERGE_HEAD").exists() {
            OperationKind::Merge
        } else if git_dir.join("CHERRY_PICK_HEAD").exists() {
            OperationKind::CherryPick
        } else if git_dir.join("BISECT_LOG").exists() {
            OperationKind::Bisect
        } else if git_dir.join("REVERT_HEAD").exists() {
            OperationKind::Revert
        } else {
            OperationKind::None
        };
        Ok(kind)
    }

    fn default_branch(&self, path: &Path, remote: &str) -> Result<String> {
        let head_ref = format!("refs/remotes/{remote}/HEAD");
        if let Ok(target) = self.run_ok(path, &["symbolic-ref", &head_ref]) {
            if let Some(branch) = target.rsplit('/').next() {
                if !branch.is_empty() {
                    return Ok(branch.to_string());
                }
            }
        }
        for candidate in ["main", "master"] {
            if self.ref_exists(path, &format!("refs/remotes/{remote}/{candidate}")) {
                return Ok(candidate.to_string());
            }
        }
        Ok("main".to_string())
    }

    fn fetch_prune(&self, path: &Path, remote: &str) -> Result<()> {
        self.run_ok(path, &["fetch", "--prune", remote]).map(|_| ())
    }

    fn pull_ff_only(&self, path: &Path) -> Result<()> {
        self.run_ok(path, &["pull", "--ff-only"]).map(|_| ())
    }

    fn push(&self, path: &Path, remote: &str) -> Result<()> {
        self.run_ok(path, &["push", remote]).map(|_| ())
    }

    fn push_upstream(&self, path: &Path, remote: &str, branch: &str) -> Result<()> {
        self.run_ok(path, &["push", "--set-upstream", remote, branch])
            .map(|_| ())
    }

    fn checkout(&self, path: &Path, branch: &str) -> Result<()> {
        self.run_ok(path, &["checkout", branch]).map(|_| ())
    }

    fn ensure_branch(&self, path: &Path, branch: &str, remote: &str) -> Result<()> {
        if self.current_branch(path)? == branch {
            return Ok(());
        }
        if self.ref_exists(path, &format!("refs/heads/{branch}")) {
            return self.checkout(path, branch);
        }
        let remote_ref = format!("refs/remotes/{remote}/{branch}");
        if self.ref_exists(path, &remote_ref) {
            let track = format!("{remote}/{branch}");
            return self
                .run_ok(path, &["checkout", "-b", branch, "--track", &track])
                .map(|_| ());
        }
        self.run_ok(path, &["checkout", "-b", branch]).map(|_| ())
    }

    fn clone_repo(&self, origin: &str, path: &Path, options: &CloneOptions) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut args: Vec<String> = vec!["clone".to_string()];
        args.extend(options.clone_args());
        args.push(origin.to_string());
        args.push(path.to_string_lossy().into_owned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let cwd = path.parent().unwrap_or_else(|| Path::new("."));
        self.run_ok(cwd, &arg_refs)?;

        let sparse = options.sparse_paths();
        if !sparse.is_empty() {
            let mut set_args = vec!["sparse-checkout", "set"];
            set_args.extend(sparse.iter().map(String::as_str));
            self.run_ok(path, &set_args)?;
        }
        Ok(())
    }
}
