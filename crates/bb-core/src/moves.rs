//! Moving a repository between catalogs.
//!
//! A move renames the working copy, rewrites the metadata's repo-key with
//! the old key appended as a tombstone, and runs the configured post-move
//! hooks. The tombstone keeps every other machine from reacting to the old
//! key; their stale copies get annotated during their own reconcile runs.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::warn;

use bb_state::StateStore;
use bb_types::{Catalog, Config, RepoMetadata};

/// The environment handed to post-move hooks.
pub const ENV_OLD_REPO_KEY: &str = "BB_MOVE_OLD_REPO_KEY";
pub const ENV_NEW_REPO_KEY: &str = "BB_MOVE_NEW_REPO_KEY";
pub const ENV_OLD_CATALOG: &str = "BB_MOVE_OLD_CATALOG";
pub const ENV_NEW_CATALOG: &str = "BB_MOVE_NEW_CATALOG";
pub const ENV_OLD_PATH: &str = "BB_MOVE_OLD_PATH";
pub const ENV_NEW_PATH: &str = "BB_MOVE_NEW_PATH";

/// Result of a committed move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedRepo {
    pub old_repo_key: String,
    pub new_repo_key: String,
    pub old_catalog: String,
    pub new_catalog: String,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

/// Move the working copy at `old_path` into `target`, updating metadata
/// and tombstoning the old key. Hooks run after the move commits; their
/// failures are logged, never fatal.
pub fn move_repo(
    store: &StateStore,
    config: &Config,
    meta: &mut RepoMetadata,
    old_path: &std::path::Path,
    target: &Catalog,
) -> Result<MovedRepo> {
    let parsed = bb_identity::parse_repo_key(&meta.repo_key)
        .with_context(|| format!("metadata key {:?}", meta.repo_key))?;
    if parsed.catalog == target.name {
        bail!("repository already lives in catalog {:?}", target.name);
    }
    let segments = parsed.relative_path.split('/').count();
    if segments != target.repo_path_depth {
        bail!(
            "cannot move {:?} into catalog {:?}: layout depth {} does not fit path {:?}",
            meta.repo_key,
            target.name,
            target.repo_path_depth,
            parsed.relative_path
        );
    }

    let new_path = target.root.join(&parsed.relative_path);
    if new_path.exists() {
        bail!("move target {} already exists", new_path.display());
    }
    if let Some(parent) = new_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::rename(old_path, &new_path).with_context(|| {
        format!("moving {} to {}", old_path.display(), new_path.display())
    })?;

    let old_key = meta.repo_key.clone();
    let new_key = format!("{}/{}", target.name, parsed.relative_path);
    meta.record_move(new_key.clone());
    store.store_repo_meta(meta)?;

    let moved = MovedRepo {
        old_repo_key: old_key,
        new_repo_key: new_key,
        old_catalog: parsed.catalog,
        new_catalog: target.name.clone(),
        old_path: old_path.to_path_buf(),
        new_path,
    };
    run_post_hooks(config, &moved);
    Ok(moved)
}

/// Post-move hooks are operator-supplied shell fragments; they see the
/// move through BB_MOVE_* variables.
fn run_post_hooks(config: &Config, moved: &MovedRepo) {
    for hook in &config.moves.post_hooks {
        let result = Command::new("sh")
            .args(["-c", hook])
            .env(ENV_OLD_REPO_KEY, &moved.old_repo_key)
            .env(ENV_NEW_REPO_KEY, &moved.new_repo_key)
            .env(ENV_OLD_CATALOG, &moved.old_catalog)
            .env(ENV_NEW_CATALOG, &moved.new_catalog)
            .env(ENV_OLD_PATH, &moved.old_path)
            .env(ENV_NEW_PATH, &moved.new_path)
            .status();
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(hook = %hook, %status, "post-move hook failed"),
            Err(err) => warn!(hook = %hook, %err, "post-move hook could not run"),
        }
    }
}
