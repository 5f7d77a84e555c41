//! Remote repository creation and clone-URL resolution.
//!
//! When `BB_TEST_REMOTE_ROOT` is set, both paths route through a local
//! directory of bare repositories instead of real hosting; fixtures and
//! end-to-end tests run without network access. Real creation goes through
//! the `gh` CLI, invoked via argv.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use bb_types::{Config, RemoteProtocol, RepoMetadata, Visibility};

pub const TEST_REMOTE_ROOT_ENV: &str = "BB_TEST_REMOTE_ROOT";

/// The local bare-repo directory override, when configured.
pub fn test_remote_root() -> Option<PathBuf> {
    std::env::var_os(TEST_REMOTE_ROOT_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// The URL reconcile clones from: the recorded origin, or the bare repo
/// under the test remote root.
pub fn resolve_clone_url(meta: &RepoMetadata) -> String {
    if let Some(root) = test_remote_root() {
        return root
            .join(format!("{}.git", meta.name))
            .to_string_lossy()
            .into_owned();
    }
    meta.origin_url.clone()
}

/// Create a hosting-side repository and return its remote URL.
///
/// Not part of the sync pipeline; exposed for the configuration flows
/// that adopt a repository with no origin.
pub fn create_remote_repo(config: &Config, name: &str, visibility: Visibility) -> Result<String> {
    if let Some(root) = test_remote_root() {
        let path = root.join(format!("{name}.git"));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating bare repo dir {}", path.display()))?;
        let output = Command::new("git")
            .args(["init", "--bare"])
            .current_dir(&path)
            .output()
            .context("running git init --bare")?;
        if !output.status.success() {
            bail!(
                "git init --bare failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        return Ok(path.to_string_lossy().into_owned());
    }

    let owner = config
        .github
        .owner
        .as_deref()
        .ok_or_else(|| anyhow!("github.owner is not configured"))?;
    let gh = which::which("gh").context("gh binary not found on PATH")?;

    let visibility_flag = match visibility {
        Visibility::Public => "--public",
        _ => "--private",
    };
    let slug = format!("{owner}/{name}");
    let output = Command::new(&gh)
        .args(["repo", "create", &slug, visibility_flag])
        .output()
        .context("running gh repo create")?;
    if !output.status.success() {
        bail!(
            "gh repo create {slug} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    debug!(%slug, "created remote repository");

    resolve_created_url(config, &gh, owner, name)
}

/// Ask `gh` for the new repository's URL, falling back to the configured
/// protocol/template when the query fails.
fn resolve_created_url(
    config: &Config,
    gh: &std::path::Path,
    owner: &str,
    name: &str,
) -> Result<String> {
    let slug = format!("{owner}/{name}");
    let output = Command::new(gh)
        .args(["repo", "view", &slug, "--json", "sshUrl,url"])
        .output()
        .context("running gh repo view")?;
    if output.status.success() {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RepoView {
            ssh_url: Option<String>,
            url: Option<String>,
        }
        if let Ok(view) = serde_json::from_slice::<RepoView>(&output.stdout) {
            let picked = match config.github.remote_protocol {
                RemoteProtocol::Ssh => view.ssh_url,
                RemoteProtocol::Https => view.url.map(|u| format!("{u}.git")),
            };
            if let Some(url) = picked {
                return Ok(url);
            }
        }
    }
    Ok(config.github.remote_url(owner, name)?)
}
