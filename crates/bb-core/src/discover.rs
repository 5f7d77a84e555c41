//! Catalog walking: find git working copies under catalog roots.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;
use walkdir::WalkDir;

use bb_identity::{clean_path, derive_repo_key};
use bb_types::Catalog;

/// A working copy found under a catalog root, not yet observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRepo {
    pub catalog: Catalog,
    pub path: PathBuf,
    pub name: String,
    pub repo_key: String,
}

/// Walk the selected catalogs. A directory is a repository iff it contains
/// a `.git` entry; the walk does not descend into repositories or into
/// `.git` directories. Output is de-duplicated by cleaned path and ordered
/// by `(repo_key, path)`.
pub fn discover_repos(catalogs: &[Catalog]) -> Result<Vec<DiscoveredRepo>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();

    for catalog in catalogs {
        if !catalog.root.exists() {
            warn!(catalog = %catalog.name, root = %catalog.root.display(), "catalog root missing");
            continue;
        }
        let mut walker = WalkDir::new(&catalog.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");
        while let Some(entry) = walker.next() {
            let entry = entry
                .with_context(|| format!("walking catalog root {}", catalog.root.display()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if !entry.path().join(".git").exists() {
                continue;
            }
            // A repository: record it and stop descending.
            let path = clean_path(entry.path());
            walker.skip_current_dir();
            if !seen.insert(path.clone()) {
                continue;
            }
            match derive_repo_key(catalog, &path) {
                Ok(parts) => out.push(DiscoveredRepo {
                    catalog: catalog.clone(),
                    path,
                    name: parts.name,
                    repo_key: parts.repo_key,
                }),
                Err(err) => {
                    // A repo above the catalog's layout depth (e.g. a stray
                    // working copy at the root of an owner/repo catalog)
                    // cannot be keyed and is left alone.
                    warn!(path = %path.display(), %err, "skipping unkeyable repository");
                }
            }
        }
    }

    out.sort_by(|a, b| (a.repo_key.as_str(), &a.path).cmp(&(b.repo_key.as_str(), &b.path)));
    Ok(out)
}
