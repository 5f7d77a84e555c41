//! Origin identity normalization and repo-key algebra.
//!
//! Two origin URLs refer to the same upstream iff their normalized
//! identities are equal; identity equality is the only origin-match
//! predicate used anywhere in bb. Repo-keys (`<catalog>/<relative-path>`)
//! identify a repository *location* and are derived deterministically from
//! the catalog layout, independent of the URL.
//!
//! # Example
//!
//! ```
//! use bb_identity::normalize_origin_identity;
//!
//! let a = normalize_origin_identity("git@github.com:acme/widget.git").unwrap();
//! let b = normalize_origin_identity("https://github.com/acme/widget").unwrap();
//! assert_eq!(a, b);
//! assert_eq!(a.to_string(), "github.com/acme/widget");
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};

use bb_types::Catalog;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid origin url {0:?}")]
    InvalidOrigin(String),
    #[error("invalid repo key {0:?}")]
    InvalidRepoKey(String),
    #[error("path {path:?} is not inside catalog {catalog:?}")]
    PathNotInCatalog { catalog: String, path: PathBuf },
    #[error("path {path:?} is shallower than catalog {catalog:?} depth {depth}")]
    PathTooShallow {
        catalog: String,
        path: PathBuf,
        depth: usize,
    },
}

/// Normalized identity of an origin URL.
///
/// SSH, scp-like, HTTPS and `file://`/path forms that point at the same
/// upstream compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OriginIdentity {
    /// `host/owner/repo`, host lowercased, trailing `.git` stripped.
    Hosted {
        host: String,
        owner: String,
        repo: String,
    },
    /// Normalized absolute filesystem path.
    Local { path: PathBuf },
}

impl fmt::Display for OriginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginIdentity::Hosted { host, owner, repo } => {
                write!(f, "{host}/{owner}/{repo}")
            }
            OriginIdentity::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Normalize an origin URL into its identity.
///
/// Accepted forms: `git@host:owner/repo(.git)?`,
/// `ssh://git@host[:port]/owner/repo(.git)?`,
/// `http(s)://host/owner/repo(.git)?`, absolute filesystem paths, and
/// `file://` URLs. Anything else is `invalid_origin`.
pub fn normalize_origin_identity(url: &str) -> Result<OriginIdentity, IdentityError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(IdentityError::InvalidOrigin(url.to_string()));
    }

    if let Some(rest) = url.strip_prefix("file://") {
        // file://localhost/x and file:///x both mean /x.
        let path = rest.strip_prefix("localhost").unwrap_or(rest);
        return local_identity(path, url);
    }
    if url.starts_with('/') {
        return local_identity(url, url);
    }

    if let Some(rest) = url.strip_prefix("ssh://") {
        return hosted_from_hierarchical(rest, url);
    }
    if let Some(rest) = url.strip_prefix("https://") {
        return hosted_from_hierarchical(rest, url);
    }
    if let Some(rest) = url.strip_prefix("http://") {
        return hosted_from_hierarchical(rest, url);
    }

    // scp-like: user@host:path, no scheme. The colon must come before any
    // slash, otherwise it would be part of a path.
    if let Some((authority, path)) = url.split_once(':') {
        if authority.contains('@') && !authority.contains('/') && !path.starts_with('/') {
            let host = authority
                .rsplit_once('@')
                .map(|(_, h)| h)
                .unwrap_or(authority);
            return hosted_identity(host, path, url);
        }
    }

    Err(IdentityError::InvalidOrigin(url.to_string()))
}

/// `host[:port]/path` remainder of an ssh/https/http URL.
fn hosted_from_hierarchical(rest: &str, original: &str) -> Result<OriginIdentity, IdentityError> {
    let (authority, path) = rest
        .split_once('/')
        .ok_or_else(|| IdentityError::InvalidOrigin(original.to_string()))?;
    let without_user = authority
        .rsplit_once('@')
        .map(|(_, h)| h)
        .unwrap_or(authority);
    let host = without_user
        .split_once(':')
        .map(|(h, _)| h)
        .unwrap_or(without_user);
    hosted_identity(host, path, original)
}

fn hosted_identity(host: &str, path: &str, original: &str) -> Result<OriginIdentity, IdentityError> {
    if host.is_empty() {
        return Err(IdentityError::InvalidOrigin(original.to_string()));
    }
    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(IdentityError::InvalidOrigin(original.to_string()));
    }
    // Nested groups (gitlab-style) fold into the owner component.
    let (owner, repo) = segments.split_at(segments.len() - 1);
    Ok(OriginIdentity::Hosted {
        host: host.to_ascii_lowercase(),
        owner: owner.join("/"),
        repo: repo[0].to_string(),
    })
}

fn local_identity(path: &str, original: &str) -> Result<OriginIdentity, IdentityError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(IdentityError::InvalidOrigin(original.to_string()));
    }
    Ok(OriginIdentity::Local {
        path: clean_path(Path::new(path)),
    })
}

/// Lexical path normalization: resolves `.`/`..` and duplicate separators
/// without touching the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// A derived repo-key plus the pieces it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoKeyParts {
    pub repo_key: String,
    pub name: String,
    pub relative_path: String,
}

/// Derive the repo-key for a working copy path inside a catalog.
///
/// Takes the first `repo_path_depth` segments of the path relative to the
/// catalog root. Fails when the path is outside the root or shallower than
/// the depth.
pub fn derive_repo_key(catalog: &Catalog, path: &Path) -> Result<RepoKeyParts, IdentityError> {
    let root = clean_path(&catalog.root);
    let path = clean_path(path);
    let relative = path
        .strip_prefix(&root)
        .map_err(|_| IdentityError::PathNotInCatalog {
            catalog: catalog.name.clone(),
            path: path.clone(),
        })?;

    let segments: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if segments.len() < catalog.repo_path_depth || catalog.repo_path_depth == 0 {
        return Err(IdentityError::PathTooShallow {
            catalog: catalog.name.clone(),
            path,
            depth: catalog.repo_path_depth,
        });
    }

    let relative_path = segments[..catalog.repo_path_depth].join("/");
    let name = segments[catalog.repo_path_depth - 1].clone();
    Ok(RepoKeyParts {
        repo_key: format!("{}/{}", catalog.name, relative_path),
        name,
        relative_path,
    })
}

/// Parsed form of a repo-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRepoKey {
    pub catalog: String,
    pub relative_path: String,
    pub repo_name: String,
}

/// Split a repo-key back into `(catalog, relative_path, repo_name)`.
pub fn parse_repo_key(key: &str) -> Result<ParsedRepoKey, IdentityError> {
    let mut segments = key.split('/');
    let catalog = segments.next().unwrap_or_default();
    let rest: Vec<&str> = segments.collect();
    if catalog.is_empty() || rest.is_empty() || rest.iter().any(|s| s.is_empty()) {
        return Err(IdentityError::InvalidRepoKey(key.to_string()));
    }
    Ok(ParsedRepoKey {
        catalog: catalog.to_string(),
        relative_path: rest.join("/"),
        repo_name: rest[rest.len() - 1].to_string(),
    })
}

/// Encode a repo-key for use as a filename component.
///
/// `%` is escaped first so the mapping stays exactly reversible.
pub fn encode_repo_key(key: &str) -> String {
    key.replace('%', "%25").replace('/', "%2F")
}

/// Inverse of [`encode_repo_key`].
pub fn decode_repo_key(encoded: &str) -> String {
    encoded.replace("%2F", "/").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn equivalent_origin_forms_normalize_equal() {
        let forms = [
            "git@github.com:o/r.git",
            "https://github.com/o/r.git",
            "https://github.com/o/r",
            "ssh://git@github.com/o/r",
            "ssh://git@github.com:2222/o/r.git",
        ];
        let first = normalize_origin_identity(forms[0]).expect("first");
        for form in &forms[1..] {
            assert_eq!(
                normalize_origin_identity(form).expect(form),
                first,
                "{form} should match {}",
                forms[0]
            );
        }
        assert_eq!(first.to_string(), "github.com/o/r");
    }

    #[test]
    fn host_is_lowercased() {
        let upper = normalize_origin_identity("https://GitHub.COM/o/r").expect("upper");
        let lower = normalize_origin_identity("https://github.com/o/r").expect("lower");
        assert_eq!(upper, lower);
    }

    #[test]
    fn nested_groups_fold_into_owner() {
        let id = normalize_origin_identity("https://gitlab.com/group/sub/repo.git").expect("id");
        assert_eq!(id.to_string(), "gitlab.com/group/sub/repo");
    }

    #[test]
    fn file_url_matches_plain_path() {
        let url = normalize_origin_identity("file:///srv/git/widget.git").expect("url");
        let path = normalize_origin_identity("/srv/git/widget.git").expect("path");
        assert_eq!(url, path);

        let localhost =
            normalize_origin_identity("file://localhost/srv/git/widget.git").expect("localhost");
        assert_eq!(localhost, path);
    }

    #[test]
    fn local_paths_are_cleaned() {
        let a = normalize_origin_identity("/srv/git/../git/widget.git").expect("a");
        let b = normalize_origin_identity("/srv/git/widget.git").expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn local_and_hosted_never_match() {
        let local = normalize_origin_identity("/srv/git/o/r").expect("local");
        let hosted = normalize_origin_identity("https://srv/o/r").expect("hosted");
        assert_ne!(local, hosted);
    }

    #[test]
    fn invalid_origins_rejected() {
        for bad in ["", "   ", "not a url", "relative/path", "https://hostonly"] {
            assert!(
                matches!(
                    normalize_origin_identity(bad),
                    Err(IdentityError::InvalidOrigin(_))
                ),
                "{bad:?} should be invalid"
            );
        }
    }

    #[test]
    fn scp_like_with_slash_in_host_is_invalid() {
        // A colon after a slash is path punctuation, not an authority split.
        assert!(normalize_origin_identity("foo/bar:baz/qux").is_err());
    }

    fn catalog(depth: usize) -> Catalog {
        let mut c = Catalog::new("software", "/home/u/software");
        c.repo_path_depth = depth;
        c
    }

    #[test]
    fn derive_repo_key_depth_one() {
        let parts =
            derive_repo_key(&catalog(1), Path::new("/home/u/software/widget")).expect("derive");
        assert_eq!(parts.repo_key, "software/widget");
        assert_eq!(parts.name, "widget");
        assert_eq!(parts.relative_path, "widget");
    }

    #[test]
    fn derive_repo_key_depth_two() {
        let parts = derive_repo_key(&catalog(2), Path::new("/home/u/software/acme/widget"))
            .expect("derive");
        assert_eq!(parts.repo_key, "software/acme/widget");
        assert_eq!(parts.name, "widget");
    }

    #[test]
    fn derive_repo_key_ignores_extra_segments() {
        // Nested dirs below the layout depth belong to the same repo.
        let parts = derive_repo_key(&catalog(1), Path::new("/home/u/software/widget/sub/dir"))
            .expect("derive");
        assert_eq!(parts.repo_key, "software/widget");
    }

    #[test]
    fn derive_repo_key_outside_root() {
        assert!(matches!(
            derive_repo_key(&catalog(1), Path::new("/elsewhere/widget")),
            Err(IdentityError::PathNotInCatalog { .. })
        ));
    }

    #[test]
    fn derive_repo_key_too_shallow() {
        assert!(matches!(
            derive_repo_key(&catalog(2), Path::new("/home/u/software/widget")),
            Err(IdentityError::PathTooShallow { .. })
        ));
    }

    #[test]
    fn parse_repo_key_round_trip() {
        let parsed = parse_repo_key("software/acme/widget").expect("parse");
        assert_eq!(parsed.catalog, "software");
        assert_eq!(parsed.relative_path, "acme/widget");
        assert_eq!(parsed.repo_name, "widget");
    }

    #[test]
    fn parse_repo_key_rejects_malformed() {
        for bad in ["", "software", "/widget", "software//widget", "software/"] {
            assert!(
                matches!(parse_repo_key(bad), Err(IdentityError::InvalidRepoKey(_))),
                "{bad:?} should be invalid"
            );
        }
    }

    #[test]
    fn encode_decode_examples() {
        assert_eq!(encode_repo_key("software/widget"), "software%2Fwidget");
        assert_eq!(decode_repo_key("software%2Fwidget"), "software/widget");
        // Keys containing a literal percent survive the round trip.
        assert_eq!(
            decode_repo_key(&encode_repo_key("soft%ware/widget")),
            "soft%ware/widget"
        );
    }

    proptest! {
        #[test]
        fn encode_decode_is_exact(key in "[a-zA-Z0-9._%/-]{1,64}") {
            prop_assert_eq!(decode_repo_key(&encode_repo_key(&key)), key);
        }

        #[test]
        fn encoded_keys_have_no_separator(key in "[a-zA-Z0-9._%/-]{1,64}") {
            prop_assert!(!encode_repo_key(&key).contains('/'));
        }

        #[test]
        fn derive_then_parse_agrees(name in "[a-z][a-z0-9-]{0,16}") {
            let c = catalog(1);
            let path = c.root.join(&name);
            let parts = derive_repo_key(&c, &path).unwrap();
            let parsed = parse_repo_key(&parts.repo_key).unwrap();
            prop_assert_eq!(parsed.catalog, c.name);
            prop_assert_eq!(parsed.repo_name, name);
        }
    }
}
