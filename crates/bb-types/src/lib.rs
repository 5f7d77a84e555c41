//! # Types
//!
//! Core domain types for bb: catalogs, per-machine repository records,
//! machine snapshots, fleet-wide repository metadata, the unsyncable-reason
//! taxonomy, and the shared configuration file.
//!
//! ## Serialization
//!
//! All persisted types implement `Serialize`/`Deserialize` and are written
//! as YAML with a `version` field first. Enum wire values are stable
//! snake_case strings; changing one is a breaking change to the state
//! directory format.
//!
//! ## Identity
//!
//! A repository is identified fleet-wide by its *repo-key*
//! (`<catalog>/<relative-path>`). Origin URLs are compared only through
//! their normalized identity, never byte-wise; see `bb-identity`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Current on-disk schema version for every state artifact.
pub const STATE_VERSION: i64 = 1;

/// Why a repository cannot be converged without operator intervention.
///
/// The set is closed; wire values are stable snake_case strings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    NoOrigin,
    NoUpstream,
    DirtyTracked,
    Untracked,
    Diverged,
    OperationInProgress,
    NeedsPush,
    PullFailed,
    PushFailed,
    CheckoutFailed,
    TargetPathNonRepo,
    TargetPathRepoMismatch,
    DuplicateLocalRepoKey,
    CloneRequired,
    CatalogMismatch,
    CatalogNotMapped,
}

impl Reason {
    /// Stable wire value, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::NoOrigin => "no_origin",
            Reason::NoUpstream => "no_upstream",
            Reason::DirtyTracked => "dirty_tracked",
            Reason::Untracked => "untracked",
            Reason::Diverged => "diverged",
            Reason::OperationInProgress => "operation_in_progress",
            Reason::NeedsPush => "needs_push",
            Reason::PullFailed => "pull_failed",
            Reason::PushFailed => "push_failed",
            Reason::CheckoutFailed => "checkout_failed",
            Reason::TargetPathNonRepo => "target_path_non_repo",
            Reason::TargetPathRepoMismatch => "target_path_repo_mismatch",
            Reason::DuplicateLocalRepoKey => "duplicate_local_repo_key",
            Reason::CloneRequired => "clone_required",
            Reason::CatalogMismatch => "catalog_mismatch",
            Reason::CatalogNotMapped => "catalog_not_mapped",
        }
    }

    /// Whether this reason makes `sync` exit non-zero.
    ///
    /// `clone_required`, `catalog_mismatch`, `catalog_not_mapped` and
    /// `needs_push` describe states the fleet can live with; everything
    /// else demands local attention.
    pub fn is_blocking(self) -> bool {
        !matches!(
            self,
            Reason::CloneRequired
                | Reason::CatalogMismatch
                | Reason::CatalogNotMapped
                | Reason::NeedsPush
        )
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multi-step git operation left in flight in a working copy.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    #[default]
    None,
    Rebase,
    Merge,
    CherryPick,
    Bisect,
    Revert,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::None => "none",
            OperationKind::Rebase => "rebase",
            OperationKind::Merge => "merge",
            OperationKind::CherryPick => "cherry-pick",
            OperationKind::Bisect => "bisect",
            OperationKind::Revert => "revert",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push policy for a repository.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AutoPushMode {
    #[default]
    Disabled,
    Enabled,
    IncludeDefaultBranch,
}

/// Repository visibility on the hosting side.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Public,
    #[default]
    Unknown,
}

/// Whether this fleet can push to the repository's origin.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PushAccess {
    #[default]
    Unknown,
    ReadOnly,
    ReadWrite,
}

fn default_depth() -> usize {
    1
}

/// A named root directory containing working copies at a fixed layout depth.
///
/// Depth 1 means `<root>/<repo>`; depth 2 means `<root>/<owner>/<repo>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_depth")]
    pub repo_path_depth: usize,
    /// Whether `sync` may clone missing repositories into this catalog.
    /// Unset falls back to the layout default: owner/repo catalogs
    /// (depth >= 2) do not auto-clone, flat catalogs do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_clone_on_sync: Option<bool>,
}

impl Catalog {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            repo_path_depth: 1,
            auto_clone_on_sync: None,
        }
    }

    /// Effective auto-clone policy for this catalog.
    pub fn allows_clone_on_sync(&self) -> bool {
        self.auto_clone_on_sync.unwrap_or(self.repo_path_depth < 2)
    }
}

/// One repository as observed on one machine during one scan.
///
/// Records are ephemeral: they are rebuilt from the filesystem on every
/// scan and published inside the machine snapshot. `observed_at` advances
/// only when `state_hash` changes, so an unchanged working copy keeps its
/// original observation timestamp across scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub repo_key: String,
    pub name: String,
    pub catalog: String,
    pub path: PathBuf,

    #[serde(default)]
    pub origin_url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub remote_head_sha: String,

    #[serde(default)]
    pub ahead: u32,
    #[serde(default)]
    pub behind: u32,
    #[serde(default)]
    pub diverged: bool,

    #[serde(default)]
    pub has_dirty_tracked: bool,
    #[serde(default)]
    pub has_untracked: bool,

    #[serde(default)]
    pub operation_in_progress: OperationKind,

    #[serde(default)]
    pub syncable: bool,
    #[serde(default)]
    pub unsyncable_reasons: BTreeSet<Reason>,

    #[serde(default)]
    pub state_hash: String,
    pub observed_at: DateTime<Utc>,

    /// Where this repository should live, populated only on
    /// catalog-mismatch synthetic records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_repo_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_catalog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_path: Option<PathBuf>,
}

impl RepoRecord {
    /// Add an unsyncable reason and clear the syncable verdict.
    pub fn mark_unsyncable(&mut self, reason: Reason) {
        self.unsyncable_reasons.insert(reason);
        self.syncable = false;
    }

    /// Whether any recorded reason is blocking for the sync exit code.
    pub fn has_blocking_reason(&self) -> bool {
        self.unsyncable_reasons.iter().any(|r| r.is_blocking())
    }

    /// Content-addressed digest over every non-timestamp field.
    ///
    /// The digest is the identity used for the `observed_at` advancement
    /// rule: two observations of an unchanged working copy hash equal.
    pub fn compute_state_hash(&self) -> String {
        fn field(hasher: &mut Sha256, key: &str, value: &str) {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, "repo_key", &self.repo_key);
        field(&mut hasher, "name", &self.name);
        field(&mut hasher, "catalog", &self.catalog);
        field(&mut hasher, "path", &self.path.to_string_lossy());
        field(&mut hasher, "origin_url", &self.origin_url);
        field(&mut hasher, "branch", &self.branch);
        field(&mut hasher, "upstream", &self.upstream);
        field(&mut hasher, "head_sha", &self.head_sha);
        field(&mut hasher, "remote_head_sha", &self.remote_head_sha);
        field(&mut hasher, "ahead", &self.ahead.to_string());
        field(&mut hasher, "behind", &self.behind.to_string());
        field(&mut hasher, "diverged", &self.diverged.to_string());
        field(
            &mut hasher,
            "has_dirty_tracked",
            &self.has_dirty_tracked.to_string(),
        );
        field(&mut hasher, "has_untracked", &self.has_untracked.to_string());
        field(
            &mut hasher,
            "operation_in_progress",
            self.operation_in_progress.as_str(),
        );
        field(&mut hasher, "syncable", &self.syncable.to_string());
        let reasons: Vec<&str> = self.unsyncable_reasons.iter().map(|r| r.as_str()).collect();
        field(&mut hasher, "unsyncable_reasons", &reasons.join("+"));
        field(
            &mut hasher,
            "expected_repo_key",
            self.expected_repo_key.as_deref().unwrap_or(""),
        );
        field(
            &mut hasher,
            "expected_catalog",
            self.expected_catalog.as_deref().unwrap_or(""),
        );
        field(
            &mut hasher,
            "expected_path",
            &self
                .expected_path
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        hex::encode(hasher.finalize())
    }

    /// Recompute the state hash, then set `observed_at`: preserved from the
    /// prior record when the hash is unchanged, `now` otherwise.
    pub fn seal(&mut self, prior: Option<&RepoRecord>, now: DateTime<Utc>) {
        self.state_hash = self.compute_state_hash();
        self.observed_at = match prior {
            Some(prev) if prev.state_hash == self.state_hash => prev.observed_at,
            _ => now,
        };
    }
}

/// Everything one machine publishes about itself into the shared state
/// directory. Exactly one file per machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSnapshot {
    #[serde(default)]
    pub version: i64,
    pub machine_id: String,
    pub hostname: String,
    #[serde(default)]
    pub catalogs: Vec<Catalog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_catalog: Option<String>,
    #[serde(default)]
    pub repos: Vec<RepoRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_scan_catalogs: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl MachineSnapshot {
    pub fn new(machine_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            machine_id: machine_id.into(),
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Look up a configured catalog by name.
    pub fn catalog(&self, name: &str) -> Option<&Catalog> {
        self.catalogs.iter().find(|c| c.name == name)
    }

    /// All local records for one repo-key.
    pub fn records_for_key<'a>(&'a self, repo_key: &str) -> Vec<&'a RepoRecord> {
        self.repos.iter().filter(|r| r.repo_key == repo_key).collect()
    }
}

/// Fleet-wide metadata for one repository. Created lazily on first
/// observation; persists until removed. Moves rewrite `repo_key` and
/// append the old key to `previous_repo_keys` (the tombstones).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoMetadata {
    #[serde(default)]
    pub version: i64,
    pub repo_key: String,
    #[serde(default)]
    pub previous_repo_keys: Vec<String>,
    pub name: String,
    #[serde(default)]
    pub origin_url: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_catalog: Option<String>,
    #[serde(default = "default_remote")]
    pub preferred_remote: String,
    #[serde(default)]
    pub auto_push: AutoPushMode,
    #[serde(default)]
    pub push_access: PushAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_access_checked_at: Option<DateTime<Utc>>,
    /// Operator pinned `push_access` by hand; probes must not overwrite it.
    #[serde(default)]
    pub push_access_manual: bool,
    #[serde(default)]
    pub branch_follow_enabled: bool,
}

fn default_remote() -> String {
    "origin".to_string()
}

impl RepoMetadata {
    pub fn new(repo_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            repo_key: repo_key.into(),
            name: name.into(),
            preferred_remote: default_remote(),
            ..Self::default()
        }
    }

    /// Canonical form used for the no-op write check: sets `version`,
    /// leaves every other field untouched.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.version = STATE_VERSION;
        out
    }

    /// Rewrite the key for a move, tombstoning the old one.
    pub fn record_move(&mut self, new_key: impl Into<String>) {
        let new_key = new_key.into();
        if new_key == self.repo_key {
            return;
        }
        let old = std::mem::replace(&mut self.repo_key, new_key);
        if !self.previous_repo_keys.contains(&old) {
            self.previous_repo_keys.push(old);
        }
    }
}

/// One emitted notification, remembered for de-duplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEntry {
    pub fingerprint: String,
    pub sent_at: DateTime<Utc>,
}

/// A recorded delivery failure, keyed by `(backend, repo_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub backend: String,
    pub repo_key: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Persistent notify de-dup state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyCache {
    #[serde(default)]
    pub version: i64,
    /// repo_key -> last emitted fingerprint.
    #[serde(default)]
    pub sent: BTreeMap<String, NotifyEntry>,
    /// "backend:repo_key" -> last delivery failure.
    #[serde(default)]
    pub delivery_failures: BTreeMap<String, DeliveryFailure>,
}

impl NotifyCache {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            ..Self::default()
        }
    }

    pub fn failure_key(backend: &str, repo_key: &str) -> String {
        format!("{backend}:{repo_key}")
    }
}

/// Errors raised while validating the shared configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported state_transport.mode {0:?} (only \"external\" is supported)")]
    UnsupportedTransportMode(String),
    #[error("remote url template rendered empty for {owner}/{repo}")]
    EmptyRemoteUrlTemplate { owner: String, repo: String },
}

/// Protocol used when building remote URLs for newly created repositories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteProtocol {
    #[default]
    Ssh,
    Https,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransport {
    pub mode: String,
}

impl Default for StateTransport {
    fn default() -> Self {
        Self {
            mode: "external".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub remote_protocol: RemoteProtocol,
    /// Template with `${org}`/`${owner}` and `${repo}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_remote_url_template: Option<String>,
}

impl GithubConfig {
    /// Build the remote URL for `owner/repo`, honoring the template when
    /// one is configured.
    pub fn remote_url(&self, owner: &str, repo: &str) -> Result<String, ConfigError> {
        if let Some(template) = &self.preferred_remote_url_template {
            let rendered = template
                .replace("${org}", owner)
                .replace("${owner}", owner)
                .replace("${repo}", repo);
            if rendered.trim().is_empty() {
                return Err(ConfigError::EmptyRemoteUrlTemplate {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                });
            }
            return Ok(rendered);
        }
        Ok(match self.remote_protocol {
            RemoteProtocol::Ssh => format!("git@github.com:{owner}/{repo}.git"),
            RemoteProtocol::Https => format!("https://github.com/{owner}/{repo}.git"),
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_scan_freshness() -> u64 {
    900
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub default_auto_push_private: AutoPushMode,
    #[serde(default)]
    pub default_auto_push_public: AutoPushMode,
    #[serde(default = "default_true")]
    pub include_untracked_as_dirty: bool,
    #[serde(default)]
    pub fetch_prune: bool,
    #[serde(default = "default_scan_freshness")]
    pub scan_freshness_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_auto_push_private: AutoPushMode::Disabled,
            default_auto_push_public: AutoPushMode::Disabled,
            include_untracked_as_dirty: true,
            fetch_prune: false,
            scan_freshness_seconds: default_scan_freshness(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClonePreset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shallow: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloneConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_catalog: Option<String>,
    #[serde(default)]
    pub shallow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub presets: BTreeMap<String, ClonePreset>,
    /// catalog name -> preset name.
    #[serde(default)]
    pub catalog_preset: BTreeMap<String, String>,
}

impl CloneConfig {
    /// Effective (shallow, filter) for a catalog, preset-aware.
    pub fn effective_for(&self, catalog: &str) -> (bool, Option<String>) {
        if let Some(preset) = self
            .catalog_preset
            .get(catalog)
            .and_then(|name| self.presets.get(name))
        {
            return (
                preset.shallow.unwrap_or(self.shallow),
                preset.filter.clone().or_else(|| self.filter.clone()),
            );
        }
        (self.shallow, self.filter.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub dedupe: bool,
    #[serde(default)]
    pub throttle_minutes: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dedupe: true,
            throttle_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveConfig {
    /// Shell fragments run after a repo move, with BB_MOVE_* env vars set.
    #[serde(default)]
    pub post_hooks: Vec<String>,
}

/// The fleet-wide configuration file (`config.yaml` in the state dir).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub state_transport: StateTransport,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub clone: CloneConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(rename = "move", default)]
    pub moves: MoveConfig,
}

impl Config {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            ..Self::default()
        }
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_transport.mode != "external" {
            return Err(ConfigError::UnsupportedTransportMode(
                self.state_transport.mode.clone(),
            ));
        }
        if let Some(template) = &self.github.preferred_remote_url_template {
            if template
                .replace("${org}", "o")
                .replace("${owner}", "o")
                .replace("${repo}", "r")
                .trim()
                .is_empty()
            {
                return Err(ConfigError::EmptyRemoteUrlTemplate {
                    owner: "o".to_string(),
                    repo: "r".to_string(),
                });
            }
        }
        Ok(())
    }
}
