//! Policy resolution: auto-push effectiveness, default-branch guard, scan
//! freshness, per-catalog clone defaults.

use chrono::{DateTime, Duration, Utc};

use bb_types::{AutoPushMode, MachineSnapshot};

/// Whether pushes are allowed on `branch` under `mode`.
///
/// `enabled` pushes everywhere except the default branch; pushing the
/// default branch needs `include_default_branch`.
pub fn auto_push_effective(mode: AutoPushMode, branch: &str, default_branch: &str) -> bool {
    match mode {
        AutoPushMode::Disabled => false,
        AutoPushMode::Enabled => branch != default_branch,
        AutoPushMode::IncludeDefaultBranch => true,
    }
}

/// Whether a snapshot is fresh enough for read-only commands: scanned
/// within the window, and the last scan covered every selected catalog.
pub fn snapshot_is_fresh(
    snapshot: &MachineSnapshot,
    selected: &[String],
    now: DateTime<Utc>,
    freshness_seconds: u64,
) -> bool {
    let Some(last_scan) = snapshot.last_scan_at else {
        return false;
    };
    let age = now - last_scan;
    if age > Duration::seconds(freshness_seconds as i64) || age < Duration::zero() {
        return false;
    }
    selected
        .iter()
        .all(|name| snapshot.last_scan_catalogs.contains(name))
}
