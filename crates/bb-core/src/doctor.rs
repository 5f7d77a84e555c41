//! State-directory health checks backing the `doctor` command.

use anyhow::Result;
use chrono::Duration;

use bb_git::SystemGit;
use bb_state::{GlobalLock, StateStore};

use crate::clock::Clock;

/// One health verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl DoctorCheck {
    fn ok(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Run every health check. The report is advisory; only callers decide
/// whether failures are fatal.
pub fn run_doctor(store: &StateStore, clock: &Clock) -> Result<Vec<DoctorCheck>> {
    let mut checks = Vec::new();

    checks.push(if store.root().is_dir() {
        DoctorCheck::ok("state_dir", store.root().display().to_string())
    } else {
        DoctorCheck::fail(
            "state_dir",
            format!("{} does not exist", store.root().display()),
        )
    });

    match store.load_config() {
        Ok(config) => match config.validate() {
            Ok(()) => checks.push(DoctorCheck::ok("config", "valid")),
            Err(err) => checks.push(DoctorCheck::fail("config", err.to_string())),
        },
        Err(err) => checks.push(DoctorCheck::fail("config", err.to_string())),
    }

    checks.push(match SystemGit::locate() {
        Ok(_) => DoctorCheck::ok("git", "found on PATH"),
        Err(err) => DoctorCheck::fail("git", err.to_string()),
    });

    checks.push(match which::which("gh") {
        Ok(path) => DoctorCheck::ok("gh", path.display().to_string()),
        Err(_) => DoctorCheck::ok("gh", "not found (remote creation unavailable)"),
    });

    if GlobalLock::is_held(store) {
        let holder = GlobalLock::read_holder(store)
            .ok()
            .flatten()
            .map(|info| format!("held by pid {} on {}", info.pid, info.hostname))
            .unwrap_or_else(|| "held".to_string());
        checks.push(DoctorCheck::fail("lock", holder));
    } else {
        checks.push(DoctorCheck::ok("lock", "free"));
    }

    let cache = store.load_notify_cache()?;
    if cache.delivery_failures.is_empty() {
        checks.push(DoctorCheck::ok("notify", "no delivery failures"));
    } else {
        let mut failures: Vec<String> = cache
            .delivery_failures
            .values()
            .map(|f| format!("{}: {}", f.backend, f.repo_key))
            .collect();
        failures.sort();
        checks.push(DoctorCheck::fail(
            "notify",
            format!("{} delivery failure(s): {}", failures.len(), failures.join(", ")),
        ));
    }

    let config = store.load_config().unwrap_or_default();
    let window = Duration::seconds(config.sync.scan_freshness_seconds as i64);
    let now = clock.now();
    for machine in store.list_machines()? {
        let name = format!("machine/{}", machine.machine_id);
        match machine.last_scan_at {
            Some(at) if now - at <= window => {
                checks.push(DoctorCheck::ok(&name, format!("scanned {at}")));
            }
            Some(at) => {
                checks.push(DoctorCheck::fail(&name, format!("stale, last scan {at}")));
            }
            None => checks.push(DoctorCheck::fail(&name, "never scanned")),
        }
    }

    Ok(checks)
}
