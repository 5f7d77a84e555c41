//! The convergence orchestrator.
//!
//! `sync` is the top-level pipeline: acquire the global lock, observe the
//! selected catalogs, publish the snapshot, load the fleet, reconcile,
//! publish again, notify. The snapshot is published twice so other
//! machines see timely local progress even when reconciliation fails
//! part-way; both publications preserve the `observed_at` advancement
//! rule.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use bb_git::GitInvoker;
use bb_state::{GlobalLock, MetaStore, StateStore};
use bb_types::{Catalog, MachineSnapshot, STATE_VERSION};

use crate::clock::Clock;
use crate::machine::resolve_machine_identity;
use crate::notify::{self, NotifySink};
use crate::observe::{self, ObserveOptions};
use crate::policy;
use crate::reconcile::reconcile;

/// Options for one `sync` invocation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Catalog names to operate on; empty means every mapped catalog.
    pub include: Vec<String>,
    /// Push ahead branches regardless of per-repo auto-push policy.
    pub push: bool,
    /// Suppress every mutating git operation.
    pub dry_run: bool,
    /// Run the notification pass.
    pub notify: bool,
    /// Bounded wait for the global lock.
    pub lock_wait: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            push: false,
            dry_run: false,
            notify: true,
            lock_wait: Duration::from_secs(10),
        }
    }
}

/// What one invocation produced.
#[derive(Debug)]
pub struct SyncOutcome {
    pub snapshot: MachineSnapshot,
    /// 0 on success, 1 when a selected record carries a blocking reason.
    /// Operational failures surface as errors and map to exit 2.
    pub exit_code: i32,
}

/// Resolve the catalogs this invocation operates on. Selecting a catalog
/// that exists only on other machines names them in the error.
pub fn select_catalogs(
    machine: &MachineSnapshot,
    include: &[String],
    store: &StateStore,
) -> Result<Vec<Catalog>> {
    if include.is_empty() {
        return Ok(machine.catalogs.clone());
    }
    let mut out: Vec<Catalog> = Vec::new();
    for name in include {
        match machine.catalog(name) {
            Some(catalog) => {
                if !out.iter().any(|c| c.name == catalog.name) {
                    out.push(catalog.clone());
                }
            }
            None => {
                let known_elsewhere = store
                    .list_machines()
                    .unwrap_or_default()
                    .iter()
                    .any(|m| m.machine_id != machine.machine_id && m.catalog(name).is_some());
                if known_elsewhere {
                    bail!(
                        "catalog {name:?} is not configured on this machine; it is known on \
                         other machines, run `bb config catalog add {name}` to map it here"
                    );
                }
                bail!("unknown catalog {name:?}");
            }
        }
    }
    Ok(out)
}

/// Run the full convergence pipeline once.
pub fn sync(
    store: &StateStore,
    git: &dyn GitInvoker,
    clock: &Clock,
    sink: &dyn NotifySink,
    opts: &SyncOptions,
) -> Result<SyncOutcome> {
    store.ensure_layout()?;
    let _lock = GlobalLock::acquire(store, opts.lock_wait)?;

    let config = store.load_config()?;
    config.validate()?;
    let identity = resolve_machine_identity(store)?;
    let mut machine = store
        .load_machine(&identity.machine_id)?
        .unwrap_or_else(|| MachineSnapshot::new(&identity.machine_id, &identity.hostname));
    machine.version = STATE_VERSION;

    let selected = select_catalogs(&machine, &opts.include, store)?;
    let selected_names: Vec<String> = selected.iter().map(|c| c.name.clone()).collect();
    debug!(machine_id = %machine.machine_id, catalogs = ?selected_names, "sync starting");

    let prev = observe::index_previous(&machine.repos);
    let metas_store = MetaStore::new(store.clone());
    let observe_opts = ObserveOptions {
        dry_run: opts.dry_run,
        push_requested: opts.push,
    };

    let outcome = observe::observe_phase(
        git,
        &metas_store,
        &config,
        clock,
        &selected,
        &prev,
        observe_opts,
    )
    .context("observation phase failed")?;

    // Records from catalogs outside this selection keep their last
    // observed state.
    let mut repos = outcome.records;
    for record in &machine.repos {
        if !selected_names.contains(&record.catalog) {
            repos.push(record.clone());
        }
    }
    repos.sort_by(|a, b| (a.repo_key.as_str(), &a.path).cmp(&(b.repo_key.as_str(), &b.path)));
    machine.repos = repos;

    let now = clock.now();
    machine.last_scan_at = Some(now);
    machine.last_scan_catalogs = selected_names.clone();
    machine.updated_at = now;
    store.store_machine(&machine)?;

    let fleet = store.list_machines()?;
    let metas = store.list_repo_metas()?;
    let reconcile_result = reconcile(
        git,
        &metas_store,
        &config,
        clock,
        &mut machine,
        &fleet,
        &metas,
        &selected,
        &outcome.transitioned,
        &prev,
        observe_opts,
    );

    // Publish the final verdicts even when a later stage failed, so other
    // machines and operators see the most recent state.
    machine.updated_at = clock.now();
    store.store_machine(&machine)?;
    reconcile_result?;

    if opts.notify && config.notify.enabled {
        let summary = notify::notify_unsyncable(store, &config, &machine.repos, clock, sink)?;
        debug!(?summary, "notification pass complete");
    }

    let blocking = machine
        .repos
        .iter()
        .filter(|r| selected_names.contains(&r.catalog) && r.has_blocking_reason())
        .count();
    let exit_code = i32::from(blocking > 0);
    info!(
        machine_id = %machine.machine_id,
        repos = machine.repos.len(),
        blocking,
        exit_code,
        "sync finished"
    );
    Ok(SyncOutcome {
        snapshot: machine,
        exit_code,
    })
}

/// Load this machine's snapshot for read-only display, refreshing the
/// observation first when it is stale for the selected catalogs.
pub fn status(
    store: &StateStore,
    git: &dyn GitInvoker,
    clock: &Clock,
    include: &[String],
    lock_wait: Duration,
) -> Result<MachineSnapshot> {
    store.ensure_layout()?;
    let config = store.load_config()?;
    config.validate()?;
    let identity = resolve_machine_identity(store)?;
    let mut machine = store
        .load_machine(&identity.machine_id)?
        .unwrap_or_else(|| MachineSnapshot::new(&identity.machine_id, &identity.hostname));

    let selected = select_catalogs(&machine, include, store)?;
    let selected_names: Vec<String> = selected.iter().map(|c| c.name.clone()).collect();
    if policy::snapshot_is_fresh(
        &machine,
        &selected_names,
        clock.now(),
        config.sync.scan_freshness_seconds,
    ) {
        return Ok(machine);
    }

    debug!("snapshot stale, refreshing observations");
    let _lock = GlobalLock::acquire(store, lock_wait)?;
    let prev = observe::index_previous(&machine.repos);
    let metas_store = MetaStore::new(store.clone());
    let outcome = observe::observe_phase(
        git,
        &metas_store,
        &config,
        clock,
        &selected,
        &prev,
        ObserveOptions {
            dry_run: true,
            push_requested: false,
        },
    )?;

    let mut repos = outcome.records;
    for record in &machine.repos {
        if !selected_names.contains(&record.catalog) {
            repos.push(record.clone());
        }
    }
    repos.sort_by(|a, b| (a.repo_key.as_str(), &a.path).cmp(&(b.repo_key.as_str(), &b.path)));
    machine.repos = repos;
    let now = clock.now();
    machine.last_scan_at = Some(now);
    machine.last_scan_catalogs = selected_names;
    machine.updated_at = now;
    store.store_machine(&machine)?;
    Ok(machine)
}
