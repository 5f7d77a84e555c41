//! Distributed reconciliation: drive local state toward the per-repo
//! fleet winner.
//!
//! Identity is the repo-key, origin equality is decided by normalized
//! origin identity, and tombstoned keys (previous identities of moved
//! repositories) are never reconciled. A metadata entry whose catalog is
//! not mapped on this machine never drives local observations; stale local
//! copies under its previous keys are only annotated.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use bb_git::{CloneOptions, GitInvoker};
use bb_identity::{normalize_origin_identity, parse_repo_key};
use bb_state::MetaStore;
use bb_types::{Catalog, Config, MachineSnapshot, Reason, RepoMetadata, RepoRecord};

use crate::clock::Clock;
use crate::discover::DiscoveredRepo;
use crate::observe::{self, ObserveOptions};
use crate::remote;
use crate::winner::{select_winner, select_winner_excluding};

/// Repo-keys that are previous identities of some repository. They are
/// never the subject of reconciliation; only their successor is.
pub fn tombstoned_keys(metas: &[RepoMetadata]) -> BTreeSet<&str> {
    metas
        .iter()
        .flat_map(|m| m.previous_repo_keys.iter().map(String::as_str))
        .collect()
}

/// Target-catalog resolution chain: the key's implicit catalog when it is
/// mapped and selected, else the metadata's preferred catalog, else the
/// machine default, else any selected catalog.
pub fn resolve_target_catalog<'a>(
    machine: &'a MachineSnapshot,
    selected: &'a [Catalog],
    meta: &RepoMetadata,
    implicit: &str,
) -> Option<&'a Catalog> {
    let available = |name: &str| selected.iter().find(|c| c.name == name);
    if let Some(catalog) = available(implicit) {
        return Some(catalog);
    }
    if let Some(preferred) = meta.preferred_catalog.as_deref() {
        if let Some(catalog) = available(preferred) {
            return Some(catalog);
        }
    }
    if let Some(default) = machine.default_catalog.as_deref() {
        if let Some(catalog) = available(default) {
            return Some(catalog);
        }
    }
    selected.first()
}

/// What occupies a prospective clone target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Vacant,
    OccupiedMatching,
    NonRepo,
    RepoMismatch,
}

/// Inspect a prospective target path. Origin equality uses normalized
/// identities, so ssh and https spellings of the same upstream match.
/// Unknown identities (no recorded origin, unreadable local origin) never
/// flag a mismatch.
fn validate_target_path(git: &dyn GitInvoker, path: &Path, meta: &RepoMetadata) -> TargetState {
    if !path.exists() {
        return TargetState::Vacant;
    }
    if path.is_dir() {
        let empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            return TargetState::Vacant;
        }
    } else {
        return TargetState::NonRepo;
    }
    if !git.is_git_repo(path) {
        return TargetState::NonRepo;
    }

    let Ok(expected) = normalize_origin_identity(&meta.origin_url) else {
        return TargetState::OccupiedMatching;
    };
    let local_origin = git
        .repo_origin(path, &meta.preferred_remote)
        .unwrap_or_default();
    let Ok(actual) = normalize_origin_identity(&local_origin) else {
        return TargetState::OccupiedMatching;
    };
    if expected == actual {
        TargetState::OccupiedMatching
    } else {
        TargetState::RepoMismatch
    }
}

/// Run reconciliation over every known repository. `fleet` is every
/// machine snapshot as loaded from the store (including this machine's
/// first publication); `machine` is mutated in place and published again
/// by the orchestrator afterwards.
#[allow(clippy::too_many_arguments)]
pub fn reconcile(
    git: &dyn GitInvoker,
    metas_store: &MetaStore,
    config: &Config,
    clock: &Clock,
    machine: &mut MachineSnapshot,
    fleet: &[MachineSnapshot],
    metas: &[RepoMetadata],
    selected: &[Catalog],
    transitioned: &BTreeSet<String>,
    prev: &HashMap<(String, PathBuf), RepoRecord>,
    opts: ObserveOptions,
) -> Result<()> {
    let tombstones = tombstoned_keys(metas);

    for meta in metas {
        if tombstones.contains(meta.repo_key.as_str()) {
            debug!(repo_key = %meta.repo_key, "skipping tombstoned key");
            continue;
        }
        let parsed = match parse_repo_key(&meta.repo_key) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(repo_key = %meta.repo_key, %err, "unparseable metadata key");
                continue;
            }
        };

        let implicit_selected = selected.iter().find(|c| c.name == parsed.catalog);
        match implicit_selected {
            Some(catalog) => {
                let catalog = catalog.clone();
                drive_key(
                    git,
                    metas_store,
                    config,
                    clock,
                    machine,
                    fleet,
                    meta,
                    &catalog,
                    &parsed.relative_path,
                    &parsed.repo_name,
                    transitioned,
                    prev,
                    opts,
                )?;
            }
            None if machine.catalog(&parsed.catalog).is_some() => {
                // Mapped but excluded from this run's selection: the
                // operator filtered it out, leave it alone.
                debug!(repo_key = %meta.repo_key, "catalog not selected this run");
            }
            None => {
                mark_catalog_mismatch(machine, meta, &parsed.catalog, clock, prev);
            }
        }
    }

    machine
        .repos
        .sort_by(|a, b| (a.repo_key.as_str(), &a.path).cmp(&(b.repo_key.as_str(), &b.path)));
    Ok(())
}

/// Annotate stale local copies of a repository whose catalog this machine
/// cannot host: the copies live under the metadata's previous keys (or the
/// current key from an older configuration). Nothing is moved.
fn mark_catalog_mismatch(
    machine: &mut MachineSnapshot,
    meta: &RepoMetadata,
    implicit: &str,
    clock: &Clock,
    prev: &HashMap<(String, PathBuf), RepoRecord>,
) {
    let expected_path = machine
        .catalog(implicit)
        .map(|catalog| catalog.root.join(relative_of(&meta.repo_key)));
    let not_mapped = machine.catalog(implicit).is_none();
    let now = clock.now();

    for record in &mut machine.repos {
        let stale = record.repo_key == meta.repo_key
            || meta.previous_repo_keys.contains(&record.repo_key);
        if !stale {
            continue;
        }
        record.mark_unsyncable(Reason::CatalogMismatch);
        if not_mapped {
            record.mark_unsyncable(Reason::CatalogNotMapped);
        }
        record.expected_repo_key = Some(meta.repo_key.clone());
        record.expected_catalog = Some(implicit.to_string());
        record.expected_path = expected_path.clone();
        let prior = prev.get(&(record.repo_key.clone(), record.path.clone()));
        record.seal(prior, now);
    }
}

fn relative_of(repo_key: &str) -> String {
    parse_repo_key(repo_key)
        .map(|p| p.relative_path)
        .unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
fn drive_key(
    git: &dyn GitInvoker,
    metas_store: &MetaStore,
    config: &Config,
    clock: &Clock,
    machine: &mut MachineSnapshot,
    fleet: &[MachineSnapshot],
    meta: &RepoMetadata,
    catalog: &Catalog,
    relative_path: &str,
    repo_name: &str,
    transitioned: &BTreeSet<String>,
    prev: &HashMap<(String, PathBuf), RepoRecord>,
    opts: ObserveOptions,
) -> Result<()> {
    let key = meta.repo_key.as_str();
    let target_path = catalog.root.join(relative_path);
    let local_indices: Vec<usize> = machine
        .repos
        .iter()
        .enumerate()
        .filter(|(_, r)| r.repo_key == key)
        .map(|(i, _)| i)
        .collect();

    if local_indices.len() > 1 {
        let now = clock.now();
        for index in local_indices {
            let record = &mut machine.repos[index];
            record.mark_unsyncable(Reason::DuplicateLocalRepoKey);
            let prior = prev.get(&(record.repo_key.clone(), record.path.clone()));
            record.seal(prior, now);
        }
        return Ok(());
    }

    // Winner across the fleet, with the local-vs-remote nudge: a record
    // that just turned syncable defers to the best remote candidate when
    // their branches disagree ("I just cleaned up; adopt the fleet's
    // branch choice").
    let mut winner = select_winner(fleet, key).map(|w| WinnerView {
        machine_id: w.machine_id.to_string(),
        branch: w.record.branch.clone(),
    });
    if let Some(view) = &winner {
        if view.machine_id == machine.machine_id
            && local_indices.len() == 1
            && transitioned.contains(key)
        {
            if let Some(remote_best) = select_winner_excluding(fleet, key, &machine.machine_id) {
                if remote_best.record.branch != view.branch {
                    winner = Some(WinnerView {
                        machine_id: remote_best.machine_id.to_string(),
                        branch: remote_best.record.branch.clone(),
                    });
                }
            }
        }
    }

    if let Some(index) = local_indices.first().copied() {
        drive_local_match(
            git,
            metas_store,
            config,
            clock,
            machine,
            meta,
            catalog,
            index,
            winner.as_ref(),
            prev,
            opts,
        )?;
        return Ok(());
    }

    // Zero local matches: clone or explain why not.
    match validate_target_path(git, &target_path, meta) {
        TargetState::OccupiedMatching => {
            // The repository is already there; a later scan will pick it
            // up. Nothing to do.
            debug!(repo_key = %key, "target path already holds the repository");
        }
        TargetState::NonRepo => {
            push_synthetic(
                machine,
                meta,
                catalog,
                repo_name,
                &target_path,
                Reason::TargetPathNonRepo,
                clock,
                prev,
            );
        }
        TargetState::RepoMismatch => {
            push_synthetic(
                machine,
                meta,
                catalog,
                repo_name,
                &target_path,
                Reason::TargetPathRepoMismatch,
                clock,
                prev,
            );
        }
        TargetState::Vacant => {
            let Some(view) = winner else {
                // No syncable source anywhere in the fleet.
                return Ok(());
            };
            if opts.dry_run || !catalog.allows_clone_on_sync() {
                push_synthetic(
                    machine,
                    meta,
                    catalog,
                    repo_name,
                    &target_path,
                    Reason::CloneRequired,
                    clock,
                    prev,
                );
                return Ok(());
            }
            clone_from_winner(
                git,
                metas_store,
                config,
                clock,
                machine,
                meta,
                catalog,
                repo_name,
                &target_path,
                &view,
                prev,
                opts,
            )?;
        }
    }
    Ok(())
}

struct WinnerView {
    machine_id: String,
    branch: String,
}

#[allow(clippy::too_many_arguments)]
fn drive_local_match(
    git: &dyn GitInvoker,
    metas_store: &MetaStore,
    config: &Config,
    clock: &Clock,
    machine: &mut MachineSnapshot,
    meta: &RepoMetadata,
    catalog: &Catalog,
    index: usize,
    winner: Option<&WinnerView>,
    prev: &HashMap<(String, PathBuf), RepoRecord>,
    opts: ObserveOptions,
) -> Result<()> {
    let (path, branch, syncable) = {
        let record = &machine.repos[index];
        (record.path.clone(), record.branch.clone(), record.syncable)
    };
    if !syncable {
        // Its reasons were recorded during observation; convergence waits
        // for the operator.
        return Ok(());
    }
    let Some(winner) = winner else {
        return Ok(());
    };
    if winner.machine_id == machine.machine_id {
        // This record is the winner; observation already applied the
        // local fetch/pull/push actions.
        return Ok(());
    }

    let now = clock.now();
    if branch != winner.branch && !winner.branch.is_empty() {
        if opts.dry_run {
            return Ok(());
        }
        if let Err(err) = git.checkout(&path, &winner.branch) {
            warn!(path = %path.display(), branch = %winner.branch, %err, "checkout failed");
            let record = &mut machine.repos[index];
            record.mark_unsyncable(Reason::CheckoutFailed);
            let prior = prev.get(&(record.repo_key.clone(), record.path.clone()));
            record.seal(prior, now);
            return Ok(());
        }
    }
    if opts.dry_run {
        return Ok(());
    }

    if config.sync.fetch_prune {
        if let Err(err) = git.fetch_prune(&path, &meta.preferred_remote) {
            debug!(path = %path.display(), %err, "fetch --prune failed");
        }
    }
    if let Err(err) = git.pull_ff_only(&path) {
        warn!(path = %path.display(), %err, "fast-forward pull failed");
        let record = &mut machine.repos[index];
        record.mark_unsyncable(Reason::PullFailed);
        let prior = prev.get(&(record.repo_key.clone(), record.path.clone()));
        record.seal(prior, now);
        return Ok(());
    }

    // Re-observe and replace the record with the post-drive truth.
    let rediscovered = DiscoveredRepo {
        catalog: catalog.clone(),
        path: path.clone(),
        name: meta.name.clone(),
        repo_key: meta.repo_key.clone(),
    };
    let mut record = observe::observe_one(git, metas_store, config, &rediscovered, opts)?;
    let prior = prev.get(&(record.repo_key.clone(), record.path.clone()));
    record.seal(prior, now);
    machine.repos[index] = record;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn clone_from_winner(
    git: &dyn GitInvoker,
    metas_store: &MetaStore,
    config: &Config,
    clock: &Clock,
    machine: &mut MachineSnapshot,
    meta: &RepoMetadata,
    catalog: &Catalog,
    repo_name: &str,
    target_path: &Path,
    winner: &WinnerView,
    prev: &HashMap<(String, PathBuf), RepoRecord>,
    opts: ObserveOptions,
) -> Result<()> {
    let origin = remote::resolve_clone_url(meta);
    if origin.is_empty() {
        push_synthetic(
            machine,
            meta,
            catalog,
            repo_name,
            target_path,
            Reason::CloneRequired,
            clock,
            prev,
        );
        return Ok(());
    }
    let (shallow, filter) = config.clone.effective_for(&catalog.name);
    let options = CloneOptions {
        shallow,
        filter,
        only: Vec::new(),
    };
    if let Err(err) = git.clone_repo(&origin, target_path, &options) {
        warn!(origin = %origin, path = %target_path.display(), %err, "clone failed");
        push_synthetic(
            machine,
            meta,
            catalog,
            repo_name,
            target_path,
            Reason::CloneRequired,
            clock,
            prev,
        );
        return Ok(());
    }
    if !winner.branch.is_empty() {
        if let Err(err) = git.ensure_branch(target_path, &winner.branch, &meta.preferred_remote) {
            debug!(path = %target_path.display(), %err, "ensure-branch after clone failed");
        }
    }
    if let Err(err) = git.pull_ff_only(target_path) {
        debug!(path = %target_path.display(), %err, "post-clone pull failed");
    }

    let discovered = DiscoveredRepo {
        catalog: catalog.clone(),
        path: target_path.to_path_buf(),
        name: repo_name.to_string(),
        repo_key: meta.repo_key.clone(),
    };
    let mut record = observe::observe_one(git, metas_store, config, &discovered, opts)?;
    record.seal(None, clock.now());
    machine.repos.push(record);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn push_synthetic(
    machine: &mut MachineSnapshot,
    meta: &RepoMetadata,
    catalog: &Catalog,
    repo_name: &str,
    target_path: &Path,
    reason: Reason,
    clock: &Clock,
    prev: &HashMap<(String, PathBuf), RepoRecord>,
) {
    let mut record = RepoRecord {
        repo_key: meta.repo_key.clone(),
        name: repo_name.to_string(),
        catalog: catalog.name.clone(),
        path: target_path.to_path_buf(),
        origin_url: meta.origin_url.clone(),
        ..RepoRecord::default()
    };
    record.mark_unsyncable(reason);
    let prior = prev.get(&(record.repo_key.clone(), record.path.clone()));
    record.seal(prior, clock.now());
    machine.repos.push(record);
}
