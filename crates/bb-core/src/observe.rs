//! Parallel repository observation.
//!
//! Discovery produces the work list; a bounded pool of worker threads
//! observes each working copy into a [`RepoRecord`]. Workers block on git
//! subprocesses only; metadata writes are serialized through the shared
//! [`MetaStore`]. The first observation error aborts the phase: workers
//! drain the remaining jobs without touching git and their results are
//! discarded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use anyhow::Result;
use tracing::{debug, warn};

use bb_git::GitInvoker;
use bb_state::MetaStore;
use bb_types::{Catalog, Config, Reason, RepoRecord};

use crate::clock::Clock;
use crate::discover::{DiscoveredRepo, discover_repos};
use crate::policy;
use crate::syncable::{self, SyncVerdictPolicy};

/// Per-invocation observation knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObserveOptions {
    /// Suppress every mutating git operation.
    pub dry_run: bool,
    /// Operator asked for pushes regardless of auto-push policy.
    pub push_requested: bool,
}

/// Result of the observation phase.
#[derive(Debug, Default)]
pub struct ObserveOutcome {
    /// Records ordered by `(repo_key, path)`.
    pub records: Vec<RepoRecord>,
    /// Repo-keys whose record went from unsyncable to syncable this scan.
    pub transitioned: BTreeSet<String>,
}

/// Index of the previous snapshot's records, for the `observed_at`
/// advancement rule and transition detection.
pub fn index_previous(records: &[RepoRecord]) -> HashMap<(String, PathBuf), RepoRecord> {
    records
        .iter()
        .map(|r| ((r.repo_key.clone(), r.path.clone()), r.clone()))
        .collect()
}

enum WorkerMsg {
    Done(usize, Box<RepoRecord>),
    Failed(anyhow::Error),
    Drained,
}

/// Observe every repository in the selected catalogs.
pub fn observe_phase(
    git: &dyn GitInvoker,
    metas: &MetaStore,
    config: &Config,
    clock: &Clock,
    selected: &[Catalog],
    prev: &HashMap<(String, PathBuf), RepoRecord>,
    opts: ObserveOptions,
) -> Result<ObserveOutcome> {
    let discovered = discover_repos(selected)?;
    observe_discovered(git, metas, config, clock, &discovered, prev, opts)
}

/// Observation over an explicit work list (exposed for reconcile, which
/// re-observes single repositories).
pub fn observe_discovered(
    git: &dyn GitInvoker,
    metas: &MetaStore,
    config: &Config,
    clock: &Clock,
    discovered: &[DiscoveredRepo],
    prev: &HashMap<(String, PathBuf), RepoRecord>,
    opts: ObserveOptions,
) -> Result<ObserveOutcome> {
    let count = discovered.len();
    if count == 0 {
        return Ok(ObserveOutcome::default());
    }

    let workers = thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
        .min(count)
        .max(1);

    let (job_tx, job_rx) = mpsc::channel::<usize>();
    let job_rx = Mutex::new(job_rx);
    let (result_tx, result_rx) = mpsc::channel::<WorkerMsg>();
    let abort = AtomicBool::new(false);

    let mut slots: Vec<Option<RepoRecord>> = Vec::new();
    slots.resize_with(count, || None);
    let mut first_error: Option<anyhow::Error> = None;

    thread::scope(|scope| {
        for _ in 0..workers {
            let result_tx = result_tx.clone();
            let job_rx = &job_rx;
            let abort = &abort;
            scope.spawn(move || {
                loop {
                    let index = {
                        let rx = job_rx.lock().expect("job channel poisoned");
                        match rx.recv() {
                            Ok(index) => index,
                            Err(_) => break,
                        }
                    };
                    if abort.load(Ordering::Relaxed) {
                        let _ = result_tx.send(WorkerMsg::Drained);
                        continue;
                    }
                    match observe_one(git, metas, config, &discovered[index], opts) {
                        Ok(record) => {
                            let _ = result_tx.send(WorkerMsg::Done(index, Box::new(record)));
                        }
                        Err(err) => {
                            abort.store(true, Ordering::Relaxed);
                            let _ = result_tx.send(WorkerMsg::Failed(err));
                        }
                    }
                }
            });
        }

        for index in 0..count {
            let _ = job_tx.send(index);
        }
        drop(job_tx);
        drop(result_tx);

        for msg in result_rx.iter() {
            match msg {
                WorkerMsg::Done(index, record) => slots[index] = Some(*record),
                WorkerMsg::Failed(err) if first_error.is_none() => first_error = Some(err),
                WorkerMsg::Failed(_) | WorkerMsg::Drained => {}
            }
        }
    });

    if let Some(err) = first_error {
        return Err(err);
    }

    let mut records: Vec<RepoRecord> = slots.into_iter().flatten().collect();

    // Colliding repo-keys within one snapshot poison every colliding record.
    let mut key_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &records {
        *key_counts.entry(record.repo_key.as_str()).or_default() += 1;
    }
    let duplicates: BTreeSet<String> = key_counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(k, _)| k.to_string())
        .collect();
    let now = clock.now();
    let mut transitioned = BTreeSet::new();
    for record in &mut records {
        if duplicates.contains(&record.repo_key) {
            record.mark_unsyncable(Reason::DuplicateLocalRepoKey);
        }
        let prior = prev.get(&(record.repo_key.clone(), record.path.clone()));
        record.seal(prior, now);
        if let Some(prior) = prior {
            if !prior.syncable && record.syncable {
                transitioned.insert(record.repo_key.clone());
            }
        }
    }

    records.sort_by(|a, b| (a.repo_key.as_str(), &a.path).cmp(&(b.repo_key.as_str(), &b.path)));
    Ok(ObserveOutcome {
        records,
        transitioned,
    })
}

/// Observe a single working copy. Git reads are best-effort: a failed read
/// leaves the zero value in place and the field is treated as unknown.
/// Only state-store failures abort the phase.
pub fn observe_one(
    git: &dyn GitInvoker,
    metas: &MetaStore,
    config: &Config,
    discovered: &DiscoveredRepo,
    opts: ObserveOptions,
) -> Result<RepoRecord> {
    let path = discovered.path.as_path();
    let mut record = RepoRecord {
        repo_key: discovered.repo_key.clone(),
        name: discovered.name.clone(),
        catalog: discovered.catalog.name.clone(),
        path: discovered.path.clone(),
        ..RepoRecord::default()
    };

    let preferred = metas
        .load(&record.repo_key)?
        .map(|m| m.preferred_remote)
        .unwrap_or_else(|| "origin".to_string());

    record.origin_url = read_or_default(git.repo_origin(path, &preferred), path, "origin");

    // New metadata starts with unknown visibility; seed auto-push from
    // the private default, the conservative choice.
    let default_auto_push = config.sync.default_auto_push_private;
    let meta = metas.ensure(
        &record.repo_key,
        &record.name,
        &record.origin_url,
        default_auto_push,
    )?;
    let remote = meta.preferred_remote.clone();

    record.branch = read_or_default(git.current_branch(path), path, "branch");
    record.head_sha = read_or_default(git.head_sha(path), path, "head");
    record.upstream = read_or_default(git.upstream(path), path, "upstream");
    record.remote_head_sha =
        read_or_default(git.remote_head_sha(path, &remote), path, "remote head");
    let (ahead, behind, diverged) =
        read_or_default(git.ahead_behind(path), path, "ahead/behind");
    record.ahead = ahead;
    record.behind = behind;
    record.diverged = diverged;
    let (dirty_tracked, untracked) = read_or_default(git.dirty(path), path, "dirty");
    record.has_dirty_tracked = dirty_tracked;
    record.has_untracked = untracked;
    record.operation_in_progress =
        read_or_default(git.operation_in_progress(path), path, "operation");

    let default_branch = match git.default_branch(path, &remote) {
        Ok(branch) => branch,
        Err(_) => "main".to_string(),
    };
    let auto_push = policy::auto_push_effective(meta.auto_push, &record.branch, &default_branch);
    let verdict_policy = SyncVerdictPolicy {
        include_untracked_as_dirty: config.sync.include_untracked_as_dirty,
        auto_push_effective: auto_push,
        allow_push: opts.push_requested,
    };

    let mut action_failures: Vec<Reason> = Vec::new();
    if !opts.dry_run {
        local_sync_actions(
            git,
            config,
            &mut record,
            &remote,
            auto_push || opts.push_requested,
            &mut action_failures,
        );
    }

    syncable::apply(&mut record, verdict_policy);
    for failure in action_failures {
        record.mark_unsyncable(failure);
    }
    Ok(record)
}

/// Fetch-prune, fast-forward when behind-only, push when ahead and
/// allowed. Each failure downgrades the record; none aborts the phase.
fn local_sync_actions(
    git: &dyn GitInvoker,
    config: &Config,
    record: &mut RepoRecord,
    remote: &str,
    push_allowed: bool,
    failures: &mut Vec<Reason>,
) {
    use bb_types::OperationKind;

    if record.origin_url.is_empty()
        || record.has_dirty_tracked
        || record.operation_in_progress != OperationKind::None
    {
        return;
    }
    let path = record.path.clone();

    if config.sync.fetch_prune {
        if let Err(err) = git.fetch_prune(&path, remote) {
            debug!(path = %path.display(), %err, "fetch --prune failed");
        }
        refresh_counts(git, record, remote);
    }

    if record.behind > 0 && record.ahead == 0 && !record.diverged {
        match git.pull_ff_only(&path) {
            Ok(()) => {
                record.head_sha = read_or_default(git.head_sha(&path), &path, "head");
                refresh_counts(git, record, remote);
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "fast-forward pull failed");
                failures.push(Reason::PullFailed);
            }
        }
    }

    if push_allowed && !record.diverged {
        if record.upstream.is_empty() && !record.head_sha.is_empty() && !record.branch.is_empty() {
            match git.push_upstream(&path, remote, &record.branch) {
                Ok(()) => {
                    record.upstream = read_or_default(git.upstream(&path), &path, "upstream");
                    refresh_counts(git, record, remote);
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "push --set-upstream failed");
                    failures.push(Reason::PushFailed);
                }
            }
        } else if record.ahead > 0 {
            match git.push(&path, remote) {
                Ok(()) => refresh_counts(git, record, remote),
                Err(err) => {
                    warn!(path = %path.display(), %err, "push failed");
                    failures.push(Reason::PushFailed);
                }
            }
        }
    }
}

fn refresh_counts(git: &dyn GitInvoker, record: &mut RepoRecord, remote: &str) {
    let path = record.path.clone();
    let (ahead, behind, diverged) =
        read_or_default(git.ahead_behind(&path), &path, "ahead/behind");
    record.ahead = ahead;
    record.behind = behind;
    record.diverged = diverged;
    record.remote_head_sha =
        read_or_default(git.remote_head_sha(&path, remote), &path, "remote head");
}

fn read_or_default<T: Default>(
    result: bb_git::Result<T>,
    path: &std::path::Path,
    what: &str,
) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            debug!(path = %path.display(), %err, "best-effort {what} read failed");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use bb_state::StateStore;
    use bb_types::{OperationKind, Visibility};
    use tempfile::tempdir;

    use super::*;

    /// Canned git results keyed by path, with in-flight accounting for the
    /// concurrency tests.
    #[derive(Default)]
    struct FakeGit {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        hold: Option<Duration>,
        target_parallel: usize,
    }

    impl FakeGit {
        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(hold) = self.hold {
                // Wait until the expected number of peers is in flight,
                // bounded so a serial pool fails the assertion instead of
                // hanging the suite.
                let deadline = Instant::now() + hold;
                while self.in_flight.load(Ordering::SeqCst) < self.target_parallel
                    && Instant::now() < deadline
                {
                    thread::sleep(Duration::from_millis(2));
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl GitInvoker for FakeGit {
        fn is_git_repo(&self, _path: &std::path::Path) -> bool {
            true
        }
        fn init_repo(&self, _path: &std::path::Path) -> bb_git::Result<()> {
            Ok(())
        }
        fn add_origin(&self, _path: &std::path::Path, _url: &str) -> bb_git::Result<()> {
            Ok(())
        }
        fn repo_origin(&self, _path: &std::path::Path, _remote: &str) -> bb_git::Result<String> {
            self.enter();
            Ok("git@github.com:o/r.git".to_string())
        }
        fn current_branch(&self, _path: &std::path::Path) -> bb_git::Result<String> {
            Ok("main".to_string())
        }
        fn head_sha(&self, _path: &std::path::Path) -> bb_git::Result<String> {
            Ok("abc123".to_string())
        }
        fn upstream(&self, _path: &std::path::Path) -> bb_git::Result<String> {
            Ok("origin/main".to_string())
        }
        fn remote_head_sha(
            &self,
            _path: &std::path::Path,
            _remote: &str,
        ) -> bb_git::Result<String> {
            Ok("abc123".to_string())
        }
        fn ahead_behind(&self, _path: &std::path::Path) -> bb_git::Result<(u32, u32, bool)> {
            Ok((0, 0, false))
        }
        fn dirty(&self, _path: &std::path::Path) -> bb_git::Result<(bool, bool)> {
            Ok((false, false))
        }
        fn operation_in_progress(
            &self,
            _path: &std::path::Path,
        ) -> bb_git::Result<OperationKind> {
            Ok(OperationKind::None)
        }
        fn default_branch(&self, _path: &std::path::Path, _remote: &str) -> bb_git::Result<String> {
            Ok("main".to_string())
        }
        fn fetch_prune(&self, _path: &std::path::Path, _remote: &str) -> bb_git::Result<()> {
            Ok(())
        }
        fn pull_ff_only(&self, _path: &std::path::Path) -> bb_git::Result<()> {
            Ok(())
        }
        fn push(&self, _path: &std::path::Path, _remote: &str) -> bb_git::Result<()> {
            Ok(())
        }
        fn push_upstream(
            &self,
            _path: &std::path::Path,
            _remote: &str,
            _branch: &str,
        ) -> bb_git::Result<()> {
            Ok(())
        }
        fn checkout(&self, _path: &std::path::Path, _branch: &str) -> bb_git::Result<()> {
            Ok(())
        }
        fn ensure_branch(
            &self,
            _path: &std::path::Path,
            _branch: &str,
            _remote: &str,
        ) -> bb_git::Result<()> {
            Ok(())
        }
        fn clone_repo(
            &self,
            _origin: &str,
            _path: &std::path::Path,
            _options: &bb_git::CloneOptions,
        ) -> bb_git::Result<()> {
            Ok(())
        }
    }

    fn discovered(catalog: &Catalog, name: &str) -> DiscoveredRepo {
        DiscoveredRepo {
            catalog: catalog.clone(),
            path: catalog.root.join(name),
            name: name.to_string(),
            repo_key: format!("{}/{name}", catalog.name),
        }
    }

    fn meta_store(td: &tempfile::TempDir) -> MetaStore {
        let store = StateStore::new(td.path().join("state"));
        store.ensure_layout().expect("layout");
        MetaStore::new(store)
    }

    #[test]
    fn observe_clean_repo_produces_syncable_record() {
        let td = tempdir().expect("tempdir");
        let metas = meta_store(&td);
        let config = Config::new();
        let catalog = Catalog::new("software", td.path().join("software"));
        let git = FakeGit::default();

        let outcome = observe_discovered(
            &git,
            &metas,
            &config,
            &Clock::system(),
            &[discovered(&catalog, "widget")],
            &HashMap::new(),
            ObserveOptions::default(),
        )
        .expect("observe");

        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert!(record.syncable, "reasons: {:?}", record.unsyncable_reasons);
        assert_eq!(record.repo_key, "software/widget");
        assert!(!record.state_hash.is_empty());

        // Metadata was created lazily with unknown visibility.
        let meta = metas
            .load("software/widget")
            .expect("load")
            .expect("created");
        assert_eq!(meta.visibility, Visibility::Unknown);
        assert_eq!(meta.origin_url, "git@github.com:o/r.git");
    }

    #[test]
    fn unchanged_repo_keeps_observed_at() {
        let td = tempdir().expect("tempdir");
        let metas = meta_store(&td);
        let config = Config::new();
        let catalog = Catalog::new("software", td.path().join("software"));
        let git = FakeGit::default();
        let work = [discovered(&catalog, "widget")];

        let early = chrono::Utc::now() - chrono::Duration::hours(2);
        let first = observe_discovered(
            &git,
            &metas,
            &config,
            &Clock::fixed(early),
            &work,
            &HashMap::new(),
            ObserveOptions::default(),
        )
        .expect("first");

        let prev = index_previous(&first.records);
        let second = observe_discovered(
            &git,
            &metas,
            &config,
            &Clock::system(),
            &work,
            &prev,
            ObserveOptions::default(),
        )
        .expect("second");

        assert_eq!(second.records[0].state_hash, first.records[0].state_hash);
        assert_eq!(second.records[0].observed_at, early);
        assert!(second.transitioned.is_empty());
    }

    #[test]
    fn transition_to_syncable_is_reported() {
        let td = tempdir().expect("tempdir");
        let metas = meta_store(&td);
        let config = Config::new();
        let catalog = Catalog::new("software", td.path().join("software"));
        let git = FakeGit::default();
        let work = [discovered(&catalog, "widget")];

        let mut prior = RepoRecord {
            repo_key: "software/widget".to_string(),
            name: "widget".to_string(),
            catalog: "software".to_string(),
            path: catalog.root.join("widget"),
            ..RepoRecord::default()
        };
        prior.mark_unsyncable(Reason::DirtyTracked);
        prior.seal(None, chrono::Utc::now());

        let outcome = observe_discovered(
            &git,
            &metas,
            &config,
            &Clock::system(),
            &work,
            &index_previous(&[prior]),
            ObserveOptions::default(),
        )
        .expect("observe");

        assert!(outcome.records[0].syncable);
        assert!(outcome.transitioned.contains("software/widget"));
    }

    #[test]
    fn duplicate_repo_keys_poison_both_records() {
        let td = tempdir().expect("tempdir");
        let metas = meta_store(&td);
        let config = Config::new();
        let catalog = Catalog::new("software", td.path().join("software"));
        let git = FakeGit::default();

        let mut a = discovered(&catalog, "widget");
        a.path = catalog.root.join("widget");
        let mut b = discovered(&catalog, "widget");
        b.path = catalog.root.join("widget-copy");

        let outcome = observe_discovered(
            &git,
            &metas,
            &config,
            &Clock::system(),
            &[a, b],
            &HashMap::new(),
            ObserveOptions::default(),
        )
        .expect("observe");

        assert_eq!(outcome.records.len(), 2);
        for record in &outcome.records {
            assert!(!record.syncable);
            assert!(
                record
                    .unsyncable_reasons
                    .contains(&Reason::DuplicateLocalRepoKey)
            );
        }
    }

    #[test]
    fn worker_pool_observes_in_parallel() {
        let parallelism = thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
        if parallelism < 2 {
            return;
        }

        let td = tempdir().expect("tempdir");
        let metas = meta_store(&td);
        let config = Config::new();
        let catalog = Catalog::new("software", td.path().join("software"));
        let git = FakeGit {
            hold: Some(Duration::from_secs(2)),
            target_parallel: 2,
            ..FakeGit::default()
        };

        let work = [discovered(&catalog, "alpha"), discovered(&catalog, "beta")];
        observe_discovered(
            &git,
            &metas,
            &config,
            &Clock::system(),
            &work,
            &HashMap::new(),
            ObserveOptions::default(),
        )
        .expect("observe");

        assert!(
            git.max_in_flight.load(Ordering::SeqCst) >= 2,
            "observations did not overlap"
        );
    }

    #[test]
    fn records_are_ordered_by_key_then_path() {
        let td = tempdir().expect("tempdir");
        let metas = meta_store(&td);
        let config = Config::new();
        let catalog = Catalog::new("software", td.path().join("software"));
        let git = FakeGit::default();

        let work = [
            discovered(&catalog, "zeta"),
            discovered(&catalog, "alpha"),
            discovered(&catalog, "mid"),
        ];
        let outcome = observe_discovered(
            &git,
            &metas,
            &config,
            &Clock::system(),
            &work,
            &HashMap::new(),
            ObserveOptions::default(),
        )
        .expect("observe");

        let keys: Vec<&str> = outcome.records.iter().map(|r| r.repo_key.as_str()).collect();
        assert_eq!(keys, vec!["software/alpha", "software/mid", "software/zeta"]);
    }
}
