//! End-to-end convergence scenarios over real git repositories and a
//! shared state directory, with machines simulated via `BB_MACHINE_ID`.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serial_test::serial;
use tempfile::{TempDir, tempdir};

use bb_core::engine::{self, SyncOptions};
use bb_core::notify::LogSink;
use bb_core::observe::ObserveOptions;
use bb_core::reconcile::reconcile;
use bb_core::Clock;
use bb_git::SystemGit;
use bb_state::{MetaStore, StateStore};
use bb_types::{Catalog, MachineSnapshot, Reason, RepoMetadata};

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} in {} failed: {}",
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_work(dir: &Path) {
    fs::create_dir_all(dir).expect("mkdir");
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test User"]);
}

fn commit(dir: &Path, msg: &str) {
    git(dir, &["commit", "--allow-empty", "-m", msg]);
}

fn rev_parse(dir: &Path, reference: &str) -> String {
    let output = Command::new("git")
        .args(["rev-parse", reference])
        .current_dir(dir)
        .output()
        .expect("rev-parse");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A shared state dir plus a seeded bare remote with two commits on main.
struct Fixture {
    td: TempDir,
    store: StateStore,
    remote: PathBuf,
    seed: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let td = tempdir().expect("tempdir");
        let store = StateStore::new(td.path().join("state"));
        store.ensure_layout().expect("layout");

        let remote = td.path().join("remotes/x.git");
        fs::create_dir_all(&remote).expect("mkdir bare");
        git(&remote, &["init", "--bare", "-b", "main"]);

        let seed = td.path().join("seed");
        init_work(&seed);
        commit(&seed, "one");
        commit(&seed, "two");
        git(&seed, &["remote", "add", "origin", remote.to_str().expect("utf8")]);
        git(&seed, &["push", "-u", "origin", "main"]);

        Self {
            td,
            store,
            remote,
            seed,
        }
    }

    fn remote_url(&self) -> String {
        self.remote.to_string_lossy().into_owned()
    }

    /// Register a machine with one flat catalog rooted under its own tree.
    fn seed_machine(&self, id: &str, catalog: &str) -> PathBuf {
        let root = self.td.path().join(id).join(catalog);
        fs::create_dir_all(&root).expect("mkdir catalog");
        let mut snapshot = MachineSnapshot::new(id, format!("host-{id}"));
        snapshot.catalogs = vec![Catalog::new(catalog, &root)];
        self.store.store_machine(&snapshot).expect("seed snapshot");
        root
    }

    fn clone_into(&self, root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        git(
            root,
            &["clone", &self.remote_url(), path.to_str().expect("utf8")],
        );
        git(&path, &["config", "user.email", "test@example.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        path
    }

    fn sync_as(&self, machine_id: &str, opts: &SyncOptions) -> engine::SyncOutcome {
        temp_env::with_var("BB_MACHINE_ID", Some(machine_id), || {
            let invoker = SystemGit::default();
            engine::sync(&self.store, &invoker, &Clock::system(), &LogSink, opts)
                .expect("sync")
        })
    }
}

#[test]
#[serial]
fn fresh_clone_via_winner() {
    let fx = Fixture::new();
    let a_root = fx.seed_machine("machine-a", "software");
    let b_root = fx.seed_machine("machine-b", "software");
    fx.clone_into(&a_root, "x");

    let a = fx.sync_as("machine-a", &SyncOptions::default());
    assert_eq!(a.exit_code, 0);
    assert!(a.snapshot.repos[0].syncable);
    assert_eq!(a.snapshot.repos[0].branch, "main");

    let b = fx.sync_as("machine-b", &SyncOptions::default());
    assert_eq!(b.exit_code, 0);

    let cloned = b_root.join("x");
    assert!(cloned.join(".git").exists(), "clone should exist on B");

    let invoker = SystemGit::default();
    use bb_git::GitInvoker;
    let origin = invoker.repo_origin(&cloned, "origin").expect("origin");
    let expected = bb_identity::normalize_origin_identity(&fx.remote_url()).expect("expected");
    let actual = bb_identity::normalize_origin_identity(&origin).expect("actual");
    assert_eq!(actual, expected, "origin identity must match the fleet's");

    let record = b
        .snapshot
        .repos
        .iter()
        .find(|r| r.repo_key == "software/x")
        .expect("record for clone");
    assert!(record.syncable, "reasons: {:?}", record.unsyncable_reasons);
    assert_eq!(record.branch, "main");
    assert_eq!(record.ahead, 0);
    assert_eq!(record.behind, 0);
}

#[test]
#[serial]
fn behind_only_fast_forward() {
    let fx = Fixture::new();
    let b_root = fx.seed_machine("machine-b", "software");
    fx.clone_into(&b_root, "x");

    let mut config = fx.store.load_config().expect("config");
    config.sync.fetch_prune = true;
    fx.store.store_config(&config).expect("store config");

    let first = fx.sync_as("machine-b", &SyncOptions::default());
    let before = first.snapshot.repos[0].clone();
    assert!(before.syncable);

    // The fleet moves ahead.
    commit(&fx.seed, "three");
    commit(&fx.seed, "four");
    commit(&fx.seed, "five");
    git(&fx.seed, &["push", "origin", "main"]);

    let second = fx.sync_as("machine-b", &SyncOptions::default());
    let after = &second.snapshot.repos[0];
    assert_eq!(second.exit_code, 0);
    assert!(after.syncable);
    assert_eq!((after.ahead, after.behind), (0, 0));
    assert_eq!(after.head_sha, rev_parse(&fx.remote, "refs/heads/main"));
    assert_ne!(after.state_hash, before.state_hash);
    assert!(after.observed_at > before.observed_at);
}

#[test]
#[serial]
fn dirty_blocks_push() {
    let fx = Fixture::new();
    let a_root = fx.seed_machine("machine-a", "software");
    let work = fx.clone_into(&a_root, "x");

    // Work on a topic branch with an upstream.
    git(&work, &["checkout", "-b", "topic"]);
    fs::write(work.join("tracked.txt"), "v1").expect("write");
    git(&work, &["add", "tracked.txt"]);
    commit(&work, "add tracked");
    git(&work, &["push", "-u", "origin", "topic"]);

    // First sync creates the metadata; then opt the repo into auto-push.
    fx.sync_as("machine-a", &SyncOptions::default());
    let mut meta = fx
        .store
        .load_repo_meta("software/x")
        .expect("load meta")
        .expect("meta exists");
    meta.auto_push = bb_types::AutoPushMode::Enabled;
    fx.store.store_repo_meta(&meta).expect("store meta");

    // Ahead by two, with dirty tracked changes.
    commit(&work, "local one");
    commit(&work, "local two");
    fs::write(work.join("tracked.txt"), "v2").expect("modify");

    let remote_tip_before = rev_parse(&fx.remote, "refs/heads/topic");
    let outcome = fx.sync_as("machine-a", &SyncOptions::default());

    assert_eq!(outcome.exit_code, 1);
    let record = &outcome.snapshot.repos[0];
    assert!(!record.syncable);
    let reasons: Vec<Reason> = record.unsyncable_reasons.iter().copied().collect();
    assert_eq!(reasons, vec![Reason::DirtyTracked]);
    assert_eq!(
        rev_parse(&fx.remote, "refs/heads/topic"),
        remote_tip_before,
        "no push may happen while the tree is dirty"
    );
}

#[test]
#[serial]
fn auto_push_publishes_ahead_branch() {
    let fx = Fixture::new();
    let a_root = fx.seed_machine("machine-a", "software");
    let work = fx.clone_into(&a_root, "x");
    git(&work, &["checkout", "-b", "topic"]);
    git(&work, &["push", "-u", "origin", "topic"]);

    fx.sync_as("machine-a", &SyncOptions::default());
    let mut meta = fx
        .store
        .load_repo_meta("software/x")
        .expect("load meta")
        .expect("meta exists");
    meta.auto_push = bb_types::AutoPushMode::Enabled;
    fx.store.store_repo_meta(&meta).expect("store meta");

    commit(&work, "ahead");
    let outcome = fx.sync_as("machine-a", &SyncOptions::default());

    assert_eq!(outcome.exit_code, 0);
    let record = &outcome.snapshot.repos[0];
    assert!(record.syncable, "reasons: {:?}", record.unsyncable_reasons);
    assert_eq!(record.ahead, 0);
    assert_eq!(
        rev_parse(&fx.remote, "refs/heads/topic"),
        rev_parse(&work, "HEAD"),
        "auto-push must publish the ahead branch"
    );
}

#[test]
#[serial]
fn tombstone_guards_previous_repo_key() {
    let fx = Fixture::new();
    // Machine B hosts a stale copy under the repo's previous key.
    let b_root = fx.seed_machine("machine-b", "references");
    fx.clone_into(&b_root, "x");
    // Machine C maps only the repo's current catalog.
    let c_root = fx.seed_machine("machine-c", "software");

    let mut meta = RepoMetadata::new("software/x", "x");
    meta.origin_url = fx.remote_url();
    meta.previous_repo_keys = vec!["references/x".to_string()];
    fx.store.store_repo_meta(&meta).expect("seed meta");

    let b = fx.sync_as("machine-b", &SyncOptions::default());
    let stale = b
        .snapshot
        .repos
        .iter()
        .find(|r| r.repo_key == "references/x")
        .expect("stale record");
    assert!(stale.unsyncable_reasons.contains(&Reason::CatalogMismatch));
    assert!(stale.unsyncable_reasons.contains(&Reason::CatalogNotMapped));
    assert_eq!(stale.expected_repo_key.as_deref(), Some("software/x"));
    assert_eq!(stale.expected_catalog.as_deref(), Some("software"));

    let c = fx.sync_as("machine-c", &SyncOptions::default());
    // The tombstone keeps C from reacting to references/x: no clone, no
    // synthetic record for the old key.
    assert!(!c_root.join("x").exists(), "no clone for a tombstoned key");
    assert!(
        c.snapshot
            .repos
            .iter()
            .all(|r| r.repo_key != "references/x"),
        "tombstoned key must not appear on C"
    );
}

#[test]
#[serial]
fn path_conflict_synthesizes_non_repo_record() {
    let fx = Fixture::new();
    let a_root = fx.seed_machine("machine-a", "software");
    let b_root = fx.seed_machine("machine-b", "software");
    fx.clone_into(&a_root, "x");

    // B's target path is occupied by a non-repo directory.
    let occupied = b_root.join("x");
    fs::create_dir_all(&occupied).expect("mkdir");
    fs::write(occupied.join("notes.txt"), "precious").expect("write");

    fx.sync_as("machine-a", &SyncOptions::default());
    let b = fx.sync_as("machine-b", &SyncOptions::default());

    let record = b
        .snapshot
        .repos
        .iter()
        .find(|r| r.repo_key == "software/x")
        .expect("synthetic record");
    assert!(record.unsyncable_reasons.contains(&Reason::TargetPathNonRepo));
    assert_eq!(b.exit_code, 1);

    // No filesystem mutation happened.
    assert!(occupied.join("notes.txt").exists());
    assert!(!occupied.join(".git").exists());
}

#[test]
#[serial]
fn origin_equivalence_across_url_forms() {
    let td = tempdir().expect("tempdir");
    let store = StateStore::new(td.path().join("state"));
    store.ensure_layout().expect("layout");
    let config = bb_types::Config::new();
    let metas_store = MetaStore::new(store.clone());
    let clock = Clock::system();
    let invoker = SystemGit::default();

    let root = td.path().join("software");
    let target = root.join("r");
    init_work(&target);
    commit(&target, "one");
    git(&target, &["remote", "add", "origin", "git@github.com:o/r.git"]);

    let catalog = Catalog::new("software", &root);
    let mut machine = MachineSnapshot::new("m1", "h1");
    machine.catalogs = vec![catalog.clone()];

    let mut meta = RepoMetadata::new("software/r", "r");
    meta.origin_url = "https://github.com/o/r".to_string();

    // The ssh and https spellings are the same upstream: no conflict
    // record may be synthesized.
    reconcile(
        &invoker,
        &metas_store,
        &config,
        &clock,
        &mut machine,
        &[],
        &[meta.clone()],
        &[catalog.clone()],
        &BTreeSet::new(),
        &HashMap::new(),
        ObserveOptions::default(),
    )
    .expect("reconcile");
    assert!(machine.repos.is_empty());

    // A genuinely different upstream is flagged.
    meta.origin_url = "https://github.com/other/r".to_string();
    reconcile(
        &invoker,
        &metas_store,
        &config,
        &clock,
        &mut machine,
        &[],
        &[meta],
        &[catalog],
        &BTreeSet::new(),
        &HashMap::new(),
        ObserveOptions::default(),
    )
    .expect("reconcile");
    assert_eq!(machine.repos.len(), 1);
    assert!(
        machine.repos[0]
            .unsyncable_reasons
            .contains(&Reason::TargetPathRepoMismatch)
    );
}

#[test]
#[serial]
fn second_run_is_idempotent() {
    let fx = Fixture::new();
    let a_root = fx.seed_machine("machine-a", "software");
    fx.clone_into(&a_root, "x");

    let first = fx.sync_as("machine-a", &SyncOptions::default());
    let meta_path = fx.store.repo_meta_path("software/x");
    let mtime_before = fs::metadata(&meta_path)
        .expect("meta file")
        .modified()
        .expect("mtime");
    let record_before = first.snapshot.repos[0].clone();

    std::thread::sleep(std::time::Duration::from_millis(20));
    let second = fx.sync_as("machine-a", &SyncOptions::default());

    assert_eq!(second.exit_code, first.exit_code);
    let mtime_after = fs::metadata(&meta_path)
        .expect("meta file")
        .modified()
        .expect("mtime");
    assert_eq!(
        mtime_before, mtime_after,
        "unchanged metadata must not be rewritten"
    );

    let record_after = &second.snapshot.repos[0];
    assert_eq!(record_after.state_hash, record_before.state_hash);
    assert_eq!(record_after.observed_at, record_before.observed_at);
}

#[test]
#[serial]
fn cleaned_up_repo_adopts_fleet_branch() {
    let fx = Fixture::new();
    let a_root = fx.seed_machine("machine-a", "software");
    let b_root = fx.seed_machine("machine-b", "software");

    // A works on a feature branch, pushed and clean.
    let a_work = fx.clone_into(&a_root, "x");
    git(&a_work, &["checkout", "-b", "feature"]);
    commit(&a_work, "feature work");
    git(&a_work, &["push", "-u", "origin", "feature"]);

    // B is on main with a dirty tracked file.
    let b_work = fx.clone_into(&b_root, "x");
    fs::write(b_work.join("tracked.txt"), "v1").expect("write");
    git(&b_work, &["add", "tracked.txt"]);
    commit(&b_work, "add tracked");
    git(&b_work, &["push", "origin", "main"]);
    fs::write(b_work.join("tracked.txt"), "dirty").expect("dirty");

    fx.sync_as("machine-a", &SyncOptions::default());
    let dirty_run = fx.sync_as("machine-b", &SyncOptions::default());
    assert_eq!(dirty_run.exit_code, 1);

    // Clean up and sync again: the record transitions to syncable and
    // defers to the fleet's branch choice.
    git(&b_work, &["checkout", "--", "tracked.txt"]);
    let clean_run = fx.sync_as("machine-b", &SyncOptions::default());

    let record = clean_run
        .snapshot
        .repos
        .iter()
        .find(|r| r.repo_key == "software/x")
        .expect("record");
    assert_eq!(record.branch, "feature", "B should adopt the fleet branch");
    assert!(record.syncable, "reasons: {:?}", record.unsyncable_reasons);
}

#[test]
#[serial]
fn selecting_foreign_catalog_names_other_machines() {
    let fx = Fixture::new();
    fx.seed_machine("machine-a", "software");
    fx.seed_machine("machine-b", "references");

    let err = temp_env::with_var("BB_MACHINE_ID", Some("machine-b"), || {
        let invoker = SystemGit::default();
        let opts = SyncOptions {
            include: vec!["software".to_string()],
            ..SyncOptions::default()
        };
        engine::sync(&fx.store, &invoker, &Clock::system(), &LogSink, &opts)
            .expect_err("selection must fail")
    });
    assert!(err.to_string().contains("known on other machines"));
}
