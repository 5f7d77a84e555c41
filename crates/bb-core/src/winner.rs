//! Winner selection: among all machines' records for one repo-key, pick
//! the record that drives everyone else.

use std::cmp::Ordering;

use bb_types::{MachineSnapshot, RepoRecord};

/// One machine's syncable record for a repo-key.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub machine_id: &'a str,
    pub record: &'a RepoRecord,
}

/// All syncable candidates for `repo_key` across the fleet.
pub fn candidates<'a>(fleet: &'a [MachineSnapshot], repo_key: &str) -> Vec<Candidate<'a>> {
    let mut out = Vec::new();
    for snapshot in fleet {
        for record in &snapshot.repos {
            if record.repo_key == repo_key && record.syncable {
                out.push(Candidate {
                    machine_id: &snapshot.machine_id,
                    record,
                });
            }
        }
    }
    out
}

/// Strict lexicographic selection order:
///
/// 1. non-empty upstream beats empty;
/// 2. remote-aligned (`ahead == 0 && behind == 0`) beats unaligned, then
///    higher non-negative `ahead - behind` progress;
/// 3. most recent `observed_at`;
/// 4. lexicographically smallest `machine_id`.
///
/// Deterministic for a given input set regardless of enumeration order.
pub fn select_winner<'a>(fleet: &'a [MachineSnapshot], repo_key: &str) -> Option<Candidate<'a>> {
    let mut pool = candidates(fleet, repo_key);
    pool.sort_by(compare);
    pool.into_iter().next()
}

/// Winner among candidates excluding one machine, for the local-vs-remote
/// nudge.
pub fn select_winner_excluding<'a>(
    fleet: &'a [MachineSnapshot],
    repo_key: &str,
    excluded_machine: &str,
) -> Option<Candidate<'a>> {
    let mut pool: Vec<Candidate<'a>> = candidates(fleet, repo_key)
        .into_iter()
        .filter(|c| c.machine_id != excluded_machine)
        .collect();
    pool.sort_by(compare);
    pool.into_iter().next()
}

fn progress(record: &RepoRecord) -> i64 {
    (i64::from(record.ahead) - i64::from(record.behind)).max(0)
}

fn compare(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    let a_upstream = !a.record.upstream.is_empty();
    let b_upstream = !b.record.upstream.is_empty();
    b_upstream
        .cmp(&a_upstream)
        .then_with(|| {
            let a_aligned = a.record.ahead == 0 && a.record.behind == 0;
            let b_aligned = b.record.ahead == 0 && b.record.behind == 0;
            b_aligned.cmp(&a_aligned)
        })
        .then_with(|| progress(b.record).cmp(&progress(a.record)))
        .then_with(|| b.record.observed_at.cmp(&a.record.observed_at))
        .then_with(|| a.machine_id.cmp(b.machine_id))
}
