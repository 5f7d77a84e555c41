//! Syncability evaluation: a pure function from observed state and policy
//! to the set of unsyncable reasons.

use std::collections::BTreeSet;

use bb_types::{OperationKind, Reason, RepoRecord};

/// Policy inputs the evaluation depends on, resolved by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncVerdictPolicy {
    pub include_untracked_as_dirty: bool,
    /// Auto-push already resolved against the current and default branch.
    pub auto_push_effective: bool,
    /// Operator passed an explicit push request for this run.
    pub allow_push: bool,
}

/// Evaluate the rule table. Every matching row contributes its reason;
/// the record is syncable iff no row matched.
pub fn evaluate(record: &RepoRecord, policy: SyncVerdictPolicy) -> BTreeSet<Reason> {
    let mut reasons = BTreeSet::new();

    if record.origin_url.is_empty() {
        reasons.insert(Reason::NoOrigin);
    }
    if record.operation_in_progress != OperationKind::None {
        reasons.insert(Reason::OperationInProgress);
    }
    if record.has_dirty_tracked {
        reasons.insert(Reason::DirtyTracked);
    }
    if record.has_untracked && policy.include_untracked_as_dirty {
        reasons.insert(Reason::Untracked);
    }
    if record.upstream.is_empty() && !record.head_sha.is_empty() {
        reasons.insert(Reason::NoUpstream);
    }
    if record.diverged {
        reasons.insert(Reason::Diverged);
    }
    if record.ahead > 0 && !(policy.auto_push_effective || policy.allow_push) {
        reasons.insert(Reason::NeedsPush);
    }

    reasons
}

/// Apply the verdict onto the record.
pub fn apply(record: &mut RepoRecord, policy: SyncVerdictPolicy) {
    let reasons = evaluate(record, policy);
    record.syncable = reasons.is_empty();
    record.unsyncable_reasons = reasons;
}
