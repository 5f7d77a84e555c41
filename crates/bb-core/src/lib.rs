//! Core convergence engine for bb.
//!
//! On each host, bb discovers git working copies under catalog roots,
//! observes them into structured records with a syncability verdict,
//! publishes the machine snapshot into a shared state directory, and uses
//! the fleet of snapshots plus per-repo metadata to converge local state
//! toward a per-repository winner.
//!
//! The pipeline is strictly sequential per invocation and holds the global
//! state lock for its entire body:
//!
//! ```text
//! lock -> observe -> publish -> load fleet -> reconcile -> publish -> notify
//! ```
//!
//! Only repository observation is parallel; everything else runs on the
//! invoking thread. See [`engine::sync`] for the entry point.

pub mod clock;
pub mod discover;
pub mod doctor;
pub mod engine;
pub mod machine;
pub mod moves;
pub mod notify;
pub mod observe;
pub mod policy;
pub mod reconcile;
pub mod remote;
pub mod syncable;
pub mod winner;

pub use clock::Clock;
pub use engine::{SyncOptions, SyncOutcome, sync};
pub use observe::{ObserveOptions, ObserveOutcome};
