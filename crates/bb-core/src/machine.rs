//! Machine identity resolution.
//!
//! The state directory is shared between machines, so the machine id must
//! come from the host itself. Resolution order: an existing snapshot whose
//! recorded hostname matches this host, else the `BB_MACHINE_ID` fallback
//! (used when no id is persisted), else the sanitized hostname.

use bb_state::StateStore;
use tracing::debug;

pub const MACHINE_ID_ENV: &str = "BB_MACHINE_ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    pub machine_id: String,
    pub hostname: String,
}

/// Resolve who this machine is within the fleet.
pub fn resolve_machine_identity(store: &StateStore) -> bb_state::Result<MachineIdentity> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();

    for snapshot in store.list_machines()? {
        if snapshot.hostname == hostname {
            debug!(machine_id = %snapshot.machine_id, "reusing persisted machine id");
            return Ok(MachineIdentity {
                machine_id: snapshot.machine_id,
                hostname,
            });
        }
    }

    if let Ok(id) = std::env::var(MACHINE_ID_ENV) {
        if !id.trim().is_empty() {
            return Ok(MachineIdentity {
                machine_id: id.trim().to_string(),
                hostname,
            });
        }
    }

    Ok(MachineIdentity {
        machine_id: sanitize_id(&hostname),
        hostname,
    })
}

/// Lowercase, runs of non-alphanumerics collapsed to single dashes.
pub fn sanitize_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("machine");
    }
    out
}
