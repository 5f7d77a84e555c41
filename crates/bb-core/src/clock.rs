//! Clock abstraction, overridable for fixtures via `BB_NOW`.

use chrono::{DateTime, Utc};

pub const NOW_ENV: &str = "BB_NOW";

/// Source of "now" for everything the engine timestamps.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    fixed: Option<DateTime<Utc>>,
}

impl Clock {
    /// System clock, unless `BB_NOW` carries an RFC3339 override.
    pub fn system() -> Self {
        let fixed = std::env::var(NOW_ENV)
            .ok()
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc));
        Self { fixed }
    }

    /// A clock pinned to one instant.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self { fixed: Some(at) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.fixed.unwrap_or_else(Utc::now)
    }
}
