//! Conflict decision function
//!
//! Maps what changed since the last reconciliation onto one of five
//! actions. Exact mtime ties go to the server: its timestamp only moves on
//! committed writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of reconciling one asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncAction {
    UpToDate,
    Push,
    Pull,
    /// Local edit is newer than the concurrent server change; needs an explicit push
    ConflictPush,
    /// Local edit is stale; server content overwrites it
    ConflictPull,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::UpToDate => "up-to-date",
            SyncAction::Push => "push",
            SyncAction::Pull => "pull",
            SyncAction::ConflictPush => "conflict-push",
            SyncAction::ConflictPull => "conflict-pull",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncAction::ConflictPush | SyncAction::ConflictPull)
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn decide(
    local_changed: bool,
    server_changed: bool,
    local_mtime: DateTime<Utc>,
    server_mtime: DateTime<Utc>,
) -> SyncAction {
    match (local_changed, server_changed) {
        (false, false) => SyncAction::UpToDate,
        (true, false) => SyncAction::Push,
        (false, true) => SyncAction::Pull,
        (true, true) if local_mtime > server_mtime => SyncAction::ConflictPush,
        (true, true) => SyncAction::ConflictPull,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_truth_table() {
        let t = at(1_700_000_000);
        assert_eq!(decide(false, false, t, t), SyncAction::UpToDate);
        assert_eq!(decide(true, false, t, t), SyncAction::Push);
        assert_eq!(decide(false, true, t, t), SyncAction::Pull);
        assert_eq!(
            decide(true, true, t + Duration::seconds(1), t),
            SyncAction::ConflictPush
        );
        assert_eq!(
            decide(true, true, t - Duration::seconds(1), t),
            SyncAction::ConflictPull
        );
    }

    #[test]
    fn test_tie_goes_to_server() {
        let t = at(1_700_000_000);
        assert_eq!(decide(true, true, t, t), SyncAction::ConflictPull);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&SyncAction::ConflictPush).unwrap(),
            "\"conflict-push\""
        );
        assert_eq!(SyncAction::UpToDate.to_string(), "up-to-date");
    }

    proptest! {
        #[test]
        fn prop_matches_table(
            local_changed in any::<bool>(),
            server_changed in any::<bool>(),
            local in 0i64..4_000_000_000,
            server in 0i64..4_000_000_000,
        ) {
            let action = decide(local_changed, server_changed, at(local), at(server));
            let expected = match (local_changed, server_changed) {
                (false, false) => SyncAction::UpToDate,
                (true, false) => SyncAction::Push,
                (false, true) => SyncAction::Pull,
                (true, true) if local > server => SyncAction::ConflictPush,
                (true, true) => SyncAction::ConflictPull,
            };
            prop_assert_eq!(action, expected);
        }
    }
}
