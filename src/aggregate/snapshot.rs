use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{AggregateId, AggregateVersion};
use crate::error::Error;

/// Materialized aggregate state at a given version.
///
/// Restoring a snapshot and replaying the events after `version` yields the
/// same state as replaying the whole stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: AggregateVersion,
    state: serde_json::Value,
}

impl Snapshot {
    pub(crate) fn capture<A: Serialize>(
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        version: AggregateVersion,
        state: &A,
    ) -> Result<Self, Error> {
        let state = serde_json::to_value(state).map_err(|source| Error::Serialization {
            event_type: format!("{aggregate_type}-snapshot"),
            source,
        })?;
        Ok(Self {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: aggregate_type.to_string(),
            version,
            state,
        })
    }

    pub fn state<A: DeserializeOwned>(&self) -> Result<A, Error> {
        serde_json::from_value(self.state.clone()).map_err(|source| Error::Deserialization {
            event_type: format!("{}-snapshot", self.aggregate_type),
            source,
        })
    }
}

/// When a store takes a snapshot after a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    #[default]
    Never,
    /// Whenever a save moves the stream across a multiple of `n` events.
    Every(u64),
}

impl SnapshotPolicy {
    /// Whether moving the stream from `before` to `after` calls for a
    /// snapshot.
    pub fn should_snapshot(&self, before: AggregateVersion, after: AggregateVersion) -> bool {
        match *self {
            SnapshotPolicy::Never => false,
            SnapshotPolicy::Every(0) => false,
            SnapshotPolicy::Every(n) => {
                // Versions are zero-based, so version v means v + 1 events.
                let count = |v: AggregateVersion| v.revision().map_or(0, |r| r + 1);
                count(after) / n > count(before) / n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_policy_never_snapshots() {
        assert!(!SnapshotPolicy::Never.should_snapshot(
            AggregateVersion::NEW,
            AggregateVersion::new(1000)
        ));
        assert!(!SnapshotPolicy::Every(0).should_snapshot(
            AggregateVersion::NEW,
            AggregateVersion::new(10)
        ));
    }

    #[test]
    fn every_policy_snapshots_when_crossing_a_multiple() {
        let policy = SnapshotPolicy::Every(3);
        // 0 -> 2 events
        assert!(!policy.should_snapshot(AggregateVersion::NEW, AggregateVersion::new(1)));
        // 2 -> 3 events
        assert!(policy.should_snapshot(AggregateVersion::new(1), AggregateVersion::new(2)));
        // 3 -> 5 events
        assert!(!policy.should_snapshot(AggregateVersion::new(2), AggregateVersion::new(4)));
        // 5 -> 7 events, crossing 6 inside one batch
        assert!(policy.should_snapshot(AggregateVersion::new(4), AggregateVersion::new(6)));
    }
}
