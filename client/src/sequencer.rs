use std::collections::HashMap;

use widgetsync_shared::{ChangeRecord, ModelId, SequenceNumber, StateMap};

/// Outcome of comparing a remotely observed record against the locally
/// tracked one.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteVerdict {
    /// The remote record is newer (or carries no sequence number at all);
    /// apply it.
    Apply,
    /// Echo or lagging duplicate of a write this engine already knows.
    /// When the remote number is *strictly* behind, `republish` carries a
    /// freshly stamped copy of the tracked record that must be written out
    /// again: the underlying table does not strongly order rapid repeated
    /// writes to one key, and a lagging duplicate may otherwise stick.
    Stale {
        republish: Option<ChangeRecord>,
    },
}

/// Per-model monotonic counter and tie-break policy.
///
/// This is the engine's entire conflict-resolution algorithm: last-writer-
/// wins keyed by a per-model counter, never by wall-clock time. The full
/// last record is retained per model so a lagging duplicate can be answered
/// with a re-publication.
pub struct ChangeSequencer {
    tracked: HashMap<ModelId, ChangeRecord>,
}

impl ChangeSequencer {
    pub fn new() -> Self {
        Self {
            tracked: HashMap::new(),
        }
    }

    /// Seeds the counter for a newly watched model. Leaves an existing
    /// record alone: creation may already have observed a sequence number.
    pub fn init_model(&mut self, model_id: &str) {
        self.tracked.entry(model_id.to_string()).or_insert_with(|| {
            ChangeRecord::new(model_id.to_string(), StateMap::new(), Some(0))
        });
    }

    pub fn tracked_sequence(&self, model_id: &str) -> Option<SequenceNumber> {
        self.tracked.get(model_id).and_then(|record| record.last_changed)
    }

    /// Compares a remote record against the tracked one and updates the
    /// tracked state on acceptance. The asymmetry between equal (drop
    /// silently) and strictly-less (drop and re-publish) is a compatibility
    /// policy of the surrounding system; do not "simplify" it.
    pub fn observe_remote(&mut self, record: &ChangeRecord) -> RemoteVerdict {
        let Some(remote) = record.last_changed else {
            // no sequence information: apply without bookkeeping
            return RemoteVerdict::Apply;
        };
        if let Some(tracked) = self.tracked_sequence(&record.model_id) {
            if remote <= tracked {
                let republish = (remote < tracked)
                    .then(|| self.restamp_tracked(&record.model_id))
                    .flatten();
                return RemoteVerdict::Stale { republish };
            }
        }
        self.tracked.insert(record.model_id.clone(), record.clone());
        RemoteVerdict::Apply
    }

    /// Bookkeeping for a record applied outside the value path (full-state
    /// updates). Records carrying a sequence number raise the tracked one.
    pub fn record_observed(&mut self, record: &ChangeRecord) {
        if record.last_changed.is_some() {
            self.tracked.insert(record.model_id.clone(), record.clone());
        }
    }

    /// Stamps a locally produced delta with the next sequence number and
    /// retains it as the tracked record.
    pub fn stamp_local(&mut self, model_id: &str, changed: StateMap<ModelId>) -> ChangeRecord {
        let next = self.tracked_sequence(model_id).unwrap_or(0) + 1;
        let record = ChangeRecord::new(model_id.to_string(), changed, Some(next));
        self.tracked.insert(model_id.to_string(), record.clone());
        record
    }

    fn restamp_tracked(&mut self, model_id: &str) -> Option<ChangeRecord> {
        let tracked = self.tracked.get(model_id)?;
        let changed = tracked.changed.clone();
        Some(self.stamp_local(model_id, changed))
    }
}

impl Default for ChangeSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use widgetsync_shared::Value;

    fn record(model_id: &str, value: i64, sequence: Option<u64>) -> ChangeRecord {
        let mut changed = StateMap::new();
        changed.insert("x".to_string(), Value::Int(value));
        ChangeRecord::new(model_id.to_string(), changed, sequence)
    }

    #[test]
    fn newer_remote_is_applied_and_raises_tracked() {
        let mut sequencer = ChangeSequencer::new();
        sequencer.init_model("m1");

        let verdict = sequencer.observe_remote(&record("m1", 1, Some(3)));
        assert_eq!(verdict, RemoteVerdict::Apply);
        assert_eq!(sequencer.tracked_sequence("m1"), Some(3));
    }

    #[test]
    fn equal_sequence_is_dropped_without_republish() {
        let mut sequencer = ChangeSequencer::new();
        sequencer.observe_remote(&record("m1", 1, Some(4)));

        let verdict = sequencer.observe_remote(&record("m1", 2, Some(4)));
        assert_eq!(verdict, RemoteVerdict::Stale { republish: None });
        assert_eq!(sequencer.tracked_sequence("m1"), Some(4));
    }

    #[test]
    fn strictly_older_remote_triggers_republish() {
        // model at sequence 5 with state x:1
        let mut sequencer = ChangeSequencer::new();
        sequencer.observe_remote(&record("m1", 1, Some(5)));

        // lagging duplicate x:2 @ 4 is rejected and answered with x:1 @ 6
        let verdict = sequencer.observe_remote(&record("m1", 2, Some(4)));
        let RemoteVerdict::Stale {
            republish: Some(republished),
        } = verdict
        else {
            panic!("expected republish, got {verdict:?}");
        };
        assert_eq!(republished.last_changed, Some(6));
        assert_eq!(republished.changed["x"], Value::Int(1));
        assert_eq!(sequencer.tracked_sequence("m1"), Some(6));

        // a genuinely newer record is then accepted
        let verdict = sequencer.observe_remote(&record("m1", 3, Some(10)));
        assert_eq!(verdict, RemoteVerdict::Apply);
        assert_eq!(sequencer.tracked_sequence("m1"), Some(10));
    }

    #[test]
    fn applying_the_same_record_twice_is_suppressed() {
        let mut sequencer = ChangeSequencer::new();
        let incoming = record("m1", 7, Some(2));

        assert_eq!(sequencer.observe_remote(&incoming), RemoteVerdict::Apply);
        assert_eq!(
            sequencer.observe_remote(&incoming),
            RemoteVerdict::Stale { republish: None }
        );
    }

    #[test]
    fn tracked_sequence_never_decreases() {
        let mut sequencer = ChangeSequencer::new();
        sequencer.init_model("m1");
        let mut high_water = 0;

        for sequence in [3u64, 1, 3, 8, 2, 8, 12] {
            sequencer.observe_remote(&record("m1", 0, Some(sequence)));
            let tracked = sequencer.tracked_sequence("m1").expect("tracked");
            assert!(tracked >= high_water, "tracked went backwards");
            high_water = tracked;
        }
        let stamped = sequencer.stamp_local("m1", StateMap::new());
        assert!(stamped.last_changed.expect("stamped") > high_water);
    }

    #[test]
    fn local_stamp_is_max_plus_one() {
        let mut sequencer = ChangeSequencer::new();
        sequencer.init_model("m1");

        let first = sequencer.stamp_local("m1", StateMap::new());
        assert_eq!(first.last_changed, Some(1));

        sequencer.observe_remote(&record("m1", 1, Some(9)));
        let second = sequencer.stamp_local("m1", StateMap::new());
        assert_eq!(second.last_changed, Some(10));
    }

    #[test]
    fn record_without_sequence_applies_without_bookkeeping() {
        let mut sequencer = ChangeSequencer::new();
        sequencer.observe_remote(&record("m1", 1, Some(5)));

        let verdict = sequencer.observe_remote(&record("m1", 2, None));
        assert_eq!(verdict, RemoteVerdict::Apply);
        assert_eq!(sequencer.tracked_sequence("m1"), Some(5));
    }
}
