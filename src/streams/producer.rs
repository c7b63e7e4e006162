//! Producer ledger (component E): Kafka-style per-(stream,producer) epoch+seq
//! validation with commit-after-success discipline.
//!
//! The per-stream write lock held by [`super::store::StreamStore`] across the
//! whole validate→append→commit sequence already provides the ordering the
//! spec asks of a dedicated per-`(path, producer_id)` lock, so the ledger
//! itself is plain synchronous state keyed by `producer_id` within a stream.

use std::collections::HashMap;

/// Committed state for one producer writing to one stream.
#[derive(Debug, Clone, Copy)]
pub struct ProducerState {
    pub epoch: u64,
    pub last_seq: u64,
    pub last_updated_ms: i64,
}

/// Outcome of validating an incoming `(epoch, seq)` against a producer's
/// current ledger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    Accepted { proposed_epoch: u64, proposed_seq: u64 },
    Duplicate { last_seq: u64 },
    StaleEpoch { current_epoch: u64 },
    SequenceGap { expected: u64, received: u64 },
    InvalidEpochSeq,
}

/// Validate an incoming `(epoch, seq)` against the ledger's current entry
/// for `producer_id`. Does not mutate; callers commit only after a
/// successful append via [`commit`].
pub fn validate(
    ledger: &HashMap<String, ProducerState>,
    producer_id: &str,
    epoch: u64,
    seq: u64,
) -> ProducerOutcome {
    match ledger.get(producer_id) {
        None => {
            if seq == 0 {
                ProducerOutcome::Accepted { proposed_epoch: epoch, proposed_seq: 0 }
            } else {
                ProducerOutcome::SequenceGap { expected: 0, received: seq }
            }
        }
        Some(state) => {
            if epoch < state.epoch {
                ProducerOutcome::StaleEpoch { current_epoch: state.epoch }
            } else if epoch > state.epoch {
                if seq != 0 {
                    ProducerOutcome::InvalidEpochSeq
                } else {
                    ProducerOutcome::Accepted { proposed_epoch: epoch, proposed_seq: 0 }
                }
            } else if seq <= state.last_seq {
                ProducerOutcome::Duplicate { last_seq: state.last_seq }
            } else if seq == state.last_seq + 1 {
                ProducerOutcome::Accepted { proposed_epoch: epoch, proposed_seq: seq }
            } else {
                ProducerOutcome::SequenceGap { expected: state.last_seq + 1, received: seq }
            }
        }
    }
}

/// Commit a proposed state returned by [`validate`]'s `Accepted` variant.
/// Only called after the corresponding append has succeeded.
pub fn commit(
    ledger: &mut HashMap<String, ProducerState>,
    producer_id: &str,
    proposed_epoch: u64,
    proposed_seq: u64,
    now_ms: i64,
) {
    ledger.insert(
        producer_id.to_string(),
        ProducerState { epoch: proposed_epoch, last_seq: proposed_seq, last_updated_ms: now_ms },
    );
}

/// Producer states untouched for at least `max_age_ms` are eligible for GC
/// (spec: retention ≥ 7 days of inactivity).
pub fn sweep_expired(ledger: &mut HashMap<String, ProducerState>, now_ms: i64, max_age_ms: i64) {
    ledger.retain(|_, state| now_ms - state.last_updated_ms < max_age_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(epoch: u64, last_seq: u64) -> ProducerState {
        ProducerState { epoch, last_seq, last_updated_ms: 0 }
    }

    #[test]
    fn new_producer_accepts_seq_zero() {
        let ledger = HashMap::new();
        assert_eq!(
            validate(&ledger, "p1", 0, 0),
            ProducerOutcome::Accepted { proposed_epoch: 0, proposed_seq: 0 }
        );
    }

    #[test]
    fn new_producer_rejects_nonzero_seq() {
        let ledger = HashMap::new();
        assert_eq!(
            validate(&ledger, "p1", 0, 5),
            ProducerOutcome::SequenceGap { expected: 0, received: 5 }
        );
    }

    #[test]
    fn stale_epoch_rejected() {
        let mut ledger = HashMap::new();
        ledger.insert("p1".to_string(), state(2, 0));
        assert_eq!(
            validate(&ledger, "p1", 1, 0),
            ProducerOutcome::StaleEpoch { current_epoch: 2 }
        );
    }

    #[test]
    fn higher_epoch_nonzero_seq_invalid() {
        let mut ledger = HashMap::new();
        ledger.insert("p1".to_string(), state(0, 3));
        assert_eq!(validate(&ledger, "p1", 1, 1), ProducerOutcome::InvalidEpochSeq);
    }

    #[test]
    fn higher_epoch_zero_seq_accepted() {
        let mut ledger = HashMap::new();
        ledger.insert("p1".to_string(), state(0, 3));
        assert_eq!(
            validate(&ledger, "p1", 1, 0),
            ProducerOutcome::Accepted { proposed_epoch: 1, proposed_seq: 0 }
        );
    }

    #[test]
    fn duplicate_same_epoch_lower_or_equal_seq() {
        let mut ledger = HashMap::new();
        ledger.insert("p1".to_string(), state(0, 5));
        assert_eq!(validate(&ledger, "p1", 0, 5), ProducerOutcome::Duplicate { last_seq: 5 });
        assert_eq!(validate(&ledger, "p1", 0, 3), ProducerOutcome::Duplicate { last_seq: 5 });
    }

    #[test]
    fn next_seq_accepted() {
        let mut ledger = HashMap::new();
        ledger.insert("p1".to_string(), state(0, 5));
        assert_eq!(
            validate(&ledger, "p1", 0, 6),
            ProducerOutcome::Accepted { proposed_epoch: 0, proposed_seq: 6 }
        );
    }

    #[test]
    fn gap_same_epoch_rejected() {
        let mut ledger = HashMap::new();
        ledger.insert("p1".to_string(), state(0, 5));
        assert_eq!(
            validate(&ledger, "p1", 0, 8),
            ProducerOutcome::SequenceGap { expected: 6, received: 8 }
        );
    }

    #[test]
    fn commit_then_duplicate_detected() {
        let mut ledger = HashMap::new();
        commit(&mut ledger, "p1", 0, 0, 1000);
        assert_eq!(validate(&ledger, "p1", 0, 0), ProducerOutcome::Duplicate { last_seq: 0 });
    }

    #[test]
    fn sweep_removes_old_entries_only() {
        let mut ledger = HashMap::new();
        ledger.insert("old".to_string(), ProducerState { epoch: 0, last_seq: 0, last_updated_ms: 0 });
        ledger.insert("new".to_string(), ProducerState { epoch: 0, last_seq: 0, last_updated_ms: 1000 });
        sweep_expired(&mut ledger, 1000, 500);
        assert!(!ledger.contains_key("old"));
        assert!(ledger.contains_key("new"));
    }
}
