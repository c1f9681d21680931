//! Attestation tracker (design §4.F): per-VM liveness state derived from
//! heartbeat samples, with a staleness rule (no sample in 3x the expected
//! sample interval) and a consecutive-failure rule (3 bad signatures in a
//! row) that both gate whether a VM's usage counts toward billing.

use std::collections::HashMap;
use std::sync::Mutex;

use meshcloud_common::api::domain::VmId;
use meshcloud_common::api::node_api::AttestationSample;
use meshcloud_common::time::Timestamp;

use crate::config::{ATTESTATION_CONSECUTIVE_FAILURE_THRESHOLD, ATTESTATION_STALE_MULTIPLIER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Live,
    Stale,
    Failing,
}

#[derive(Debug, Clone)]
struct VmLiveness {
    last_sample_at: Timestamp,
    consecutive_failures: u32,
}

/// Shared, mutex-guarded map rather than `DashMap` here: heartbeats arrive
/// one per node (covering many VMs at once), so updates are naturally
/// batched per call and a single lock per heartbeat is cheaper than one
/// per VM entry.
pub struct AttestationTracker {
    sample_interval_secs: i64,
    state: Mutex<HashMap<VmId, VmLiveness>>,
}

impl AttestationTracker {
    pub fn new(sample_interval_secs: i64) -> Self {
        Self {
            sample_interval_secs,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Records the samples from one heartbeat. A `valid: false` sample
    /// bumps the failure streak; a valid sample resets it.
    pub fn record_samples(&self, samples: &HashMap<VmId, AttestationSample>, now: Timestamp) {
        let mut state = self.state.lock().unwrap();
        for (vm_id, sample) in samples {
            let entry = state.entry(vm_id.clone()).or_insert_with(|| VmLiveness {
                last_sample_at: now,
                consecutive_failures: 0,
            });
            entry.last_sample_at = now;
            entry.consecutive_failures = if sample.valid { 0 } else { entry.consecutive_failures + 1 };
        }
    }

    pub fn liveness(&self, vm_id: &str, now: Timestamp) -> LivenessState {
        let state = self.state.lock().unwrap();
        let Some(entry) = state.get(vm_id) else {
            return LivenessState::Stale;
        };

        if entry.consecutive_failures >= ATTESTATION_CONSECUTIVE_FAILURE_THRESHOLD {
            return LivenessState::Failing;
        }

        let stale_deadline = self.sample_interval_secs * ATTESTATION_STALE_MULTIPLIER;
        if meshcloud_common::time::is_stale(entry.last_sample_at, now, stale_deadline) {
            return LivenessState::Stale;
        }

        LivenessState::Live
    }

    /// Whether a VM's usage for this cycle should bill at the verified
    /// rate. Stale/failing attestation still bills (design §4.K routes
    /// those minutes to `unverifiedRuntimeMinutes` instead of refusing to
    /// bill), so this only distinguishes the bucket, not whether to bill.
    pub fn is_verified(&self, vm_id: &str, now: Timestamp) -> bool {
        self.liveness(vm_id, now) == LivenessState::Live
    }

    pub fn forget(&self, vm_id: &str) {
        self.state.lock().unwrap().remove(vm_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn unknown_vm_is_stale() {
        let tracker = AttestationTracker::new(60);
        assert_eq!(tracker.liveness("vm1", chrono::Utc::now()), LivenessState::Stale);
    }

    #[test]
    fn becomes_failing_after_three_invalid_samples() {
        let tracker = AttestationTracker::new(60);
        let now = chrono::Utc::now();
        for _ in 0..3 {
            let mut samples = HashMap::new();
            samples.insert(
                "vm1".to_string(),
                AttestationSample {
                    valid: false,
                    nonce: "n".into(),
                    signature: "s".into(),
                },
            );
            tracker.record_samples(&samples, now);
        }
        assert_eq!(tracker.liveness("vm1", now), LivenessState::Failing);
    }

    #[test]
    fn becomes_stale_after_three_missed_intervals() {
        let tracker = AttestationTracker::new(60);
        let now = chrono::Utc::now();
        let mut samples = HashMap::new();
        samples.insert(
            "vm1".to_string(),
            AttestationSample {
                valid: true,
                nonce: "n".into(),
                signature: "s".into(),
            },
        );
        tracker.record_samples(&samples, now);

        assert_eq!(tracker.liveness("vm1", now + Duration::seconds(179)), LivenessState::Live);
        assert_eq!(tracker.liveness("vm1", now + Duration::seconds(181)), LivenessState::Stale);
    }
}
