//! Sequence-number gate for rotation packets.
//!
//! UDP may reorder or duplicate datagrams, so only packets newer than the
//! last accepted one get through. Sequence numbers below the restart
//! threshold are always accepted: the sender restarted its counter (app
//! relaunch), and waiting for it to climb past the old value would freeze the
//! pose. The downside is that a genuinely stale low-numbered packet shortly
//! after startup is also accepted.

/// Sequence numbers below this are treated as a counter restart.
pub const DEFAULT_RESTART_THRESHOLD: i32 = 1000;

#[derive(Debug, Clone)]
pub struct SequenceGate {
    /// `None` until the first packet, which sits below every valid value.
    last: Option<i32>,
    restart_threshold: i32,
}

impl Default for SequenceGate {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_THRESHOLD)
    }
}

impl SequenceGate {
    #[must_use]
    pub const fn new(restart_threshold: i32) -> Self {
        Self {
            last: None,
            restart_threshold,
        }
    }

    /// Accepts `seq` iff it is newer than the last accepted value or below the
    /// restart threshold. An accepted value becomes the new reference.
    pub fn admit(&mut self, seq: i32) -> bool {
        let fresh = match self.last {
            None => true,
            Some(last) => seq > last || seq < self.restart_threshold,
        };
        if fresh {
            self.last = Some(seq);
        }
        fresh
    }

    /// Last accepted sequence number.
    #[must_use]
    pub const fn last(&self) -> Option<i32> {
        self.last
    }

    #[must_use]
    pub const fn restart_threshold(&self) -> i32 {
        self.restart_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_at(threshold: i32, last: i32) -> SequenceGate {
        let mut gate = SequenceGate::new(threshold);
        assert!(gate.admit(last));
        gate
    }

    #[test]
    fn first_packet_is_always_accepted() {
        let mut gate = SequenceGate::default();
        assert_eq!(gate.last(), None);
        assert!(gate.admit(i32::MIN));
        assert_eq!(gate.last(), Some(i32::MIN));
    }

    #[test]
    fn newer_packet_advances_reference() {
        let mut gate = gate_at(DEFAULT_RESTART_THRESHOLD, 50);
        assert!(gate.admit(51));
        assert_eq!(gate.last(), Some(51));
    }

    #[test]
    fn below_threshold_counts_as_restart() {
        let mut gate = gate_at(DEFAULT_RESTART_THRESHOLD, 50);
        assert!(gate.admit(5));
        assert_eq!(gate.last(), Some(5));
    }

    #[test]
    fn small_threshold_rejects_older_packets() {
        // Threshold 10: 10 is neither newer than 50 nor a restart, 5 is a restart.
        let mut gate = gate_at(10, 50);
        assert!(!gate.admit(10));
        assert_eq!(gate.last(), Some(50));
        assert!(gate.admit(5));
        assert_eq!(gate.last(), Some(5));
    }

    #[test]
    fn stale_and_duplicate_packets_above_threshold_are_dropped() {
        let mut gate = gate_at(DEFAULT_RESTART_THRESHOLD, 5000);
        assert!(!gate.admit(5000));
        assert!(!gate.admit(4999));
        assert!(!gate.admit(1000));
        assert_eq!(gate.last(), Some(5000));
        assert!(gate.admit(999));
    }

    #[test]
    fn negative_numbers_are_restarts() {
        let mut gate = gate_at(DEFAULT_RESTART_THRESHOLD, 70_000);
        assert!(gate.admit(-1));
        assert!(gate.admit(0));
    }
}
