//! Rotating set of concurrently-valid knock sequences.
//!
//! Three time slots are live per secret at any instant — previous, current,
//! next — bounding client clock skew to ±30 s. The rotator thread drives the
//! window: extend to cover the current slot's neighbours, sleep to the next
//! boundary, discard the departed slot. A sequence consumed by a first-port
//! match keeps its `used` latch until its slot rotates out, which is the
//! whole replay defense.

use anyhow::Result;
use tracing::debug;

use crate::otp::{self, PortSequence};
use crate::secrets::Secret;

/// Index into the secret list loaded at startup.
pub type SecretId = usize;

/// One derived sequence inside the acceptance window.
#[derive(Debug, Clone)]
struct ActiveSequence {
    secret_id: SecretId,
    slot: u64,
    ports: PortSequence,
    used: bool,
}

/// All sequences currently accepted, across every configured secret.
pub struct SequenceSet {
    secrets: Vec<Secret>,
    entries: Vec<ActiveSequence>,
}

impl SequenceSet {
    pub fn new(secrets: Vec<Secret>) -> Self {
        Self {
            secrets,
            entries: Vec::new(),
        }
    }

    /// Generate any missing entries for slots {current−1, current, current+1}
    /// of every secret. Existing entries (and their `used` latches) are left
    /// untouched.
    pub fn extend_to_window(&mut self, now_unix: u64) -> Result<()> {
        let current = now_unix / otp::SLOT_SECONDS;
        for slot in current.saturating_sub(1)..=current + 1 {
            for (secret_id, secret) in self.secrets.iter().enumerate() {
                if self
                    .entries
                    .iter()
                    .any(|e| e.secret_id == secret_id && e.slot == slot)
                {
                    continue;
                }
                let ports = otp::ports_for_slot(secret, slot)?;
                self.entries.push(ActiveSequence {
                    secret_id,
                    slot,
                    ports,
                    used: false,
                });
            }
        }
        debug!(
            slots = ?self.slot_range(),
            sequences = self.entries.len(),
            "sequence window extended"
        );
        Ok(())
    }

    /// Drop every sequence belonging to the oldest slot in the set. Runs
    /// right after a boundary, before the window is extended again, so a
    /// knock matching the departing slot cannot consume it retroactively.
    pub fn discard_oldest(&mut self) {
        if let Some(oldest) = self.entries.iter().map(|e| e.slot).min() {
            self.entries.retain(|e| e.slot != oldest);
            debug!(slot = oldest, "discarded expired sequences");
        }
    }

    /// First unused sequence whose opening port matches, in insertion order.
    /// With several secrets sharing a first port, the earliest entry wins.
    pub fn find_unused_starting_with(&self, port: u16) -> Option<(usize, PortSequence)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| !e.used && e.ports[0] == port)
            .map(|(idx, e)| (idx, e.ports))
    }

    /// Latch a sequence as consumed. It stays in the set (blocking replays)
    /// until `discard_oldest` retires its slot.
    pub fn mark_used(&mut self, idx: usize) {
        if let Some(entry) = self.entries.get_mut(idx) {
            entry.used = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn slot_range(&self) -> Option<(u64, u64)> {
        let min = self.entries.iter().map(|e| e.slot).min()?;
        let max = self.entries.iter().map(|e| e.slot).max()?;
        Some((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_010; // exactly on a slot boundary
    const SLOT: u64 = NOW / otp::SLOT_SECONDS;

    fn secret(fill: u8) -> Secret {
        Secret::from_bytes(vec![fill; 20]).unwrap()
    }

    fn window(secrets: Vec<Secret>) -> SequenceSet {
        let mut set = SequenceSet::new(secrets);
        set.extend_to_window(NOW).unwrap();
        set
    }

    #[test]
    fn test_window_holds_three_slots_per_secret() {
        let set = window(vec![secret(0)]);
        assert_eq!(set.len(), 3);

        let set = window(vec![secret(0), secret(1)]);
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn test_skewed_slots_are_all_accepted() {
        let set = window(vec![secret(0)]);
        for slot in [SLOT - 1, SLOT, SLOT + 1] {
            let ports = otp::ports_for_slot(&secret(0), slot).unwrap();
            assert!(
                set.find_unused_starting_with(ports[0]).is_some(),
                "slot {slot} missing from window"
            );
        }
    }

    #[test]
    fn test_consumed_sequence_blocks_replay() {
        let mut set = window(vec![secret(0)]);
        let ports = otp::ports_for_slot(&secret(0), SLOT).unwrap();

        let (idx, found) = set.find_unused_starting_with(ports[0]).unwrap();
        assert_eq!(found, ports);
        set.mark_used(idx);

        // Same first port no longer matches anything unless another slot
        // happens to collide, which these fixed vectors do not.
        assert!(set.find_unused_starting_with(ports[0]).is_none());
    }

    #[test]
    fn test_rotation_pop_then_push() {
        let mut set = window(vec![secret(0)]);
        assert_eq!(set.len(), 3);

        // Boundary crossed: discard first, then extend for the new now.
        set.discard_oldest();
        assert_eq!(set.len(), 2);

        set.extend_to_window(NOW + otp::SLOT_SECONDS).unwrap();
        assert_eq!(set.len(), 3);

        // The departed slot is gone; the new next slot is present.
        let old_prev = otp::ports_for_slot(&secret(0), SLOT - 1).unwrap();
        assert!(set.find_unused_starting_with(old_prev[0]).is_none());
        let new_next = otp::ports_for_slot(&secret(0), SLOT + 2).unwrap();
        assert!(set.find_unused_starting_with(new_next[0]).is_some());
    }

    #[test]
    fn test_used_latch_survives_extension() {
        let mut set = window(vec![secret(0)]);
        let ports = otp::ports_for_slot(&secret(0), SLOT).unwrap();
        let (idx, _) = set.find_unused_starting_with(ports[0]).unwrap();
        set.mark_used(idx);

        // Re-extending the same window must not resurrect the sequence.
        set.extend_to_window(NOW).unwrap();
        assert!(set.find_unused_starting_with(ports[0]).is_none());
    }

    #[test]
    fn test_rotation_retires_used_latch() {
        let mut set = window(vec![secret(0)]);
        let prev_ports = otp::ports_for_slot(&secret(0), SLOT - 1).unwrap();
        let (idx, _) = set.find_unused_starting_with(prev_ports[0]).unwrap();
        set.mark_used(idx);

        set.discard_oldest();
        set.extend_to_window(NOW + otp::SLOT_SECONDS).unwrap();

        // The latched entry belonged to the retired slot; nothing left to
        // match its first port (no cross-slot collisions in these vectors).
        assert!(set.find_unused_starting_with(prev_ports[0]).is_none());
    }
}
