// kestrel_sim/src/board.rs

//! Snapshot hand-off between the acquisition and estimation tasks.
//!
//! One slot, whole-snapshot writes and reads. Both sides use `try_lock`
//! and give up immediately on contention, so neither task can stall the
//! other mid-cycle; the estimation side falls back to its previous copy
//! when a publish is in progress.

use std::sync::Mutex;

use kestrel_core::messages::SampleSnapshot;

pub struct SampleBoard {
    slot: Mutex<SampleSnapshot>,
}

impl SampleBoard {
    pub fn new(n_baro: usize, n_imu: usize) -> Self {
        Self {
            slot: Mutex::new(SampleSnapshot::new(n_baro, n_imu)),
        }
    }

    /// Publishes a whole snapshot. Returns false without waiting when the
    /// consumer currently holds the slot; the next publish supersedes the
    /// lost one anyway.
    pub fn publish(&self, snapshot: &SampleSnapshot) -> bool {
        let Ok(mut slot) = self.slot.try_lock() else {
            return false;
        };
        slot.clone_from(snapshot);
        true
    }

    /// Copies the latest snapshot out. `None` without waiting when the
    /// producer currently holds the slot.
    pub fn snapshot(&self) -> Option<SampleSnapshot> {
        self.slot.try_lock().ok().map(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::messages::BaroSample;

    #[test]
    fn test_publish_then_snapshot_round_trips() {
        let board = SampleBoard::new(2, 1);
        let mut snapshot = SampleSnapshot::new(2, 1);
        snapshot.tick = 40;
        snapshot.baros[1] = Some(BaroSample {
            pressure_pa: 94_800.0,
            temperature_c: 19.0,
            tick: 35,
        });

        assert!(board.publish(&snapshot));
        let copy = board.snapshot().unwrap();
        assert_eq!(copy, snapshot);
    }

    #[test]
    fn test_contended_slot_fails_fast() {
        let board = SampleBoard::new(1, 1);
        let guard = board.slot.try_lock().unwrap();

        let snapshot = SampleSnapshot::new(1, 1);
        assert!(!board.publish(&snapshot));
        assert!(board.snapshot().is_none());
        drop(guard);

        assert!(board.publish(&snapshot));
        assert!(board.snapshot().is_some());
    }
}
