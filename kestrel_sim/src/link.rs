// kestrel_sim/src/link.rs

//! Ground link over the byte queues.
//!
//! Commands ride the uplink and telemetry the downlink, one JSON object
//! per newline-delimited frame over a [`RingQueue`] each. Writes are
//! all-or-nothing: a full or contended queue drops the frame and the
//! sender counts it, so the link never blocks either end.

use std::sync::Arc;

use kestrel_core::messages::{Command, StateEstimate};
use kestrel_core::phase::FlightPhase;
use kestrel_core::queue::RingQueue;
use kestrel_core::types::Tick;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

const DELIMITER: u8 = b'\n';
/// Generous bound on one serialized frame; telemetry runs ~200 bytes.
pub const MAX_FRAME: usize = 512;

/// Vehicle-to-ground status frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub tick: Tick,
    pub phase: FlightPhase,
    pub estimate: StateEstimate,
    pub trusted_baros: usize,
    pub trusted_imus: usize,
}

/// Builds both ends of a link with a queue of `capacity` bytes per
/// direction.
pub fn pair(capacity: usize) -> (GroundStation, VehicleLink) {
    let uplink = Arc::new(RingQueue::new(capacity));
    let downlink = Arc::new(RingQueue::new(capacity));
    (
        GroundStation {
            uplink: Arc::clone(&uplink),
            downlink: Arc::clone(&downlink),
            dropped: 0,
        },
        VehicleLink {
            uplink,
            downlink,
            dropped: 0,
        },
    )
}

fn write_frame<T: Serialize>(queue: &RingQueue, value: &T) -> bool {
    let Ok(mut bytes) = serde_json::to_vec(value) else {
        return false;
    };
    bytes.push(DELIMITER);
    queue.write(&bytes)
}

/// Pulls the next parseable frame, skipping over garbage frames. Bounded
/// so a queue full of junk cannot spin the caller.
fn read_frame<T: DeserializeOwned>(queue: &RingQueue) -> Option<T> {
    let mut buf = [0u8; MAX_FRAME];
    for _ in 0..32 {
        let n = queue.read_until(DELIMITER, &mut buf);
        if n == 0 {
            return None;
        }
        match serde_json::from_slice(&buf[..n]) {
            Ok(value) => return Some(value),
            Err(e) => debug!(error = %e, "discarding unparseable frame"),
        }
    }
    None
}

pub struct GroundStation {
    uplink: Arc<RingQueue>,
    downlink: Arc<RingQueue>,
    dropped: u32,
}

impl GroundStation {
    pub fn send(&mut self, command: &Command) -> bool {
        let sent = write_frame(&self.uplink, command);
        if !sent {
            self.dropped += 1;
        }
        sent
    }

    pub fn poll_telemetry(&self) -> Option<TelemetryFrame> {
        read_frame(&self.downlink)
    }

    /// Frames dropped because the uplink was full or contended.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

pub struct VehicleLink {
    uplink: Arc<RingQueue>,
    downlink: Arc<RingQueue>,
    dropped: u32,
}

impl VehicleLink {
    pub fn poll_command(&self) -> Option<Command> {
        read_frame(&self.uplink)
    }

    pub fn send_telemetry(&mut self, frame: &TelemetryFrame) -> bool {
        let sent = write_frame(&self.downlink, frame);
        if !sent {
            self.dropped += 1;
        }
        sent
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tick: Tick) -> TelemetryFrame {
        TelemetryFrame {
            tick,
            phase: FlightPhase::Idle,
            estimate: StateEstimate::invalid_at(tick),
            trusted_baros: 3,
            trusted_imus: 2,
        }
    }

    #[test]
    fn test_commands_round_trip_in_order() {
        let (mut ground, vehicle) = pair(1024);
        assert!(ground.send(&Command::Arm));
        assert!(ground.send(&Command::Abort));

        assert_eq!(vehicle.poll_command(), Some(Command::Arm));
        assert_eq!(vehicle.poll_command(), Some(Command::Abort));
        assert_eq!(vehicle.poll_command(), None);
    }

    #[test]
    fn test_telemetry_round_trips() {
        let (ground, mut vehicle) = pair(1024);
        assert!(vehicle.send_telemetry(&frame(120)));

        let received = ground.poll_telemetry().unwrap();
        assert_eq!(received.tick, 120);
        assert_eq!(received.trusted_baros, 3);
        assert_eq!(ground.poll_telemetry(), None);
    }

    #[test]
    fn test_full_queue_drops_frame_and_counts() {
        // Too small for even one frame.
        let (mut ground, vehicle) = pair(8);
        assert!(!ground.send(&Command::Arm));
        assert_eq!(ground.dropped(), 1);
        assert_eq!(vehicle.poll_command(), None);
    }

    #[test]
    fn test_garbage_frames_are_skipped() {
        let (mut ground, vehicle) = pair(1024);
        vehicle.uplink.write(b"not json\n");
        assert!(ground.send(&Command::Recalibrate));

        assert_eq!(vehicle.poll_command(), Some(Command::Recalibrate));
    }
}
