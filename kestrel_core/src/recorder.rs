// kestrel_core/src/recorder.rs

//! Flight recording boundary.
//!
//! The pipeline emits one [`FlightRecord`] per data class per cycle
//! through the [`Recorder`] trait and never looks at the sink again, so
//! storage backends (flash, host filesystem, in-memory capture) stay out
//! of the control path.

use serde::{Deserialize, Serialize};

use crate::messages::{BaroSample, ImuSample, StateEstimate, TrustEvent};
use crate::phase::PhaseTransition;
use crate::types::{SensorId, Tick};

/// Payload of one record, tagged by data class. Tags are part of the log
/// format and must stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RecordData {
    Baro { id: SensorId, sample: BaroSample },
    Imu { id: SensorId, sample: ImuSample },
    Estimate(StateEstimate),
    Phase(PhaseTransition),
    Trust(TrustEvent),
}

impl RecordData {
    pub fn tag(&self) -> &'static str {
        match self {
            RecordData::Baro { .. } => "baro",
            RecordData::Imu { .. } => "imu",
            RecordData::Estimate(_) => "estimate",
            RecordData::Phase(_) => "phase",
            RecordData::Trust(_) => "trust",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlightRecord {
    /// Cycle tick the record was produced on, not the sample's own tick.
    pub tick: Tick,
    pub data: RecordData,
}

pub trait Recorder {
    fn record(&mut self, record: FlightRecord);
}

/// Keeps every record in order. Backs the simulation's post-run export
/// and the pipeline tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    records: Vec<FlightRecord>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[FlightRecord] {
        &self.records
    }

    pub fn count_of(&self, tag: &str) -> usize {
        self.records.iter().filter(|r| r.data.tag() == tag).count()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, record: FlightRecord) {
        self.records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_recorder_keeps_order_and_counts_by_tag() {
        let mut recorder = MemoryRecorder::new();
        recorder.record(FlightRecord {
            tick: 10,
            data: RecordData::Baro {
                id: 0,
                sample: BaroSample {
                    pressure_pa: 95_000.0,
                    temperature_c: 20.0,
                    tick: 10,
                },
            },
        });
        recorder.record(FlightRecord {
            tick: 10,
            data: RecordData::Estimate(StateEstimate::invalid_at(10)),
        });
        recorder.record(FlightRecord {
            tick: 20,
            data: RecordData::Baro {
                id: 1,
                sample: BaroSample {
                    pressure_pa: 94_990.0,
                    temperature_c: 20.1,
                    tick: 20,
                },
            },
        });

        assert_eq!(recorder.records().len(), 3);
        assert_eq!(recorder.count_of("baro"), 2);
        assert_eq!(recorder.count_of("estimate"), 1);
        assert_eq!(recorder.count_of("phase"), 0);
        assert_eq!(recorder.records()[0].tick, 10);
        assert_eq!(recorder.records()[2].tick, 20);
    }

    #[test]
    fn test_record_serialization_tags_are_stable() {
        let record = FlightRecord {
            tick: 5,
            data: RecordData::Trust(TrustEvent {
                kind: crate::types::SensorKind::Barometer,
                id: 2,
                eliminated: true,
                tick: 5,
            }),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"type\":\"Trust\""));
        assert!(json.contains("\"eliminated\":true"));
    }
}
