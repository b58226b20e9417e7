// kestrel_sim/src/flight_log.rs

//! Post-run CSV export of the flight record.
//!
//! Every record class shares one sparse row layout so a single file holds
//! the whole mission and plots trivially against the `tick` column.

use std::path::Path;

use kestrel_core::recorder::{FlightRecord, RecordData};
use kestrel_core::types::SensorKind;

const HEADER: [&str; 13] = [
    "tick",
    "type",
    "id",
    "pressure_pa",
    "temperature_c",
    "altitude_m",
    "velocity_mps",
    "accel_mps2",
    "valid",
    "from",
    "to",
    "intent",
    "eliminated",
];

fn sensor_label(kind: SensorKind) -> &'static str {
    match kind {
        SensorKind::Barometer => "baro",
        SensorKind::Imu => "imu",
    }
}

fn row(record: &FlightRecord) -> [String; 13] {
    let mut row: [String; 13] = std::array::from_fn(|_| String::new());
    row[0] = record.tick.to_string();
    row[1] = record.data.tag().to_string();
    match record.data {
        RecordData::Baro { id, sample } => {
            row[2] = id.to_string();
            row[3] = format!("{:.2}", sample.pressure_pa);
            row[4] = format!("{:.2}", sample.temperature_c);
        }
        RecordData::Imu { id, sample } => {
            row[2] = id.to_string();
            row[7] = format!("{:.4}", sample.accel.z);
        }
        RecordData::Estimate(estimate) => {
            row[5] = format!("{:.3}", estimate.altitude_agl);
            row[6] = format!("{:.3}", estimate.vertical_velocity);
            row[7] = format!("{:.3}", estimate.vertical_accel);
            row[8] = estimate.valid.to_string();
        }
        RecordData::Phase(transition) => {
            row[9] = transition.from.label().to_string();
            row[10] = transition.to.label().to_string();
            if let Some(intent) = transition.intent {
                row[11] = intent.label().to_string();
            }
        }
        RecordData::Trust(event) => {
            row[1] = format!("trust_{}", sensor_label(event.kind));
            row[2] = event.id.to_string();
            row[12] = event.eliminated.to_string();
        }
    }
    row
}

pub fn export_csv(records: &[FlightRecord], path: &Path) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(HEADER)?;
    for record in records {
        wtr.write_record(&row(record))?;
    }
    wtr.flush()?;
    Ok(())
}
