//! Wire data model: everything in this module is serialized verbatim into
//! `status_update` frames, so field names are part of the client contract.

use serde::ser::Serializer;
use serde::Serialize;
use std::collections::HashMap;

/// Literal sent in place of a reading when no matching sensor exists.
pub const TEMPERATURE_SENSOR_MISSING: &str = "Temperature sensor not found";

/// One complete, immutable reading of all tracked metrics at a single
/// instant. Produced once per tick and shared by every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub cpu: CpuStat,
    pub memory: MemoryStat,
    pub storage: StorageStat,
    pub log_status: HashMap<String, u64>,
    pub system_info: SystemInfoStat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuStat {
    pub processor: String,
    pub current_ghz: f64,
    pub min_ghz: f64,
    pub max_ghz: f64,
    pub temperature: Temperature,
    /// `(current_ghz / 2.0) * 100.0` against an assumed 2.0 GHz baseline.
    /// This is a frequency gauge, not CPU-busy time.
    pub load_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStat {
    pub percent: f64,
    pub total_gib: f64,
    pub used_gib: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStat {
    pub percent: f64,
    pub total_gib: f64,
    pub used_gib: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfoStat {
    pub uptime: UptimeStat,
    pub os: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UptimeStat {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
}

/// A temperature reading, or the known-absent case. Serializes as a bare
/// number or as the [`TEMPERATURE_SENSOR_MISSING`] literal, matching what
/// dashboard clients render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Temperature {
    Celsius(f64),
    SensorMissing,
}

impl Serialize for Temperature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Temperature::Celsius(value) => serializer.serialize_f64(*value),
            Temperature::SensorMissing => serializer.serialize_str(TEMPERATURE_SENSOR_MISSING),
        }
    }
}

/// Outbound broadcast frame.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate<'a> {
    pub event: &'static str,
    pub data: &'a SystemSnapshot,
}

impl<'a> StatusUpdate<'a> {
    pub fn new(data: &'a SystemSnapshot) -> Self {
        Self {
            event: "status_update",
            data,
        }
    }
}
