//! Wire and internal data model.
//!
//! Stations are identified by the pair (server, station) where `server` is
//! the configured name of the broker the station publishes through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sensor name to the readings of every physical sensor carrying that name,
/// in broker sensor-index order.
pub type SensorMap = BTreeMap<String, Vec<SensorValue>>;

/// A single reading with its unit string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    pub unit: String,
    pub value: f64,
}

/// Weather payload as published by a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherMessage {
    pub time: DateTime<Utc>,
    pub id: String,
    #[serde(default)]
    pub sensors: SensorMap,
}

impl WeatherMessage {
    /// Tag the message with the broker it arrived through.
    pub fn to_entry(&self, server: &str) -> WeatherEntry {
        WeatherEntry {
            station: self.id.clone(),
            server: server.to_string(),
            time: self.time,
            sensors: self.sensors.clone(),
        }
    }
}

/// A persisted (or persistable) weather reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherEntry {
    pub station: String,
    pub server: String,
    pub time: DateTime<Utc>,
    pub sensors: SensorMap,
}

impl WeatherEntry {
    pub fn map_id(&self) -> String {
        map_id(&self.server, &self.station)
    }
}

/// Station metadata payload as published by a station.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationMessage {
    pub make: String,
    pub model: String,
    pub software: String,
    pub version: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub district: String,
    pub city: String,
    pub region: String,
    pub country: String,
    #[serde(rename = "rapid-weather")]
    pub rapid_weather: bool,
}

impl StationMessage {
    pub fn to_entry(&self, server: &str, station: &str, updated: DateTime<Utc>) -> StationEntry {
        StationEntry {
            server: server.to_string(),
            station: station.to_string(),
            make: self.make.clone(),
            model: self.model.clone(),
            software: self.software.clone(),
            version: self.version.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            elevation: self.elevation,
            district: self.district.clone(),
            city: self.city.clone(),
            region: self.region.clone(),
            country: self.country.clone(),
            rapid_weather: self.rapid_weather,
            updated,
        }
    }
}

/// Station metadata as stored and served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationEntry {
    pub server: String,
    pub station: String,
    pub make: String,
    pub model: String,
    pub software: String,
    pub version: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub district: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub rapid_weather: bool,
    pub updated: DateTime<Utc>,
}

impl StationEntry {
    pub fn map_id(&self) -> String {
        map_id(&self.server, &self.station)
    }

    pub fn key(&self) -> StationKey {
        StationKey {
            server: self.server.clone(),
            station: self.station.clone(),
        }
    }
}

/// Identity of a station across brokers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StationKey {
    pub server: String,
    pub station: String,
}

/// Command published to a station's request topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub action: String,
}

impl RequestMessage {
    pub fn info() -> Self {
        Self {
            action: "info".to_string(),
        }
    }

    pub fn rapid_weather() -> Self {
        Self {
            action: "rapid-weather".to_string(),
        }
    }
}

/// A (country, region, city, district) tuple matched by a region search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMatch {
    pub country: String,
    pub region: String,
    pub city: String,
    pub district: String,
}

/// Stable cross-map key for a station.
pub fn map_id(server: &str, station: &str) -> String {
    format!("{server}-{station}")
}
