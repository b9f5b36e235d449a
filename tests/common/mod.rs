//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use weather_gateway::db::Database;
use weather_gateway::http::AppState;
use weather_gateway::types::{SensorMap, SensorValue, StationEntry, WeatherEntry};

pub fn test_db() -> Database {
    Database::open(":memory:").unwrap()
}

pub fn test_state(db: Database) -> AppState {
    AppState {
        db,
        brokers: Arc::new(HashMap::new()),
    }
}

pub fn station(server: &str, name: &str, lat: f64, lon: f64) -> StationEntry {
    StationEntry {
        server: server.to_string(),
        station: name.to_string(),
        make: "Acme".to_string(),
        model: "WX-1".to_string(),
        software: "acmewx".to_string(),
        version: "1.0".to_string(),
        latitude: lat,
        longitude: lon,
        elevation: 100.0,
        district: "Downtown".to_string(),
        city: "Portland".to_string(),
        region: "Oregon".to_string(),
        country: "US".to_string(),
        rapid_weather: false,
        updated: "2024-01-01T00:00:00Z".parse().unwrap(),
    }
}

pub fn entry(server: &str, name: &str, time: &str, sensors: &[(&str, &str, f64)]) -> WeatherEntry {
    let mut map = SensorMap::new();
    for (sensor, unit, value) in sensors {
        map.entry(sensor.to_string()).or_default().push(SensorValue {
            unit: unit.to_string(),
            value: *value,
        });
    }
    WeatherEntry {
        station: name.to_string(),
        server: server.to_string(),
        time: time.parse().unwrap(),
        sensors: map,
    }
}
