//! Weather aggregation gateway.
//!
//! Subscribes to upstream MQTT brokers carrying per-station weather
//! telemetry, normalizes and persists every reading, and re-exposes the
//! data over HTTP as point-in-time JSON queries and live server-sent event
//! streams — per station, per location, or per administrative region.

pub mod aggregate;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod http;
pub mod types;
pub mod units;

pub use broker::Broker;
pub use config::Config;
pub use db::Database;
pub use error::{GatewayError, Result};
