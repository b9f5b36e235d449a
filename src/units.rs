//! Sensor unit conversions and weighted averaging.
//!
//! Readings are normalized to a small canonical metric set on ingest and
//! converted to imperial presentation units on the way out. Unrecognized
//! units pass through unchanged.

use std::f64::consts::PI;

const MPH_PER_MPS: f64 = 2.236936;
const MM_PER_IN: f64 = 25.4;
const KM_PER_NM: f64 = 1.852;
const KM_PER_MI: f64 = 1.609344;
const HPA_PER_INHG: f64 = 33.86389;
const HPA_PER_TORR: f64 = 1.3332236842105;

/// Convert a reading to its canonical metric unit.
///
/// The sensor name disambiguates unitless readings: a "uv" sensor is always
/// a UV index regardless of the unit string it was published with.
pub fn to_metric(value: f64, unit: &str, sensor_hint: &str) -> (f64, String) {
    let mut unit = unit.to_lowercase();
    if sensor_hint == "uv" {
        unit = "uv".to_string();
    }
    match unit.as_str() {
        "m/h" | "mph" => (value / MPH_PER_MPS, "mps".to_string()),
        "mps" | "m/s" => (value, "mps".to_string()),
        "c" => (value, "c".to_string()),
        "f" => ((value - 32.0) * 5.0 / 9.0, "c".to_string()),
        "in" => (value / MM_PER_IN, "mm".to_string()),
        "mm" => (value, "mm".to_string()),
        "nm" => (value * KM_PER_NM, "km".to_string()),
        "mi" => (value * KM_PER_MI, "km".to_string()),
        "km" => (value, "km".to_string()),
        "inhg" => (value * HPA_PER_INHG, "hpa".to_string()),
        "torr" => (value * HPA_PER_TORR, "hpa".to_string()),
        "hpa" => (value, "hpa".to_string()),
        "%" | "pct" => (value, "%".to_string()),
        "deg" => (value, "deg".to_string()),
        "rad" => (value * 180.0 / PI, "deg".to_string()),
        _ => (value, unit.clone()),
    }
}

/// Convert a reading to its presentation imperial unit.
pub fn to_imperial(value: f64, unit: &str, _sensor_hint: &str) -> (f64, String) {
    let unit = unit.to_lowercase();
    match unit.as_str() {
        "m/s" | "mps" => (value * MPH_PER_MPS, "mph".to_string()),
        "c" => (value * 9.0 / 5.0 + 32.0, "f".to_string()),
        "f" => (value, "f".to_string()),
        "in" => (value, "in".to_string()),
        "mm" => (value * MM_PER_IN, "in".to_string()),
        "nm" => (value, "nm".to_string()),
        "mi" => (value, "mi".to_string()),
        "km" => (value / KM_PER_MI, "mi".to_string()),
        "inhg" => (value, "inhg".to_string()),
        "torr" => (value / MM_PER_IN, "inhg".to_string()),
        "hpa" => (value / HPA_PER_INHG, "inhg".to_string()),
        "%" | "pct" => (value, "%".to_string()),
        "deg" => (value, "deg".to_string()),
        "rad" => (value * 180.0 / PI, "deg".to_string()),
        _ => (value, unit.clone()),
    }
}

/// Weighted average of sensor readings sharing a unit.
///
/// Directional units are averaged on the unit circle so that readings that
/// straddle north (350 and 10 degrees) average to north, not south.
pub fn average_sensor(values: &[f64], weights: &[f64], unit: &str, _sensor_hint: &str) -> f64 {
    match unit {
        "deg" => circular_mean(values, weights, PI / 180.0).rem_euclid(2.0 * PI) * 180.0 / PI,
        "rad" => circular_mean(values, weights, 1.0).rem_euclid(2.0 * PI),
        _ => {
            let total: f64 = weights.iter().sum();
            let weighted: f64 = values.iter().zip(weights).map(|(v, w)| v * w).sum();
            weighted / total
        }
    }
}

/// Weighted circular mean in radians of angles given in `1/scale` radians.
fn circular_mean(values: &[f64], weights: &[f64], scale: f64) -> f64 {
    let total: f64 = weights.iter().sum();
    let sin_mean: f64 = values
        .iter()
        .zip(weights)
        .map(|(v, w)| (v * scale).sin() * w)
        .sum::<f64>()
        / total;
    let cos_mean: f64 = values
        .iter()
        .zip(weights)
        .map(|(v, w)| (v * scale).cos() * w)
        .sum::<f64>()
        / total;
    sin_mean.atan2(cos_mean)
}
