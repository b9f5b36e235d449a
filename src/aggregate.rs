//! Station selection and condition aggregation.
//!
//! Selects the stations contributing to a location or region query, weights
//! them, and combines their latest readings into a single set of averaged
//! sensor values.

use std::collections::{BTreeMap, HashMap};

use crate::db::{gen_string_joins, Database, SqlValue};
use crate::error::Result;
use crate::geo;
use crate::types::{RegionMatch, SensorValue, StationEntry, WeatherEntry};
use crate::units;

/// Stations within `dist` kilometres of (lat, lon) and their distances, in
/// query order. The bounding box pre-filters; the haversine check is exact.
pub async fn find_nearest_stations(
    db: &Database,
    lat: f64,
    lon: f64,
    dist: f64,
) -> Result<(Vec<StationEntry>, Vec<f64>)> {
    let (delta_lat, delta_lon) = geo::dist_to_lat_lon(lon, dist);

    let entries = db
        .query_station_infos(
            "WHERE latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?",
            vec![
                (lat - delta_lat).into(),
                (lat + delta_lat).into(),
                (lon - delta_lon).into(),
                (lon + delta_lon).into(),
            ],
        )
        .await?;

    let mut stations = Vec::new();
    let mut distances = Vec::new();
    for entry in entries {
        let d = geo::haversine(lat, lon, entry.latitude, entry.longitude);
        if d <= dist {
            stations.push(entry);
            distances.push(d);
        }
    }
    Ok((stations, distances))
}

/// Stations whose administrative hierarchy matches every non-empty
/// component.
pub async fn find_region_stations(
    db: &Database,
    district: &str,
    city: &str,
    region: &str,
    country: &str,
) -> Result<Vec<StationEntry>> {
    let mut conditions = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    for (column, value) in [
        ("district", district),
        ("city", city),
        ("region", region),
        ("country", country),
    ] {
        if !value.is_empty() {
            conditions.push(format!("{column}.value LIKE ?"));
            args.push(value.to_string().into());
        }
    }
    let condition = format!("WHERE {}", conditions.join(" AND "));
    db.query_station_infos(&condition, args).await
}

/// One plausible assignment of search tokens to hierarchy slots.
struct RegionCase {
    country: String,
    region: String,
    city: String,
    district: String,
}

/// Enumerate the plausible assignments of 1-4 free-form tokens to the
/// (country, region, city, district) slots. Empty for any other count.
fn region_search_cases(tokens: &[String]) -> Vec<RegionCase> {
    let mut cases = Vec::new();
    {
        let mut option = |country: &str, region: &str, city: &str, district: &str| {
            cases.push(RegionCase {
                country: country.to_string(),
                region: region.to_string(),
                city: city.to_string(),
                district: district.to_string(),
            });
        };
        match tokens {
            [a] => {
                option("", "", a, "");
                option("", "", "", a);
            }
            [a, b] => {
                option(a, "", b, "");
                option(a, "", "", b);
                option("", a, b, "");
                option("", a, "", b);
                option("", "", a, b);

                option(b, "", a, "");
                option(b, "", "", a);
                option("", b, a, "");
                option("", b, "", a);
                option("", "", b, a);
            }
            [a, b, c] => {
                option(a, b, c, "");
                option(a, b, "", c);
                option(a, "", b, c);
                option("", a, b, c);

                option(c, b, a, "");
                option(c, b, "", a);
                option(c, "", b, a);
                option("", c, b, a);
            }
            [a, b, c, d] => {
                option(a, b, c, d);
                option(d, c, b, a);
            }
            _ => {}
        }
    }
    cases
}

/// Distinct (country, region, city, district) tuples plausibly matching the
/// search tokens.
pub async fn search_region(db: &Database, tokens: &[String]) -> Result<Vec<RegionMatch>> {
    let cases = region_search_cases(tokens);
    if cases.is_empty() {
        return Ok(Vec::new());
    }

    let mut conditions = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    for case in &cases {
        let mut case_conditions = Vec::new();
        for (column, value) in [
            ("country", &case.country),
            ("region", &case.region),
            ("city", &case.city),
            ("district", &case.district),
        ] {
            if !value.is_empty() {
                case_conditions.push(format!("{column}.value LIKE ?"));
                args.push(value.clone().into());
            }
        }
        conditions.push(format!("( {} )", case_conditions.join(" AND ")));
    }

    let condition = format!("WHERE {}", conditions.join(" OR "));
    db.query_regions(&condition, args).await
}

/// The latest weather entry of every given station, in one query.
pub async fn fetch_conditions(db: &Database, stations: &[StationEntry]) -> Result<Vec<WeatherEntry>> {
    if stations.is_empty() {
        return Ok(Vec::new());
    }

    let joins = gen_string_joins("weather_entry", &["station", "server"]);
    let mut conditions = Vec::with_capacity(stations.len());
    let mut args: Vec<SqlValue> = Vec::with_capacity(stations.len() * 4);
    for station in stations {
        conditions.push(format!(
            "(server.value = ? AND station.value = ? AND time = (\n\
                SELECT MAX(time) FROM weather_entry {joins}\
                WHERE server.value = ? AND station.value = ?))"
        ));
        args.push(station.server.clone().into());
        args.push(station.station.clone().into());
        args.push(station.server.clone().into());
        args.push(station.station.clone().into());
    }

    db.fetch_entries(&format!("WHERE {}", conditions.join(" OR ")), args)
        .await
}

/// Normalized inverse-distance weights.
///
/// Each distance is normalized against the total, inverted through
/// 1/(n + 1), and the inverted weights are normalized to sum to one. The
/// exact shape matters to consumers; do not algebraically simplify it.
pub fn weights(distances: &[f64]) -> Vec<f64> {
    let total: f64 = distances.iter().sum();
    let normalized: Vec<f64> = distances.iter().map(|d| d / total).collect();

    let inverted: Vec<f64> = normalized.iter().map(|n| 1.0 / (n + 1.0)).collect();
    let total_weight: f64 = inverted.iter().sum();

    inverted.iter().map(|w| w / total_weight).collect()
}

/// Combine the first reading of every sensor name across entries into a
/// weighted average per name. The unit of the first reading seen for a name
/// wins; every value is normalized to metric before averaging.
pub fn average_conditions(
    conditions: &[WeatherEntry],
    weights: &HashMap<String, f64>,
) -> BTreeMap<String, SensorValue> {
    struct Accumulated {
        unit: String,
        values: Vec<f64>,
        weights: Vec<f64>,
    }

    let mut value_list: BTreeMap<String, Accumulated> = BTreeMap::new();
    for entry in conditions {
        let weight = weights.get(&entry.map_id()).copied().unwrap_or_default();
        for (name, sensors) in &entry.sensors {
            let Some(first) = sensors.first() else { continue };
            let (value, unit) = units::to_metric(first.value, &first.unit, name);
            let accumulated = value_list.entry(name.clone()).or_insert_with(|| Accumulated {
                unit,
                values: Vec::new(),
                weights: Vec::new(),
            });
            accumulated.values.push(value);
            accumulated.weights.push(weight);
        }
    }

    value_list
        .into_iter()
        .map(|(name, accumulated)| {
            let value = units::average_sensor(
                &accumulated.values,
                &accumulated.weights,
                &accumulated.unit,
                &name,
            );
            (
                name,
                SensorValue {
                    unit: accumulated.unit,
                    value,
                },
            )
        })
        .collect()
}

/// Convert averaged canonical values to their presentation imperial units.
pub fn imperial_conditions(values: BTreeMap<String, SensorValue>) -> BTreeMap<String, SensorValue> {
    values
        .into_iter()
        .map(|(name, sensor)| {
            let (value, unit) = units::to_imperial(sensor.value, &sensor.unit, &name);
            (name, SensorValue { unit, value })
        })
        .collect()
}
