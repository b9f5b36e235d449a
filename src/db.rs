//! Persistence layer.
//!
//! Wraps `rusqlite::Connection` and provides the high-level database
//! methods. Every string-valued column is interned into the
//! `lookup_strings` table and referenced by integer id; callers pass
//! condition fragments that reference the joined aliases (`station.value`,
//! `server.value`, `time`, ...).

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{SensorMap, SensorValue, StationEntry, StationKey, WeatherEntry};

/// Dynamically-typed SQL parameter for condition fragments.
pub type SqlValue = rusqlite::types::Value;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lookup_strings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    value TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS weather_entry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    station_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    server_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS weather_entry_station_time
    ON weather_entry (server_id, station_id, time);

CREATE TABLE IF NOT EXISTS sensor_value (
    entry_id INTEGER NOT NULL REFERENCES weather_entry (id),
    name_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    sensor_number INTEGER NOT NULL,
    unit_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    value REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS sensor_value_entry ON sensor_value (entry_id);

CREATE TABLE IF NOT EXISTS station (
    server_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    station_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    make_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    model_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    software_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    version_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    elevation REAL NOT NULL,
    district_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    city_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    region_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    country_id INTEGER NOT NULL REFERENCES lookup_strings (id),
    rapid_weather INTEGER NOT NULL,
    updated INTEGER NOT NULL,
    UNIQUE (server_id, station_id)
);
"#;

/// Build the `lookup_strings` joins for the given string-valued columns of
/// `table`, aliasing each join by the column name.
pub fn gen_string_joins(table: &str, properties: &[&str]) -> String {
    let mut joins = String::new();
    for property in properties {
        joins.push_str(&format!(
            "JOIN lookup_strings {property} ON {table}.{property}_id = {property}.id\n"
        ));
    }
    joins
}

const STATION_PROPERTIES: &[&str] = &[
    "make", "model", "software", "version", "district", "city", "region", "country", "server",
    "station",
];

const STATION_COLUMNS: &str = "server.value, station.value, make.value, model.value, \
     software.value, version.value, latitude, longitude, elevation, district.value, \
     city.value, region.value, country.value, rapid_weather, updated";

/// Wraps the SQLite connection and provides the high-level database methods.
#[derive(Clone)]
pub struct Database {
    connection: Arc<Mutex<rusqlite::Connection>>,
}

impl Database {
    /// Open (or create) the database and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let connection = rusqlite::Connection::open(path)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Append a weather reading, interning every string it references.
    /// Returns the new entry's row id.
    pub async fn insert_weather_entry(&self, entry: &WeatherEntry) -> Result<i64> {
        let connection = self.connection.lock().await;

        let mut strings = vec![entry.station.clone(), entry.server.clone()];
        for (name, sensors) in &entry.sensors {
            strings.push(name.clone());
            for sensor in sensors {
                strings.push(sensor.unit.clone());
            }
        }
        let lookup = get_or_insert_lookup_strings(&connection, &strings)?;
        let id_of = |value: &str| lookup.get(value).copied().unwrap_or_default();

        connection
            .prepare_cached("INSERT INTO weather_entry (station_id, server_id, time) VALUES (?1, ?2, ?3)")?
            .execute(params![
                id_of(&entry.station),
                id_of(&entry.server),
                entry.time.timestamp_millis(),
            ])?;
        let entry_id = connection.last_insert_rowid();

        let mut placeholders = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        for (name, sensors) in &entry.sensors {
            for (number, sensor) in sensors.iter().enumerate() {
                placeholders.push("(?, ?, ?, ?, ?)");
                args.push(entry_id.into());
                args.push(id_of(name).into());
                args.push((number as i64).into());
                args.push(id_of(&sensor.unit).into());
                args.push(sensor.value.into());
            }
        }
        if !placeholders.is_empty() {
            let query = format!(
                "INSERT INTO sensor_value (entry_id, name_id, sensor_number, unit_id, value) VALUES {}",
                placeholders.join(", ")
            );
            connection.execute(&query, params_from_iter(args))?;
        }

        Ok(entry_id)
    }

    /// Fetch the first weather entry matching the condition fragment, or
    /// `None` when nothing matches.
    pub async fn fetch_entry(&self, condition: &str, args: Vec<SqlValue>) -> Result<Option<WeatherEntry>> {
        let connection = self.connection.lock().await;
        let query = format!(
            "SELECT weather_entry.id, station.value, server.value, time FROM weather_entry\n{}{}\nLIMIT 1",
            gen_string_joins("weather_entry", &["station", "server"]),
            condition,
        );
        let row = connection
            .prepare(&query)?
            .query_row(params_from_iter(args), get_entry_row)
            .optional()?;
        match row {
            Some((id, station, server, time)) => Ok(Some(WeatherEntry {
                station,
                server,
                time: millis_to_datetime(time),
                sensors: fetch_entry_sensors(&connection, id)?,
            })),
            None => Ok(None),
        }
    }

    /// Fetch every weather entry matching the condition fragment.
    pub async fn fetch_entries(&self, condition: &str, args: Vec<SqlValue>) -> Result<Vec<WeatherEntry>> {
        let connection = self.connection.lock().await;
        let query = format!(
            "SELECT weather_entry.id, station.value, server.value, time FROM weather_entry\n{}{}",
            gen_string_joins("weather_entry", &["station", "server"]),
            condition,
        );
        let rows: Vec<(i64, String, String, i64)> = connection
            .prepare(&query)?
            .query_map(params_from_iter(args), get_entry_row)?
            .collect::<rusqlite::Result<_>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, station, server, time) in rows {
            entries.push(WeatherEntry {
                station,
                server,
                time: millis_to_datetime(time),
                sensors: fetch_entry_sensors(&connection, id)?,
            });
        }
        Ok(entries)
    }

    /// Insert or refresh a station's metadata. At most one row ever exists
    /// per (server, station).
    pub async fn update_station_info(&self, entry: &StationEntry) -> Result<()> {
        let connection = self.connection.lock().await;
        let lookup = get_or_insert_lookup_strings(
            &connection,
            &[
                entry.server.clone(),
                entry.station.clone(),
                entry.make.clone(),
                entry.model.clone(),
                entry.software.clone(),
                entry.version.clone(),
                entry.district.clone(),
                entry.city.clone(),
                entry.region.clone(),
                entry.country.clone(),
            ],
        )?;
        let id_of = |value: &str| lookup.get(value).copied().unwrap_or_default();

        let count: i64 = connection
            .prepare_cached("SELECT COUNT(station_id) FROM station WHERE server_id = ?1 AND station_id = ?2")?
            .query_row(params![id_of(&entry.server), id_of(&entry.station)], |row| row.get(0))?;

        let query = if count > 0 {
            "UPDATE station SET
                make_id = ?1, model_id = ?2, software_id = ?3, version_id = ?4,
                latitude = ?5, longitude = ?6, elevation = ?7,
                district_id = ?8, city_id = ?9, region_id = ?10, country_id = ?11,
                rapid_weather = ?12, updated = ?13
             WHERE server_id = ?14 AND station_id = ?15"
        } else {
            "INSERT INTO station (
                make_id, model_id, software_id, version_id,
                latitude, longitude, elevation,
                district_id, city_id, region_id, country_id,
                rapid_weather, updated, server_id, station_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        };
        connection.prepare_cached(query)?.execute(params![
            id_of(&entry.make),
            id_of(&entry.model),
            id_of(&entry.software),
            id_of(&entry.version),
            entry.latitude,
            entry.longitude,
            entry.elevation,
            id_of(&entry.district),
            id_of(&entry.city),
            id_of(&entry.region),
            id_of(&entry.country),
            entry.rapid_weather,
            entry.updated.timestamp_millis(),
            id_of(&entry.server),
            id_of(&entry.station),
        ])?;
        Ok(())
    }

    /// When the station's metadata was last refreshed, or `None` when the
    /// station has never been seen.
    pub async fn last_station_info_update(&self, server: &str, station: &str) -> Result<Option<DateTime<Utc>>> {
        let connection = self.connection.lock().await;
        let query = format!(
            "SELECT updated FROM station\n{}WHERE server.value = ?1 AND station.value = ?2",
            gen_string_joins("station", &["server", "station"]),
        );
        let updated: Option<i64> = connection
            .prepare_cached(&query)?
            .query_row(params![server, station], |row| row.get(0))
            .optional()?;
        Ok(updated.map(millis_to_datetime))
    }

    /// Fetch a single station's metadata, or `None` when unknown.
    pub async fn fetch_station_info(&self, server: &str, station: &str) -> Result<Option<StationEntry>> {
        let connection = self.connection.lock().await;
        let query = format!(
            "SELECT {STATION_COLUMNS} FROM station\n{}WHERE server.value = ?1 AND station.value = ?2\nLIMIT 1",
            gen_string_joins("station", STATION_PROPERTIES),
        );
        let result = connection
            .prepare_cached(&query)?
            .query_row(params![server, station], get_station_entry)
            .optional()?;
        Ok(result)
    }

    /// Fetch metadata for a batch of stations in one query.
    pub async fn fetch_station_infos(&self, stations: &[StationKey]) -> Result<Vec<StationEntry>> {
        if stations.is_empty() {
            return Ok(Vec::new());
        }
        let conditions: Vec<&str> = stations
            .iter()
            .map(|_| "(server.value = ? AND station.value = ?)")
            .collect();
        let mut args: Vec<SqlValue> = Vec::with_capacity(stations.len() * 2);
        for station in stations {
            args.push(station.server.clone().into());
            args.push(station.station.clone().into());
        }
        let condition = format!("WHERE {}", conditions.join(" OR "));
        self.query_station_infos(&condition, args).await
    }

    /// Fetch every station matching the condition fragment.
    pub async fn query_station_infos(&self, condition: &str, args: Vec<SqlValue>) -> Result<Vec<StationEntry>> {
        let connection = self.connection.lock().await;
        let query = format!(
            "SELECT {STATION_COLUMNS} FROM station\n{}{}",
            gen_string_joins("station", STATION_PROPERTIES),
            condition,
        );
        let entries = connection
            .prepare(&query)?
            .query_map(params_from_iter(args), get_station_entry)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(entries)
    }

    /// Distinct (country, region, city, district) tuples matching the
    /// condition fragment.
    pub async fn query_regions(&self, condition: &str, args: Vec<SqlValue>) -> Result<Vec<crate::types::RegionMatch>> {
        let connection = self.connection.lock().await;
        let query = format!(
            "SELECT DISTINCT country.value, region.value, city.value, district.value FROM station\n{}{}",
            gen_string_joins("station", &["district", "city", "region", "country"]),
            condition,
        );
        let matches = connection
            .prepare(&query)?
            .query_map(params_from_iter(args), |row| {
                Ok(crate::types::RegionMatch {
                    country: row.get(0)?,
                    region: row.get(1)?,
                    city: row.get(2)?,
                    district: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(matches)
    }
}

/// Map a `(id, station, server, time)` header row.
fn get_entry_row(row: &Row) -> rusqlite::Result<(i64, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

/// Builds a `StationEntry` from a full station row.
fn get_station_entry(row: &Row) -> rusqlite::Result<StationEntry> {
    Ok(StationEntry {
        server: row.get(0)?,
        station: row.get(1)?,
        make: row.get(2)?,
        model: row.get(3)?,
        software: row.get(4)?,
        version: row.get(5)?,
        latitude: row.get(6)?,
        longitude: row.get(7)?,
        elevation: row.get(8)?,
        district: row.get(9)?,
        city: row.get(10)?,
        region: row.get(11)?,
        country: row.get(12)?,
        rapid_weather: row.get(13)?,
        updated: millis_to_datetime(row.get(14)?),
    })
}

/// All `sensor_value` rows of an entry, grouped by sensor name. Insertion
/// order keeps the per-name lists in sensor-number order.
fn fetch_entry_sensors(connection: &rusqlite::Connection, entry_id: i64) -> Result<SensorMap> {
    let query = format!(
        "SELECT sensor_number, name.value, unit.value, sensor_value.value FROM sensor_value\n{}WHERE entry_id = ?1\nORDER BY name_id ASC, unit_id ASC",
        gen_string_joins("sensor_value", &["name", "unit"]),
    );
    let mut statement = connection.prepare_cached(&query)?;
    let mut rows = statement.query(params![entry_id])?;

    let mut sensors = SensorMap::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let unit: String = row.get(2)?;
        let value: f64 = row.get(3)?;
        sensors.entry(name).or_default().push(SensorValue { unit, value });
    }
    Ok(sensors)
}

/// Intern a batch of strings, returning the id of every one of them.
/// Concurrent inserters of the same batch race on the unique index; the
/// conflict is swallowed and the loser re-reads the winner's ids.
pub fn get_or_insert_lookup_strings(
    connection: &rusqlite::Connection,
    strings: &[String],
) -> Result<HashMap<String, i64>> {
    let unique = make_unique(strings);
    let mut found = fetch_lookup_strings(connection, &unique)?;
    let to_create: Vec<String> = unique
        .iter()
        .filter(|value| !found.contains_key(*value))
        .cloned()
        .collect();
    if !to_create.is_empty() {
        insert_lookup_strings(connection, &to_create)?;
        found.extend(fetch_lookup_strings(connection, &to_create)?);
    }
    Ok(found)
}

fn fetch_lookup_strings(connection: &rusqlite::Connection, strings: &[String]) -> Result<HashMap<String, i64>> {
    if strings.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; strings.len()].join(", ");
    let query = format!("SELECT id, value FROM lookup_strings WHERE value IN ({placeholders})");
    let mut statement = connection.prepare(&query)?;
    let mut rows = statement.query(params_from_iter(strings))?;

    let mut found = HashMap::new();
    while let Some(row) = rows.next()? {
        found.insert(row.get::<_, String>(1)?, row.get::<_, i64>(0)?);
    }
    Ok(found)
}

fn insert_lookup_strings(connection: &rusqlite::Connection, strings: &[String]) -> Result<()> {
    let placeholders = vec!["(?)"; strings.len()].join(", ");
    let query =
        format!("INSERT INTO lookup_strings (value) VALUES {placeholders} ON CONFLICT (value) DO NOTHING");
    connection.execute(&query, params_from_iter(strings))?;
    Ok(())
}

fn make_unique(strings: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    strings
        .iter()
        .filter(|value| seen.insert(value.as_str()))
        .cloned()
        .collect()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorValue;

    fn sample_entry(station: &str, server: &str, millis: i64) -> WeatherEntry {
        let mut sensors = SensorMap::new();
        sensors.insert(
            "temp".to_string(),
            vec![
                SensorValue { unit: "c".to_string(), value: 4.5 },
                SensorValue { unit: "c".to_string(), value: 4.7 },
            ],
        );
        sensors.insert(
            "wind_speed".to_string(),
            vec![SensorValue { unit: "mps".to_string(), value: 2.0 }],
        );
        WeatherEntry {
            station: station.to_string(),
            server: server.to_string(),
            time: millis_to_datetime(millis),
            sensors,
        }
    }

    fn sample_station(station: &str, server: &str, lat: f64, lon: f64) -> StationEntry {
        StationEntry {
            server: server.to_string(),
            station: station.to_string(),
            make: "Acme".to_string(),
            model: "WX-1".to_string(),
            software: "acmewx".to_string(),
            version: "1.2".to_string(),
            latitude: lat,
            longitude: lon,
            elevation: 120.0,
            district: "Downtown".to_string(),
            city: "Portland".to_string(),
            region: "Oregon".to_string(),
            country: "US".to_string(),
            rapid_weather: true,
            updated: millis_to_datetime(1_700_000_000_000),
        }
    }

    async fn lookup_count(db: &Database) -> i64 {
        db.connection
            .lock()
            .await
            .query_row("SELECT COUNT(*) FROM lookup_strings", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn insert_then_fetch_round_trips() {
        let db = Database::open(":memory:").unwrap();
        let entry = sample_entry("s1", "b1", 1_700_000_000_000);
        db.insert_weather_entry(&entry).await.unwrap();

        let fetched = db
            .fetch_entry(
                "WHERE server.value = ? AND station.value = ?\nORDER BY time DESC",
                vec!["b1".to_string().into(), "s1".to_string().into()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, entry);
    }

    #[tokio::test]
    async fn fetch_entry_returns_none_on_empty_database() {
        let db = Database::open(":memory:").unwrap();
        let fetched = db
            .fetch_entry(
                "WHERE server.value = ? AND station.value = ?\nORDER BY time DESC",
                vec!["b1".to_string().into(), "s1".to_string().into()],
            )
            .await
            .unwrap();
        assert_eq!(fetched, None);
    }

    #[tokio::test]
    async fn lookup_strings_are_interned_once() {
        let db = Database::open(":memory:").unwrap();
        let entry = sample_entry("s1", "b1", 1_700_000_000_000);
        db.insert_weather_entry(&entry).await.unwrap();
        let count = lookup_count(&db).await;
        db.insert_weather_entry(&entry).await.unwrap();
        assert_eq!(lookup_count(&db).await, count);
    }

    #[tokio::test]
    async fn repeated_lookup_insert_is_not_fatal() {
        let db = Database::open(":memory:").unwrap();
        let connection = db.connection.lock().await;
        let strings = vec!["alpha".to_string(), "beta".to_string()];
        let first = get_or_insert_lookup_strings(&connection, &strings).unwrap();
        // A racing writer has already inserted the same values.
        insert_lookup_strings(&connection, &strings).unwrap();
        let second = get_or_insert_lookup_strings(&connection, &strings).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn station_info_upserts_single_row() {
        let db = Database::open(":memory:").unwrap();
        let mut station = sample_station("s1", "b1", 45.5, -122.6);
        db.update_station_info(&station).await.unwrap();
        station.model = "WX-2".to_string();
        station.updated = millis_to_datetime(1_700_000_100_000);
        db.update_station_info(&station).await.unwrap();

        let infos = db
            .fetch_station_infos(&[StationKey {
                server: "b1".to_string(),
                station: "s1".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0], station);
    }

    #[tokio::test]
    async fn last_station_info_update_absent_is_none() {
        let db = Database::open(":memory:").unwrap();
        assert_eq!(db.last_station_info_update("b1", "ghost").await.unwrap(), None);

        let station = sample_station("s1", "b1", 45.5, -122.6);
        db.update_station_info(&station).await.unwrap();
        assert_eq!(
            db.last_station_info_update("b1", "s1").await.unwrap(),
            Some(station.updated)
        );
    }

    #[tokio::test]
    async fn fetch_station_info_single() {
        let db = Database::open(":memory:").unwrap();
        assert_eq!(db.fetch_station_info("b1", "s1").await.unwrap(), None);
        let station = sample_station("s1", "b1", 45.5, -122.6);
        db.update_station_info(&station).await.unwrap();
        assert_eq!(db.fetch_station_info("b1", "s1").await.unwrap(), Some(station));
    }

    #[tokio::test]
    async fn fetch_station_infos_batches_keys() {
        let db = Database::open(":memory:").unwrap();
        db.update_station_info(&sample_station("s1", "b1", 45.5, -122.6)).await.unwrap();
        db.update_station_info(&sample_station("s2", "b1", 45.6, -122.7)).await.unwrap();
        db.update_station_info(&sample_station("s1", "b2", 45.7, -122.8)).await.unwrap();

        let keys = vec![
            StationKey { server: "b1".to_string(), station: "s1".to_string() },
            StationKey { server: "b2".to_string(), station: "s1".to_string() },
        ];
        let infos = db.fetch_station_infos(&keys).await.unwrap();
        assert_eq!(infos.len(), 2);
    }

    #[tokio::test]
    async fn fetch_entries_orders_by_time() {
        let db = Database::open(":memory:").unwrap();
        db.insert_weather_entry(&sample_entry("s1", "b1", 1_000)).await.unwrap();
        db.insert_weather_entry(&sample_entry("s1", "b1", 3_000)).await.unwrap();
        db.insert_weather_entry(&sample_entry("s1", "b1", 2_000)).await.unwrap();

        let entries = db
            .fetch_entries(
                "WHERE server.value = ? AND station.value = ?\nORDER BY time DESC\nLIMIT ?",
                vec![
                    "b1".to_string().into(),
                    "s1".to_string().into(),
                    SqlValue::Integer(2),
                ],
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].time, millis_to_datetime(3_000));
        assert_eq!(entries[1].time, millis_to_datetime(2_000));
    }

    #[tokio::test]
    async fn sensor_lists_preserve_number_order() {
        let db = Database::open(":memory:").unwrap();
        let entry = sample_entry("s1", "b1", 1_700_000_000_000);
        db.insert_weather_entry(&entry).await.unwrap();
        let fetched = db
            .fetch_entry(
                "WHERE server.value = ? AND station.value = ?\nORDER BY time DESC",
                vec!["b1".to_string().into(), "s1".to_string().into()],
            )
            .await
            .unwrap()
            .unwrap();
        let temps = &fetched.sensors["temp"];
        assert_eq!(temps.len(), 2);
        assert_eq!(temps[0].value, 4.5);
        assert_eq!(temps[1].value, 4.7);
    }
}
