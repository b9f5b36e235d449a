//! Latitude/longitude routes: nearest station, point-in-time aggregated
//! conditions, and the live aggregated stream.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;

use super::{live_conditions, ApiError, AppState, WeightMode};
use crate::aggregate;
use crate::geo;
use crate::types::{SensorValue, StationEntry};
use crate::units;

const DEFAULT_RANGE_KM: f64 = 15.0;

#[derive(Deserialize)]
pub struct LocationQuery {
    lat: Option<String>,
    lon: Option<String>,
    range: Option<String>,
}

impl LocationQuery {
    /// Parse lat/lon/range, reporting the offending parameter.
    fn parse(&self) -> Result<(f64, f64, f64), ApiError> {
        let (Some(lat), Some(lon)) = (&self.lat, &self.lon) else {
            return Err(ApiError::bad_request("lat and lon are required parameters"));
        };
        let range = match &self.range {
            Some(range) => range
                .parse()
                .map_err(|_| ApiError::bad_request("range must be a number"))?,
            None => DEFAULT_RANGE_KM,
        };
        let lat = lat
            .parse()
            .map_err(|_| ApiError::bad_request("lat must be a number"))?;
        let lon = lon
            .parse()
            .map_err(|_| ApiError::bad_request("lon must be a number"))?;
        Ok((lat, lon, range))
    }
}

/// GET /location/nearest/ - the station closest to the query point among
/// the bounding-box candidates.
pub async fn nearest(
    State(state): State<AppState>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lon, range) = query.parse()?;
    let (delta_lat, delta_lon) = geo::dist_to_lat_lon(lon, range);

    let entries = state
        .db
        .query_station_infos(
            "WHERE latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?",
            vec![
                (lat - delta_lat).into(),
                (lat + delta_lat).into(),
                (lon - delta_lon).into(),
                (lon + delta_lon).into(),
            ],
        )
        .await
        .map_err(|err| {
            log::error!("error while fetching nearest station: {err}");
            ApiError::internal()
        })?;

    let closest = entries
        .into_iter()
        .min_by(|a, b| {
            let da = geo::haversine(lat, lon, a.latitude, a.longitude);
            let db = geo::haversine(lat, lon, b.latitude, b.longitude);
            da.total_cmp(&db)
        })
        .ok_or_else(|| ApiError::not_found("Entry not found"))?;

    Ok(Json(closest).into_response())
}

/// GET /location/conditions/ - sensor values averaged over the stations in
/// range, weighted by inverse distance, in imperial units.
pub async fn conditions(
    State(state): State<AppState>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lon, range) = query.parse()?;

    let (stations, distances) = aggregate::find_nearest_stations(&state.db, lat, lon, range)
        .await
        .map_err(|err| {
            log::error!("unable to find nearest stations: {err}");
            ApiError::internal()
        })?;
    if stations.is_empty() {
        return Err(ApiError::not_found("No stations found"));
    }

    let entries = aggregate::fetch_conditions(&state.db, &stations).await.map_err(|err| {
        log::error!("unable to fetch weather entries: {err}");
        ApiError::internal()
    })?;

    if stations.len() == 1 {
        // A single station needs no weighting.
        let Some(entry) = entries.first() else {
            return Err(ApiError::not_found("No stations found"));
        };
        let mut values = std::collections::BTreeMap::new();
        for (name, sensors) in &entry.sensors {
            let Some(first) = sensors.first() else { continue };
            let (value, unit) = units::to_metric(first.value, &first.unit, name);
            values.insert(name.clone(), SensorValue { unit, value });
        }
        return Ok(Json(aggregate::imperial_conditions(values)).into_response());
    }

    let weights = aggregate::weights(&distances);
    let weight_map: HashMap<String, f64> = stations
        .iter()
        .map(StationEntry::map_id)
        .zip(weights)
        .collect();

    let averaged = aggregate::average_conditions(&entries, &weight_map);
    Ok(Json(aggregate::imperial_conditions(averaged)).into_response())
}

/// GET /location/conditions/updates/ - SSE stream re-averaging whenever any
/// in-range station reports.
pub async fn updates(
    State(state): State<AppState>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lon, range) = query.parse()?;

    let (stations, distances) = aggregate::find_nearest_stations(&state.db, lat, lon, range)
        .await
        .map_err(|err| {
            log::error!("unable to find nearest stations: {err}");
            ApiError::internal()
        })?;
    if stations.is_empty() {
        return Err(ApiError::not_found("No stations found"));
    }

    live_conditions(&state, stations, WeightMode::InverseDistance(distances)).await
}
