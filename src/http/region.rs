//! Administrative-region routes: free-form region search, aggregated
//! conditions, and the live aggregated stream.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;

use super::{live_conditions, ApiError, AppState, WeightMode};
use crate::aggregate;
use crate::geo::decode_uri;
use crate::types::StationEntry;

#[derive(Deserialize)]
pub struct SearchQuery {
    a: Option<String>,
    b: Option<String>,
    c: Option<String>,
    d: Option<String>,
}

/// GET /region/search/ - resolve up to four free-form tokens into known
/// (country, region, city, district) tuples.
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let tokens: Vec<String> = [&query.a, &query.b, &query.c, &query.d]
        .into_iter()
        .flatten()
        .map(|token| decode_uri(token))
        .filter(|token| !token.is_empty())
        .collect();
    if tokens.is_empty() || tokens.len() > 4 {
        return Err(ApiError::bad_request(
            "Must have between 1 and 4 value parameters",
        ));
    }

    let regions = aggregate::search_region(&state.db, &tokens).await.map_err(|err| {
        log::error!("could not search region: {err}");
        ApiError::internal()
    })?;

    Ok(Json(regions).into_response())
}

/// GET /region/conditions/{country}/{region}/{city}/
pub async fn conditions(
    state: State<AppState>,
    Path((country, region, city)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    region_conditions(state, country, region, city, String::new()).await
}

/// GET /region/conditions/{country}/{region}/{city}/{district}/
pub async fn conditions_district(
    state: State<AppState>,
    Path((country, region, city, district)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    region_conditions(state, country, region, city, district).await
}

/// GET /region/conditions/updates/{country}/{region}/{city}/
pub async fn updates(
    state: State<AppState>,
    Path((country, region, city)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    region_updates(state, country, region, city, String::new()).await
}

/// GET /region/conditions/updates/{country}/{region}/{city}/{district}/
pub async fn updates_district(
    state: State<AppState>,
    Path((country, region, city, district)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    region_updates(state, country, region, city, district).await
}

async fn find_stations(
    state: &AppState,
    country: &str,
    region: &str,
    city: &str,
    district: &str,
) -> Result<Vec<StationEntry>, ApiError> {
    let stations = aggregate::find_region_stations(
        &state.db,
        &decode_uri(district),
        &decode_uri(city),
        &decode_uri(region),
        &decode_uri(country),
    )
    .await
    .map_err(|err| {
        log::error!("could not fetch region stations: {err}");
        ApiError::internal()
    })?;
    if stations.is_empty() {
        return Err(ApiError::not_found("Region not found"));
    }
    Ok(stations)
}

async fn region_conditions(
    State(state): State<AppState>,
    country: String,
    region: String,
    city: String,
    district: String,
) -> Result<Response, ApiError> {
    let stations = find_stations(&state, &country, &region, &city, &district).await?;

    let entries = aggregate::fetch_conditions(&state.db, &stations).await.map_err(|err| {
        log::error!("could not fetch region entries: {err}");
        ApiError::internal()
    })?;

    // Regions are not distance-ranked; every station weighs the same.
    let weight = 1.0 / entries.len() as f64;
    let weight_map: HashMap<String, f64> = stations
        .iter()
        .map(|station| (station.map_id(), weight))
        .collect();

    let averaged = aggregate::average_conditions(&entries, &weight_map);
    Ok(Json(aggregate::imperial_conditions(averaged)).into_response())
}

async fn region_updates(
    State(state): State<AppState>,
    country: String,
    region: String,
    city: String,
    district: String,
) -> Result<Response, ApiError> {
    let stations = find_stations(&state, &country, &region, &city, &district).await?;
    live_conditions(&state, stations, WeightMode::Uniform).await
}
