//! Per-station routes: latest conditions, history, metadata, and the two
//! SSE update streams.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::DateTime;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{sse_response, ApiError, AppState};
use crate::db::SqlValue;
use crate::types::WeatherMessage;

/// GET /station/{server}/{station}/conditions/ - latest persisted entry.
pub async fn conditions(
    State(state): State<AppState>,
    Path((server, station)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let entry = state
        .db
        .fetch_entry(
            "WHERE server.value = ? AND station.value = ?\nORDER BY time DESC",
            vec![server.into(), station.into()],
        )
        .await
        .map_err(|err| {
            log::error!("could not fetch entry: {err}");
            ApiError::internal()
        })?
        .ok_or_else(|| ApiError::not_found("Station not found"))?;

    Ok(Json(entry).into_response())
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    before: Option<String>,
    after: Option<String>,
    count: Option<String>,
    order: Option<String>,
}

const DEFAULT_HISTORY_COUNT: i64 = 25;

/// GET /station/{server}/{station}/conditions/history/ - past entries,
/// newest first unless `order=asc`.
pub async fn history(
    State(state): State<AppState>,
    Path((server, station)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let mut args: Vec<SqlValue> = vec![server.into(), station.into()];

    let order = match query.order.as_deref() {
        Some("asc") => "ASC",
        _ => "DESC",
    };

    let mut before_condition = "";
    if let Some(before) = query.before.filter(|value| !value.is_empty()) {
        let before = DateTime::parse_from_rfc3339(&before)
            .map_err(|err| ApiError::bad_request(format!("before: {err}")))?;
        before_condition = "AND time <= ?";
        args.push(before.timestamp_millis().into());
    }

    let mut after_condition = "";
    if let Some(after) = query.after.filter(|value| !value.is_empty()) {
        let after = DateTime::parse_from_rfc3339(&after)
            .map_err(|err| ApiError::bad_request(format!("after: {err}")))?;
        after_condition = "AND time >= ?";
        args.push(after.timestamp_millis().into());
    }

    let count = query
        .count
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(DEFAULT_HISTORY_COUNT);
    args.push(count.into());

    let condition = format!(
        "WHERE server.value = ? AND station.value = ?\n{before_condition} {after_condition}\nORDER BY time {order}\nLIMIT ?"
    );
    let entries = state.db.fetch_entries(&condition, args).await.map_err(|err| {
        log::error!("could not fetch entries: {err}");
        ApiError::internal()
    })?;

    Ok(Json(entries).into_response())
}

/// GET /station/{server}/{station}/info/ - station metadata.
pub async fn info(
    State(state): State<AppState>,
    Path((server, station)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let info = state
        .db
        .fetch_station_info(&server, &station)
        .await
        .map_err(|err| {
            log::error!("could not fetch station info: {err}");
            ApiError::internal()
        })?
        .ok_or_else(|| ApiError::not_found("No station found"))?;

    Ok(Json(info).into_response())
}

/// GET /station/{server}/{station}/conditions/updates/ - SSE stream of the
/// station's regular weather messages.
pub async fn updates(
    State(state): State<AppState>,
    Path((server, station)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let broker = state
        .brokers
        .get(&server)
        .cloned()
        .ok_or_else(|| ApiError::not_found("No station found"))?;
    require_known_station(&state, &server, &station).await?;

    let (listener, mut updates_rx) = mpsc::channel::<WeatherMessage>(1);
    broker.subscribe_weather_updates(&station, listener.clone()).await;

    let (frames_tx, frames_rx) = mpsc::channel::<String>(1);
    tokio::spawn(async move {
        forward_messages(&mut updates_rx, &frames_tx).await;
        broker.unsubscribe_weather_updates(&station, &listener).await;
    });

    Ok(sse_response(frames_rx))
}

/// GET /station/{server}/{station}/conditions/rapid/ - SSE stream of the
/// station's rapid weather messages, started on demand.
pub async fn rapid_updates(
    State(state): State<AppState>,
    Path((server, station)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let broker = state
        .brokers
        .get(&server)
        .cloned()
        .ok_or_else(|| ApiError::not_found("No station found"))?;
    require_known_station(&state, &server, &station).await?;

    let (listener, mut updates_rx) = mpsc::channel::<WeatherMessage>(1);
    broker
        .subscribe_rapid_updates(&station, listener.clone())
        .await
        .map_err(|err| {
            log::error!("could not start rapid weather updates: {err}");
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Could not start rapid weather updates",
            )
        })?;

    let (frames_tx, frames_rx) = mpsc::channel::<String>(1);
    tokio::spawn(async move {
        forward_messages(&mut updates_rx, &frames_tx).await;
        broker.unsubscribe_rapid_updates(&station, &listener).await;
    });

    Ok(sse_response(frames_rx))
}

async fn require_known_station(state: &AppState, server: &str, station: &str) -> Result<(), ApiError> {
    let updated = state
        .db
        .last_station_info_update(server, station)
        .await
        .map_err(|err| {
            log::error!("could not check station: {err}");
            ApiError::internal()
        })?;
    if updated.is_none() {
        return Err(ApiError::not_found("No station found"));
    }
    Ok(())
}

/// Forward raw weather messages as SSE frames until either side goes away.
async fn forward_messages(updates: &mut mpsc::Receiver<WeatherMessage>, frames: &mpsc::Sender<String>) {
    loop {
        tokio::select! {
            _ = frames.closed() => return,
            message = updates.recv() => {
                let Some(message) = message else { return };
                match serde_json::to_string(&message) {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => log::error!("could not encode update: {err}"),
                }
            }
        }
    }
}
