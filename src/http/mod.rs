//! HTTP surface.
//!
//! Routes, shared state, error bodies, and the live SSE aggregation loop
//! shared by the location and region update streams.

pub mod location;
pub mod region;
pub mod station;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::aggregate;
use crate::broker::Broker;
use crate::db::Database;
use crate::types::{StationEntry, WeatherEntry};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub brokers: Arc<HashMap<String, Broker>>,
}

/// An error response: `{"message": ...}` with the given status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Create the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/station/{server}/{station}/conditions/", get(station::conditions))
        .route("/station/{server}/{station}/conditions/history/", get(station::history))
        .route("/station/{server}/{station}/conditions/rapid/", get(station::rapid_updates))
        .route("/station/{server}/{station}/conditions/updates/", get(station::updates))
        .route("/station/{server}/{station}/info/", get(station::info))
        .route("/location/nearest/", get(location::nearest))
        .route("/location/conditions/", get(location::conditions))
        .route("/location/conditions/updates/", get(location::updates))
        .route("/region/search/", get(region::search))
        .route("/region/conditions/{country}/{region}/{city}/", get(region::conditions))
        .route(
            "/region/conditions/{country}/{region}/{city}/{district}/",
            get(region::conditions_district),
        )
        .route(
            "/region/conditions/updates/{country}/{region}/{city}/",
            get(region::updates),
        )
        .route(
            "/region/conditions/updates/{country}/{region}/{city}/{district}/",
            get(region::updates_district),
        )
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .with_state(state)
}

/// Wrap a stream of JSON frames as an SSE response. Every frame goes out as
/// `data: <json>\n\n`.
pub(crate) fn sse_response(frames: mpsc::Receiver<String>) -> Response {
    let stream = ReceiverStream::new(frames)
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame)));
    (
        [
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Sse::new(stream),
    )
        .into_response()
}

/// How a live stream weights its contributing stations.
pub(crate) enum WeightMode {
    /// Inverse-distance weights from the stations' distances to the query
    /// point.
    InverseDistance(Vec<f64>),
    /// Every station weighted 1/N over the snapshot entries.
    Uniform,
}

/// Stream live averaged conditions for a set of contributing stations.
///
/// Subscribes one channel per distinct upstream broker, seeds the state from
/// the current snapshot, emits one frame immediately and one more whenever
/// any contributing station updates. Teardown happens when the client goes
/// away and reverses every subscription made here.
pub(crate) async fn live_conditions(
    state: &AppState,
    stations: Vec<StationEntry>,
    mode: WeightMode,
) -> Result<Response, ApiError> {
    let mut raw_updates: HashMap<String, mpsc::Sender<crate::types::WeatherMessage>> = HashMap::new();
    let (updates_tx, mut updates_rx) = mpsc::channel::<WeatherEntry>(1);

    for station in &stations {
        let broker = state.brokers.get(&station.server).ok_or_else(|| {
            log::error!("couldn't find broker {}", station.server);
            ApiError::internal()
        })?;

        let listener = match raw_updates.get(&station.server) {
            Some(listener) => listener.clone(),
            None => {
                let (listener, mut raw_rx) = mpsc::channel::<crate::types::WeatherMessage>(1);
                raw_updates.insert(station.server.clone(), listener.clone());
                let server = station.server.clone();
                let updates_tx = updates_tx.clone();
                tokio::spawn(async move {
                    while let Some(message) = raw_rx.recv().await {
                        if updates_tx.send(message.to_entry(&server)).await.is_err() {
                            break;
                        }
                    }
                });
                listener
            }
        };
        broker.subscribe_weather_updates(&station.station, listener).await;
    }
    drop(updates_tx);

    let entries = aggregate::fetch_conditions(&state.db, &stations).await.map_err(|err| {
        log::error!("unable to fetch weather entries: {err}");
        ApiError::internal()
    })?;

    let weight_map: HashMap<String, f64> = match mode {
        WeightMode::InverseDistance(distances) => {
            let weights = aggregate::weights(&distances);
            stations
                .iter()
                .map(StationEntry::map_id)
                .zip(weights)
                .collect()
        }
        WeightMode::Uniform => {
            let weight = 1.0 / entries.len() as f64;
            stations
                .iter()
                .map(|station| (station.map_id(), weight))
                .collect()
        }
    };

    let mut conditions: HashMap<String, WeatherEntry> =
        entries.into_iter().map(|entry| (entry.map_id(), entry)).collect();

    let (frames_tx, frames_rx) = mpsc::channel::<String>(1);
    let state = state.clone();
    tokio::spawn(async move {
        emit_frame(&conditions, &weight_map, &frames_tx).await;
        loop {
            tokio::select! {
                _ = frames_tx.closed() => break,
                update = updates_rx.recv() => {
                    let Some(update) = update else { break };
                    conditions.insert(update.map_id(), update);
                    if !emit_frame(&conditions, &weight_map, &frames_tx).await {
                        break;
                    }
                }
            }
        }
        for station in &stations {
            if let (Some(broker), Some(listener)) = (
                state.brokers.get(&station.server),
                raw_updates.get(&station.server),
            ) {
                broker.unsubscribe_weather_updates(&station.station, listener).await;
            }
        }
    });

    Ok(sse_response(frames_rx))
}

/// Average the current per-station state and push one frame. Returns false
/// once the client is gone.
async fn emit_frame(
    conditions: &HashMap<String, WeatherEntry>,
    weights: &HashMap<String, f64>,
    frames: &mpsc::Sender<String>,
) -> bool {
    let entries: Vec<WeatherEntry> = conditions.values().cloned().collect();
    let averaged = aggregate::average_conditions(&entries, weights);
    let values = aggregate::imperial_conditions(averaged);
    match serde_json::to_string(&values) {
        Ok(frame) => frames.send(frame).await.is_ok(),
        Err(err) => {
            log::error!("unable to encode conditions frame: {err}");
            true
        }
    }
}
