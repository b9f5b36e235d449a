//! Upstream broker client.
//!
//! One `Broker` per configured upstream. A single wildcard subscription
//! covers every station's weather topic; downstream listeners register per
//! station and are fanned out to from the message dispatch path, so the
//! upstream subscription count is independent of the downstream listener
//! count. Rapid-weather streams are demand-driven: they exist only while at
//! least one listener is attached and must be kept alive with periodic
//! request messages.

use chrono::{Duration as StaleDuration, Utc};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::db::Database;
use crate::error::{GatewayError, Result};
use crate::types::{RequestMessage, StationEntry, StationMessage, WeatherMessage};
use crate::units;

pub const WEATHER_TOPIC: &str = "/station/weather/+";
const WEATHER_PREFIX: &str = "/station/weather/";
const RAPID_PREFIX: &str = "/station/rapid-weather/";
const INFO_PREFIX: &str = "/station/info/";

/// Cadence of rapid-weather keep-alive requests.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(50);
/// Delay between subscribing to a station's info topic and requesting the
/// report, so the subscription settles first.
const INFO_SETTLE_DELAY: Duration = Duration::from_millis(250);
/// Bounded wait for a station-info response.
const INFO_TIMEOUT: Duration = Duration::from_secs(5);
/// Station metadata older than this is refreshed on the next reading.
const INFO_STALE_HOURS: i64 = 24;

pub type WeatherSender = mpsc::Sender<WeatherMessage>;

fn rapid_topic(station: &str) -> String {
    format!("{RAPID_PREFIX}{station}")
}

fn info_topic(station: &str) -> String {
    format!("{INFO_PREFIX}{station}")
}

fn request_topic(station: &str) -> String {
    format!("/station/request/{station}")
}

/// Rewrite every sensor value of a message to its canonical metric unit.
pub fn normalize_to_metric(message: &mut WeatherMessage) {
    for (name, sensors) in message.sensors.iter_mut() {
        for sensor in sensors.iter_mut() {
            let (value, unit) = units::to_metric(sensor.value, &sensor.unit, name);
            sensor.value = value;
            sensor.unit = unit;
        }
    }
}

/// Fan-out point for one station's rapid-weather stream. Owns the broker
/// subscription: the keep-alive task it spawns is the only place that
/// unsubscribes, after the last listener leaves.
struct RapidMux {
    listeners: Vec<WeatherSender>,
    done: Option<oneshot::Sender<()>>,
}

struct BrokerInner {
    name: String,
    client: AsyncClient,
    db: Database,
    station_updates: Mutex<HashMap<String, Vec<WeatherSender>>>,
    rapid_updates: Mutex<HashMap<String, RapidMux>>,
    pending_info: Mutex<HashMap<String, Vec<oneshot::Sender<StationMessage>>>>,
}

/// Cheap-to-clone handle on a single upstream broker client.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Connect to the broker, subscribe to the station weather wildcard, and
    /// spawn the dispatch task. A connection refusal is a construction
    /// failure, not a retry.
    pub async fn connect(db: Database, client_id: &str, name: &str, url: &str) -> Result<Self> {
        let (host, port) = parse_broker_url(url)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // Drive the event loop until CONNACK so a dead broker fails bootstrap.
        loop {
            if let Event::Incoming(Packet::ConnAck(ack)) = event_loop.poll().await? {
                if ack.code != ConnectReturnCode::Success {
                    return Err(GatewayError::Broker(format!(
                        "{name}: connection refused: {:?}",
                        ack.code
                    )));
                }
                break;
            }
        }

        client.subscribe(WEATHER_TOPIC, QoS::AtMostOnce).await?;

        let broker = Self {
            inner: Arc::new(BrokerInner {
                name: name.to_string(),
                client,
                db,
                station_updates: Mutex::new(HashMap::new()),
                rapid_updates: Mutex::new(HashMap::new()),
                pending_info: Mutex::new(HashMap::new()),
            }),
        };

        tokio::spawn(broker.clone().run_event_loop(event_loop));

        Ok(broker)
    }

    /// The configured name of this broker, used as the `server` tag.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) {
        if let Err(err) = self.inner.client.disconnect().await {
            log::warn!("{}: disconnect failed: {err}", self.inner.name);
        }
    }

    async fn run_event_loop(self, mut event_loop: EventLoop) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Reconnected; the broker has forgotten our subscriptions.
                    self.restore_subscriptions().await;
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("{}: connection error: {err}", self.inner.name);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn restore_subscriptions(&self) {
        let inner = &self.inner;
        log::info!("{}: restoring subscriptions after reconnect", inner.name);
        if let Err(err) = inner.client.subscribe(WEATHER_TOPIC, QoS::AtMostOnce).await {
            log::warn!("{}: could not restore weather subscription: {err}", inner.name);
        }
        for station in inner.rapid_updates.lock().await.keys() {
            if let Err(err) = inner.client.subscribe(rapid_topic(station), QoS::AtLeastOnce).await {
                log::warn!("{}: could not restore rapid subscription for {station}: {err}", inner.name);
            }
        }
        for station in inner.pending_info.lock().await.keys() {
            if let Err(err) = inner.client.subscribe(info_topic(station), QoS::AtLeastOnce).await {
                log::warn!("{}: could not restore info subscription for {station}: {err}", inner.name);
            }
        }
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) {
        if let Some(station) = topic.strip_prefix(RAPID_PREFIX) {
            self.handle_rapid(station, payload).await;
        } else if let Some(station) = topic.strip_prefix(INFO_PREFIX) {
            self.handle_info(station, payload).await;
        } else if topic.starts_with(WEATHER_PREFIX) {
            self.handle_weather(payload).await;
        }
    }

    /// Regular weather reading: normalize, fan out, persist, and refresh
    /// stale station metadata.
    async fn handle_weather(&self, payload: &[u8]) {
        let inner = &self.inner;
        let mut message: WeatherMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("{}: unable to parse weather message: {err}", inner.name);
                return;
            }
        };
        normalize_to_metric(&mut message);

        let listeners = {
            inner
                .station_updates
                .lock()
                .await
                .get(&message.id)
                .cloned()
                .unwrap_or_default()
        };
        for listener in &listeners {
            // Rendezvous semantics: a slow listener back-pressures dispatch.
            let _ = listener.send(message.clone()).await;
        }

        let entry = message.to_entry(&inner.name);
        if let Err(err) = inner.db.insert_weather_entry(&entry).await {
            log::error!("{}: unable to save weather entry: {err}", inner.name);
            return;
        }
        log::debug!("{}: stored weather for {}", inner.name, entry.station);

        match inner.db.last_station_info_update(&inner.name, &message.id).await {
            Ok(updated) => {
                let stale = updated
                    .map_or(true, |at| Utc::now() - at > StaleDuration::hours(INFO_STALE_HOURS));
                if stale {
                    // The info response arrives through this same event
                    // loop; fetching inline would deadlock dispatch.
                    let broker = self.clone();
                    let station = message.id.clone();
                    tokio::spawn(async move {
                        match broker.fetch_station_info(&station).await {
                            Ok(info) => log::info!(
                                "{}: fetched station info for {}",
                                broker.inner.name,
                                info.station
                            ),
                            Err(err) => log::warn!(
                                "{}: unable to fetch station info for {station}: {err}",
                                broker.inner.name
                            ),
                        }
                    });
                }
            }
            Err(err) => log::error!("{}: unable to check station in db: {err}", inner.name),
        }
    }

    /// Rapid reading: normalize and fan out to the station's mux. Rapid
    /// readings are not persisted.
    async fn handle_rapid(&self, station: &str, payload: &[u8]) {
        let inner = &self.inner;
        let mut message: WeatherMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("{}: unable to parse rapid-weather message: {err}", inner.name);
                return;
            }
        };
        normalize_to_metric(&mut message);

        let listeners = {
            match inner.rapid_updates.lock().await.get(station) {
                Some(mux) => mux.listeners.clone(),
                None => return,
            }
        };
        for listener in &listeners {
            let _ = listener.send(message.clone()).await;
        }
    }

    /// Station info response: resolve every waiter for the station.
    async fn handle_info(&self, station: &str, payload: &[u8]) {
        let inner = &self.inner;
        let message: StationMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("{}: unable to parse station info for {station}: {err}", inner.name);
                return;
            }
        };
        let waiters = inner
            .pending_info
            .lock()
            .await
            .remove(station)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(message.clone());
        }
    }

    /// Request a station's metadata from the broker and upsert it.
    pub async fn fetch_station_info(&self, station: &str) -> Result<StationEntry> {
        let inner = &self.inner;
        let (waiter_tx, waiter_rx) = oneshot::channel();
        inner
            .pending_info
            .lock()
            .await
            .entry(station.to_string())
            .or_default()
            .push(waiter_tx);

        let topic = info_topic(station);
        inner.client.subscribe(&topic, QoS::AtLeastOnce).await?;
        tokio::time::sleep(INFO_SETTLE_DELAY).await;

        let request = serde_json::to_vec(&RequestMessage::info())?;
        inner
            .client
            .publish(request_topic(station), QoS::AtLeastOnce, false, request)
            .await?;

        let message = match tokio::time::timeout(INFO_TIMEOUT, waiter_rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) | Err(_) => {
                let _ = inner.client.unsubscribe(&topic).await;
                self.drop_closed_waiters(station).await;
                return Err(GatewayError::StationInfoTimeout);
            }
        };

        let info = message.to_entry(&inner.name, station, Utc::now());
        inner.db.update_station_info(&info).await?;
        inner.client.unsubscribe(&topic).await?;
        Ok(info)
    }

    async fn drop_closed_waiters(&self, station: &str) {
        let mut pending = self.inner.pending_info.lock().await;
        if let Some(waiters) = pending.get_mut(station) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                pending.remove(station);
            }
        }
    }

    /// Attach a listener for a station's regular weather updates. The
    /// wildcard subscription already covers the topic; this only touches the
    /// listener set.
    pub async fn subscribe_weather_updates(&self, station: &str, listener: WeatherSender) {
        self.inner
            .station_updates
            .lock()
            .await
            .entry(station.to_string())
            .or_default()
            .push(listener);
    }

    /// Detach a listener. Returns whether the listener was attached; the
    /// station's entry is removed with its last listener.
    pub async fn unsubscribe_weather_updates(&self, station: &str, listener: &WeatherSender) -> bool {
        let mut updates = self.inner.station_updates.lock().await;
        let Some(listeners) = updates.get_mut(station) else {
            return false;
        };
        let Some(index) = listeners.iter().position(|l| l.same_channel(listener)) else {
            return false;
        };
        listeners.remove(index);
        if listeners.is_empty() {
            updates.remove(station);
        }
        true
    }

    /// Attach a listener to a station's rapid-weather stream, starting the
    /// stream if this is the first listener.
    pub async fn subscribe_rapid_updates(&self, station: &str, listener: WeatherSender) -> Result<()> {
        let inner = &self.inner;
        let mut muxes = inner.rapid_updates.lock().await;
        if let Some(mux) = muxes.get_mut(station) {
            mux.listeners.push(listener);
            log::debug!(
                "{}: {} rapid listeners for {station}",
                inner.name,
                mux.listeners.len()
            );
            return Ok(());
        }

        log::info!("{}: creating rapid-weather listener for {station}", inner.name);
        inner
            .client
            .subscribe(rapid_topic(station), QoS::AtLeastOnce)
            .await?;
        let request = serde_json::to_vec(&RequestMessage::rapid_weather())?;
        if let Err(err) = inner
            .client
            .publish(request_topic(station), QoS::AtLeastOnce, false, request.clone())
            .await
        {
            let _ = inner.client.unsubscribe(rapid_topic(station)).await;
            return Err(err.into());
        }

        let (done_tx, done_rx) = oneshot::channel();
        muxes.insert(
            station.to_string(),
            RapidMux {
                listeners: vec![listener],
                done: Some(done_tx),
            },
        );

        tokio::spawn(self.clone().keep_alive(station.to_string(), request, done_rx));
        Ok(())
    }

    /// Detach a rapid-weather listener. The last one out signals the
    /// keep-alive task, which tears the stream down.
    pub async fn unsubscribe_rapid_updates(&self, station: &str, listener: &WeatherSender) -> bool {
        let mut muxes = self.inner.rapid_updates.lock().await;
        let Some(mux) = muxes.get_mut(station) else {
            return false;
        };
        let Some(index) = mux.listeners.iter().position(|l| l.same_channel(listener)) else {
            return false;
        };
        mux.listeners.remove(index);
        if mux.listeners.is_empty() {
            if let Some(done) = mux.done.take() {
                let _ = done.send(());
            }
        }
        true
    }

    /// Re-publish the rapid-weather request until `done` fires, then
    /// unsubscribe and drop the mux.
    async fn keep_alive(self, station: String, request: Vec<u8>, mut done: oneshot::Receiver<()>) {
        let inner = &self.inner;
        loop {
            tokio::select! {
                _ = &mut done => {
                    if let Err(err) = inner.client.unsubscribe(rapid_topic(&station)).await {
                        log::warn!("{}: could not unsubscribe from rapid weather: {err}", inner.name);
                    }
                    inner.rapid_updates.lock().await.remove(&station);
                    log::info!("{}: closing rapid-weather listener for {station}", inner.name);
                    return;
                }
                _ = tokio::time::sleep(KEEP_ALIVE_PERIOD) => {
                    if let Err(err) = inner
                        .client
                        .publish(request_topic(&station), QoS::AtLeastOnce, false, request.clone())
                        .await
                    {
                        log::warn!("{}: could not send rapid-weather request: {err}", inner.name);
                    }
                }
            }
        }
    }
}

/// Split a `tcp://host:port` (or bare `host:port`) broker URL.
fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| GatewayError::Config(format!("Invalid broker port in {url}")))?;
            (host, port)
        }
        None => (rest, 1883),
    };
    if host.is_empty() {
        return Err(GatewayError::Config(format!("Invalid broker url {url}")));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_broker() -> Broker {
        let (client, _event_loop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 8);
        Broker {
            inner: Arc::new(BrokerInner {
                name: "b1".to_string(),
                client,
                db: Database::open(":memory:").unwrap(),
                station_updates: Mutex::new(HashMap::new()),
                rapid_updates: Mutex::new(HashMap::new()),
                pending_info: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("tcp://broker.example.com:1883").unwrap(),
            ("broker.example.com".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://10.0.0.2:8883").unwrap(),
            ("10.0.0.2".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("tcp://localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert!(parse_broker_url("tcp://host:notaport").is_err());
        assert!(parse_broker_url("tcp://:1883").is_err());
    }

    #[test]
    fn test_normalize_to_metric_rewrites_in_place() {
        let mut message: WeatherMessage = serde_json::from_str(
            r#"{"time":"2024-01-01T00:00:00Z","id":"s1","sensors":{
                "temp":[{"unit":"F","value":32}],
                "uv":[{"unit":"index","value":6}]}}"#,
        )
        .unwrap();
        normalize_to_metric(&mut message);
        assert_eq!(message.sensors["temp"][0].unit, "c");
        assert!((message.sensors["temp"][0].value - 0.0).abs() < 1e-9);
        assert_eq!(message.sensors["uv"][0].unit, "uv");
    }

    #[tokio::test]
    async fn weather_unsubscribe_is_idempotent() {
        let broker = test_broker();
        let (listener, _rx) = mpsc::channel(1);

        broker.subscribe_weather_updates("s1", listener.clone()).await;
        assert!(broker.unsubscribe_weather_updates("s1", &listener).await);
        assert!(!broker.unsubscribe_weather_updates("s1", &listener).await);
    }

    #[tokio::test]
    async fn last_weather_listener_removes_entry() {
        let broker = test_broker();
        let (first, _rx1) = mpsc::channel(1);
        let (second, _rx2) = mpsc::channel(1);

        broker.subscribe_weather_updates("s1", first.clone()).await;
        broker.subscribe_weather_updates("s1", second.clone()).await;

        assert!(broker.unsubscribe_weather_updates("s1", &first).await);
        assert!(broker.inner.station_updates.lock().await.contains_key("s1"));

        assert!(broker.unsubscribe_weather_updates("s1", &second).await);
        assert!(!broker.inner.station_updates.lock().await.contains_key("s1"));
    }

    #[tokio::test]
    async fn listeners_are_compared_by_channel_identity() {
        let broker = test_broker();
        let (first, _rx1) = mpsc::channel(1);
        let (second, _rx2) = mpsc::channel(1);

        broker.subscribe_weather_updates("s1", first.clone()).await;
        assert!(!broker.unsubscribe_weather_updates("s1", &second).await);
        assert!(broker.unsubscribe_weather_updates("s1", &first).await);
    }

    #[tokio::test]
    async fn rapid_unsubscribe_unknown_station_is_false() {
        let broker = test_broker();
        let (listener, _rx) = mpsc::channel(1);
        assert!(!broker.unsubscribe_rapid_updates("ghost", &listener).await);
    }

    #[tokio::test]
    async fn last_rapid_listener_fires_done_once() {
        let broker = test_broker();
        let (first, _rx1) = mpsc::channel(1);
        let (second, _rx2) = mpsc::channel(1);
        let (done_tx, mut done_rx) = oneshot::channel();

        broker.inner.rapid_updates.lock().await.insert(
            "s1".to_string(),
            RapidMux {
                listeners: vec![first.clone(), second.clone()],
                done: Some(done_tx),
            },
        );

        assert!(broker.unsubscribe_rapid_updates("s1", &first).await);
        assert!(done_rx.try_recv().is_err());

        assert!(broker.unsubscribe_rapid_updates("s1", &second).await);
        assert!(done_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn weather_fan_out_reaches_station_listeners() {
        let broker = test_broker();
        let (listener, mut rx) = mpsc::channel(1);
        broker.subscribe_weather_updates("s1", listener).await;

        let payload =
            br#"{"time":"2024-01-01T00:00:00Z","id":"s1","sensors":{"temp":[{"unit":"F","value":32}]}}"#;
        broker.handle_weather(payload).await;

        let message = rx.try_recv().unwrap();
        assert_eq!(message.id, "s1");
        assert_eq!(message.sensors["temp"][0].unit, "c");

        // The reading was also persisted, normalized.
        let entry = broker
            .inner
            .db
            .fetch_entry(
                "WHERE server.value = ? AND station.value = ?\nORDER BY time DESC",
                vec!["b1".to_string().into(), "s1".to_string().into()],
            )
            .await
            .unwrap()
            .unwrap();
        assert!((entry.sensors["temp"][0].value - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_weather_payload_is_dropped() {
        let broker = test_broker();
        let (listener, mut rx) = mpsc::channel(1);
        broker.subscribe_weather_updates("s1", listener).await;

        broker.handle_weather(b"not json").await;
        assert!(rx.try_recv().is_err());
    }
}
