//! Live GPS feed: message parsing and the reconnecting websocket consumer.
//!
//! Messages look like
//! `{"message": "...", "data": [{"imei": "...", "latitude": .., "longitude": .., "speed": ..}]}`.
//! Entries without an identity or with unusable coordinates are skipped;
//! a payload that is not JSON at all is rejected as a whole.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::FeedConfig;
use crate::error::{Result, TrackerError};
use crate::VehicleFix;

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Vec<Value>,
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn identity(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_entry(entry: &Value, received_at: DateTime<Utc>) -> Option<VehicleFix> {
    let vehicle_id = identity(entry.get("imei"))?;
    let latitude = number(entry.get("latitude"))?;
    let longitude = number(entry.get("longitude"))?;
    let speed = number(entry.get("speed")).unwrap_or(0.0);

    let fix = VehicleFix::new(vehicle_id, latitude, longitude, speed, received_at);
    fix.position.is_valid().then_some(fix)
}

/// Decode one feed message into fixes stamped with `received_at`.
pub fn parse_feed_message(payload: &[u8], received_at: DateTime<Utc>) -> Result<Vec<VehicleFix>> {
    let message: FeedMessage = serde_json::from_slice(payload)?;
    if let Some(text) = message.message.as_deref() {
        debug!("[Feed] Message '{}' with {} entries", text, message.data.len());
    }

    let total = message.data.len();
    let fixes: Vec<VehicleFix> = message
        .data
        .iter()
        .filter_map(|entry| parse_entry(entry, received_at))
        .collect();
    if fixes.len() < total {
        debug!("[Feed] Skipped {} unusable entries", total - fixes.len());
    }
    Ok(fixes)
}

/// How a single connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    Shutdown,
    Closed,
}

/// Websocket consumer that reconnects after a fixed delay until shut down.
pub struct FeedConsumer {
    config: FeedConfig,
}

impl FeedConsumer {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    /// Consume the feed, handing every payload to `on_message`.
    ///
    /// Returns once `shutdown` turns true (or its sender is dropped).
    pub async fn run<F>(&self, mut on_message: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(&[u8]),
    {
        let delay = self.config.reconnect_delay();
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.consume_once(&mut on_message, &mut shutdown).await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Closed) => info!("[Feed] Connection closed by upstream"),
                Err(e) => warn!("[Feed] {}", e),
            }

            info!("[Feed] Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[Feed] Stopped");
    }

    async fn consume_once<F>(
        &self,
        on_message: &mut F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionEnd>
    where
        F: FnMut(&[u8]),
    {
        info!("[Feed] Connecting to {}", self.config.url);
        let (mut ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TrackerError::Feed {
                message: format!("dial failed: {}", e),
            })?;
        info!("[Feed] Connected");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(e) = ws.close(None).await {
                            debug!("[Feed] Close handshake failed: {}", e);
                        }
                        return Ok(ConnectionEnd::Shutdown);
                    }
                }
                next = ws.next() => match next {
                    None => return Ok(ConnectionEnd::Closed),
                    Some(Err(e)) => {
                        return Err(TrackerError::Feed {
                            message: format!("read failed: {}", e),
                        })
                    }
                    Some(Ok(Message::Text(text))) => on_message(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => on_message(&bytes),
                    Some(Ok(Message::Close(_))) => return Ok(ConnectionEnd::Closed),
                    // ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_parse_feed_message() {
        let payload = br#"{
            "message": "ok",
            "data": [
                {"imei": "860000000000001", "latitude": -6.3483, "longitude": 106.8297, "speed": 21, "course": 90},
                {"imei": "860000000000002", "latitude": "-6.3610", "longitude": "106.8317"}
            ]
        }"#;
        let fixes = parse_feed_message(payload, now()).unwrap();
        assert_eq!(fixes.len(), 2);
        assert_eq!(fixes[0].vehicle_id, "860000000000001");
        assert_eq!(fixes[0].speed_kmh, 21.0);
        assert_eq!(fixes[0].timestamp, now());
        assert_eq!(fixes[1].position.latitude, -6.3610);
        assert_eq!(fixes[1].speed_kmh, 0.0);
    }

    #[test]
    fn test_parse_skips_unusable_entries() {
        let payload = br#"{"data": [
            {"latitude": -6.35, "longitude": 106.83},
            {"imei": "", "latitude": -6.35, "longitude": 106.83},
            {"imei": "a", "latitude": 123.0, "longitude": 106.83},
            {"imei": "b", "longitude": 106.83},
            {"imei": 42, "latitude": -6.35, "longitude": 106.83}
        ]}"#;
        let fixes = parse_feed_message(payload, now()).unwrap();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].vehicle_id, "42");
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert!(parse_feed_message(br#"{"message": "hello"}"#, now())
            .unwrap()
            .is_empty());
        let err = parse_feed_message(b"not json", now()).unwrap_err();
        assert!(matches!(err, TrackerError::MalformedFeed { .. }));
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let (tx, rx) = watch::channel(true);
        let consumer = FeedConsumer::new(FeedConfig {
            url: "ws://127.0.0.1:9".to_string(),
            reconnect_delay_ms: 10,
        });
        let mut count = 0;
        consumer.run(|_| count += 1, rx).await;
        assert_eq!(count, 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_run_reconnects_after_upstream_drop() {
        use futures::SinkExt;
        use std::time::{Duration, Instant};
        use tokio::net::TcpListener;
        use tokio::sync::mpsc;
        use tokio_tungstenite::accept_async;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // First connection sends one payload and drops without a close frame;
        // the second one stays up until the consumer closes it.
        let upstream = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text("first".to_string())).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Binary(b"second".to_vec())).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Close(_) = message {
                    return true;
                }
            }
            false
        });

        let reconnect_delay = Duration::from_millis(50);
        let consumer = FeedConsumer::new(FeedConfig {
            url: format!("ws://{}", addr),
            reconnect_delay_ms: reconnect_delay.as_millis() as u64,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (payload_tx, mut payloads) = mpsc::unbounded_channel();
        let running = tokio::spawn(async move {
            consumer
                .run(
                    move |payload| {
                        let text = String::from_utf8_lossy(payload).into_owned();
                        let _ = payload_tx.send((text, Instant::now()));
                    },
                    shutdown_rx,
                )
                .await
        });

        let wait = Duration::from_secs(5);
        let (first, first_at) = tokio::time::timeout(wait, payloads.recv()).await.unwrap().unwrap();
        let (second, second_at) = tokio::time::timeout(wait, payloads.recv()).await.unwrap().unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");
        assert!(second_at - first_at >= reconnect_delay);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(wait, running).await.unwrap().unwrap();
        assert!(tokio::time::timeout(wait, upstream).await.unwrap().unwrap());
    }
}
