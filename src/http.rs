//! HTTP clients for the lane classification service and the lap event push.
//!
//! Both reuse one pooled `reqwest` client with a request timeout. Neither
//! retries: callers treat them as advisory and only log failures.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::collaborators::{LaneClassifier, LaneLabel, LapEventSink};
use crate::error::{Result, TrackerError};
use crate::laps::LapEvent;
use crate::VehicleFix;

const MAX_IDLE_PER_HOST: usize = 4;

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .timeout(timeout)
        .build()
        .map_err(|e| TrackerError::Http {
            message: format!("Failed to create HTTP client: {}", e),
            status_code: None,
        })
}

/// One window point as the classifier expects it.
#[derive(Debug, Clone, Serialize)]
struct WindowPoint {
    lat: f64,
    lng: f64,
    /// Unix seconds
    ts: i64,
}

#[derive(Debug, Serialize)]
struct DetectRouteRequest {
    current_points: HashMap<String, Vec<WindowPoint>>,
}

/// Response maps vehicle id to a label.
type DetectRouteResponse = HashMap<String, String>;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
}

/// Client for `POST {base}/detect-route/`.
pub struct HttpLaneClassifier {
    client: Client,
    endpoint: String,
}

impl HttpLaneClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: format!("{}/detect-route/", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn detect(&self, vehicle_id: String, fixes: Vec<VehicleFix>) -> Result<LaneLabel> {
        let points = fixes
            .iter()
            .map(|f| WindowPoint {
                lat: f.position.latitude,
                lng: f.position.longitude,
                ts: f.timestamp.timestamp(),
            })
            .collect();
        let body = DetectRouteRequest {
            current_points: HashMap::from([(vehicle_id.clone(), points)]),
        };

        debug!(
            "[LaneClassifier] Detecting route for {} ({} points)",
            vehicle_id,
            fixes.len()
        );
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.detail)
                .unwrap_or_else(|| status.to_string());
            return Err(TrackerError::Http {
                message: detail,
                status_code: Some(status.as_u16()),
            });
        }

        let labels: DetectRouteResponse = resp.json().await?;
        Ok(labels
            .get(&vehicle_id)
            .map(|l| LaneLabel::from_label(l))
            .unwrap_or(LaneLabel::Unknown))
    }
}

impl LaneClassifier for HttpLaneClassifier {
    fn classify(
        &self,
        vehicle_id: String,
        fixes: Vec<VehicleFix>,
    ) -> BoxFuture<'_, Result<LaneLabel>> {
        Box::pin(self.detect(vehicle_id, fixes))
    }
}

/// Posts each lap event as JSON to a fixed URL.
pub struct HttpLapEventSink {
    client: Client,
    url: String,
}

impl HttpLapEventSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
        })
    }

    async fn post(&self, event: LapEvent) -> Result<()> {
        let resp = self.client.post(&self.url).json(&event).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TrackerError::Http {
                message: format!("lap event rejected for {}", event.key),
                status_code: Some(status.as_u16()),
            });
        }
        info!("[Laps] Pushed {:?} for {}", event.kind, event.key);
        Ok(())
    }
}

impl LapEventSink for HttpLapEventSink {
    fn push(&self, event: LapEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.post(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_endpoint_normalized() {
        let a = HttpLaneClassifier::new("http://rm.local/", Duration::from_secs(5)).unwrap();
        let b = HttpLaneClassifier::new("http://rm.local", Duration::from_secs(5)).unwrap();
        assert_eq!(a.endpoint(), "http://rm.local/detect-route/");
        assert_eq!(a.endpoint(), b.endpoint());
    }

    #[test]
    fn test_request_body_shape() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let body = DetectRouteRequest {
            current_points: HashMap::from([(
                "bus-1".to_string(),
                vec![WindowPoint {
                    lat: -6.35,
                    lng: 106.83,
                    ts: ts.timestamp(),
                }],
            )]),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["current_points"]["bus-1"][0]["lat"], -6.35);
        assert_eq!(json["current_points"]["bus-1"][0]["ts"], 1_700_000_000);
    }

    #[tokio::test]
    async fn test_unreachable_classifier_errors() {
        let classifier =
            HttpLaneClassifier::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let result = classifier.classify("bus-1".to_string(), Vec::new()).await;
        assert!(matches!(result, Err(TrackerError::Http { .. })));
    }
}
