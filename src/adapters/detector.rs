//! Open-vocabulary instance detector adapter

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde::{Deserialize, Serialize};

// Custom modules
use crate::adapters::{self, HostedEndpoint};
use crate::mask::Mask;

/// A single raw detection from the model, before domain tagging
#[derive(Clone, Debug)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// x1, y1, x2, y2 in image pixels
    pub bbox: [f32; 4],
    pub mask: Option<Mask>,
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: &'a str,
    confidence_threshold: f32,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<WireDetection>,
}

#[derive(Deserialize)]
struct WireDetection {
    label: String,
    confidence: f32,
    #[serde(rename = "box")]
    bbox: [f32; 4],
    mask_png_b64: Option<String>,
}

pub struct DetectorAdapter {
    endpoint: Option<HostedEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
    calls: AtomicU64,
    canned: Mutex<Option<Vec<Detection>>>,
}

impl DetectorAdapter {
    pub fn new(endpoint: Option<HostedEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
            calls: AtomicU64::new(0),
            canned: Mutex::new(None),
        }
    }

    /// Detects discrete objects. Returns an empty list on timeout or any
    /// model failure, never an error.
    pub async fn detect(
        &self,
        data_uri: &str,
        image_width: u32,
        image_height: u32,
        conf_threshold: f32,
    ) -> Vec<Detection> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let Some(endpoint) = &self.endpoint else {
            // Local mode: canned output, or nothing detected
            let canned = self.canned.lock().expect("detector canned lock poisoned");
            return canned.clone().unwrap_or_default();
        };

        let request = self.client
            .post(format!("{}/detect", endpoint.base_url))
            .json(&DetectRequest {
                image: data_uri,
                confidence_threshold: conf_threshold,
            });
        let request = match &endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = tokio::time::timeout(self.timeout, async {
            request.send().await?.error_for_status()?.json::<DetectResponse>().await
        }).await;

        let parsed = match response {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                tracing::warn!(error = e.to_string(), "detector call failed");
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "detector call timed out");
                return Vec::new();
            }
        };

        parsed.detections
            .into_iter()
            .filter(|d| d.confidence >= conf_threshold)
            .map(|d| Detection {
                label: d.label.to_lowercase(),
                confidence: d.confidence,
                bbox: d.bbox,
                mask: d.mask_png_b64
                    .as_deref()
                    .and_then(|b64| adapters::decode_mask_png(b64, image_width, image_height)),
            })
            .collect()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Injects local-mode output. Used by tests and development runs.
    pub fn set_canned(&self, detections: Vec<Detection>) {
        let mut canned = self.canned.lock().expect("detector canned lock poisoned");
        *canned = Some(detections);
    }
}
