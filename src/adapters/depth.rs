//! Metric depth estimator adapter

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

// Custom modules
use crate::PipelineError;
use crate::adapters::{HostedEndpoint, ModelId};
use crate::adapters::cache::{CacheKey, CacheValue, MaskCache};
use crate::mask::DepthMap;

/// Depth map in meters plus the model's own focal estimate in pixels
#[derive(Clone, Debug)]
pub struct DepthOutput {
    pub depth: Option<DepthMap>,
    pub focal_px: Option<f32>,
}

impl DepthOutput {
    pub fn empty() -> Self {
        Self { depth: None, focal_px: None }
    }
}

#[derive(Serialize)]
struct DepthRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct DepthResponse {
    width: u32,
    height: u32,
    /// Little-endian f32 depth values, base64 encoded
    depth_f32_b64: String,
    focal_px: Option<f32>,
}

pub struct DepthAdapter {
    endpoint: Option<HostedEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
    calls: AtomicU64,
    canned: Mutex<Option<DepthOutput>>,
}

impl DepthAdapter {
    pub fn new(endpoint: Option<HostedEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
            calls: AtomicU64::new(0),
            canned: Mutex::new(None),
        }
    }

    /// Estimates metric depth, served from the request cache on repeat
    /// pixels. Errors only on cache key collisions.
    pub async fn estimate_cached(
        &self,
        cache: &MaskCache,
        data_uri: &str,
        preproc_sha256: &str,
        image_width: u32,
        image_height: u32,
    ) -> Result<DepthOutput, PipelineError> {
        let key = CacheKey {
            model: ModelId::DepthEstimator,
            preproc_sha256: preproc_sha256.to_string(),
            prompt_hash: 0,
        };

        if let Some(CacheValue::Depth(cached)) = cache.get(&key, image_width, image_height)? {
            tracing::debug!(preproc_sha256, "depth estimate served from cache");
            return Ok(cached);
        }

        let output = self.estimate(data_uri).await;
        cache.insert(key, CacheValue::Depth(output.clone()));

        Ok(output)
    }

    /// Runs the model directly. Empty output on timeout or failure.
    pub async fn estimate(&self, data_uri: &str) -> DepthOutput {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let Some(endpoint) = &self.endpoint else {
            let canned = self.canned.lock().expect("depth canned lock poisoned");
            return canned.clone().unwrap_or_else(DepthOutput::empty);
        };

        let request = self.client
            .post(format!("{}/depth", endpoint.base_url))
            .json(&DepthRequest { image: data_uri });
        let request = match &endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = tokio::time::timeout(self.timeout, async {
            request.send().await?.error_for_status()?.json::<DepthResponse>().await
        }).await;

        let parsed = match response {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                tracing::warn!(error = e.to_string(), "depth estimator call failed");
                return DepthOutput::empty();
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "depth estimator call timed out");
                return DepthOutput::empty();
            }
        };

        let Ok(raw) = BASE64.decode(&parsed.depth_f32_b64) else {
            tracing::warn!("depth payload is not valid base64");
            return DepthOutput::empty();
        };

        let expected = (parsed.width as usize) * (parsed.height as usize) * 4;
        if raw.len() != expected {
            tracing::warn!(
                got = raw.len(),
                expected,
                "depth payload size does not match declared dimensions"
            );
            return DepthOutput::empty();
        }

        let values: Vec<f32> = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        match DepthMap::from_data(parsed.width, parsed.height, values) {
            Ok(depth) => DepthOutput {
                depth: Some(depth),
                focal_px: parsed.focal_px,
            },
            Err(e) => {
                tracing::warn!(error = e.to_string(), "depth payload rejected");
                DepthOutput::empty()
            }
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Injects local-mode output. Used by tests and development runs.
    pub fn set_canned(&self, output: DepthOutput) {
        let mut canned = self.canned.lock().expect("depth canned lock poisoned");
        *canned = Some(output);
    }
}
