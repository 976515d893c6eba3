//! Text-prompted bulk segmenter adapter with request-scoped caching

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde::{Deserialize, Serialize};

// Custom modules
use crate::PipelineError;
use crate::adapters::{self, HostedEndpoint, ModelId, prompt_hash};
use crate::adapters::cache::{CacheKey, CacheValue, MaskCache};
use crate::mask::Mask;

/// Combined mask over every prompt match, before any morphology
#[derive(Clone, Debug)]
pub struct BulkSegOutput {
    pub mask: Option<Mask>,
    pub confidence: f32,
}

impl BulkSegOutput {
    pub fn empty() -> Self {
        Self { mask: None, confidence: 0.0 }
    }
}

#[derive(Serialize)]
struct SegmentRequest<'a> {
    image: &'a str,
    prompts: &'a [&'a str],
}

#[derive(Deserialize)]
struct SegmentResponse {
    masks: Vec<WireMask>,
}

#[derive(Deserialize)]
struct WireMask {
    confidence: f32,
    mask_png_b64: String,
}

pub struct BulkSegmenterAdapter {
    endpoint: Option<HostedEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
    calls: AtomicU64,
    canned: Mutex<Option<BulkSegOutput>>,
}

impl BulkSegmenterAdapter {
    pub fn new(endpoint: Option<HostedEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
            calls: AtomicU64::new(0),
            canned: Mutex::new(None),
        }
    }

    /// Segments the pile region, serving repeats of the same preprocessed
    /// pixels from the request cache. Errors only on cache key collisions.
    pub async fn segment_cached(
        &self,
        cache: &MaskCache,
        data_uri: &str,
        preproc_sha256: &str,
        image_width: u32,
        image_height: u32,
        prompts: &[&str],
    ) -> Result<BulkSegOutput, PipelineError> {
        let key = CacheKey {
            model: ModelId::BulkSegmenter,
            preproc_sha256: preproc_sha256.to_string(),
            prompt_hash: prompt_hash(prompts),
        };

        if let Some(CacheValue::Bulk(cached)) = cache.get(&key, image_width, image_height)? {
            tracing::debug!(preproc_sha256, "bulk segmentation served from cache");
            return Ok(cached);
        }

        let output = self.segment(data_uri, image_width, image_height, prompts).await;
        cache.insert(key, CacheValue::Bulk(output.clone()));

        Ok(output)
    }

    /// Runs the model directly. Empty output on timeout or failure.
    pub async fn segment(
        &self,
        data_uri: &str,
        image_width: u32,
        image_height: u32,
        prompts: &[&str],
    ) -> BulkSegOutput {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let Some(endpoint) = &self.endpoint else {
            let canned = self.canned.lock().expect("segmenter canned lock poisoned");
            return canned.clone().unwrap_or_else(BulkSegOutput::empty);
        };

        let request = self.client
            .post(format!("{}/segment", endpoint.base_url))
            .json(&SegmentRequest { image: data_uri, prompts });
        let request = match &endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = tokio::time::timeout(self.timeout, async {
            request.send().await?.error_for_status()?.json::<SegmentResponse>().await
        }).await;

        let parsed = match response {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                tracing::warn!(error = e.to_string(), "bulk segmenter call failed");
                return BulkSegOutput::empty();
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "bulk segmenter call timed out");
                return BulkSegOutput::empty();
            }
        };

        // Union every prompt match into a single pile mask
        let mut combined: Option<Mask> = None;
        let mut best_conf = 0.0f32;

        for wire in parsed.masks {
            let Some(mask) = adapters::decode_mask_png(&wire.mask_png_b64, image_width, image_height) else {
                continue;
            };
            best_conf = best_conf.max(wire.confidence);
            match &mut combined {
                Some(acc) => acc.union_with(&mask),
                None => combined = Some(mask),
            }
        }

        BulkSegOutput { mask: combined, confidence: best_conf }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Injects local-mode output. Used by tests and development runs.
    pub fn set_canned(&self, output: BulkSegOutput) {
        let mut canned = self.canned.lock().expect("segmenter canned lock poisoned");
        *canned = Some(output);
    }
}
