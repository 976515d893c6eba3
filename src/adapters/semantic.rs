//! Semantic scene segmenter adapter. Two model biases are exposed: an
//! outdoor-trained variant and an indoor-trained variant; the perception
//! stage picks between them per frame.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde::{Deserialize, Serialize};

// Custom modules
use crate::PipelineError;
use crate::adapters::{self, HostedEndpoint, ModelId};
use crate::adapters::cache::{CacheKey, CacheValue, MaskCache};
use crate::mask::Mask;

/// Which semantic model variant to run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemanticBias {
    Outdoor,
    Indoor,
}

impl SemanticBias {
    pub fn as_str(self) -> &'static str {
        match self {
            SemanticBias::Outdoor => "outdoor",
            SemanticBias::Indoor => "indoor",
        }
    }

    fn model_id(self) -> ModelId {
        match self {
            SemanticBias::Outdoor => ModelId::SemanticOutdoor,
            SemanticBias::Indoor => ModelId::SemanticIndoor,
        }
    }
}

/// One labelled region from the semantic model
#[derive(Clone, Debug)]
pub struct SemanticSegment {
    pub label: String,
    pub mask: Mask,
}

/// Raw per-model output before floor/background classification
#[derive(Clone, Debug)]
pub struct SemanticRawOutput {
    pub width: u32,
    pub height: u32,
    pub segments: Vec<SemanticSegment>,
}

impl SemanticRawOutput {
    pub fn empty(width: u32, height: u32) -> Self {
        Self { width, height, segments: Vec::new() }
    }
}

#[derive(Serialize)]
struct SemanticRequest<'a> {
    image: &'a str,
    bias: &'a str,
}

#[derive(Deserialize)]
struct SemanticResponse {
    segments: Vec<WireSegment>,
}

#[derive(Deserialize)]
struct WireSegment {
    label: String,
    mask_png_b64: String,
}

pub struct SemanticAdapter {
    endpoint: Option<HostedEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
    calls: AtomicU64,
    canned_outdoor: Mutex<Option<SemanticRawOutput>>,
    canned_indoor: Mutex<Option<SemanticRawOutput>>,
}

impl SemanticAdapter {
    pub fn new(endpoint: Option<HostedEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
            calls: AtomicU64::new(0),
            canned_outdoor: Mutex::new(None),
            canned_indoor: Mutex::new(None),
        }
    }

    /// Runs one semantic variant, served from the request cache on repeat
    /// pixels. Errors only on cache key collisions.
    pub async fn segment_cached(
        &self,
        cache: &MaskCache,
        data_uri: &str,
        preproc_sha256: &str,
        image_width: u32,
        image_height: u32,
        bias: SemanticBias,
    ) -> Result<SemanticRawOutput, PipelineError> {
        let key = CacheKey {
            model: bias.model_id(),
            preproc_sha256: preproc_sha256.to_string(),
            prompt_hash: 0,
        };

        if let Some(CacheValue::Semantic(cached)) = cache.get(&key, image_width, image_height)? {
            return Ok(cached);
        }

        let output = self.segment(data_uri, image_width, image_height, bias).await;
        cache.insert(key, CacheValue::Semantic(output.clone()));

        Ok(output)
    }

    /// Runs the model directly. Empty segment list on timeout or failure.
    pub async fn segment(
        &self,
        data_uri: &str,
        image_width: u32,
        image_height: u32,
        bias: SemanticBias,
    ) -> SemanticRawOutput {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let Some(endpoint) = &self.endpoint else {
            let slot = match bias {
                SemanticBias::Outdoor => &self.canned_outdoor,
                SemanticBias::Indoor => &self.canned_indoor,
            };
            let canned = slot.lock().expect("semantic canned lock poisoned");
            return canned.clone().unwrap_or_else(|| SemanticRawOutput::empty(image_width, image_height));
        };

        let request = self.client
            .post(format!("{}/semantic", endpoint.base_url))
            .json(&SemanticRequest { image: data_uri, bias: bias.as_str() });
        let request = match &endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = tokio::time::timeout(self.timeout, async {
            request.send().await?.error_for_status()?.json::<SemanticResponse>().await
        }).await;

        let parsed = match response {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                tracing::warn!(error = e.to_string(), bias = bias.as_str(), "semantic segmenter call failed");
                return SemanticRawOutput::empty(image_width, image_height);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    bias = bias.as_str(),
                    "semantic segmenter call timed out"
                );
                return SemanticRawOutput::empty(image_width, image_height);
            }
        };

        let segments = parsed.segments
            .into_iter()
            .filter_map(|wire| {
                adapters::decode_mask_png(&wire.mask_png_b64, image_width, image_height)
                    .map(|mask| SemanticSegment { label: wire.label.to_lowercase(), mask })
            })
            .collect();

        SemanticRawOutput { width: image_width, height: image_height, segments }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Injects local-mode output for one bias. Used by tests.
    pub fn set_canned(&self, bias: SemanticBias, output: SemanticRawOutput) {
        let slot = match bias {
            SemanticBias::Outdoor => &self.canned_outdoor,
            SemanticBias::Indoor => &self.canned_indoor,
        };
        let mut canned = slot.lock().expect("semantic canned lock poisoned");
        *canned = Some(output);
    }
}
