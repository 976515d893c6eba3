//! Responsible for isolating every external vision model behind a narrow
//! adapter. The pipeline core never references a specific provider: each
//! adapter is either hosted (JSON over HTTP) or local (deterministic
//! placeholder outputs), selected by configuration.
//!
//! Adapters never raise for model failures. A timeout or a decode failure
//! yields the adapter's well-formed empty result and the pipeline
//! continues with degraded confidence.

use std::sync::Arc;
use tokio::sync::OnceCell;
use anyhow::{Result, Context};

// Custom modules
pub mod cache;
pub mod detector;
pub mod segmenter;
pub mod semantic;
pub mod scene;
pub mod depth;
pub mod auditor;

use crate::utils::config::{AppConfig, ProviderMode};
use detector::DetectorAdapter;
use segmenter::BulkSegmenterAdapter;
use semantic::SemanticAdapter;
use scene::SceneAdapter;
use depth::DepthAdapter;
use auditor::AuditorAdapter;

/// Identifies an external model for cache keys and logging
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelId {
    Detector,
    BulkSegmenter,
    SemanticOutdoor,
    SemanticIndoor,
    SceneClassifier,
    DepthEstimator,
    Auditor,
}

impl ModelId {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelId::Detector => "detector",
            ModelId::BulkSegmenter => "bulk_segmenter",
            ModelId::SemanticOutdoor => "semantic_outdoor",
            ModelId::SemanticIndoor => "semantic_indoor",
            ModelId::SceneClassifier => "scene_classifier",
            ModelId::DepthEstimator => "depth_estimator",
            ModelId::Auditor => "auditor",
        }
    }
}

/// Shared hosted-endpoint settings for one adapter call path
#[derive(Clone)]
pub struct HostedEndpoint {
    pub base_url: String,
    pub token: Option<String>,
}

/// Static singleton instance holding every model adapter
pub static MODEL_ADAPTERS: OnceCell<Arc<ModelAdapters>> = OnceCell::const_new();

/// Returns the model adapter set, if initiated
pub fn get_model_adapters() -> Result<&'static Arc<ModelAdapters>> {
    Ok(
        MODEL_ADAPTERS
            .get()
            .context("Model adapters are not initiated!")?
    )
}

/// Initiates the process-wide model adapter set
pub fn init_model_adapters(app_config: &AppConfig) -> Result<()> {
    if get_model_adapters().is_ok() {
        anyhow::bail!("Model adapters are already initiated!")
    }

    let adapters = ModelAdapters::new(app_config);

    MODEL_ADAPTERS.set(Arc::new(adapters))
        .map_err(|_| anyhow::anyhow!("Error setting model adapter instance"))?;

    Ok(())
}

/// One adapter per external model. Instances are process-wide and
/// thread-safe; the orchestrator issues one call at a time per frame lane.
pub struct ModelAdapters {
    pub detector: DetectorAdapter,
    pub bulk_segmenter: BulkSegmenterAdapter,
    pub semantic: SemanticAdapter,
    pub scene: SceneAdapter,
    pub depth: DepthAdapter,
    pub auditor: AuditorAdapter,
}

impl ModelAdapters {
    pub fn new(app_config: &AppConfig) -> Self {
        let endpoint = match app_config.provider_mode() {
            ProviderMode::Hosted => Some(HostedEndpoint {
                base_url: app_config.inference_url().to_string(),
                token: app_config.inference_token().map(|t| t.to_string()),
            }),
            ProviderMode::Local => None,
        };

        let timeout = std::time::Duration::from_secs(app_config.adapter_timeout_secs());

        Self {
            detector: DetectorAdapter::new(endpoint.clone(), timeout),
            bulk_segmenter: BulkSegmenterAdapter::new(endpoint.clone(), timeout),
            semantic: SemanticAdapter::new(endpoint.clone(), timeout),
            scene: SceneAdapter::new(endpoint.clone(), timeout),
            depth: DepthAdapter::new(endpoint.clone(), timeout),
            auditor: AuditorAdapter::new(endpoint, timeout),
        }
    }

    /// Local-mode adapter set for tests, with canned outputs injected per test
    pub fn local_for_tests() -> Self {
        let timeout = std::time::Duration::from_secs(5);
        Self {
            detector: DetectorAdapter::new(None, timeout),
            bulk_segmenter: BulkSegmenterAdapter::new(None, timeout),
            semantic: SemanticAdapter::new(None, timeout),
            scene: SceneAdapter::new(None, timeout),
            depth: DepthAdapter::new(None, timeout),
            auditor: AuditorAdapter::new(None, timeout),
        }
    }
}

/// Decodes a base64 PNG mask into a boolean mask at the requested
/// dimensions, resizing nearest-neighbor when the model returned a
/// different resolution. None when the payload is unusable.
pub fn decode_mask_png(b64: &str, width: u32, height: u32) -> Option<crate::mask::Mask> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    let bytes = BASE64.decode(b64).ok()?;
    let decoded = image::load_from_memory(&bytes).ok()?;
    let mut gray = decoded.to_luma8();

    if gray.width() != width || gray.height() != height {
        gray = image::imageops::resize(&gray, width, height, image::imageops::FilterType::Nearest);
    }

    let data: Vec<bool> = gray.pixels().map(|p| p.0[0] > 127).collect();
    crate::mask::Mask::from_data(width, height, data).ok()
}

/// Stable 64-bit hash for prompt cache keys
pub fn prompt_hash(prompts: &[&str]) -> u64 {
    let joined = prompts.join("\u{1f}");
    let digest = crate::utils::sha256_hex(joined.as_bytes());
    u64::from_str_radix(&digest[..16], 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_hash_is_order_sensitive() {
        let a = prompt_hash(&["pile of junk", "debris pile"]);
        let b = prompt_hash(&["debris pile", "pile of junk"]);
        let c = prompt_hash(&["pile of junk", "debris pile"]);
        assert_eq!(a, c);
        assert_ne!(a, b);
    }
}
