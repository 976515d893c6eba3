//! Scene classifier adapter: a narrow visual-question wrapper that labels
//! the shot indoor/outdoor/uneven for ground-plane strategy gating

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde::{Deserialize, Serialize};

// Custom modules
use crate::adapters::HostedEndpoint;

/// Raw classifier verdict; perception maps the label onto its scene enum
#[derive(Clone, Debug)]
pub struct SceneOutput {
    pub label: String,
    pub confidence: f32,
}

impl SceneOutput {
    pub fn empty() -> Self {
        Self { label: "unknown".to_string(), confidence: 0.0 }
    }
}

#[derive(Serialize)]
struct SceneRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct SceneResponse {
    label: String,
    confidence: f32,
}

pub struct SceneAdapter {
    endpoint: Option<HostedEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
    calls: AtomicU64,
    canned: Mutex<Option<SceneOutput>>,
}

impl SceneAdapter {
    pub fn new(endpoint: Option<HostedEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
            calls: AtomicU64::new(0),
            canned: Mutex::new(None),
        }
    }

    /// Classifies the scene. Unknown with zero confidence on timeout or
    /// failure, never an error.
    pub async fn classify(&self, data_uri: &str) -> SceneOutput {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let Some(endpoint) = &self.endpoint else {
            let canned = self.canned.lock().expect("scene canned lock poisoned");
            return canned.clone().unwrap_or_else(SceneOutput::empty);
        };

        let request = self.client
            .post(format!("{}/scene", endpoint.base_url))
            .json(&SceneRequest { image: data_uri });
        let request = match &endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = tokio::time::timeout(self.timeout, async {
            request.send().await?.error_for_status()?.json::<SceneResponse>().await
        }).await;

        match response {
            Ok(Ok(parsed)) => SceneOutput {
                label: parsed.label.to_lowercase(),
                confidence: parsed.confidence.clamp(0.0, 1.0),
            },
            Ok(Err(e)) => {
                tracing::warn!(error = e.to_string(), "scene classifier call failed");
                SceneOutput::empty()
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "scene classifier call timed out");
                SceneOutput::empty()
            }
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Injects local-mode output. Used by tests.
    pub fn set_canned(&self, output: SceneOutput) {
        let mut canned = self.canned.lock().expect("scene canned lock poisoned");
        *canned = Some(output);
    }
}
