//! Vision-language audit adapter. Pure annotation: the audit decorates
//! the final payload and never feeds back into the volume.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde::{Deserialize, Serialize};

// Custom modules
use crate::adapters::HostedEndpoint;

/// Context handed to the auditor alongside the best-view image
#[derive(Clone, Debug, Serialize)]
pub struct AuditContext {
    pub final_volume_cy: f64,
    pub uncertainty_min_cy: f64,
    pub uncertainty_max_cy: f64,
    pub frame_volumes_cy: Vec<f64>,
    pub detected_items: Vec<String>,
    pub flags: Vec<String>,
}

/// Auditor verdict attached verbatim to the response payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditOutput {
    pub status: String,
    pub visual_volume_estimate: String,
    pub confidence_score: f64,
    pub flag_for_human_review: bool,
    pub missing_items: Vec<String>,
    pub audit_reason: String,
}

#[derive(Serialize)]
struct AuditRequest<'a> {
    image: &'a str,
    context: &'a AuditContext,
}

pub struct AuditorAdapter {
    endpoint: Option<HostedEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
    calls: AtomicU64,
    canned: Mutex<Option<AuditOutput>>,
}

impl AuditorAdapter {
    pub fn new(endpoint: Option<HostedEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
            calls: AtomicU64::new(0),
            canned: Mutex::new(None),
        }
    }

    /// Requests an audit of the finished estimate. Returns None when no
    /// auditor is configured or the call fails; the quote ships without
    /// the annotation in that case.
    pub async fn audit(&self, data_uri: &str, context: &AuditContext) -> Option<AuditOutput> {
        let Some(endpoint) = &self.endpoint else {
            let canned = self.canned.lock().expect("auditor canned lock poisoned");
            if canned.is_some() {
                self.calls.fetch_add(1, Ordering::Relaxed);
            }
            return canned.clone();
        };

        self.calls.fetch_add(1, Ordering::Relaxed);

        let request = self.client
            .post(format!("{}/audit", endpoint.base_url))
            .json(&AuditRequest { image: data_uri, context });
        let request = match &endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = tokio::time::timeout(self.timeout, async {
            request.send().await?.error_for_status()?.json::<AuditOutput>().await
        }).await;

        match response {
            Ok(Ok(output)) => Some(output),
            Ok(Err(e)) => {
                tracing::warn!(error = e.to_string(), "audit call failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "audit call timed out");
                None
            }
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Injects local-mode output. Used by tests.
    pub fn set_canned(&self, output: AuditOutput) {
        let mut canned = self.canned.lock().expect("auditor canned lock poisoned");
        *canned = Some(output);
    }
}
