//! Responsible for orchestrating the seven-stage quote pipeline over one
//! request. Frames run in canonical content-hash order; perception lanes
//! fan out per frame; a bounded semaphore keeps concurrent requests from
//! oversubscribing the inference backend; an overall deadline degrades
//! the quote instead of failing it.

use std::sync::Arc;
use std::time::Duration;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;

// Custom modules
use crate::PipelineError;
use crate::adapters::ModelAdapters;
use crate::adapters::auditor::AuditContext;
use crate::adapters::cache::MaskCache;
use crate::calibration::scale::{self, AnchorMeasurement};
use crate::fusion::{self, FrameQuality};
use crate::geometry::{self, FloorQuality, GeometryResult};
use crate::ingestion::{self, IngestedFrame, exif::ClientExif};
use crate::output::{self, QuoteResponse};
use crate::perception::{self, PerceptionResult};
use crate::utils::{self, config::AppConfig};
use crate::volumetrics::{self, VolumetricResult};

/// Floor visibility gate: the pile cannot cover more than this much of
/// the image if the floor is to be found
const GATE_BULK_COVER_MAX_PCT: f32 = 85.0;
/// Bottom band inspected by the visibility gate
const GATE_BOTTOM_FRACTION: f32 = 0.35;
/// The bottom band needs at least this much clear (non-pile) area
const GATE_CLEAR_MIN_PCT: f32 = 8.0;

/// Quote request payload
#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    /// Base64 or data-URI image payloads
    pub images: Vec<String>,
    #[serde(rename = "heavyMaterialLevel")]
    pub heavy_material_level: Option<String>,
    pub exif: Option<Vec<ClientExif>>,
}

/// Per-frame stage results gathered before fusion
struct FrameOutcome {
    perception: PerceptionResult,
    geometry: GeometryResult,
}

/// The request pipeline. One instance per process; requests share the
/// semaphore and the model adapters, nothing else.
pub struct Pipeline {
    adapters: Arc<ModelAdapters>,
    semaphore: Arc<Semaphore>,
    deadline: Duration,
    detector_conf_threshold: f32,
}

impl Pipeline {
    pub fn new(app_config: &AppConfig, adapters: Arc<ModelAdapters>) -> Self {
        Self {
            adapters,
            semaphore: Arc::new(Semaphore::new(app_config.concurrency_cap())),
            deadline: Duration::from_secs(app_config.deadline_secs()),
            detector_conf_threshold: app_config.detector_conf_threshold(),
        }
    }

    /// Runs one quote request end to end. Degradations come back inside
    /// the payload; only unrecoverable invariant violations are errors.
    pub async fn run_quote(&self, request: QuoteRequest) -> Result<QuoteResponse, PipelineError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| PipelineError::ShapeMismatch {
            context: "request_semaphore",
            details: "semaphore closed".to_string(),
        })?;
        let deadline = Instant::now() + self.deadline;

        // Decode request payloads; bad base64 is a per-image rejection
        let mut blobs: Vec<Vec<u8>> = Vec::new();
        let mut payload_rejects = Vec::new();
        for (index, payload) in request.images.iter().enumerate() {
            match utils::decode_image_payload(payload) {
                Ok(bytes) => blobs.push(bytes),
                Err(e) => {
                    let msg: String = e.to_string().chars().take(50).collect();
                    payload_rejects.push(ingestion::rejection_record(
                        &format!("payload_{index}"),
                        &format!("load_error:{msg}"),
                    ));
                }
            }
        }

        // Job identity is a content hash, so reruns are comparable
        let mut hashes: Vec<String> = blobs.iter().map(|b| utils::sha256_hex(b)).collect();
        hashes.sort();
        let job_id = utils::sha256_hex(hashes.join(",").as_bytes())[..8].to_string();

        tracing::info!(job_id, images = request.images.len(), "quote request started");

        if blobs.is_empty() {
            let response = output::minimum_load_response(
                &job_id,
                &payload_rejects,
                "FAIL: no decodable images in request",
            );
            return Ok(response);
        }

        // Stage 1: ingestion, canonical order
        let client_exif = request.exif.unwrap_or_default();
        let mut ingestion_result = ingestion::run_ingestion(&blobs, &client_exif);
        ingestion_result.rejected_frames.extend(payload_rejects);

        if ingestion_result.frames.is_empty() {
            let response = output::minimum_load_response(
                &job_id,
                &ingestion_result.rejected_frames,
                "no frames survived quality gating",
            );
            return Ok(response);
        }

        // Stages 2+3 per frame, with the request deadline in force
        let cache = MaskCache::new();
        let mut outcomes: Vec<FrameOutcome> = Vec::new();
        let mut deadline_rejects: Vec<(String, String)> = Vec::new();

        for frame in &ingestion_result.frames {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    job_id,
                    frame_id = frame.metadata.image_id,
                    "deadline exhausted, skipping remaining frames"
                );
                deadline_rejects.push((frame.metadata.image_id.clone(), "deadline_exceeded".to_string()));
                continue;
            }

            let processed = tokio::time::timeout(
                remaining,
                self.process_frame(frame, &cache),
            ).await;

            match processed {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(
                        job_id,
                        frame_id = frame.metadata.image_id,
                        "frame processing hit the request deadline"
                    );
                    deadline_rejects.push((frame.metadata.image_id.clone(), "deadline_exceeded".to_string()));
                }
            }
        }

        // Stage 4: scale calibration over anchors from every frame
        let mut measurements: Vec<AnchorMeasurement> = Vec::new();
        for outcome in &outcomes {
            let Some(depth) = &outcome.geometry.depth else {
                continue;
            };
            if outcome.geometry.fx_used <= 0.0 {
                continue;
            }
            measurements.extend(scale::measure_frame_anchors(
                &outcome.perception.lane_a.anchors(),
                depth,
                outcome.geometry.fx_used,
            ));
        }

        let exif_available = ingestion_result.frames.iter().any(|f| f.metadata.exif_present);
        let intrinsics_available = outcomes.iter().any(|o| o.geometry.model_focal_px.is_some());
        let scale_result = scale::run_scale_calibration(measurements, exif_available, intrinsics_available);

        // Stage 5: per-frame volumetrics
        let volumetric_results: Vec<VolumetricResult> = outcomes
            .iter()
            .map(|o| volumetrics::run_volumetrics(&o.perception, &o.geometry, scale_result.scale_factor))
            .collect();

        // Stage 6: fusion
        let qualities: Vec<FrameQuality> = outcomes
            .iter()
            .zip(volumetric_results.iter())
            .map(|(o, v)| {
                let diag = ((o.geometry.pixel_map.as_ref().map(|m| m.width).unwrap_or(0) as f32).powi(2)
                    + (o.geometry.pixel_map.as_ref().map(|m| m.height).unwrap_or(0) as f32).powi(2))
                    .sqrt();
                FrameQuality {
                    frame_id: o.perception.frame_id.clone(),
                    volume_cy: v.frame_volume_cy,
                    floor_quality: o.geometry.floor_quality,
                    depth_confidence: o.geometry.depth_confidence,
                    floor_flatness_p95: o.geometry.floor_flatness_p95,
                    inlier_ratio: o.geometry.plane.map(|p| p.inlier_ratio).unwrap_or(0.0),
                    valid_depth_pct: o.geometry.valid_depth_pct,
                    mask_coverage: v.mask_coverage,
                    bulk_centroid: o.perception.lane_b.mask.as_ref().and_then(|m| m.centroid()),
                    image_diag_px: diag.max(1.0),
                }
            })
            .collect();

        let mut fusion_result = fusion::run_fusion(&qualities, &volumetric_results);
        fusion_result.rejected_frames.extend(deadline_rejects);

        // Nothing usable made it through: minimum-load fallback quote
        if fusion_result.valid_frames.is_empty() {
            let mut response = output::minimum_load_response(
                &job_id,
                &ingestion_result.rejected_frames,
                "no frames produced a usable estimate",
            );
            response.diagnostics.rejected_frames.extend(
                fusion_result.rejected_frames
                    .iter()
                    .map(|(id, reason)| format!("{id}:{reason}")),
            );
            return Ok(response);
        }

        // Aggregate quality for grading
        let floor_quality = if outcomes.is_empty()
            || outcomes.iter().any(|o| o.geometry.floor_quality == FloorQuality::Failed)
        {
            FloorQuality::Failed
        } else if outcomes.iter().any(|o| o.geometry.floor_quality == FloorQuality::Noisy) {
            FloorQuality::Noisy
        } else {
            FloorQuality::Good
        };
        let depth_confidence_avg = if outcomes.is_empty() {
            0.0
        } else {
            outcomes.iter().map(|o| o.geometry.depth_confidence as f64).sum::<f64>()
                / outcomes.len() as f64
        };

        // A bulk mask that ran off the pile poisons the integration, so
        // any flagged frame routes the quote to a human
        let suspected_mask_leakage = outcomes
            .iter()
            .any(|o| o.perception.lane_b.risk.suspected_leakage());
        if suspected_mask_leakage {
            tracing::warn!(job_id, "bulk mask leakage suspected, flagging for review");
        }

        // Stage 7: decision output
        let mut response = output::build_output(
            &job_id,
            &ingestion_result.rejected_frames,
            &scale_result,
            &fusion_result,
            floor_quality,
            depth_confidence_avg,
            suspected_mask_leakage,
            request.heavy_material_level.as_deref(),
        );

        // Optional audit annotation on the best-view frame
        response.audit = self.run_audit(
            &ingestion_result.frames,
            &outcomes,
            &volumetric_results,
            &fusion_result,
            &scale_result,
        ).await;

        tracing::info!(
            job_id,
            final_volume_cy = response.final_volume_cy,
            confidence = response.confidence_score,
            valid_frames = response.diagnostics.valid_frames,
            "quote request complete"
        );

        Ok(response)
    }

    /// Stages 2 and 3 for one frame
    async fn process_frame(
        &self,
        frame: &IngestedFrame,
        cache: &MaskCache,
    ) -> Result<FrameOutcome, PipelineError> {
        let mut perception = perception::run_perception(
            frame,
            &self.adapters,
            cache,
            self.detector_conf_threshold,
        ).await?;

        let geometry = if floor_visible(&perception) {
            geometry::run_geometry(frame, &perception, &self.adapters, cache).await?
        } else {
            tracing::info!(
                frame_id = frame.metadata.image_id,
                "floor visibility gate failed, geometry skipped"
            );
            GeometryResult::failed(&frame.metadata.image_id)
        };

        // Attach the leakage risk signals computed by geometry
        perception.lane_b.risk = geometry.bulk_risk;

        Ok(FrameOutcome { perception, geometry })
    }

    /// Audit decorates the payload; it never feeds back into the volume
    async fn run_audit(
        &self,
        frames: &[IngestedFrame],
        outcomes: &[FrameOutcome],
        volumetric_results: &[VolumetricResult],
        fusion_result: &fusion::FusionResult,
        scale_result: &scale::ScaleResult,
    ) -> Option<crate::adapters::auditor::AuditOutput> {
        let best = best_view_frame(frames, outcomes)?;

        let mut detected: Vec<String> = outcomes
            .iter()
            .flat_map(|o| o.perception.lane_a.instances.iter().map(|i| i.label.clone()))
            .collect();
        detected.sort();
        detected.dedup();

        let mut flags = Vec::new();
        if scale_result.conservative_billing {
            flags.push("uncalibrated".to_string());
        }
        if fusion_result.viewpoint_diversity == fusion::Diversity::Low {
            flags.push("low_diversity".to_string());
        }

        let context = AuditContext {
            final_volume_cy: fusion_result.final_volume_cy,
            uncertainty_min_cy: fusion_result.uncertainty_min_cy,
            uncertainty_max_cy: fusion_result.uncertainty_max_cy,
            frame_volumes_cy: volumetric_results.iter().map(|v| v.frame_volume_cy).collect(),
            detected_items: detected,
            flags,
        };

        self.adapters.auditor.audit(&best.data_uri, &context).await
    }
}

/// Floor visibility gate: reject geometry when the pile swallows the
/// image or the bottom band has no clear ground
fn floor_visible(perception: &PerceptionResult) -> bool {
    let Some(bulk) = &perception.lane_b.mask else {
        return true;
    };

    let bulk_pct = bulk.area_ratio() * 100.0;
    if bulk_pct > GATE_BULK_COVER_MAX_PCT {
        return false;
    }

    // Clear share of the bottom band
    let band_start = ((bulk.height as f32) * (1.0 - GATE_BOTTOM_FRACTION)) as u32;
    let mut band_px = 0usize;
    let mut clear_px = 0usize;
    for r in band_start..bulk.height {
        for c in 0..bulk.width {
            band_px += 1;
            if !bulk.get(r, c) {
                clear_px += 1;
            }
        }
    }
    if band_px == 0 {
        return true;
    }

    let clear_pct = (clear_px as f32 / band_px as f32) * 100.0;
    clear_pct >= GATE_CLEAR_MIN_PCT
}

/// Best-view selection for the audit: the frame with the strongest floor
/// and depth evidence
fn best_view_frame<'a>(
    frames: &'a [IngestedFrame],
    outcomes: &[FrameOutcome],
) -> Option<&'a IngestedFrame> {
    let rank = |q: FloorQuality| match q {
        FloorQuality::Good => 0,
        FloorQuality::Noisy => 1,
        FloorQuality::Failed => 2,
    };

    let best = outcomes.iter().min_by(|a, b| {
        rank(a.geometry.floor_quality)
            .cmp(&rank(b.geometry.floor_quality))
            .then_with(|| {
                b.geometry.depth_confidence
                    .partial_cmp(&a.geometry.depth_confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.perception.frame_id.cmp(&b.perception.frame_id))
    })?;

    frames.iter().find(|f| f.metadata.image_id == best.perception.frame_id)
}
