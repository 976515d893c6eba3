//! Responsible for the decision gate: conservative rounding, overall
//! confidence grading, billable line items and operational flags,
//! rendered as the response payload.

use serde::Serialize;

// Custom modules
use crate::adapters::auditor::AuditOutput;
use crate::calibration::Confidence;
use crate::calibration::scale::ScaleResult;
use crate::fusion::{Diversity, FusionResult};
use crate::geometry::FloorQuality;
use crate::ingestion::FrameMetadata;

/// Conservative billing rounds up to this tier
const CONSERVATIVE_ROUND_TIER: f64 = 0.5;
/// Fallback quote when nothing survives the pipeline
pub const MINIMUM_LOAD_CY: f64 = 0.5;
/// Bulk lines below this are dropped as noise
const BULK_LINE_MIN_CY: f64 = 0.1;

/// A billable line in the quote
#[derive(Clone, Debug, Serialize)]
pub struct LineItem {
    pub name: String,
    pub qty: u32,
    pub vol_cy: f64,
    /// "Discrete_Database" or "Measured_Terrain"
    pub source: String,
    pub surcharges: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Operational flags for review and routing
#[derive(Clone, Debug, Serialize)]
pub struct FlagsPayload {
    pub review_required: bool,
    pub calibration_source: String,
    pub viewpoint_diversity: String,
    pub conservative_billing: bool,
    pub truck_capacity_exceeded: bool,
}

/// Diagnostic block for debugging and operations
#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticsPayload {
    pub valid_frames: usize,
    pub rejected_frames: Vec<String>,
    pub floor_quality: String,
    pub depth_confidence_avg: f64,
    pub calibration_source: String,
    pub fusion_method: String,
    /// Any frame's bulk mask showed leakage-risk signals
    pub suspected_mask_leakage: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heavy_material_level: Option<String>,
}

/// Final response payload
#[derive(Clone, Debug, Serialize)]
pub struct QuoteResponse {
    pub job_id: String,
    pub final_volume_cy: f64,
    pub uncertainty_range: [f64; 2],
    /// "HIGH" | "MEDIUM" | "LOW"
    pub confidence_score: String,
    pub line_items: Vec<LineItem>,
    pub flags: FlagsPayload,
    pub diagnostics: DiagnosticsPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Rounds UP to the next half-yard tier
fn round_conservative(volume: f64) -> f64 {
    (volume / CONSERVATIVE_ROUND_TIER).ceil() * CONSERVATIVE_ROUND_TIER
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn title_case(label: &str) -> String {
    label
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Overall confidence: start at 3, subtract for weak calibration, weak
/// floor, low diversity and thin frame coverage
fn overall_confidence(
    calibration: Confidence,
    floor_quality: FloorQuality,
    diversity: Diversity,
    valid_frame_count: usize,
) -> &'static str {
    let mut score: i32 = 3;

    match calibration {
        Confidence::Low => score -= 2,
        Confidence::Med => score -= 1,
        Confidence::High => {}
    }
    match floor_quality {
        FloorQuality::Failed => score -= 2,
        FloorQuality::Noisy => score -= 1,
        FloorQuality::Good => {}
    }
    if diversity == Diversity::Low {
        score -= 1;
    }
    if valid_frame_count < 2 {
        score -= 1;
    }

    if score >= 3 {
        "HIGH"
    } else if score >= 1 {
        "MEDIUM"
    } else {
        "LOW"
    }
}

fn build_line_items(
    fusion: &FusionResult,
    final_volume: f64,
    heavy_surcharge: bool,
) -> Vec<LineItem> {
    let mut items = Vec::new();
    let mut discrete_total = 0.0f64;
    let mut absorbed_count = 0usize;

    for item in &fusion.items {
        if item.absorbed_into_bulk {
            absorbed_count += 1;
            continue;
        }
        if item.volume_cy <= 0.0 {
            continue;
        }
        items.push(LineItem {
            name: title_case(&item.label),
            qty: 1,
            vol_cy: round2(item.volume_cy),
            source: "Discrete_Database".to_string(),
            surcharges: item.surcharges.iter().map(|s| s.as_str().to_string()).collect(),
            note: None,
        });
        discrete_total += item.volume_cy;
    }

    let bulk_cy = (final_volume - discrete_total).max(0.0);
    if bulk_cy > BULK_LINE_MIN_CY {
        let note = if absorbed_count > 0 {
            Some(format!("Includes {absorbed_count} low-confidence items"))
        } else {
            None
        };
        let surcharges = if heavy_surcharge {
            vec![crate::catalog::Surcharge::HeavyMaterial.as_str().to_string()]
        } else {
            Vec::new()
        };
        items.push(LineItem {
            name: "Mixed Bulk Debris".to_string(),
            qty: 1,
            vol_cy: round1(bulk_cy),
            source: "Measured_Terrain".to_string(),
            surcharges,
            note,
        });
    }

    items
}

/// Output entry point: assembles the final payload
#[allow(clippy::too_many_arguments)]
pub fn build_output(
    job_id: &str,
    ingestion_rejects: &[FrameMetadata],
    scale: &ScaleResult,
    fusion: &FusionResult,
    floor_quality: FloorQuality,
    depth_confidence_avg: f64,
    suspected_mask_leakage: bool,
    heavy_material_level: Option<&str>,
) -> QuoteResponse {
    let mut final_volume = fusion.final_volume_cy;
    let mut uncertainty_min = fusion.uncertainty_min_cy;
    let mut uncertainty_max = fusion.uncertainty_max_cy;

    if scale.conservative_billing {
        final_volume = round_conservative(final_volume);
        uncertainty_max = round_conservative(uncertainty_max);
    }

    let review_required = scale.review_required
        || scale.confidence == Confidence::Low
        || floor_quality == FloorQuality::Failed
        || fusion.valid_frames.len() < 2
        || suspected_mask_leakage;

    let confidence = overall_confidence(
        scale.confidence,
        floor_quality,
        fusion.viewpoint_diversity,
        fusion.valid_frames.len(),
    );

    let heavy_surcharge = matches!(heavy_material_level, Some("mostly") | Some("all"));
    let line_items = build_line_items(fusion, final_volume, heavy_surcharge);

    let mut rejected: Vec<String> = ingestion_rejects
        .iter()
        .map(|m| {
            format!(
                "{}:{}",
                m.image_id,
                m.rejection_reason.as_deref().unwrap_or("rejected")
            )
        })
        .collect();
    rejected.extend(
        fusion.rejected_frames
            .iter()
            .map(|(id, reason)| format!("{id}:{reason}")),
    );

    final_volume = round2(final_volume);
    uncertainty_min = round2(uncertainty_min);
    uncertainty_max = round2(uncertainty_max);

    QuoteResponse {
        job_id: job_id.to_string(),
        final_volume_cy: final_volume,
        uncertainty_range: [uncertainty_min, uncertainty_max],
        confidence_score: confidence.to_string(),
        line_items,
        flags: FlagsPayload {
            review_required,
            calibration_source: scale.source.as_str().to_string(),
            viewpoint_diversity: fusion.viewpoint_diversity.as_str().to_string(),
            conservative_billing: scale.conservative_billing,
            truck_capacity_exceeded: fusion.capacity_exceeded,
        },
        diagnostics: DiagnosticsPayload {
            valid_frames: fusion.valid_frames.len(),
            rejected_frames: rejected,
            floor_quality: floor_quality.as_str().to_string(),
            depth_confidence_avg: round2(depth_confidence_avg),
            calibration_source: scale.source.as_str().to_string(),
            fusion_method: fusion.fusion_method.as_str().to_string(),
            suspected_mask_leakage,
            heavy_material_level: heavy_material_level.map(|s| s.to_string()),
        },
        audit: None,
        note: None,
    }
}

/// Minimum-load fallback for empty or fully failed requests
pub fn minimum_load_response(
    job_id: &str,
    ingestion_rejects: &[FrameMetadata],
    note: &str,
) -> QuoteResponse {
    QuoteResponse {
        job_id: job_id.to_string(),
        final_volume_cy: MINIMUM_LOAD_CY,
        uncertainty_range: [MINIMUM_LOAD_CY, MINIMUM_LOAD_CY],
        confidence_score: "LOW".to_string(),
        line_items: Vec::new(),
        flags: FlagsPayload {
            review_required: true,
            calibration_source: "fallback".to_string(),
            viewpoint_diversity: "unknown".to_string(),
            conservative_billing: true,
            truck_capacity_exceeded: false,
        },
        diagnostics: DiagnosticsPayload {
            valid_frames: 0,
            rejected_frames: ingestion_rejects
                .iter()
                .map(|m| {
                    format!(
                        "{}:{}",
                        m.image_id,
                        m.rejection_reason.as_deref().unwrap_or("rejected")
                    )
                })
                .collect(),
            floor_quality: "failed".to_string(),
            depth_confidence_avg: 0.0,
            calibration_source: "fallback".to_string(),
            fusion_method: "no_valid_frames".to_string(),
            suspected_mask_leakage: false,
            heavy_material_level: None,
        },
        audit: None,
        note: Some(note.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::scale::{ScaleResult, ScaleSource};
    use crate::fusion::FusionMethod;
    use crate::volumetrics::DiscreteItem;

    fn scale(conservative: bool, confidence: Confidence) -> ScaleResult {
        ScaleResult {
            scale_factor: 1.0,
            source: if conservative { ScaleSource::Fallback } else { ScaleSource::AnchorConsensus },
            confidence,
            conservative_billing: conservative,
            review_required: conservative,
            measurements: Vec::new(),
            conflict_detected: false,
            reason_codes: Vec::new(),
        }
    }

    fn fusion(volume: f64, items: Vec<DiscreteItem>) -> FusionResult {
        FusionResult {
            final_volume_cy: volume,
            uncertainty_min_cy: volume * 0.85,
            uncertainty_max_cy: volume * 1.15,
            valid_frames: vec!["a".to_string(), "b".to_string()],
            rejected_frames: Vec::new(),
            viewpoint_diversity: Diversity::Good,
            fusion_method: FusionMethod::WeightedMedian,
            items,
            capacity_exceeded: false,
            sum_valid_cy: volume,
            sum_weighted_cy: volume,
        }
    }

    fn sofa_item() -> DiscreteItem {
        DiscreteItem {
            instance_id: "i1".to_string(),
            label: "sofa".to_string(),
            volume_cy: 2.0,
            confidence: 0.9,
            surcharges: vec![crate::catalog::Surcharge::TwoPersonLift],
            has_mask: true,
            area_ratio: 0.2,
            absorbed_into_bulk: false,
        }
    }

    #[test]
    fn conservative_rounding_is_ceil_to_half() {
        assert_eq!(round_conservative(2.01), 2.5);
        assert_eq!(round_conservative(2.5), 2.5);
        assert_eq!(round_conservative(0.1), 0.5);
    }

    #[test]
    fn confidence_grading_matrix() {
        assert_eq!(overall_confidence(Confidence::High, FloorQuality::Good, Diversity::Good, 3), "HIGH");
        assert_eq!(overall_confidence(Confidence::Med, FloorQuality::Noisy, Diversity::Good, 3), "MEDIUM");
        assert_eq!(overall_confidence(Confidence::Low, FloorQuality::Failed, Diversity::Low, 1), "LOW");
        assert_eq!(overall_confidence(Confidence::High, FloorQuality::Good, Diversity::Low, 1), "MEDIUM");
    }

    #[test]
    fn sofa_only_quote_has_no_bulk_line() {
        let response = build_output(
            "job1",
            &[],
            &scale(false, Confidence::High),
            &fusion(2.0, vec![sofa_item()]),
            FloorQuality::Good,
            0.8,
            false,
            None,
        );

        assert_eq!(response.line_items.len(), 1);
        assert_eq!(response.line_items[0].name, "Sofa");
        assert_eq!(response.line_items[0].source, "Discrete_Database");
        assert_eq!(response.confidence_score, "HIGH");
        assert!(!response.flags.review_required);
    }

    #[test]
    fn bulk_remainder_becomes_terrain_line() {
        let response = build_output(
            "job1",
            &[],
            &scale(false, Confidence::High),
            &fusion(5.0, vec![sofa_item()]),
            FloorQuality::Good,
            0.8,
            false,
            None,
        );

        assert_eq!(response.line_items.len(), 2);
        let bulk = &response.line_items[1];
        assert_eq!(bulk.name, "Mixed Bulk Debris");
        assert_eq!(bulk.source, "Measured_Terrain");
        assert!((bulk.vol_cy - 3.0).abs() < 1e-9);
    }

    #[test]
    fn conservative_billing_rounds_up() {
        let response = build_output(
            "job1",
            &[],
            &scale(true, Confidence::Low),
            &fusion(3.2, Vec::new()),
            FloorQuality::Good,
            0.8,
            false,
            None,
        );

        assert_eq!(response.final_volume_cy, 3.5);
        assert!(response.flags.conservative_billing);
        assert!(response.flags.review_required);
    }

    #[test]
    fn heavy_material_stamps_bulk_surcharge() {
        let response = build_output(
            "job1",
            &[],
            &scale(false, Confidence::High),
            &fusion(4.0, Vec::new()),
            FloorQuality::Good,
            0.8,
            false,
            Some("mostly"),
        );

        let bulk = &response.line_items[0];
        assert!(bulk.surcharges.contains(&"heavy_material".to_string()));
    }

    #[test]
    fn minimum_load_is_half_yard_low() {
        let response = minimum_load_response("job1", &[], "no usable frames");
        assert_eq!(response.final_volume_cy, MINIMUM_LOAD_CY);
        assert_eq!(response.confidence_score, "LOW");
        assert!(response.flags.review_required);
        assert!(response.note.is_some());
    }

    #[test]
    fn mask_leakage_suspicion_forces_review() {
        let response = build_output(
            "job1",
            &[],
            &scale(false, Confidence::High),
            &fusion(4.0, Vec::new()),
            FloorQuality::Good,
            0.8,
            true,
            None,
        );

        assert!(response.diagnostics.suspected_mask_leakage);
        assert!(response.flags.review_required);
    }

    #[test]
    fn capacity_exceeded_flag_reaches_the_payload() {
        let mut capped = fusion(20.0, Vec::new());
        capped.capacity_exceeded = true;
        capped.uncertainty_max_cy = 20.0;

        let response = build_output(
            "job1",
            &[],
            &scale(false, Confidence::High),
            &capped,
            FloorQuality::Good,
            0.8,
            false,
            None,
        );

        assert_eq!(response.final_volume_cy, 20.0);
        assert!(response.flags.truck_capacity_exceeded);
        assert!(response.uncertainty_range[1] <= 20.0);
    }

    #[test]
    fn payload_serializes_with_expected_keys() {
        let response = build_output(
            "job1",
            &[],
            &scale(false, Confidence::High),
            &fusion(2.0, vec![sofa_item()]),
            FloorQuality::Good,
            0.8,
            false,
            None,
        );

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("final_volume_cy").is_some());
        assert!(json.get("uncertainty_range").is_some());
        assert!(json.get("confidence_score").is_some());
        assert!(json.get("line_items").is_some());
        assert!(json.get("flags").is_some());
        assert!(json.get("diagnostics").is_some());
        // Audit absent unless the auditor ran
        assert!(json.get("audit").is_none());
    }
}
