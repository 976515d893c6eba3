//! Scene scale calibration ladder: anchor consensus, then camera
//! intrinsics, then a conservative uncalibrated fallback. Stops at the
//! first tier that succeeds and emits reason codes for every decision.

// Custom modules
use crate::calibration::Confidence;
use crate::catalog::AnchorKind;
use crate::mask::DepthMap;
use crate::perception::Instance;
use crate::utils;

/// Anchors must agree with the consensus within this relative band
const ANCHOR_AGREEMENT_TOLERANCE: f32 = 0.10;
/// Depth below this is treated as invalid inside an anchor bbox
const ANCHOR_DEPTH_FLOOR_M: f32 = 0.1;

/// One anchor measured against its own frame's depth
#[derive(Clone, Debug)]
pub struct AnchorMeasurement {
    pub anchor_id: String,
    pub label: String,
    pub kind: AnchorKind,
    pub expected_m: f32,
    pub measured_m: f32,
    pub scale_factor: f32,
    pub confidence: f32,
    /// The bbox shape looks right for this anchor kind
    pub aspect_ok: bool,
}

/// Which tier of the ladder produced the scale
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleSource {
    AnchorConsensus,
    Exif,
    Intrinsics,
    Fallback,
}

impl ScaleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleSource::AnchorConsensus => "anchor_consensus",
            ScaleSource::Exif => "exif",
            ScaleSource::Intrinsics => "intrinsics",
            ScaleSource::Fallback => "fallback",
        }
    }
}

/// Result of scale calibration
#[derive(Clone, Debug)]
pub struct ScaleResult {
    /// Multiply all distances by this
    pub scale_factor: f32,
    pub source: ScaleSource,
    pub confidence: Confidence,
    pub conservative_billing: bool,
    pub review_required: bool,
    pub measurements: Vec<AnchorMeasurement>,
    pub conflict_detected: bool,
    pub reason_codes: Vec<String>,
}

/// Measures the real-world size of an anchor from depth:
/// size = (bbox_px / fx) * median(depth within bbox)
fn measure_anchor_size(
    instance: &Instance,
    depth: &DepthMap,
    fx: f32,
) -> Option<f32> {
    if fx <= 0.0 {
        return None;
    }

    let [x1, y1, x2, y2] = instance.bbox;
    let x1 = (x1.max(0.0) as u32).min(depth.width.saturating_sub(1));
    let x2 = (x2.max(0.0) as u32).min(depth.width.saturating_sub(1));
    let y1 = (y1.max(0.0) as u32).min(depth.height.saturating_sub(1));
    let y2 = (y2.max(0.0) as u32).min(depth.height.saturating_sub(1));
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let mut samples: Vec<f32> = Vec::with_capacity(((y2 - y1) * (x2 - x1)) as usize);
    for r in y1..y2 {
        for c in x1..x2 {
            let d = depth.get(r, c);
            if d > ANCHOR_DEPTH_FLOOR_M {
                samples.push(d);
            }
        }
    }
    if samples.is_empty() {
        return None;
    }

    let median_depth = utils::median(&samples);
    if median_depth <= 0.0 {
        return None;
    }

    let bbox_h = (y2 - y1) as f32;
    let bbox_w = (x2 - x1) as f32;
    let kind = AnchorKind::from_label(&instance.label)?;

    // Vertical anchors measure by height; tires by their larger extent
    let size_px = match kind {
        AnchorKind::Tire => bbox_h.max(bbox_w),
        _ => bbox_h,
    };

    Some((size_px / fx) * median_depth)
}

/// Doors read tall, tires read square. A bad aspect usually means the
/// detector boxed a partial view.
fn aspect_valid(kind: AnchorKind, bbox: [f32; 4]) -> bool {
    let w = (bbox[2] - bbox[0]).max(1.0);
    let h = (bbox[3] - bbox[1]).max(1.0);
    match kind {
        AnchorKind::Door => h > w,
        AnchorKind::Tire => (0.5..=2.0).contains(&(w / h)),
        _ => true,
    }
}

/// Measures every anchor instance of one frame against that frame's depth
pub fn measure_frame_anchors(
    anchors: &[Instance],
    depth: &DepthMap,
    fx: f32,
) -> Vec<AnchorMeasurement> {
    let mut measurements = Vec::new();

    for anchor in anchors {
        let Some(kind) = AnchorKind::from_label(&anchor.label) else {
            continue;
        };
        let Some(measured) = measure_anchor_size(anchor, depth, fx) else {
            continue;
        };
        if measured <= 0.0 {
            continue;
        }

        let expected = kind.expected_size_m();
        measurements.push(AnchorMeasurement {
            anchor_id: anchor.instance_id.clone(),
            label: anchor.label.clone(),
            kind,
            expected_m: expected,
            measured_m: measured,
            scale_factor: expected / measured,
            confidence: anchor.confidence,
            aspect_ok: aspect_valid(kind, anchor.bbox),
        });
    }

    measurements
}

/// Median consensus over anchor scales with conflict detection. Anchors
/// deviating more than the tolerance from the median are outliers; the
/// consensus is recomputed over the in-band subset.
fn compute_consensus(measurements: &[AnchorMeasurement]) -> (f32, bool) {
    let scales: Vec<f32> = measurements.iter().map(|m| m.scale_factor).collect();
    if scales.len() == 1 {
        return (scales[0], false);
    }

    let median_scale = utils::median(&scales);
    let conflict = scales
        .iter()
        .any(|sf| ((sf - median_scale) / median_scale).abs() > ANCHOR_AGREEMENT_TOLERANCE);

    if conflict {
        let in_band: Vec<f32> = scales
            .iter()
            .copied()
            .filter(|sf| ((sf - median_scale) / median_scale).abs() <= ANCHOR_AGREEMENT_TOLERANCE)
            .collect();
        if !in_band.is_empty() {
            return (utils::median(&in_band), true);
        }
    }

    (median_scale, conflict)
}

/// Scale calibration entry point. Measurements come from
/// [`measure_frame_anchors`] across all frames.
pub fn run_scale_calibration(
    mut measurements: Vec<AnchorMeasurement>,
    exif_available: bool,
    intrinsics_available: bool,
) -> ScaleResult {
    let mut reason_codes: Vec<String> = Vec::new();

    if !exif_available {
        reason_codes.push("missing_exif".to_string());
    }
    if !intrinsics_available {
        reason_codes.push("depthpro_intrinsics_unavailable".to_string());
    }
    if measurements.is_empty() {
        reason_codes.push("no_anchors_detected".to_string());
    }

    // Deterministic ordering: most trusted anchor kinds first, clean
    // aspect before suspect aspect
    measurements.sort_by(|a, b| {
        a.kind.trust_rank()
            .cmp(&b.kind.trust_rank())
            .then_with(|| b.aspect_ok.cmp(&a.aspect_ok))
            .then_with(|| a.anchor_id.cmp(&b.anchor_id))
    });

    // Tier 1: anchor consensus measures the actual scene
    if !measurements.is_empty() {
        let (scale, conflict) = compute_consensus(&measurements);
        if conflict {
            reason_codes.push("anchor_conflict_detected".to_string());
        }

        let result = ScaleResult {
            scale_factor: scale,
            source: ScaleSource::AnchorConsensus,
            confidence: if conflict { Confidence::Med } else { Confidence::High },
            conservative_billing: false,
            review_required: false,
            measurements,
            conflict_detected: conflict,
            reason_codes,
        };
        log_scale_trace(&result);
        return result;
    }

    // Tier 2: trust the camera intrinsics
    if exif_available || intrinsics_available {
        if !exif_available {
            reason_codes.push("exif_unavailable_using_intrinsics".to_string());
        }
        let result = ScaleResult {
            scale_factor: 1.0,
            source: if exif_available { ScaleSource::Exif } else { ScaleSource::Intrinsics },
            confidence: Confidence::Med,
            conservative_billing: false,
            review_required: false,
            measurements,
            conflict_detected: false,
            reason_codes,
        };
        log_scale_trace(&result);
        return result;
    }

    // Tier 3: uncalibrated, bill conservatively and flag for review
    reason_codes.push("uncalibrated_mode".to_string());
    let result = ScaleResult {
        scale_factor: 1.0,
        source: ScaleSource::Fallback,
        confidence: Confidence::Low,
        conservative_billing: true,
        review_required: true,
        measurements,
        conflict_detected: false,
        reason_codes,
    };
    log_scale_trace(&result);
    result
}

fn log_scale_trace(result: &ScaleResult) {
    tracing::info!(
        source = result.source.as_str(),
        scale_factor = result.scale_factor,
        confidence = result.confidence.as_str(),
        anchors_used = result.measurements.len(),
        conflict = result.conflict_detected,
        reason_codes = result.reason_codes.join(","),
        "scale calibration decision"
    );
    for m in &result.measurements {
        tracing::debug!(
            label = m.label,
            expected_m = m.expected_m,
            measured_m = m.measured_m,
            scale = m.scale_factor,
            "anchor measurement"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(label: &str, kind: AnchorKind, scale: f32) -> AnchorMeasurement {
        AnchorMeasurement {
            anchor_id: format!("{label}-1"),
            label: label.to_string(),
            kind,
            expected_m: kind.expected_size_m(),
            measured_m: kind.expected_size_m() / scale,
            scale_factor: scale,
            confidence: 0.9,
            aspect_ok: true,
        }
    }

    fn flat_depth(width: u32, height: u32, value: f32) -> DepthMap {
        DepthMap::new(width, height, value)
    }

    fn anchor_instance(label: &str, bbox: [f32; 4]) -> Instance {
        Instance {
            instance_id: format!("{label}-i"),
            label: label.to_string(),
            confidence: 0.9,
            bbox,
            mask: None,
            area_ratio: 0.05,
            is_anchor: true,
            is_high_value: false,
        }
    }

    #[test]
    fn door_measurement_matches_projection() {
        // Door at 3m, fx=800: a 2.03m door spans 2.03*800/3 = 541px
        let depth = flat_depth(1024, 768, 3.0);
        let door = anchor_instance("door", [100.0, 100.0, 300.0, 641.3]);

        let measurements = measure_frame_anchors(&[door], &depth, 800.0);
        assert_eq!(measurements.len(), 1);
        assert!((measurements[0].measured_m - 2.03).abs() < 0.02);
        assert!((measurements[0].scale_factor - 1.0).abs() < 0.02);
    }

    #[test]
    fn agreeing_anchors_grade_high() {
        let result = run_scale_calibration(
            vec![
                measurement("door", AnchorKind::Door, 1.00),
                measurement("trash bin", AnchorKind::TrashBin, 1.05),
            ],
            true,
            true,
        );
        assert_eq!(result.source, ScaleSource::AnchorConsensus);
        assert_eq!(result.confidence, Confidence::High);
        assert!(!result.conflict_detected);
        // Property: two agreeing anchors stay within 10% of each other
        assert!((result.scale_factor - 1.025).abs() < 1e-3);
    }

    #[test]
    fn conflicting_anchor_is_outlier_and_demotes() {
        // Door and bin say 1.0, tire says 1.3: tire is the outlier
        let result = run_scale_calibration(
            vec![
                measurement("door", AnchorKind::Door, 1.00),
                measurement("tire", AnchorKind::Tire, 1.30),
                measurement("trash bin", AnchorKind::TrashBin, 1.02),
            ],
            true,
            true,
        );
        assert!(result.conflict_detected);
        assert_eq!(result.confidence, Confidence::Med);
        assert!(result.reason_codes.iter().any(|r| r == "anchor_conflict_detected"));
        // Chosen scale is the median of the in-band anchors
        assert!((result.scale_factor - 1.01).abs() < 1e-3);
    }

    #[test]
    fn intrinsics_tier_when_no_anchors() {
        let result = run_scale_calibration(Vec::new(), true, true);
        assert_eq!(result.source, ScaleSource::Exif);
        assert_eq!(result.scale_factor, 1.0);
        assert_eq!(result.confidence, Confidence::Med);
        assert!(result.reason_codes.iter().any(|r| r == "no_anchors_detected"));
    }

    #[test]
    fn fallback_tier_flags_review() {
        let result = run_scale_calibration(Vec::new(), false, false);
        assert_eq!(result.source, ScaleSource::Fallback);
        assert!(result.conservative_billing);
        assert!(result.review_required);
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.reason_codes.iter().any(|r| r == "uncalibrated_mode"));
        assert!(result.reason_codes.iter().any(|r| r == "missing_exif"));
    }
}
