//! Responsible for the parallel perception lanes run on every frame:
//! instance detection, bulk pile segmentation, scene classification and
//! semantic floor extraction. Lanes A, C and D run concurrently; lane B
//! waits on lane D because it consumes the floor mask.

// Custom modules
use crate::PipelineError;
use crate::adapters::ModelAdapters;
use crate::adapters::cache::MaskCache;
use crate::adapters::detector::Detection;
use crate::adapters::semantic::{SemanticBias, SemanticRawOutput};
use crate::catalog;
use crate::ingestion::IngestedFrame;
use crate::mask::Mask;
use crate::utils;

/// Dilation radius applied to the combined bulk mask
const BULK_DILATION_PX: u32 = 8;
/// Minimum floor coverage for a semantic model to be chosen
const FLOOR_AREA_MIN_PCT: f32 = 5.0;
/// Outdoor model must beat indoor by this margin to win
const FLOOR_OUTDOOR_MARGIN_PCT: f32 = 2.0;

/// Scene classification for ground-plane logic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneType {
    IndoorFlat,
    OutdoorDriveway,
    UnevenGround,
    Unknown,
}

impl SceneType {
    pub fn as_str(self) -> &'static str {
        match self {
            SceneType::IndoorFlat => "indoor_flat",
            SceneType::OutdoorDriveway => "outdoor_driveway",
            SceneType::UnevenGround => "uneven_ground",
            SceneType::Unknown => "unknown",
        }
    }

    fn from_label(label: &str) -> Self {
        match label {
            "indoor_flat" | "indoor" => SceneType::IndoorFlat,
            "outdoor_driveway" | "outdoor" | "driveway" => SceneType::OutdoorDriveway,
            "uneven_ground" | "uneven" | "yard" => SceneType::UnevenGround,
            _ => SceneType::Unknown,
        }
    }

    /// Yard-waste-like scenes keep vegetation inside the pile candidates
    pub fn is_yard_waste_like(self) -> bool {
        self == SceneType::UnevenGround
    }
}

/// One detected discrete object. Owned by its frame; references between
/// frames go through frame id plus instance id.
#[derive(Clone, Debug)]
pub struct Instance {
    /// Stable id: hash of label + bbox + frame
    pub instance_id: String,
    pub label: String,
    pub confidence: f32,
    /// x1, y1, x2, y2 in working-image pixels
    pub bbox: [f32; 4],
    pub mask: Option<Mask>,
    pub area_ratio: f32,
    pub is_anchor: bool,
    pub is_high_value: bool,
}

/// Lane A output
#[derive(Clone, Debug, Default)]
pub struct LaneAResult {
    pub instances: Vec<Instance>,
}

impl LaneAResult {
    pub fn anchors(&self) -> Vec<Instance> {
        self.instances.iter().filter(|i| i.is_anchor).cloned().collect()
    }
}

/// Leakage risk signals attached to the bulk mask after geometry runs
#[derive(Clone, Copy, Debug, Default)]
pub struct BulkRisk {
    /// Fraction of mask pixels on steep (vertical) surfaces
    pub vertical_pct: f32,
    /// Height anomaly at the mask boundary relative to the interior
    pub boundary_spike: f32,
    /// Fraction of mask pixels far behind the scene median
    pub far_pct: f32,
}

/// A mask dominated by walls, spiking at its edges or reaching into the
/// far background probably leaked off the pile
const RISK_VERTICAL_MAX: f32 = 0.5;
const RISK_BOUNDARY_SPIKE_MAX: f32 = 0.5;
const RISK_FAR_MAX: f32 = 0.35;

impl BulkRisk {
    pub fn suspected_leakage(&self) -> bool {
        self.vertical_pct > RISK_VERTICAL_MAX
            || self.boundary_spike > RISK_BOUNDARY_SPIKE_MAX
            || self.far_pct > RISK_FAR_MAX
    }
}

/// Lane B output: the pile region
#[derive(Clone, Debug)]
pub struct LaneBResult {
    /// Mask after floor subtraction; what volumetrics integrates over
    pub mask: Option<Mask>,
    /// Mask before floor subtraction; kept for depth-aware refinement
    pub raw_mask: Option<Mask>,
    pub area_ratio: f32,
    pub confidence: f32,
    pub risk: BulkRisk,
}

impl LaneBResult {
    fn empty() -> Self {
        Self {
            mask: None,
            raw_mask: None,
            area_ratio: 0.0,
            confidence: 0.0,
            risk: BulkRisk::default(),
        }
    }
}

/// Lane C output
#[derive(Clone, Copy, Debug)]
pub struct LaneCResult {
    pub scene_type: SceneType,
    pub confidence: f32,
}

/// Lane D output: drivable/standing ground plus background layers
#[derive(Clone, Debug)]
pub struct LaneDResult {
    pub floor_mask: Option<Mask>,
    /// Always subtractable background: sky, building, fence, person, car
    pub safe_bg_mask: Option<Mask>,
    /// Vegetation; subtractable only outside yard-waste scenes
    pub risky_bg_mask: Option<Mask>,
    pub floor_area_ratio: f32,
    pub model_used: String,
    pub labels_found: Vec<String>,
    pub safe_bg_labels: Vec<String>,
    pub risky_bg_labels: Vec<String>,
}

impl LaneDResult {
    fn none() -> Self {
        Self {
            floor_mask: None,
            safe_bg_mask: None,
            risky_bg_mask: None,
            floor_area_ratio: 0.0,
            model_used: "none".to_string(),
            labels_found: Vec::new(),
            safe_bg_labels: Vec::new(),
            risky_bg_labels: Vec::new(),
        }
    }
}

/// Combined result from all perception lanes
pub struct PerceptionResult {
    pub frame_id: String,
    pub lane_a: LaneAResult,
    pub lane_b: LaneBResult,
    pub lane_c: LaneCResult,
    pub lane_d: LaneDResult,
}

/// Stable instance id from label + position + frame
fn instance_id(frame_id: &str, label: &str, bbox: [f32; 4]) -> String {
    let key = format!(
        "{frame_id}:{label}:{}:{}:{}:{}",
        bbox[0] as i64, bbox[1] as i64, bbox[2] as i64, bbox[3] as i64
    );
    utils::sha256_hex(key.as_bytes())[..12].to_string()
}

fn build_instances(detections: Vec<Detection>, frame_id: &str, width: u32, height: u32) -> LaneAResult {
    let image_area = (width as f32) * (height as f32);
    let mut result = LaneAResult::default();

    for det in detections {
        let label = det.label.to_lowercase();
        let is_anchor = catalog::AnchorKind::from_label(&label).is_some();
        let is_high_value = catalog::is_high_value(&label);

        let area_ratio = match &det.mask {
            Some(mask) => mask.area_ratio(),
            None => {
                let w = (det.bbox[2] - det.bbox[0]).max(0.0);
                let h = (det.bbox[3] - det.bbox[1]).max(0.0);
                if image_area > 0.0 { (w * h) / image_area } else { 0.0 }
            }
        };

        result.instances.push(Instance {
            instance_id: instance_id(frame_id, &label, det.bbox),
            label,
            confidence: det.confidence,
            bbox: det.bbox,
            mask: det.mask,
            area_ratio,
            is_anchor,
            is_high_value,
        });
    }

    result
}

/// Classifies semantic segments into floor / safe background / risky
/// background masks using the label tables
fn classify_semantic(output: &SemanticRawOutput, floor_labels: &[&str]) -> LaneDResult {
    let (w, h) = (output.width, output.height);
    let mut floor = Mask::new(w, h);
    let mut safe = Mask::new(w, h);
    let mut risky = Mask::new(w, h);
    let mut labels_found = Vec::new();
    let mut safe_labels = Vec::new();
    let mut risky_labels = Vec::new();

    for seg in &output.segments {
        if floor_labels.iter().any(|fl| seg.label.contains(fl)) {
            floor.union_with(&seg.mask);
            labels_found.push(seg.label.clone());
        } else if catalog::SAFE_BG_LABELS.iter().any(|l| seg.label.contains(l)) {
            safe.union_with(&seg.mask);
            safe_labels.push(seg.label.clone());
        } else if catalog::RISKY_BG_LABELS.iter().any(|l| seg.label.contains(l)) {
            risky.union_with(&seg.mask);
            risky_labels.push(seg.label.clone());
        }
    }

    let floor_area_ratio = floor.area_ratio();
    LaneDResult {
        floor_mask: Some(floor),
        safe_bg_mask: Some(safe),
        risky_bg_mask: Some(risky),
        floor_area_ratio,
        model_used: String::new(),
        labels_found,
        safe_bg_labels: safe_labels,
        risky_bg_labels: risky_labels,
    }
}

/// Lane D: run both semantic variants and choose per frame.
/// Outdoor wins when it covers at least 5% and beats indoor by 2%.
async fn run_lane_d(
    adapters: &ModelAdapters,
    cache: &MaskCache,
    frame: &IngestedFrame,
) -> Result<LaneDResult, PipelineError> {
    let (w, h) = (frame.metadata.width, frame.metadata.height);
    let sha = &frame.metadata.preproc_sha256;

    let (outdoor_raw, indoor_raw) = tokio::join!(
        adapters.semantic.segment_cached(cache, &frame.data_uri, sha, w, h, SemanticBias::Outdoor),
        adapters.semantic.segment_cached(cache, &frame.data_uri, sha, w, h, SemanticBias::Indoor),
    );
    let outdoor_raw = outdoor_raw?;
    let indoor_raw = indoor_raw?;

    let outdoor = classify_semantic(&outdoor_raw, catalog::OUTDOOR_FLOOR_LABELS);
    let indoor = classify_semantic(&indoor_raw, catalog::INDOOR_FLOOR_LABELS);

    let outdoor_pct = outdoor.floor_area_ratio * 100.0;
    let indoor_pct = indoor.floor_area_ratio * 100.0;

    let mut chosen = if outdoor_pct >= FLOOR_AREA_MIN_PCT
        && outdoor_pct >= indoor_pct + FLOOR_OUTDOOR_MARGIN_PCT
    {
        let mut result = outdoor;
        result.model_used = "outdoor".to_string();
        result
    } else if indoor_pct >= FLOOR_AREA_MIN_PCT {
        let mut result = indoor;
        result.model_used = "indoor".to_string();
        result
    } else {
        LaneDResult::none()
    };

    if chosen.model_used == "none" {
        chosen.floor_mask = None;
        chosen.safe_bg_mask = None;
        chosen.risky_bg_mask = None;
    }

    tracing::info!(
        frame_id = frame.metadata.image_id,
        outdoor_pct,
        indoor_pct,
        chosen = chosen.model_used,
        labels = chosen.labels_found.join(","),
        "semantic floor lane"
    );

    Ok(chosen)
}

/// Lane B: text-prompted bulk segmentation plus morphology cleanup.
/// Keeps the pre-subtraction mask for depth-aware refinement downstream.
async fn run_lane_b(
    adapters: &ModelAdapters,
    cache: &MaskCache,
    frame: &IngestedFrame,
    floor_mask: Option<&Mask>,
) -> Result<LaneBResult, PipelineError> {
    let (w, h) = (frame.metadata.width, frame.metadata.height);

    let output = adapters.bulk_segmenter.segment_cached(
        cache,
        &frame.data_uri,
        &frame.metadata.preproc_sha256,
        w,
        h,
        catalog::BULK_PROMPTS,
    ).await?;

    let Some(combined) = output.mask else {
        return Ok(LaneBResult::empty());
    };
    if combined.is_empty() {
        return Ok(LaneBResult::empty());
    }

    // Dilate to close small gaps, then keep the dominant blob
    let raw = combined.dilate(BULK_DILATION_PX).largest_component();

    let mut clean = raw.clone();
    if let Some(floor) = floor_mask {
        clean.subtract(floor);
    }

    let area_ratio = clean.area_ratio();
    tracing::info!(
        frame_id = frame.metadata.image_id,
        area_pct = area_ratio * 100.0,
        confidence = output.confidence,
        "bulk segmentation lane"
    );

    Ok(LaneBResult {
        mask: Some(clean),
        raw_mask: Some(raw),
        area_ratio,
        confidence: output.confidence,
        risk: BulkRisk::default(),
    })
}

/// Perception entry point: all four lanes for one frame
pub async fn run_perception(
    frame: &IngestedFrame,
    adapters: &ModelAdapters,
    cache: &MaskCache,
    detector_conf_threshold: f32,
) -> Result<PerceptionResult, PipelineError> {
    let frame_id = frame.metadata.image_id.clone();
    let (w, h) = (frame.metadata.width, frame.metadata.height);

    // Lanes A, C and D are independent; run them together
    let (detections, scene_output, lane_d) = tokio::join!(
        adapters.detector.detect(&frame.data_uri, w, h, detector_conf_threshold),
        adapters.scene.classify(&frame.data_uri),
        run_lane_d(adapters, cache, frame),
    );
    let lane_d = lane_d?;

    let lane_a = build_instances(detections, &frame_id, w, h);
    let lane_c = LaneCResult {
        scene_type: SceneType::from_label(&scene_output.label),
        confidence: scene_output.confidence.clamp(0.0, 1.0),
    };

    // Lane B consumes the floor mask, so it runs after lane D
    let lane_b = run_lane_b(adapters, cache, frame, lane_d.floor_mask.as_ref()).await?;

    tracing::info!(
        frame_id,
        items = lane_a.instances.len(),
        anchors = lane_a.anchors().len(),
        bulk_area_pct = lane_b.area_ratio * 100.0,
        scene = lane_c.scene_type.as_str(),
        floor_model = lane_d.model_used,
        "perception complete"
    );

    Ok(PerceptionResult {
        frame_id,
        lane_a,
        lane_b,
        lane_c,
        lane_d,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::detector::Detection;

    fn detection(label: &str, conf: f32) -> Detection {
        Detection {
            label: label.to_string(),
            confidence: conf,
            bbox: [10.0, 10.0, 110.0, 90.0],
            mask: None,
        }
    }

    #[test]
    fn instances_are_tagged_from_registry() {
        let lane_a = build_instances(
            vec![detection("sofa", 0.9), detection("door", 0.8), detection("banana", 0.5)],
            "frame1",
            640,
            480,
        );

        let sofa = &lane_a.instances[0];
        assert!(sofa.is_high_value);
        assert!(!sofa.is_anchor);

        let door = &lane_a.instances[1];
        assert!(door.is_anchor);

        let banana = &lane_a.instances[2];
        assert!(!banana.is_anchor);
        assert!(!banana.is_high_value);

        assert_eq!(lane_a.anchors().len(), 1);
    }

    #[test]
    fn instance_ids_are_stable_and_distinct() {
        let a = instance_id("f1", "sofa", [1.0, 2.0, 3.0, 4.0]);
        let b = instance_id("f1", "sofa", [1.0, 2.0, 3.0, 4.0]);
        let c = instance_id("f2", "sofa", [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn bbox_area_ratio_when_no_mask() {
        let lane_a = build_instances(vec![detection("sofa", 0.9)], "f", 100, 100);
        // 100x80 box in a 100x100 image
        assert!((lane_a.instances[0].area_ratio - 0.8).abs() < 1e-5);
    }

    #[test]
    fn bulk_risk_thresholds_flag_leakage() {
        assert!(!BulkRisk::default().suspected_leakage());
        assert!(!BulkRisk { vertical_pct: 0.3, boundary_spike: 0.2, far_pct: 0.1 }.suspected_leakage());

        assert!(BulkRisk { vertical_pct: 0.6, ..Default::default() }.suspected_leakage());
        assert!(BulkRisk { boundary_spike: 0.8, ..Default::default() }.suspected_leakage());
        assert!(BulkRisk { far_pct: 0.5, ..Default::default() }.suspected_leakage());
    }

    #[test]
    fn scene_labels_map_to_enum() {
        assert_eq!(SceneType::from_label("indoor"), SceneType::IndoorFlat);
        assert_eq!(SceneType::from_label("outdoor_driveway"), SceneType::OutdoorDriveway);
        assert_eq!(SceneType::from_label("uneven"), SceneType::UnevenGround);
        assert_eq!(SceneType::from_label("spaceship"), SceneType::Unknown);
        assert!(SceneType::UnevenGround.is_yard_waste_like());
        assert!(!SceneType::OutdoorDriveway.is_yard_waste_like());
    }

    #[test]
    fn semantic_classification_splits_layers() {
        use crate::adapters::semantic::{SemanticSegment, SemanticRawOutput};

        let mut road = Mask::new(10, 10);
        for c in 0..10 {
            road.set(8, c, true);
            road.set(9, c, true);
        }
        let mut sky = Mask::new(10, 10);
        for c in 0..10 {
            sky.set(0, c, true);
        }
        let mut tree = Mask::new(10, 10);
        tree.set(1, 1, true);

        let raw = SemanticRawOutput {
            width: 10,
            height: 10,
            segments: vec![
                SemanticSegment { label: "road".to_string(), mask: road },
                SemanticSegment { label: "sky".to_string(), mask: sky },
                SemanticSegment { label: "tree".to_string(), mask: tree },
            ],
        };

        let result = classify_semantic(&raw, catalog::OUTDOOR_FLOOR_LABELS);
        assert_eq!(result.floor_mask.as_ref().unwrap().count(), 20);
        assert_eq!(result.safe_bg_mask.as_ref().unwrap().count(), 10);
        assert_eq!(result.risky_bg_mask.as_ref().unwrap().count(), 1);
        assert_eq!(result.labels_found, vec!["road".to_string()]);
        assert!((result.floor_area_ratio - 0.2).abs() < 1e-6);
    }
}
