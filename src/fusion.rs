//! Responsible for fusing per-frame volumes into one reliable number.
//! Weighted trimmed mean as the primary estimator, with catastrophic
//! frame rejection, a physical truck cap and a calibrated uncertainty
//! band.

use std::collections::BTreeMap;

// Custom modules
use crate::geometry::FloorQuality;
use crate::volumetrics::{DiscreteItem, VolumetricResult};

/// The truck cannot carry more than this
pub const MAX_PILE_VOLUME_CY: f64 = 20.0;

// Catastrophic drop thresholds
const CATASTROPHIC_INLIER_RATIO: f32 = 0.10;
const CATASTROPHIC_FLATNESS_M: f32 = 0.50;
const CATASTROPHIC_DEPTH_VALID_PCT: f32 = 0.50;

// Quality weights
const WEIGHT_GOOD: f64 = 1.0;
const WEIGHT_NOISY: f64 = 0.75;
const WEIGHT_FAILED: f64 = 0.4;

/// Single-frame estimates shrink toward zero
const SINGLE_FRAME_SHRINKAGE: f64 = 0.85;

/// Centroids closer than this fraction of the image diagonal mean the
/// shots are near-identical viewpoints
const DIVERSITY_CENTROID_FRAC: f32 = 0.05;

/// Quality evidence for one frame entering fusion
#[derive(Clone, Debug)]
pub struct FrameQuality {
    pub frame_id: String,
    pub volume_cy: f64,
    pub floor_quality: FloorQuality,
    pub depth_confidence: f32,
    pub floor_flatness_p95: f32,
    pub inlier_ratio: f32,
    pub valid_depth_pct: f32,
    pub mask_coverage: f32,
    /// Bulk mask centroid (row, col) for viewpoint diversity
    pub bulk_centroid: Option<(f32, f32)>,
    pub image_diag_px: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionMethod {
    WeightedTrimmedMean,
    WeightedMedian,
    SingleFrameShrinkage,
    NoValidFrames,
}

impl FusionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            FusionMethod::WeightedTrimmedMean => "weighted_trimmed_mean",
            FusionMethod::WeightedMedian => "weighted_median",
            FusionMethod::SingleFrameShrinkage => "single_frame_shrinkage",
            FusionMethod::NoValidFrames => "no_valid_frames",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Diversity {
    Good,
    Low,
    Unknown,
}

impl Diversity {
    pub fn as_str(self) -> &'static str {
        match self {
            Diversity::Good => "good",
            Diversity::Low => "low",
            Diversity::Unknown => "unknown",
        }
    }
}

/// Result of multi-view fusion
#[derive(Clone, Debug)]
pub struct FusionResult {
    pub final_volume_cy: f64,
    pub uncertainty_min_cy: f64,
    pub uncertainty_max_cy: f64,
    pub valid_frames: Vec<String>,
    pub rejected_frames: Vec<(String, String)>,
    pub viewpoint_diversity: Diversity,
    pub fusion_method: FusionMethod,
    pub items: Vec<DiscreteItem>,
    pub capacity_exceeded: bool,
    /// Diagnostic only: naive sums to expose partial-complement shoots
    pub sum_valid_cy: f64,
    pub sum_weighted_cy: f64,
}

fn catastrophic_reason(q: &FrameQuality) -> Option<&'static str> {
    if q.mask_coverage <= 0.0 {
        return Some("no_bulk_mask");
    }
    if q.inlier_ratio < CATASTROPHIC_INLIER_RATIO {
        return Some("inlier_ratio_collapsed");
    }
    if q.floor_flatness_p95 > CATASTROPHIC_FLATNESS_M {
        return Some("floor_flatness_catastrophic");
    }
    if q.valid_depth_pct < CATASTROPHIC_DEPTH_VALID_PCT {
        return Some("depth_mostly_invalid");
    }
    None
}

fn frame_weight(quality: FloorQuality) -> f64 {
    match quality {
        FloorQuality::Good => WEIGHT_GOOD,
        FloorQuality::Noisy => WEIGHT_NOISY,
        FloorQuality::Failed => WEIGHT_FAILED,
    }
}

/// Weighted average after dropping the single lowest and highest volume
fn weighted_trimmed_mean(sorted: &[(&FrameQuality, f64)]) -> f64 {
    let kept = &sorted[1..sorted.len() - 1];
    let total_weight: f64 = kept.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    kept.iter().map(|(q, w)| q.volume_cy * w).sum::<f64>() / total_weight
}

/// Smallest volume whose cumulative weight reaches half the total
fn weighted_median(sorted: &[(&FrameQuality, f64)]) -> f64 {
    let total_weight: f64 = sorted.iter().map(|(_, w)| w).sum();
    let mut cumulative = 0.0;
    for (q, w) in sorted {
        cumulative += w;
        if cumulative >= total_weight / 2.0 {
            return q.volume_cy;
        }
    }
    sorted.last().map(|(q, _)| q.volume_cy).unwrap_or(0.0)
}

fn viewpoint_diversity(valid: &[&FrameQuality]) -> Diversity {
    if valid.is_empty() {
        return Diversity::Unknown;
    }
    if valid.len() < 2 {
        return Diversity::Low;
    }

    let centroids: Vec<(f32, f32, f32)> = valid
        .iter()
        .filter_map(|q| q.bulk_centroid.map(|(r, c)| (r, c, q.image_diag_px)))
        .collect();
    if centroids.len() < 2 {
        return Diversity::Low;
    }

    let mut max_dist_frac = 0.0f32;
    for i in 0..centroids.len() {
        for j in i + 1..centroids.len() {
            let (r1, c1, d1) = centroids[i];
            let (r2, c2, d2) = centroids[j];
            let dist = ((r1 - r2).powi(2) + (c1 - c2).powi(2)).sqrt();
            let diag = d1.max(d2).max(1.0);
            max_dist_frac = max_dist_frac.max(dist / diag);
        }
    }

    if max_dist_frac < DIVERSITY_CENTROID_FRAC {
        Diversity::Low
    } else {
        Diversity::Good
    }
}

/// Same canonical label across frames collapses into one fused item,
/// keeping the best representation: has-mask beats confidence beats area.
/// Surcharge flags accumulate.
fn fuse_discrete_items(
    valid_ids: &[String],
    volumetrics: &[VolumetricResult],
) -> Vec<DiscreteItem> {
    let mut by_label: BTreeMap<String, DiscreteItem> = BTreeMap::new();

    for result in volumetrics {
        if !valid_ids.contains(&result.frame_id) {
            continue;
        }
        for item in &result.items {
            match by_label.get_mut(&item.label) {
                None => {
                    by_label.insert(item.label.clone(), item.clone());
                }
                Some(existing) => {
                    let better = (item.has_mask, item.confidence, item.area_ratio)
                        > (existing.has_mask, existing.confidence, existing.area_ratio);
                    let mut merged_surcharges = existing.surcharges.clone();
                    for s in &item.surcharges {
                        if !merged_surcharges.contains(s) {
                            merged_surcharges.push(*s);
                        }
                    }
                    if better {
                        let mut replacement = item.clone();
                        replacement.surcharges = merged_surcharges;
                        *existing = replacement;
                    } else {
                        existing.surcharges = merged_surcharges;
                    }
                }
            }
        }
    }

    by_label.into_values().collect()
}

/// Fusion entry point
pub fn run_fusion(qualities: &[FrameQuality], volumetrics: &[VolumetricResult]) -> FusionResult {
    let mut valid: Vec<&FrameQuality> = Vec::new();
    let mut rejected: Vec<(String, String)> = Vec::new();

    for q in qualities {
        match catastrophic_reason(q) {
            Some(reason) => {
                tracing::info!(frame_id = q.frame_id, reason, "frame dropped before weighting");
                rejected.push((q.frame_id.clone(), reason.to_string()));
            }
            None => valid.push(q),
        }
    }

    let mut weighted: Vec<(&FrameQuality, f64)> = valid
        .iter()
        .map(|q| (*q, frame_weight(q.floor_quality)))
        .collect();
    weighted.sort_by(|a, b| {
        a.0.volume_cy
            .partial_cmp(&b.0.volume_cy)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.frame_id.cmp(&b.0.frame_id))
    });

    let (mut final_volume, fusion_method) = match weighted.len() {
        0 => (0.0, FusionMethod::NoValidFrames),
        1 => (
            weighted[0].0.volume_cy * SINGLE_FRAME_SHRINKAGE,
            FusionMethod::SingleFrameShrinkage,
        ),
        2 | 3 => (weighted_median(&weighted), FusionMethod::WeightedMedian),
        _ => (weighted_trimmed_mean(&weighted), FusionMethod::WeightedTrimmedMean),
    };

    // Physical cap
    let mut capacity_exceeded = false;
    if final_volume > MAX_PILE_VOLUME_CY {
        tracing::warn!(final_volume, "fused volume exceeds truck capacity, clamping");
        final_volume = MAX_PILE_VOLUME_CY;
        capacity_exceeded = true;
    }

    let diversity = viewpoint_diversity(&valid);

    // Uncertainty band widens with the worst frame quality
    let any_failed = valid.iter().any(|q| q.floor_quality == FloorQuality::Failed);
    let any_noisy = valid.iter().any(|q| q.floor_quality == FloorQuality::Noisy);
    let (lo_factor, hi_factor) = if valid.is_empty() || any_failed || diversity != Diversity::Good {
        (0.60, 1.50)
    } else if any_noisy {
        (0.70, 1.30)
    } else {
        (0.85, 1.15)
    };

    let uncertainty_min_cy = final_volume * lo_factor;
    let uncertainty_max_cy = (final_volume * hi_factor).min(MAX_PILE_VOLUME_CY);

    let valid_ids: Vec<String> = valid.iter().map(|q| q.frame_id.clone()).collect();
    let items = fuse_discrete_items(&valid_ids, volumetrics);

    // Diagnostic sums: a simple sum far above the fused value suggests
    // each photo saw a different part of the pile
    let sum_valid_cy: f64 = valid.iter().map(|q| q.volume_cy).sum();
    let sum_weighted_cy: f64 = weighted.iter().map(|(q, w)| q.volume_cy * w).sum();

    tracing::info!(
        valid = valid.len(),
        rejected = rejected.len(),
        method = fusion_method.as_str(),
        final_volume_cy = final_volume,
        sum_valid_cy,
        sum_weighted_cy,
        diversity = diversity.as_str(),
        "fusion complete"
    );

    FusionResult {
        final_volume_cy: final_volume,
        uncertainty_min_cy,
        uncertainty_max_cy,
        valid_frames: valid_ids,
        rejected_frames: rejected,
        viewpoint_diversity: diversity,
        fusion_method,
        items,
        capacity_exceeded,
        sum_valid_cy,
        sum_weighted_cy,
    }
}
