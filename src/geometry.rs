//! Responsible for turning a frame's metric depth into a floor-rectified
//! 3D terrain: depth cleanup, back-projection, ground-plane fit and
//! rectification. Never fails a request for a single bad image; a frame
//! that loses its floor comes back with `floor_quality = failed` so
//! fusion can down-weight it.

use glam::Vec3;

// Custom modules
pub mod plane;

use crate::PipelineError;
use crate::adapters::ModelAdapters;
use crate::adapters::cache::MaskCache;
use crate::calibration::Confidence;
use crate::ingestion::IngestedFrame;
use crate::mask::{DepthMap, Mask};
use crate::perception::{BulkRisk, PerceptionResult};
use crate::utils;
use plane::GroundPlane;

/// Valid metric depth window in meters
pub const DEPTH_NEAR_CLIP: f32 = 0.1;
pub const DEPTH_FAR_CLIP: f32 = 10.0;
/// Floor prior looks at this bottom fraction of the image
const FLOOR_BOTTOM_FRACTION: f32 = 0.40;
/// Fallback band when the prior fails
const FALLBACK_BOTTOM_FRACTION: f32 = 0.20;
/// Floor flatness grading in meters
const FLATNESS_GOOD_M: f32 = 0.08;
const FLATNESS_NOISY_M: f32 = 0.15;
/// Minimum valid pixels for quantile thresholds; below this the raw
/// bottom band is used as the prior
const MIN_PRIOR_PIXELS: usize = 1000;
/// Minimum overlap between geometric and semantic floor candidates
const MIN_SEMANTIC_OVERLAP: usize = 200;
/// Support region parameters
const SUPPORT_DILATION_PX: u32 = 30;
const SUPPORT_MIN_NEAR_PILE_PX: usize = 500;
const SUPPORT_MIN_CANDIDATES: usize = 2000;
const SUPPORT_MIN_BULK_AREA_PCT: f32 = 1.0;

/// Floor reliability grade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloorQuality {
    Good,
    Noisy,
    Failed,
}

impl FloorQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            FloorQuality::Good => "good",
            FloorQuality::Noisy => "noisy",
            FloorQuality::Failed => "failed",
        }
    }
}

/// Which intrinsics fed back-projection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrinsicsSource {
    CalibrationBundle,
    DepthModel,
    Unavailable,
}

impl IntrinsicsSource {
    pub fn as_str(self) -> &'static str {
        match self {
            IntrinsicsSource::CalibrationBundle => "calibration_bundle",
            IntrinsicsSource::DepthModel => "depth_model",
            IntrinsicsSource::Unavailable => "unavailable",
        }
    }
}

/// 3D points in meters, Y-up, with the pixel each point came from
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    pub points: Vec<Vec3>,
    pub pixel_indices: Vec<[u32; 2]>,
}

/// Reverse lookup from pixels to point indices.
/// Invariant: map[r][c] = i if and only if pixel_indices[i] = (r, c).
#[derive(Clone, Debug)]
pub struct PointPixelMap {
    pub width: u32,
    pub height: u32,
    map: Vec<i32>,
}

impl PointPixelMap {
    pub fn build(pixel_indices: &[[u32; 2]], width: u32, height: u32) -> Result<Self, PipelineError> {
        let mut map = vec![-1i32; (width as usize) * (height as usize)];
        for (i, [r, c]) in pixel_indices.iter().enumerate() {
            if *r >= height || *c >= width {
                return Err(PipelineError::ShapeMismatch {
                    context: "point_pixel_map",
                    details: format!("pixel ({r}, {c}) outside {width}x{height}"),
                });
            }
            map[(*r * width + *c) as usize] = i as i32;
        }
        Ok(Self { width, height, map })
    }

    /// Point index at a pixel, or None when no valid point landed there
    #[inline]
    pub fn point_at(&self, row: u32, col: u32) -> Option<usize> {
        let v = self.map[(row * self.width + col) as usize];
        if v < 0 { None } else { Some(v as usize) }
    }
}

/// Pile-adjacent local floor evidence, used as a fusion tie-breaker
#[derive(Clone, Copy, Debug)]
pub struct SupportRegion {
    pub valid: bool,
    pub inlier_ratio: f32,
    pub flatness_p95: f32,
}

impl Default for SupportRegion {
    fn default() -> Self {
        Self { valid: false, inlier_ratio: 0.0, flatness_p95: 0.20 }
    }
}

/// Result of the geometry stage for one frame
pub struct GeometryResult {
    pub frame_id: String,
    pub depth: Option<DepthMap>,
    pub depth_confidence: f32,
    /// Share of pixels inside the metric clip window before cleaning
    pub valid_depth_pct: f32,
    /// Rectified cloud: floor at Y = 0, up = +Y
    pub cloud: Option<PointCloud>,
    pub pixel_map: Option<PointPixelMap>,
    pub plane: Option<GroundPlane>,
    pub floor_quality: FloorQuality,
    pub floor_flatness_p95: f32,
    pub intrinsics_source: IntrinsicsSource,
    /// Focal length that actually fed back-projection
    pub fx_used: f32,
    /// The depth model reported its own focal estimate
    pub model_focal_px: Option<f32>,
    pub support: SupportRegion,
    pub bulk_risk: BulkRisk,
}

impl GeometryResult {
    pub fn failed(frame_id: &str) -> Self {
        Self {
            frame_id: frame_id.to_string(),
            depth: None,
            depth_confidence: 0.0,
            valid_depth_pct: 0.0,
            cloud: None,
            pixel_map: None,
            plane: None,
            floor_quality: FloorQuality::Failed,
            floor_flatness_p95: 0.20,
            intrinsics_source: IntrinsicsSource::Unavailable,
            fx_used: 0.0,
            model_focal_px: None,
            support: SupportRegion::default(),
            bulk_risk: BulkRisk::default(),
        }
    }
}

/// Clips to the metric window and kills isolated spikes with a 3x3
/// median. Returns the cleaned map, a variance-based confidence and the
/// valid-pixel share of the raw input.
pub fn clean_depth(depth: &DepthMap) -> (DepthMap, f32, f32) {
    let (w, h) = (depth.width, depth.height);
    let total = depth.data.len();

    let valid: Vec<f32> = depth.data
        .iter()
        .copied()
        .filter(|d| *d > DEPTH_NEAR_CLIP && *d < DEPTH_FAR_CLIP)
        .collect();
    let valid_pct = if total > 0 { valid.len() as f32 / total as f32 } else { 0.0 };

    let confidence = if valid.is_empty() {
        0.0
    } else {
        let mean = valid.iter().sum::<f32>() / valid.len() as f32;
        let var = valid.iter().map(|d| (d - mean) * (d - mean)).sum::<f32>() / valid.len() as f32;
        (var / 2.0).min(1.0)
    };

    // Clip, then 3x3 median with replicated borders
    let clipped: Vec<f32> = depth.data
        .iter()
        .map(|d| d.clamp(DEPTH_NEAR_CLIP, DEPTH_FAR_CLIP))
        .collect();

    let mut cleaned = vec![0.0f32; total];
    let mut window = [0.0f32; 9];
    for r in 0..h as i64 {
        for c in 0..w as i64 {
            let mut n = 0;
            for dr in -1..=1i64 {
                for dc in -1..=1i64 {
                    let rr = (r + dr).clamp(0, h as i64 - 1) as u32;
                    let cc = (c + dc).clamp(0, w as i64 - 1) as u32;
                    window[n] = clipped[(rr * w + cc) as usize];
                    n += 1;
                }
            }
            window.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            cleaned[(r as u32 * w + c as u32) as usize] = window[4];
        }
    }

    (
        DepthMap { width: w, height: h, data: cleaned },
        confidence,
        valid_pct,
    )
}

/// Back-projects the depth map into Y-up camera-frame coordinates:
/// Z = depth, X = (u - cx) * Z / fx, Y = -(v - cy) * Z / fy
pub fn back_project(
    depth: &DepthMap,
    fx: f32,
    fy: f32,
    cx: f32,
    cy: f32,
) -> Result<(PointCloud, PointPixelMap), PipelineError> {
    if fx <= 0.0 || fy <= 0.0 {
        return Err(PipelineError::ShapeMismatch {
            context: "back_project",
            details: format!("non-positive focal fx={fx} fy={fy}"),
        });
    }

    let (w, h) = (depth.width, depth.height);
    let mut points = Vec::new();
    let mut pixel_indices = Vec::new();

    for v in 0..h {
        for u in 0..w {
            let z = depth.get(v, u);
            if z <= DEPTH_NEAR_CLIP || z >= DEPTH_FAR_CLIP {
                continue;
            }
            let x = (u as f32 - cx) * z / fx;
            let y = -((v as f32 - cy) * z / fy);
            points.push(Vec3::new(x, y, z));
            pixel_indices.push([v, u]);
        }
    }

    let map = PointPixelMap::build(&pixel_indices, w, h)?;
    Ok((PointCloud { points, pixel_indices }, map))
}

fn depth_gradient(depth: &DepthMap) -> Vec<f32> {
    let (w, h) = (depth.width as usize, depth.height as usize);
    let data = &depth.data;
    let mut grad = vec![0.0f32; w * h];

    for r in 0..h {
        for c in 0..w {
            let gy = if r + 1 < h { data[(r + 1) * w + c] - data[r * w + c] } else { 0.0 };
            let gx = if c + 1 < w { data[r * w + c + 1] - data[r * w + c] } else { 0.0 };
            grad[r * w + c] = (gx * gx + gy * gy).sqrt();
        }
    }

    grad
}

fn depth_curvature(depth: &DepthMap) -> Vec<f32> {
    let (w, h) = (depth.width as usize, depth.height as usize);
    let data = &depth.data;
    let mut curv = vec![0.0f32; w * h];

    for r in 1..h.saturating_sub(1) {
        for c in 1..w.saturating_sub(1) {
            let lap = data[(r - 1) * w + c]
                + data[(r + 1) * w + c]
                + data[r * w + c - 1]
                + data[r * w + c + 1]
                - 4.0 * data[r * w + c];
            curv[r * w + c] = lap.abs();
        }
    }

    curv
}

fn bottom_band_mask(width: u32, height: u32, fraction: f32) -> Mask {
    let mut band = Mask::new(width, height);
    let start = ((height as f32) * (1.0 - fraction)) as u32;
    for r in start..height {
        for c in 0..width {
            band.set(r, c, true);
        }
    }
    band
}

/// Geometric floor prior: low-gradient, low-curvature pixels in the
/// bottom band. Quantile thresholds 65 (gradient) and 70 (curvature)
/// computed over valid bottom-band pixels.
pub fn floor_like_candidates(depth: &DepthMap) -> Mask {
    let (w, h) = (depth.width, depth.height);
    let band = bottom_band_mask(w, h, FLOOR_BOTTOM_FRACTION);

    let grad = depth_gradient(depth);
    let curv = depth_curvature(depth);

    let mut band_grad = Vec::new();
    let mut band_curv = Vec::new();
    for r in 0..h {
        for c in 0..w {
            let d = depth.get(r, c);
            if band.get(r, c) && d > DEPTH_NEAR_CLIP && d < DEPTH_FAR_CLIP {
                band_grad.push(grad[(r * w + c) as usize]);
                band_curv.push(curv[(r * w + c) as usize]);
            }
        }
    }

    if band_grad.len() < MIN_PRIOR_PIXELS {
        return band;
    }

    let grad_thresh = utils::percentile(&band_grad, 65.0);
    let curv_thresh = utils::percentile(&band_curv, 70.0);

    let mut candidates = Mask::new(w, h);
    for r in 0..h {
        for c in 0..w {
            let idx = (r * w + c) as usize;
            let d = depth.get(r, c);
            if band.get(r, c)
                && d > DEPTH_NEAR_CLIP
                && d < DEPTH_FAR_CLIP
                && grad[idx] < grad_thresh
                && curv[idx] < curv_thresh
            {
                candidates.set(r, c, true);
            }
        }
    }

    tracing::debug!(
        grad_thresh,
        curv_thresh,
        candidate_pct = candidates.area_ratio() * 100.0,
        "floor-like prior"
    );

    candidates
}

fn mask_to_point_indices(mask: &Mask, map: &PointPixelMap) -> Vec<usize> {
    let mut indices = Vec::new();
    for r in 0..mask.height {
        for c in 0..mask.width {
            if mask.get(r, c) {
                if let Some(i) = map.point_at(r, c) {
                    indices.push(i);
                }
            }
        }
    }
    indices
}

/// Pile-adjacent support candidates with relaxed local thresholds
/// (gradient p98, curvature p90, depth within [p15, p85]). Falls back to
/// the global bottom band when the near-pile zone is too thin.
fn support_candidates(depth: &DepthMap, bulk_mask: &Mask) -> (Mask, bool) {
    let (w, h) = (depth.width, depth.height);
    let band = bottom_band_mask(w, h, FLOOR_BOTTOM_FRACTION);
    let valid = |d: f32| d > DEPTH_NEAR_CLIP && d < DEPTH_FAR_CLIP;

    let mut fallback = band.clone();
    for r in 0..h {
        for c in 0..w {
            if fallback.get(r, c) && !valid(depth.get(r, c)) {
                fallback.set(r, c, false);
            }
        }
    }

    let bulk_area_pct = bulk_mask.area_ratio() * 100.0;
    if bulk_area_pct < SUPPORT_MIN_BULK_AREA_PCT {
        return (fallback, false);
    }

    // Near-pile zone: dilated bulk ring inside the bottom band
    let dilated = bulk_mask.dilate(SUPPORT_DILATION_PX);
    let mut near_pile = dilated;
    near_pile.intersect_with(&band);
    near_pile.subtract(bulk_mask);

    let grad = depth_gradient(depth);
    let curv = depth_curvature(depth);

    let mut grad_near = Vec::new();
    let mut curv_near = Vec::new();
    let mut depth_near = Vec::new();
    for r in 0..h {
        for c in 0..w {
            if near_pile.get(r, c) && valid(depth.get(r, c)) {
                let idx = (r * w + c) as usize;
                grad_near.push(grad[idx]);
                curv_near.push(curv[idx]);
                depth_near.push(depth.get(r, c));
            } else if near_pile.get(r, c) {
                near_pile.set(r, c, false);
            }
        }
    }

    if depth_near.len() < SUPPORT_MIN_NEAR_PILE_PX {
        return (fallback, false);
    }

    let grad_thresh = utils::percentile(&grad_near, 98.0);
    let curv_thresh = utils::percentile(&curv_near, 90.0);
    let depth_lo = utils::percentile(&depth_near, 15.0);
    let depth_hi = utils::percentile(&depth_near, 85.0);

    let mut local = Mask::new(w, h);
    let mut count = 0usize;
    for r in 0..h {
        for c in 0..w {
            let idx = (r * w + c) as usize;
            let d = depth.get(r, c);
            if near_pile.get(r, c)
                && grad[idx] < grad_thresh
                && curv[idx] < curv_thresh
                && d >= depth_lo
                && d <= depth_hi
            {
                local.set(r, c, true);
                count += 1;
            }
        }
    }

    if count < SUPPORT_MIN_CANDIDATES {
        return (fallback, false);
    }

    (local, true)
}

/// Leakage risk signals for the bulk mask: share of steep surfaces,
/// boundary height anomaly and far-background contamination
fn compute_bulk_risk(
    depth: &DepthMap,
    rectified: &[Vec3],
    map: &PointPixelMap,
    bulk_mask: &Mask,
) -> BulkRisk {
    const STEEP_GRAD_M: f32 = 0.08;

    let grad = depth_gradient(depth);
    let (w, h) = (bulk_mask.width, bulk_mask.height);

    let mut mask_px = 0usize;
    let mut steep_px = 0usize;
    let mut far_px = 0usize;
    let mut boundary_y = Vec::new();
    let mut interior_y = Vec::new();

    let mut all_depth = Vec::new();
    for d in &depth.data {
        if *d > DEPTH_NEAR_CLIP && *d < DEPTH_FAR_CLIP {
            all_depth.push(*d);
        }
    }
    let far_thresh = utils::percentile(&all_depth, 85.0);

    for r in 0..h {
        for c in 0..w {
            if !bulk_mask.get(r, c) {
                continue;
            }
            mask_px += 1;

            let idx = (r * w + c) as usize;
            if grad[idx] > STEEP_GRAD_M {
                steep_px += 1;
            }
            let d = depth.get(r, c);
            if d > far_thresh {
                far_px += 1;
            }

            if let Some(pi) = map.point_at(r, c) {
                let on_boundary = (r > 0 && !bulk_mask.get(r - 1, c))
                    || (r + 1 < h && !bulk_mask.get(r + 1, c))
                    || (c > 0 && !bulk_mask.get(r, c - 1))
                    || (c + 1 < w && !bulk_mask.get(r, c + 1));
                if on_boundary {
                    boundary_y.push(rectified[pi].y.abs());
                } else {
                    interior_y.push(rectified[pi].y.abs());
                }
            }
        }
    }

    if mask_px == 0 {
        return BulkRisk::default();
    }

    let mean = |v: &[f32]| if v.is_empty() { 0.0 } else { v.iter().sum::<f32>() / v.len() as f32 };
    let interior_mean = mean(&interior_y);
    let boundary_mean = mean(&boundary_y);
    let boundary_spike = if interior_mean > 1e-3 {
        ((boundary_mean / interior_mean) - 1.0).clamp(0.0, 1.0)
    } else {
        0.0
    };

    BulkRisk {
        vertical_pct: steep_px as f32 / mask_px as f32,
        boundary_spike,
        far_pct: far_px as f32 / mask_px as f32,
    }
}

fn flatness_quality(p95: f32) -> FloorQuality {
    if p95 < FLATNESS_GOOD_M {
        FloorQuality::Good
    } else if p95 <= FLATNESS_NOISY_M {
        FloorQuality::Noisy
    } else {
        FloorQuality::Failed
    }
}

fn frame_seed(frame_id: &str) -> u64 {
    u64::from_str_radix(&frame_id[..frame_id.len().min(16)], 16).unwrap_or(0x5eed)
}

/// Geometry entry point for one frame
pub async fn run_geometry(
    frame: &IngestedFrame,
    perception: &PerceptionResult,
    adapters: &ModelAdapters,
    cache: &MaskCache,
) -> Result<GeometryResult, PipelineError> {
    let frame_id = &frame.metadata.image_id;
    let (w, h) = (frame.metadata.width, frame.metadata.height);

    let depth_out = adapters.depth.estimate_cached(
        cache,
        &frame.data_uri,
        &frame.metadata.preproc_sha256,
        w,
        h,
    ).await?;

    let Some(raw_depth) = depth_out.depth else {
        tracing::warn!(frame_id, "no depth available, frame degraded");
        return Ok(GeometryResult::failed(frame_id));
    };

    if raw_depth.width != w || raw_depth.height != h {
        tracing::warn!(
            frame_id,
            depth_w = raw_depth.width,
            depth_h = raw_depth.height,
            frame_w = w,
            frame_h = h,
            "depth resolution disagrees with working image, frame degraded"
        );
        return Ok(GeometryResult::failed(frame_id));
    }

    // Intrinsics: prefer the calibration bundle when it is trustworthy,
    // otherwise fall back to the depth model's own focal estimate
    let (fx, fy, cx, cy, intrinsics_source) = if frame.bundle.confidence >= Confidence::Med {
        frame.bundle.assert_matches_depth(raw_depth.width, raw_depth.height)?;
        (
            frame.bundle.fx,
            frame.bundle.fy,
            frame.bundle.cx,
            frame.bundle.cy,
            IntrinsicsSource::CalibrationBundle,
        )
    } else if let Some(f_px) = depth_out.focal_px {
        (f_px, f_px, w as f32 / 2.0, h as f32 / 2.0, IntrinsicsSource::DepthModel)
    } else {
        frame.bundle.assert_matches_depth(raw_depth.width, raw_depth.height)?;
        (
            frame.bundle.fx,
            frame.bundle.fy,
            frame.bundle.cx,
            frame.bundle.cy,
            IntrinsicsSource::CalibrationBundle,
        )
    };

    let (cleaned, depth_confidence, valid_depth_pct) = clean_depth(&raw_depth);
    let (cloud, pixel_map) = back_project(&cleaned, fx, fy, cx, cy)?;

    // Floor prior, narrowed by the semantic floor when the overlap is real
    let mut candidates_mask = floor_like_candidates(&cleaned);
    if let Some(semantic_floor) = &perception.lane_d.floor_mask {
        let mut narrowed = candidates_mask.clone();
        narrowed.intersect_with(semantic_floor);
        if narrowed.count() >= MIN_SEMANTIC_OVERLAP {
            candidates_mask = narrowed;
        }
    }

    let seed = frame_seed(frame_id);
    let mut candidates = mask_to_point_indices(&candidates_mask, &pixel_map);
    let mut fitted = plane::fit_ground_plane(&cloud.points, &candidates, seed);

    // Retry on the raw bottom band. Ragged outdoor ground makes the band
    // itself unreliable, so yard-waste scenes skip the retry.
    if fitted.is_none() && !perception.lane_c.scene_type.is_yard_waste_like() {
        let band = bottom_band_mask(w, h, FALLBACK_BOTTOM_FRACTION);
        candidates = mask_to_point_indices(&band, &pixel_map);
        fitted = plane::fit_ground_plane(&cloud.points, &candidates, seed);
    }

    let Some((ground_plane, inliers)) = fitted else {
        tracing::warn!(frame_id, "ground plane not found, floor failed");
        let mut result = GeometryResult::failed(frame_id);
        result.depth = Some(cleaned);
        result.depth_confidence = depth_confidence;
        result.valid_depth_pct = valid_depth_pct;
        result.intrinsics_source = intrinsics_source;
        result.fx_used = fx;
        result.model_focal_px = depth_out.focal_px;
        return Ok(result);
    };

    let rectified_points = plane::rectify(&cloud.points, &ground_plane);
    let floor_flatness_p95 = plane::flatness_p95(&rectified_points, &inliers);
    let floor_quality = flatness_quality(floor_flatness_p95);

    // Local floor confidence around the pile
    let mut support = SupportRegion::default();
    if let Some(bulk_raw) = &perception.lane_b.raw_mask {
        let (support_mask, support_valid) = support_candidates(&cleaned, bulk_raw);
        let support_idx = mask_to_point_indices(&support_mask, &pixel_map);
        if let Some((local_plane, local_inliers)) =
            plane::fit_ground_plane(&cloud.points, &support_idx, seed.wrapping_add(1))
        {
            let local_rectified = plane::rectify(&cloud.points, &local_plane);
            support = SupportRegion {
                valid: support_valid,
                inlier_ratio: local_plane.inlier_ratio,
                flatness_p95: plane::flatness_p95(&local_rectified, &local_inliers),
            };
        }
    }

    // Enrich the bulk mask with leakage risk signals
    let bulk_risk = match &perception.lane_b.mask {
        Some(bulk_mask) => compute_bulk_risk(&cleaned, &rectified_points, &pixel_map, bulk_mask),
        None => BulkRisk::default(),
    };

    tracing::info!(
        frame_id,
        depth_confidence,
        valid_depth_pct,
        intrinsics_source = intrinsics_source.as_str(),
        inlier_ratio = ground_plane.inlier_ratio,
        floor_flatness_p95,
        floor_quality = floor_quality.as_str(),
        support_valid = support.valid,
        support_inlier_ratio = support.inlier_ratio,
        points = cloud.points.len(),
        "geometry complete"
    );

    Ok(GeometryResult {
        frame_id: frame_id.clone(),
        depth: Some(cleaned),
        depth_confidence,
        valid_depth_pct,
        cloud: Some(PointCloud {
            points: rectified_points,
            pixel_indices: cloud.pixel_indices,
        }),
        pixel_map: Some(pixel_map),
        plane: Some(ground_plane),
        floor_quality,
        floor_flatness_p95,
        intrinsics_source,
        fx_used: fx,
        model_focal_px: depth_out.focal_px,
        support,
        bulk_risk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Depth map of a flat floor 1.5m below the camera, with a far wall
    /// in the upper half: Z = y_floor * fy / (v - cy) for rows below cy
    pub(crate) fn synthetic_floor_depth(w: u32, h: u32, fy: f32) -> DepthMap {
        let cy = h as f32 / 2.0;
        let mut depth = DepthMap::new(w, h, 9.5);
        for v in 0..h {
            let dv = v as f32 - cy;
            if dv > 2.0 {
                let z = (1.5 * fy / dv).clamp(0.2, 9.5);
                for u in 0..w {
                    depth.set(v, u, z);
                }
            }
        }
        depth
    }

    #[test]
    fn back_projection_formula() {
        let mut depth = DepthMap::new(32, 32, 0.0);
        depth.set(16, 26, 2.0);

        let (cloud, map) = back_project(&depth, 100.0, 100.0, 16.0, 16.0).unwrap();
        assert_eq!(cloud.points.len(), 1);
        let p = cloud.points[0];
        // u - cx = 10, Z = 2, fx = 100 -> X = 0.2; v = cy -> Y = 0
        assert!((p.x - 0.2).abs() < 1e-6);
        assert!(p.y.abs() < 1e-6);
        assert!((p.z - 2.0).abs() < 1e-6);

        assert_eq!(map.point_at(16, 26), Some(0));
        assert_eq!(map.point_at(0, 0), None);
    }

    #[test]
    fn y_axis_points_up() {
        let mut depth = DepthMap::new(8, 8, 0.0);
        depth.set(6, 4, 1.0); // Below principal point
        let (cloud, _) = back_project(&depth, 10.0, 10.0, 4.0, 4.0).unwrap();
        // Pixels below center are below the camera axis: negative Y
        assert!(cloud.points[0].y < 0.0);
    }

    #[test]
    fn pixel_map_invariant_holds() {
        let depth = synthetic_floor_depth(24, 24, 24.0);
        let (cloud, map) = back_project(&depth, 24.0, 24.0, 12.0, 12.0).unwrap();

        for (i, [r, c]) in cloud.pixel_indices.iter().enumerate() {
            assert_eq!(map.point_at(*r, *c), Some(i));
        }
    }

    #[test]
    fn clean_depth_clips_and_scores() {
        let mut depth = DepthMap::new(16, 16, 3.0);
        depth.set(4, 4, 55.0); // spike far outside the window
        depth.set(5, 5, 0.01); // too near

        let (cleaned, confidence, valid_pct) = clean_depth(&depth);
        // Median filter flattens the isolated spikes back to their neighbors
        assert!((cleaned.get(4, 4) - 3.0).abs() < 1e-5);
        assert!((cleaned.get(5, 5) - 3.0).abs() < 1e-5);
        assert!(cleaned.data.iter().all(|d| *d >= DEPTH_NEAR_CLIP && *d <= DEPTH_FAR_CLIP));
        // 254 of 256 pixels valid
        assert!((valid_pct - 254.0 / 256.0).abs() < 1e-4);
        // Near-constant depth has almost no variance
        assert!(confidence < 0.1);
    }

    #[test]
    fn floor_prior_prefers_smooth_bottom() {
        let depth = synthetic_floor_depth(64, 64, 64.0);
        let candidates = floor_like_candidates(&depth);
        // All candidates live in the bottom 40%
        for r in 0..candidates.height {
            for c in 0..candidates.width {
                if candidates.get(r, c) {
                    assert!(r >= ((64.0 * 0.6) as u32));
                }
            }
        }
        assert!(candidates.count() > 100);
    }

    #[test]
    fn bulk_risk_flags_steep_masks() {
        let mut depth = DepthMap::new(10, 10, 3.0);
        let mut pixel_indices = Vec::new();
        let mut points = Vec::new();
        let mut mask = Mask::new(10, 10);
        for r in 0..10u32 {
            for c in 0..10u32 {
                pixel_indices.push([r, c]);
                points.push(Vec3::new(c as f32 * 0.1, 0.5, 3.0));
                mask.set(r, c, true);
            }
        }
        let map = PointPixelMap::build(&pixel_indices, 10, 10).unwrap();

        // Flat depth under the whole mask: nothing suspicious
        let calm = compute_bulk_risk(&depth, &points, &map, &mask);
        assert!(!calm.suspected_leakage());

        // Steep depth ramp across the mask reads as wall coverage
        for r in 0..10u32 {
            for c in 0..10u32 {
                depth.set(r, c, 2.0 + 0.2 * r as f32);
            }
        }
        let steep = compute_bulk_risk(&depth, &points, &map, &mask);
        assert!(steep.vertical_pct > 0.5, "vertical_pct={}", steep.vertical_pct);
        assert!(steep.suspected_leakage());
    }

    #[test]
    fn flatness_grades() {
        assert_eq!(flatness_quality(0.05), FloorQuality::Good);
        assert_eq!(flatness_quality(0.10), FloorQuality::Noisy);
        assert_eq!(flatness_quality(0.30), FloorQuality::Failed);
    }

    #[test]
    fn frame_seed_is_stable() {
        assert_eq!(frame_seed("00000000000000ff"), 255);
        assert_eq!(frame_seed("zzzz"), 0x5eed);
    }
}
