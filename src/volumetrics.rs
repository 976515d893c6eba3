//! Responsible for per-frame volume: "truck bed" grid integration of the
//! rectified pile terrain, minus the cells of separately billed discrete
//! items, plus catalogued item volumes.

use std::collections::BTreeMap;
use glam::Vec3;

// Custom modules
use crate::catalog::{self, Surcharge};
use crate::geometry::{GeometryResult, PointPixelMap};
use crate::mask::{DepthMap, Mask};
use crate::perception::PerceptionResult;
use crate::utils;

/// XZ grid cell edge in meters
pub const GRID_CELL_SIZE_M: f32 = 0.10;
/// Per-cell height percentile: suppresses spikes, preserves tall peaks
const HEIGHT_PERCENTILE: f32 = 98.0;
/// Items billed (and subtracted) separately need at least this confidence
pub const DISCRETE_CONF_THRESHOLD: f32 = 0.85;
/// Max relative depth spread inside an item bbox for subtraction
const DEPTH_CONSISTENCY_THRESHOLD: f32 = 0.20;
/// Cubic meters to cubic yards
pub const M3_TO_CY: f64 = 1.30795;
/// Warn when floor/background subtraction barely changed the bulk
const DEPTH_SUB_SAVED_WARN: f32 = 0.05;

/// A catalogued item recognised in a frame
#[derive(Clone, Debug)]
pub struct DiscreteItem {
    pub instance_id: String,
    pub label: String,
    pub volume_cy: f64,
    pub confidence: f32,
    pub surcharges: Vec<Surcharge>,
    pub has_mask: bool,
    pub area_ratio: f32,
    /// Below the billing threshold: the item's volume stays in the bulk
    pub absorbed_into_bulk: bool,
}

/// Per-frame volumetric result
#[derive(Clone, Debug)]
pub struct VolumetricResult {
    pub frame_id: String,
    pub bulk_raw_cy: f64,
    pub bulk_net_cy: f64,
    pub discrete_volume_cy: f64,
    pub frame_volume_cy: f64,
    pub items: Vec<DiscreteItem>,
    /// How much of the bulk the floor/background subtraction removed
    pub depth_sub_saved_ratio: f32,
    pub mask_coverage: f32,
}

/// Rasterizes a bbox into a mask for instances without pixel masks
fn bbox_to_mask(bbox: [f32; 4], width: u32, height: u32) -> Mask {
    let mut mask = Mask::new(width, height);
    let x1 = (bbox[0].max(0.0) as u32).min(width);
    let y1 = (bbox[1].max(0.0) as u32).min(height);
    let x2 = (bbox[2].max(0.0) as u32).min(width);
    let y2 = (bbox[3].max(0.0) as u32).min(height);
    for r in y1..y2 {
        for c in x1..x2 {
            mask.set(r, c, true);
        }
    }
    mask
}

/// Depth spread check: the bbox must look like one surface, not a
/// foreground object pasted on far background
fn depth_consistent(depth: &DepthMap, bbox: [f32; 4]) -> bool {
    let x1 = (bbox[0].max(0.0) as u32).min(depth.width.saturating_sub(1));
    let y1 = (bbox[1].max(0.0) as u32).min(depth.height.saturating_sub(1));
    let x2 = (bbox[2].max(0.0) as u32).min(depth.width.saturating_sub(1));
    let y2 = (bbox[3].max(0.0) as u32).min(depth.height.saturating_sub(1));
    if x2 <= x1 || y2 <= y1 {
        return false;
    }

    let mut samples = Vec::with_capacity(((y2 - y1) * (x2 - x1)) as usize);
    for r in y1..y2 {
        for c in x1..x2 {
            let d = depth.get(r, c);
            if d > crate::geometry::DEPTH_NEAR_CLIP && d < crate::geometry::DEPTH_FAR_CLIP {
                samples.push(d);
            }
        }
    }
    if samples.is_empty() {
        return false;
    }

    let median = utils::median(&samples);
    if median <= 0.0 {
        return false;
    }
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    let std = (samples.iter().map(|d| (d - mean) * (d - mean)).sum::<f32>()
        / samples.len() as f32)
        .sqrt();

    std / median <= DEPTH_CONSISTENCY_THRESHOLD
}

/// Grid integration over the rectified cloud restricted to `occupancy`.
/// Points scale by the calibration factor before binning, so volume
/// scales with its cube. Returns (bulk_raw_cy, bulk_net_cy); net removes
/// cells covered by any of `subtract_masks`.
pub fn integrate_bulk(
    points: &[Vec3],
    pixel_map: &PointPixelMap,
    occupancy: &Mask,
    subtract_masks: &[Mask],
    scale: f32,
) -> (f64, f64) {
    // Per-cell sample heights, keyed by XZ cell. BTreeMap keeps the
    // iteration order deterministic.
    let mut cells: BTreeMap<(i64, i64), Vec<f32>> = BTreeMap::new();
    let mut subtract_cells: std::collections::BTreeSet<(i64, i64)> = Default::default();

    for r in 0..occupancy.height {
        for c in 0..occupancy.width {
            if !occupancy.get(r, c) {
                continue;
            }
            let Some(i) = pixel_map.point_at(r, c) else {
                continue;
            };
            let p = points[i] * scale;
            // Above-floor only
            if p.y <= 0.0 {
                continue;
            }

            let key = (
                (p.x / GRID_CELL_SIZE_M).floor() as i64,
                (p.z / GRID_CELL_SIZE_M).floor() as i64,
            );
            cells.entry(key).or_default().push(p.y);

            if subtract_masks.iter().any(|m| m.get(r, c)) {
                subtract_cells.insert(key);
            }
        }
    }

    let cell_area_m2 = (GRID_CELL_SIZE_M * GRID_CELL_SIZE_M) as f64;
    let mut raw_m3 = 0.0f64;
    let mut subtracted_m3 = 0.0f64;

    for (key, heights) in &cells {
        let cell_height = utils::percentile(heights, HEIGHT_PERCENTILE) as f64;
        let cell_volume = cell_area_m2 * cell_height;
        raw_m3 += cell_volume;
        if subtract_cells.contains(key) {
            subtracted_m3 += cell_volume;
        }
    }

    let raw_cy = raw_m3 * M3_TO_CY;
    let net_cy = ((raw_m3 - subtracted_m3).max(0.0)) * M3_TO_CY;

    (raw_cy, net_cy)
}

/// Volumetrics entry point for one frame
pub fn run_volumetrics(
    perception: &PerceptionResult,
    geometry: &GeometryResult,
    scale_factor: f32,
) -> VolumetricResult {
    let frame_id = perception.frame_id.clone();
    let (width, height) = match &perception.lane_b.mask {
        Some(m) => (m.width, m.height),
        None => (0, 0),
    };

    // Catalogue pass over lane A instances
    let mut items: Vec<DiscreteItem> = Vec::new();
    let mut discrete_volume_cy = 0.0f64;

    for instance in &perception.lane_a.instances {
        let Some(volume_cy) = catalog::catalog_volume_cy(&instance.label) else {
            continue;
        };

        let billed = instance.confidence >= DISCRETE_CONF_THRESHOLD;
        if billed {
            discrete_volume_cy += volume_cy;
        }

        items.push(DiscreteItem {
            instance_id: instance.instance_id.clone(),
            label: instance.label.clone(),
            volume_cy,
            confidence: instance.confidence,
            surcharges: catalog::surcharges_for(&instance.label),
            has_mask: instance.mask.is_some(),
            area_ratio: instance.area_ratio,
            absorbed_into_bulk: !billed,
        });
    }

    // Bulk integration needs a rectified cloud and a pile mask
    let (bulk_raw_cy, bulk_net_cy, depth_sub_saved_ratio) = match (
        &geometry.cloud,
        &geometry.pixel_map,
        &perception.lane_b.mask,
        &geometry.depth,
    ) {
        (Some(cloud), Some(pixel_map), Some(bulk_mask), Some(depth)) if !bulk_mask.is_empty() => {
            // Occupancy: pile pixels minus floor and background layers
            let before_px = bulk_mask.count();
            let mut occupancy = bulk_mask.clone();
            if let Some(floor) = &perception.lane_d.floor_mask {
                occupancy.subtract(floor);
            }
            if let Some(safe_bg) = &perception.lane_d.safe_bg_mask {
                occupancy.subtract(safe_bg);
            }
            if !perception.lane_c.scene_type.is_yard_waste_like() {
                if let Some(risky_bg) = &perception.lane_d.risky_bg_mask {
                    occupancy.subtract(risky_bg);
                }
            }
            let after_px = occupancy.count();
            let saved_ratio = if before_px > 0 {
                1.0 - (after_px as f32 / before_px as f32)
            } else {
                0.0
            };
            if saved_ratio < DEPTH_SUB_SAVED_WARN {
                tracing::warn!(
                    frame_id,
                    saved_ratio,
                    "floor/background subtraction removed almost nothing, possible mask leakage"
                );
            }

            // Regions of separately billed items get their cells removed
            let subtract_masks: Vec<Mask> = items
                .iter()
                .filter(|item| !item.absorbed_into_bulk)
                .filter_map(|item| {
                    let instance = perception.lane_a.instances
                        .iter()
                        .find(|i| i.instance_id == item.instance_id)?;
                    if !depth_consistent(depth, instance.bbox) {
                        return None;
                    }
                    Some(match &instance.mask {
                        Some(mask) => mask.clone(),
                        None => bbox_to_mask(instance.bbox, width, height),
                    })
                })
                .collect();

            let (raw, net) = integrate_bulk(
                &cloud.points,
                pixel_map,
                &occupancy,
                &subtract_masks,
                scale_factor,
            );
            (raw, net, saved_ratio)
        }
        _ => (0.0, 0.0, 0.0),
    };

    let frame_volume_cy = bulk_net_cy + discrete_volume_cy;

    tracing::info!(
        frame_id,
        bulk_raw_cy,
        bulk_net_cy,
        discrete_volume_cy,
        frame_volume_cy,
        depth_sub_saved_ratio,
        items = items.len(),
        "volumetrics complete"
    );

    VolumetricResult {
        frame_id,
        bulk_raw_cy,
        bulk_net_cy,
        discrete_volume_cy,
        frame_volume_cy,
        items,
        depth_sub_saved_ratio,
        mask_coverage: perception.lane_b.area_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PointCloud, PointPixelMap};

    /// Synthetic rectified scene: a WxH pixel grid where each pixel maps
    /// to one point on a flat-topped box of the given height, one pixel
    /// per 10cm cell so the math is easy to check by hand.
    fn box_scene(cols: u32, rows: u32, height_m: f32) -> (PointCloud, PointPixelMap, Mask) {
        let mut points = Vec::new();
        let mut pixel_indices = Vec::new();
        let mut mask = Mask::new(cols, rows);

        for r in 0..rows {
            for c in 0..cols {
                // One point per cell center
                let x = c as f32 * GRID_CELL_SIZE_M + 0.05;
                let z = r as f32 * GRID_CELL_SIZE_M + 0.05;
                points.push(Vec3::new(x, height_m, z));
                pixel_indices.push([r, c]);
                mask.set(r, c, true);
            }
        }

        let map = PointPixelMap::build(&pixel_indices, cols, rows).unwrap();
        (PointCloud { points, pixel_indices }, map, mask)
    }

    #[test]
    fn box_volume_matches_hand_math() {
        // 10x10 cells x 0.01 m2 x 1.0 m = 1.0 m3 = 1.30795 cy
        let (cloud, map, mask) = box_scene(10, 10, 1.0);
        let (raw, net) = integrate_bulk(&cloud.points, &map, &mask, &[], 1.0);
        assert!((raw - 1.30795).abs() < 1e-6);
        assert_eq!(raw, net);
    }

    #[test]
    fn volume_scales_cubically() {
        let (cloud, map, mask) = box_scene(10, 10, 1.0);
        let (raw1, _) = integrate_bulk(&cloud.points, &map, &mask, &[], 1.0);
        let (raw2, _) = integrate_bulk(&cloud.points, &map, &mask, &[], 2.0);
        // Doubling the scale multiplies volume by 8
        assert!((raw2 / raw1 - 8.0).abs() < 0.05);
    }

    #[test]
    fn below_floor_points_are_ignored() {
        let (cloud, map, mask) = box_scene(5, 5, -0.5);
        let (raw, net) = integrate_bulk(&cloud.points, &map, &mask, &[], 1.0);
        assert_eq!(raw, 0.0);
        assert_eq!(net, 0.0);
    }

    #[test]
    fn privileged_subtraction_is_monotone() {
        let (cloud, map, mask) = box_scene(10, 10, 1.0);

        // Subtract a 5x10 half of the grid
        let mut half = Mask::new(10, 10);
        for r in 0..10 {
            for c in 0..5 {
                half.set(r, c, true);
            }
        }

        let (raw, net) = integrate_bulk(&cloud.points, &map, &mask, &[half], 1.0);
        assert!(net <= raw);
        assert!(net >= 0.0);
        assert!((net - raw / 2.0).abs() < 1e-6);
    }

    #[test]
    fn full_subtraction_clamps_at_zero() {
        let (cloud, map, mask) = box_scene(6, 6, 0.8);
        let (raw, net) = integrate_bulk(&cloud.points, &map, &mask, &[mask.clone()], 1.0);
        assert!(raw > 0.0);
        assert_eq!(net, 0.0);
    }

    #[test]
    fn percentile_height_suppresses_single_spike() {
        // 100 pixels land in the same 10cm cell; one carries a 10m spike
        let mut points = Vec::new();
        let mut pixel_indices = Vec::new();
        let mut mask = Mask::new(10, 10);
        for r in 0..10u32 {
            for c in 0..10u32 {
                let y = if r == 0 && c == 0 { 10.0 } else { 0.5 };
                points.push(Vec3::new(0.05, y, 0.05));
                pixel_indices.push([r, c]);
                mask.set(r, c, true);
            }
        }
        let map = PointPixelMap::build(&pixel_indices, 10, 10).unwrap();

        let (raw, _) = integrate_bulk(&points, &map, &mask, &[], 1.0);
        // One cell at P98 height ~0.5m, not the 10m outlier
        let expected = 0.01 * 0.5 * M3_TO_CY;
        assert!((raw - expected).abs() < expected * 0.1, "raw={raw}");
    }

    #[test]
    fn depth_consistency_rejects_split_depths() {
        // Half the bbox at 2m, half at 8m: spread way beyond 20%
        let mut depth = DepthMap::new(20, 20, 2.0);
        for r in 0..20 {
            for c in 10..20 {
                depth.set(r, c, 8.0);
            }
        }
        assert!(!depth_consistent(&depth, [0.0, 0.0, 20.0, 20.0]));
        // A uniform region passes
        assert!(depth_consistent(&depth, [0.0, 0.0, 9.0, 20.0]));
    }
}
