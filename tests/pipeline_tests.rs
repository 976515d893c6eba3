//! End-to-end pipeline scenarios driven through local-mode adapters with
//! canned model outputs.

use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use junkvision::adapters::ModelAdapters;
use junkvision::adapters::depth::DepthOutput;
use junkvision::adapters::detector::Detection;
use junkvision::adapters::scene::SceneOutput;
use junkvision::adapters::segmenter::BulkSegOutput;
use junkvision::ingestion::exif::ClientExif;
use junkvision::mask::{DepthMap, Mask};
use junkvision::pipeline::{Pipeline, QuoteRequest};
use junkvision::utils;
use junkvision::utils::config::AppConfig;

const IMG_W: u32 = 200;
const IMG_H: u32 = 200;
const FY: f32 = 200.0;

/// Sharp checkerboard that passes the ingestion quality gate. The cell
/// size varies the content hash.
fn checkerboard_png(cell: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(IMG_W, IMG_H, |x, y| {
        if ((x / cell) + (y / cell)) % 2 == 0 {
            Rgb([220u8, 220, 220])
        } else {
            Rgb([40u8, 40, 40])
        }
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

fn flat_png(value: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(IMG_W, IMG_H, Rgb([value, value, value]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

/// Synthetic depth for a driveway shot: flat floor 1.5m below the
/// camera, a 1m box pile at 4m, far wall elsewhere.
fn driveway_depth() -> DepthMap {
    let cy = 100.0f32;
    let mut depth = DepthMap::new(IMG_W, IMG_H, 9.5);

    // Floor: Y = -1.5 => Z = 1.5 * FY / (v - cy)
    for v in 0..IMG_H {
        let dv = v as f32 - cy;
        if dv > 30.0 {
            let z = 1.5 * FY / dv;
            for u in 0..IMG_W {
                depth.set(v, u, z);
            }
        }
    }

    // Pile box: 1m wide (cols 75..125), top at Y=-0.5, front face Z=4
    for v in 125..=175u32 {
        for u in 75..125u32 {
            if v <= 133 {
                // Top surface: Z = 0.5 * FY / (v - cy)
                depth.set(v, u, 0.5 * FY / (v as f32 - cy));
            } else {
                depth.set(v, u, 4.0);
            }
        }
    }

    depth
}

fn rect_mask(x1: u32, y1: u32, x2: u32, y2: u32) -> Mask {
    let mut mask = Mask::new(IMG_W, IMG_H);
    for r in y1..y2 {
        for c in x1..x2 {
            mask.set(r, c, true);
        }
    }
    mask
}

fn sofa_detection() -> Detection {
    Detection {
        label: "sofa".to_string(),
        confidence: 0.9,
        bbox: [75.0, 125.0, 125.0, 175.0],
        mask: None,
    }
}

fn door_detection() -> Detection {
    // Door on the far wall at 9.5m: 2.03m tall ~= 42px at fx 200
    Detection {
        label: "door".to_string(),
        confidence: 0.8,
        bbox: [10.0, 20.0, 40.0, 62.7],
        mask: None,
    }
}

fn test_pipeline(adapters: Arc<ModelAdapters>) -> Pipeline {
    Pipeline::new(&AppConfig::for_tests(), adapters)
}

fn prime_driveway_scene(adapters: &ModelAdapters, detections: Vec<Detection>, focal_px: Option<f32>) {
    adapters.detector.set_canned(detections);
    adapters.scene.set_canned(SceneOutput {
        label: "outdoor_driveway".to_string(),
        confidence: 0.8,
    });
    // Bulk mask sits inside the sofa bbox even after the 8px dilation
    adapters.bulk_segmenter.set_canned(BulkSegOutput {
        mask: Some(rect_mask(85, 135, 115, 165)),
        confidence: 0.8,
    });
    adapters.depth.set_canned(DepthOutput {
        depth: Some(driveway_depth()),
        focal_px,
    });
}

fn exif_for(bytes: &[u8]) -> ClientExif {
    ClientExif {
        server_sha256: Some(utils::sha256_hex(bytes)),
        make: Some("Apple".to_string()),
        model: Some("iPhone 14".to_string()),
        // Chosen so fx at the working resolution is 200px
        focal_length_35mm: Some(30.6),
        orientation: Some(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn sofa_on_driveway_bills_one_discrete_line() {
    let adapters = Arc::new(ModelAdapters::local_for_tests());
    prime_driveway_scene(&adapters, vec![sofa_detection(), door_detection()], Some(200.0));

    let image = checkerboard_png(4);
    let request = QuoteRequest {
        images: vec![utils::to_data_uri(&image)],
        heavy_material_level: None,
        exif: Some(vec![exif_for(&image)]),
    };

    let response = test_pipeline(adapters).run_quote(request).await.unwrap();

    // The sofa is billed from the catalogue; its cells leave the bulk
    assert_eq!(response.line_items.len(), 1);
    assert_eq!(response.line_items[0].name, "Sofa");
    assert_eq!(response.line_items[0].source, "Discrete_Database");
    assert!((response.line_items[0].vol_cy - 2.0).abs() < 1e-9);

    // Single frame: 2.0 discrete with shrinkage applied
    assert!((response.final_volume_cy - 1.7).abs() < 1e-6);

    // Door anchor resolved scale from the actual scene
    assert_eq!(response.flags.calibration_source, "anchor_consensus");
    assert_eq!(response.diagnostics.floor_quality, "good");
    assert_eq!(response.confidence_score, "MEDIUM");
    assert!(!response.flags.conservative_billing);
    // Clean pile mask on a flat driveway raises no leakage suspicion
    assert!(!response.diagnostics.suspected_mask_leakage);
}

#[tokio::test]
async fn uncalibrated_mixed_pile_bills_conservatively() {
    let adapters = Arc::new(ModelAdapters::local_for_tests());
    // No anchors, no EXIF, no model intrinsics: full calibration fallback
    prime_driveway_scene(&adapters, Vec::new(), None);

    let request = QuoteRequest {
        images: vec![
            utils::to_data_uri(&checkerboard_png(4)),
            utils::to_data_uri(&checkerboard_png(5)),
            utils::to_data_uri(&checkerboard_png(8)),
        ],
        heavy_material_level: None,
        exif: None,
    };

    let response = test_pipeline(adapters).run_quote(request).await.unwrap();

    assert_eq!(response.flags.calibration_source, "fallback");
    assert!(response.flags.conservative_billing);
    assert!(response.flags.review_required);
    assert!(
        response.confidence_score == "LOW" || response.confidence_score == "MEDIUM",
        "got {}",
        response.confidence_score
    );

    // Conservative billing rounds up to the next half yard
    let doubled = response.final_volume_cy * 2.0;
    assert!((doubled - doubled.round()).abs() < 1e-9);
    assert!(response.final_volume_cy >= 0.5);

    // Everything measured lands on the terrain line
    assert!(response.line_items.iter().all(|li| li.source == "Measured_Terrain"));
}

#[tokio::test]
async fn blurred_only_frame_returns_minimum_load() {
    let adapters = Arc::new(ModelAdapters::local_for_tests());

    // Featureless and dark: fails both the blur and brightness gates
    let request = QuoteRequest {
        images: vec![utils::to_data_uri(&flat_png(12))],
        heavy_material_level: None,
        exif: None,
    };

    let response = test_pipeline(adapters).run_quote(request).await.unwrap();

    assert_eq!(response.final_volume_cy, 0.5);
    assert_eq!(response.confidence_score, "LOW");
    assert!(response.flags.review_required);
    assert!(response.line_items.is_empty());
    assert!(response.note.is_some());
    assert!(
        response.diagnostics.rejected_frames
            .iter()
            .any(|r| r.contains("too_blurry")),
        "rejections: {:?}",
        response.diagnostics.rejected_frames
    );
}

#[tokio::test]
async fn empty_request_fails_to_minimum_load() {
    let adapters = Arc::new(ModelAdapters::local_for_tests());

    let request = QuoteRequest {
        images: vec!["%%%not-base64%%%".to_string()],
        heavy_material_level: None,
        exif: None,
    };

    let response = test_pipeline(adapters).run_quote(request).await.unwrap();

    assert_eq!(response.final_volume_cy, 0.5);
    assert!(response.note.as_deref().unwrap_or("").starts_with("FAIL"));
    assert!(response.line_items.is_empty());
}

#[tokio::test]
async fn repeat_frame_hits_segmentation_and_depth_cache() {
    let adapters = Arc::new(ModelAdapters::local_for_tests());
    prime_driveway_scene(&adapters, vec![sofa_detection(), door_detection()], Some(200.0));

    let image = checkerboard_png(4);
    let request = QuoteRequest {
        // The same pixels twice in one request scope
        images: vec![utils::to_data_uri(&image), utils::to_data_uri(&image)],
        heavy_material_level: None,
        exif: Some(vec![exif_for(&image)]),
    };

    let response = test_pipeline(Arc::clone(&adapters)).run_quote(request).await.unwrap();
    assert_eq!(response.diagnostics.valid_frames, 2);

    // Second frame served from the request-scoped mask cache
    assert_eq!(adapters.bulk_segmenter.calls(), 1);
    assert_eq!(adapters.depth.calls(), 1);
    // One call per semantic bias
    assert_eq!(adapters.semantic.calls(), 2);
}

#[tokio::test]
async fn responses_are_deterministic_across_input_order() {
    let run = |images: Vec<String>| async move {
        let adapters = Arc::new(ModelAdapters::local_for_tests());
        prime_driveway_scene(&adapters, vec![sofa_detection()], Some(200.0));
        let request = QuoteRequest {
            images,
            heavy_material_level: None,
            exif: None,
        };
        test_pipeline(adapters).run_quote(request).await.unwrap()
    };

    let a = utils::to_data_uri(&checkerboard_png(4));
    let b = utils::to_data_uri(&checkerboard_png(5));
    let c = utils::to_data_uri(&checkerboard_png(8));

    let forward = run(vec![a.clone(), b.clone(), c.clone()]).await;
    let backward = run(vec![c, b, a]).await;

    assert_eq!(forward.final_volume_cy, backward.final_volume_cy);
    assert_eq!(
        serde_json::to_string(&forward.line_items).unwrap(),
        serde_json::to_string(&backward.line_items).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&forward.flags).unwrap(),
        serde_json::to_string(&backward.flags).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&forward.diagnostics).unwrap(),
        serde_json::to_string(&backward.diagnostics).unwrap()
    );
}

#[tokio::test]
async fn dead_adapters_degrade_instead_of_failing() {
    // No canned outputs at all: every adapter returns its empty result
    let adapters = Arc::new(ModelAdapters::local_for_tests());

    let request = QuoteRequest {
        images: vec![utils::to_data_uri(&checkerboard_png(4))],
        heavy_material_level: None,
        exif: None,
    };

    let response = test_pipeline(adapters).run_quote(request).await.unwrap();

    // A well-formed degraded quote, not an error
    assert_eq!(response.confidence_score, "LOW");
    assert!(response.flags.review_required);
    assert_eq!(response.diagnostics.floor_quality, "failed");
}

#[tokio::test]
async fn heavy_material_level_stamps_bulk_surcharge() {
    let adapters = Arc::new(ModelAdapters::local_for_tests());
    prime_driveway_scene(&adapters, Vec::new(), Some(200.0));

    let request = QuoteRequest {
        images: vec![
            utils::to_data_uri(&checkerboard_png(4)),
            utils::to_data_uri(&checkerboard_png(5)),
        ],
        heavy_material_level: Some("mostly".to_string()),
        exif: None,
    };

    let response = test_pipeline(adapters).run_quote(request).await.unwrap();

    let bulk = response.line_items
        .iter()
        .find(|li| li.name == "Mixed Bulk Debris")
        .expect("bulk line expected");
    assert!(bulk.surcharges.contains(&"heavy_material".to_string()));
    assert_eq!(
        response.diagnostics.heavy_material_level.as_deref(),
        Some("mostly")
    );
}
