//! Responsible for hardened ingestion of customer photos: decode, EXIF
//! orientation, quality gating, resolution lock and canonical hashing.
//! Frames that survive carry a calibration bundle and are immutable
//! afterwards.

use image::{DynamicImage, RgbImage, ImageEncoder};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use anyhow::{Result, Context};

// Custom modules
pub mod exif;

use crate::calibration::bundle::{self, CalibrationBundle};
use crate::utils;
use exif::{ClientExif, ExifFields};

/// Resolution lock: working images are at most this wide
pub const TARGET_WIDTH: u32 = 1024;
/// Laplacian variance below this is too blurry
pub const BLUR_THRESHOLD: f64 = 100.0;
/// Acceptable mean-brightness window
pub const BRIGHTNESS_MIN: f64 = 30.0;
pub const BRIGHTNESS_MAX: f64 = 225.0;
/// Quality score below this rejects the frame
pub const SCORE_REJECT: i32 = 40;
/// Re-encode quality for working JPEG bytes
const JPEG_QUALITY: u8 = 90;

/// Extracted metadata and quality trace for a single frame
#[derive(Clone, Debug)]
pub struct FrameMetadata {
    /// Content-based identity: first 16 hex of SHA-256 over original bytes
    pub image_id: String,
    /// Full SHA-256 of the original bytes
    pub file_hash: String,
    pub file_size_bytes: usize,
    /// Working (post-orientation, post-resize) dimensions
    pub width: u32,
    pub height: u32,
    pub decoded_width: u32,
    pub decoded_height: u32,
    pub oriented_width: u32,
    pub oriented_height: u32,
    pub orientation: u16,
    pub orientation_applied: bool,
    pub resize_applied: bool,
    pub blur_score: f64,
    pub brightness: f64,
    pub exif_present: bool,
    pub ingestion_score: i32,
    pub rejected: bool,
    pub rejection_reason: Option<String>,
    /// SHA-256 over the raw RGB buffer of the working image: the cache key
    /// for every downstream segmentation call
    pub preproc_sha256: String,
}

/// A validated, normalized frame ready for perception
#[derive(Debug)]
pub struct IngestedFrame {
    pub metadata: FrameMetadata,
    /// Working pixels at the locked resolution
    pub image: RgbImage,
    /// Working image re-encoded as JPEG for hosted model calls
    pub jpeg_bytes: Vec<u8>,
    pub data_uri: String,
    pub bundle: CalibrationBundle,
}

/// Result of the ingestion stage
pub struct IngestionResult {
    pub frames: Vec<IngestedFrame>,
    pub rejected_frames: Vec<FrameMetadata>,
    /// True when no frame carried any EXIF
    pub uncalibrated_mode: bool,
}

/// Physically rotates pixels according to the EXIF orientation tag so
/// every downstream resolution is the oriented one
fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Laplacian variance over the grayscale image. Low variance means the
/// image has no sharp structure anywhere.
fn blur_score(gray: &image::GrayImage) -> f64 {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    if w < 3 || h < 3 {
        return 0.0;
    }

    let data = gray.as_raw();
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let n = ((w - 2) * (h - 2)) as f64;

    for r in 1..h - 1 {
        for c in 1..w - 1 {
            let center = data[r * w + c] as f64;
            let lap = data[(r - 1) * w + c] as f64
                + data[(r + 1) * w + c] as f64
                + data[r * w + c - 1] as f64
                + data[r * w + c + 1] as f64
                - 4.0 * center;
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let mean = sum / n;
    (sum_sq / n) - mean * mean
}

/// Mean pixel intensity of the grayscale image
fn brightness(gray: &image::GrayImage) -> f64 {
    let data = gray.as_raw();
    if data.is_empty() {
        return 128.0;
    }
    data.iter().map(|v| *v as f64).sum::<f64>() / data.len() as f64
}

/// Quality score 0-100. Deductions: blur -40, brightness out of range -30,
/// missing EXIF -20.
fn ingestion_score(blur: f64, bright: f64, exif_present: bool) -> i32 {
    let mut score = 100;

    if blur < BLUR_THRESHOLD {
        score -= 40;
    }
    if bright < BRIGHTNESS_MIN || bright > BRIGHTNESS_MAX {
        score -= 30;
    }
    if !exif_present {
        score -= 20;
    }

    score.max(0)
}

fn rejection_reason(blur: f64, bright: f64) -> String {
    let mut reasons: Vec<&str> = Vec::new();
    if blur < BLUR_THRESHOLD {
        reasons.push("too_blurry");
    }
    if bright < BRIGHTNESS_MIN {
        reasons.push("too_dark");
    }
    if bright > BRIGHTNESS_MAX {
        reasons.push("too_bright");
    }

    if reasons.is_empty() {
        "low_quality".to_string()
    } else {
        reasons.join("+")
    }
}

fn encode_working_jpeg(rgb: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.write_image(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    ).context("Error encoding working JPEG")?;

    Ok(out)
}

/// Rejection record for a payload that never produced decodable bytes
pub fn rejection_record(image_id: &str, reason: &str) -> FrameMetadata {
    FrameMetadata {
        image_id: image_id.to_string(),
        file_hash: String::new(),
        file_size_bytes: 0,
        width: 0,
        height: 0,
        decoded_width: 0,
        decoded_height: 0,
        oriented_width: 0,
        oriented_height: 0,
        orientation: 1,
        orientation_applied: false,
        resize_applied: false,
        blur_score: 0.0,
        brightness: 128.0,
        exif_present: false,
        ingestion_score: 0,
        rejected: true,
        rejection_reason: Some(reason.to_string()),
        preproc_sha256: String::new(),
    }
}

/// Processes one image blob through ingestion.
/// Ok is a validated frame, Err is the rejection record.
pub fn ingest_blob(
    raw_bytes: &[u8],
    client_exif: Option<&ClientExif>,
) -> std::result::Result<Box<IngestedFrame>, FrameMetadata> {
    let file_hash = utils::sha256_hex(raw_bytes);
    let image_id = file_hash[..16].to_string();

    let rejection = |reason: String| FrameMetadata {
        image_id: image_id.clone(),
        file_hash: file_hash.clone(),
        file_size_bytes: raw_bytes.len(),
        width: 0,
        height: 0,
        decoded_width: 0,
        decoded_height: 0,
        oriented_width: 0,
        oriented_height: 0,
        orientation: 1,
        orientation_applied: false,
        resize_applied: false,
        blur_score: 0.0,
        brightness: 128.0,
        exif_present: false,
        ingestion_score: 0,
        rejected: true,
        rejection_reason: Some(reason),
        preproc_sha256: String::new(),
    };

    let decoded = match image::load_from_memory(raw_bytes) {
        Ok(img) => img,
        Err(e) => {
            let msg: String = e.to_string().chars().take(50).collect();
            return Err(rejection(format!("load_error:{msg}")));
        }
    };
    let decoded_width = decoded.width();
    let decoded_height = decoded.height();

    // Extract EXIF before any transforms; bad EXIF is log-and-continue
    let server_exif = exif::extract_server_exif(raw_bytes);
    let merged: ExifFields = exif::merge_exif(server_exif, client_exif);
    let exif_present = merged.present();
    let orientation = merged.orientation;

    let oriented = apply_orientation(decoded, orientation);
    let oriented_width = oriented.width();
    let oriented_height = oriented.height();
    let orientation_applied = orientation != 1;

    // Quality metrics on the oriented full-resolution image
    let gray = oriented.to_luma8();
    let blur = blur_score(&gray);
    let bright = brightness(&gray);
    let score = ingestion_score(blur, bright, exif_present);

    let mut metadata = FrameMetadata {
        image_id: image_id.clone(),
        file_hash,
        file_size_bytes: raw_bytes.len(),
        width: oriented_width,
        height: oriented_height,
        decoded_width,
        decoded_height,
        oriented_width,
        oriented_height,
        orientation,
        orientation_applied,
        resize_applied: false,
        blur_score: blur,
        brightness: bright,
        exif_present,
        ingestion_score: score,
        rejected: false,
        rejection_reason: None,
        preproc_sha256: String::new(),
    };

    if score < SCORE_REJECT {
        metadata.rejected = true;
        metadata.rejection_reason = Some(rejection_reason(blur, bright));
        tracing::info!(
            image_id = metadata.image_id,
            score,
            reason = metadata.rejection_reason.as_deref().unwrap_or(""),
            "frame rejected at ingestion"
        );
        return Err(metadata);
    }

    // Resolution lock
    let working: RgbImage = if oriented_width > TARGET_WIDTH {
        let ratio = TARGET_WIDTH as f64 / oriented_width as f64;
        let new_h = ((oriented_height as f64) * ratio) as u32;
        metadata.resize_applied = true;
        image::imageops::resize(
            &oriented.to_rgb8(),
            TARGET_WIDTH,
            new_h.max(1),
            image::imageops::FilterType::Lanczos3,
        )
    } else {
        oriented.to_rgb8()
    };

    metadata.width = working.width();
    metadata.height = working.height();
    metadata.preproc_sha256 = utils::sha256_hex(working.as_raw());

    let jpeg_bytes = match encode_working_jpeg(&working) {
        Ok(bytes) => bytes,
        Err(e) => {
            let msg: String = e.to_string().chars().take(50).collect();
            metadata.rejected = true;
            metadata.rejection_reason = Some(format!("load_error:{msg}"));
            return Err(metadata);
        }
    };
    let data_uri = utils::to_data_uri(&jpeg_bytes);

    let bundle = bundle::build_bundle(
        &merged,
        decoded_width,
        decoded_height,
        oriented_width,
        oriented_height,
        metadata.width,
        metadata.height,
        &metadata.image_id,
    );

    tracing::info!(
        image_id = metadata.image_id,
        byte_len = metadata.file_size_bytes,
        decoded_w = decoded_width,
        decoded_h = decoded_height,
        oriented_w = oriented_width,
        oriented_h = oriented_height,
        final_w = metadata.width,
        final_h = metadata.height,
        orientation = metadata.orientation,
        blur = metadata.blur_score,
        brightness = metadata.brightness,
        exif_present = metadata.exif_present,
        score = metadata.ingestion_score,
        preproc_sha256 = metadata.preproc_sha256,
        "ingestion fingerprint"
    );

    Ok(Box::new(IngestedFrame {
        metadata,
        image: working,
        jpeg_bytes,
        data_uri,
        bundle,
    }))
}

/// Ingestion entry point. Matches client EXIF to blobs by SHA-256 (never
/// by index), then processes blobs in canonical content-hash order so
/// downstream fusion is deterministic.
pub fn run_ingestion(blobs: &[Vec<u8>], client_exif: &[ClientExif]) -> IngestionResult {
    // Hash-based EXIF registry
    let mut hash_to_exif: Vec<(&str, &ClientExif)> = Vec::new();
    for entry in client_exif {
        if let Some(hash) = entry.server_sha256.as_deref() {
            hash_to_exif.push((hash, entry));
        }
    }

    // Canonical order: sort by content hash
    let mut hash_blob_pairs: Vec<(String, &Vec<u8>)> = blobs
        .iter()
        .map(|b| (utils::sha256_hex(b), b))
        .collect();
    hash_blob_pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut result = IngestionResult {
        frames: Vec::new(),
        rejected_frames: Vec::new(),
        uncalibrated_mode: false,
    };
    let mut exif_count = 0usize;

    for (file_hash, blob) in hash_blob_pairs {
        let matched = hash_to_exif
            .iter()
            .find(|(h, _)| *h == file_hash)
            .map(|(_, e)| *e);

        match ingest_blob(blob, matched) {
            Ok(frame) => {
                if frame.metadata.exif_present {
                    exif_count += 1;
                }
                result.frames.push(*frame);
            }
            Err(rejected) => result.rejected_frames.push(rejected),
        }
    }

    if exif_count == 0 && !result.frames.is_empty() {
        result.uncalibrated_mode = true;
    }

    tracing::info!(
        valid = result.frames.len(),
        rejected = result.rejected_frames.len(),
        uncalibrated_mode = result.uncalibrated_mode,
        "ingestion complete"
    );

    result
}
