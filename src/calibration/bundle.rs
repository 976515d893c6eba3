//! Calibration bundle: camera intrinsics derived from EXIF, a device
//! table and fallbacks.
//!
//! Core invariant: intrinsics live in the same pixel space as the depth
//! model input. Dimension chain: decoded raw, then physically rotated
//! pixels (intrinsics base), then model input.

// Custom modules
use crate::PipelineError;
use crate::calibration::Confidence;
use crate::catalog::DeviceFamily;
use crate::ingestion::exif::ExifFields;

/// Full-frame diagonal in millimeters, for the 35mm-equivalent formula
const FULL_FRAME_DIAG_MM: f32 = 43.27;
/// Soft anchoring penalty when the digital zoom ratio is unknown
const ZOOM_UNKNOWN_PENALTY: f32 = 0.85;

/// Which physical lens captured the frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LensId {
    Main,
    Ultra,
    Tele,
    Unknown,
}

impl LensId {
    pub fn as_str(self) -> &'static str {
        match self {
            LensId::Main => "main",
            LensId::Ultra => "ultra",
            LensId::Tele => "tele",
            LensId::Unknown => "unknown",
        }
    }
}

/// Which signal identified the lens / focal length
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocalSource {
    LensModel,
    Focal35mm,
    FocalMmDevice,
    Fallback,
}

impl FocalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FocalSource::LensModel => "lens_model",
            FocalSource::Focal35mm => "focal_35mm",
            FocalSource::FocalMmDevice => "focal_mm_device",
            FocalSource::Fallback => "fallback",
        }
    }
}

/// Complete calibration state for a single frame
#[derive(Clone, Debug)]
pub struct CalibrationBundle {
    // Dimension chain
    pub decoded_width: u32,
    pub decoded_height: u32,
    pub oriented_width: u32,
    pub oriented_height: u32,
    pub model_width: u32,
    pub model_height: u32,
    pub orientation: u16,

    // Base intrinsics at oriented resolution
    pub fx_base: f32,
    pub fy_base: f32,
    pub cx_base: f32,
    pub cy_base: f32,

    // Intrinsics at model-input resolution. Everything downstream of the
    // depth model uses these.
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,

    // Camera and lens identity
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens_model: Option<String>,
    pub lens_id: LensId,
    pub lens_id_reason: String,
    pub focal_source: FocalSource,

    // Optics
    pub focal_length_mm: Option<f32>,
    pub focal_length_35mm: Option<f32>,
    pub digital_zoom_ratio: f32,

    // Quality
    pub anchoring_mult: f32,
    pub confidence: Confidence,
    pub warnings: Vec<String>,
    pub exif_from_server: bool,
    pub exif_from_client: bool,
}

impl CalibrationBundle {
    /// Guards the resolution invariant: back-projection may only pair
    /// these intrinsics with a depth map at model-input resolution.
    pub fn assert_matches_depth(&self, depth_width: u32, depth_height: u32) -> Result<(), PipelineError> {
        if self.model_width != depth_width || self.model_height != depth_height {
            return Err(PipelineError::IntrinsicsResolutionMismatch {
                intrinsics_width: self.model_width,
                intrinsics_height: self.model_height,
                depth_width,
                depth_height,
            });
        }
        Ok(())
    }
}

/// Lens identification ladder: LensModel string, then 35mm bands, then
/// device-specific physical-focal bands, else unknown.
fn identify_lens(exif: &ExifFields) -> (LensId, String, FocalSource) {
    if let Some(lens_model) = exif.lens_model.as_deref() {
        let lm = lens_model.to_lowercase();
        if lm.contains("ultra") || lm.contains("wide") {
            return (LensId::Ultra, format!("lens_model={lens_model}"), FocalSource::LensModel);
        }
        if lm.contains("tele") {
            return (LensId::Tele, format!("lens_model={lens_model}"), FocalSource::LensModel);
        }
        return (LensId::Main, format!("lens_model={lens_model}"), FocalSource::LensModel);
    }

    if let Some(f35) = exif.focal_length_35mm {
        if f35 <= 15.0 {
            return (LensId::Ultra, format!("f35={f35:.0}<=15"), FocalSource::Focal35mm);
        } else if f35 <= 40.0 {
            return (LensId::Main, format!("f35={f35:.0} in [16-40]"), FocalSource::Focal35mm);
        }
        return (LensId::Tele, format!("f35={f35:.0}>40"), FocalSource::Focal35mm);
    }

    if let (Some(f_mm), Some(model)) = (exif.focal_length_mm, exif.model.as_deref()) {
        if model.to_lowercase().contains("iphone") {
            if f_mm < 2.5 {
                return (LensId::Ultra, format!("focal_mm={f_mm:.1}<2.5"), FocalSource::FocalMmDevice);
            } else if f_mm <= 6.0 {
                return (LensId::Main, format!("focal_mm={f_mm:.1} in [2.5-6]"), FocalSource::FocalMmDevice);
            }
            return (LensId::Tele, format!("focal_mm={f_mm:.1}>6"), FocalSource::FocalMmDevice);
        }
    }

    (LensId::Unknown, "no_lens_signals".to_string(), FocalSource::Fallback)
}

/// HIGH requires server EXIF, Make and Model, an identified lens and a
/// non-fallback focal. Fallback focal always grades LOW.
fn compute_confidence(bundle: &CalibrationBundle) -> Confidence {
    if bundle.focal_source == FocalSource::Fallback
        && bundle.warnings.iter().any(|w| w == "fallback_fov_60")
    {
        return Confidence::Low;
    }
    if bundle.lens_id == LensId::Unknown {
        return Confidence::Med;
    }
    if !bundle.exif_from_server {
        return Confidence::Med;
    }
    if bundle.make.is_none() || bundle.model.is_none() {
        return Confidence::Med;
    }
    Confidence::High
}

/// Builds the calibration bundle for an ingested frame
#[allow(clippy::too_many_arguments)]
pub fn build_bundle(
    exif: &ExifFields,
    decoded_width: u32,
    decoded_height: u32,
    oriented_width: u32,
    oriented_height: u32,
    model_width: u32,
    model_height: u32,
    frame_id: &str,
) -> CalibrationBundle {
    let mut warnings: Vec<String> = Vec::new();

    let (lens_id, lens_id_reason, mut focal_source) = identify_lens(exif);

    // Zoom policy: assume 1.0 when missing, with a soft anchoring penalty
    let (zoom, anchoring_mult) = match exif.digital_zoom_ratio {
        Some(z) => (z, 1.0),
        None => {
            warnings.push("zoom_unknown_assume_1.0".to_string());
            (1.0, ZOOM_UNKNOWN_PENALTY)
        }
    };

    // Derive the 35mm equivalent from the physical focal length and a
    // device crop factor when the camera did not record it
    let mut focal_35mm = exif.focal_length_35mm;
    if focal_35mm.is_none() {
        if let (Some(f_mm), Some(model)) = (exif.focal_length_mm, exif.model.as_deref()) {
            if let Some(device) = DeviceFamily::from_model(model) {
                let derived = f_mm * device.crop_factor();
                warnings.push(format!("focal_35mm_derived:{derived:.0}"));
                focal_35mm = Some(derived);
            }
        }
    }

    // Base intrinsics at oriented resolution via the diagonal formula
    let diag_px = ((oriented_width as f32).powi(2) + (oriented_height as f32).powi(2)).sqrt();
    let fx_base = match focal_35mm {
        Some(f35) if f35 > 0.0 => {
            let mut fx = (f35 / FULL_FRAME_DIAG_MM) * diag_px;
            if zoom > 1.0 {
                fx *= zoom;
                warnings.push(format!("zoom_applied:{zoom:.2}"));
            }
            fx
        }
        _ => {
            // Assume a 60 degree field of view
            warnings.push("fallback_fov_60".to_string());
            focal_source = FocalSource::Fallback;
            diag_px / (2.0 * (30.0f32).to_radians().tan())
        }
    };
    let fy_base = fx_base;
    let cx_base = oriented_width as f32 / 2.0;
    let cy_base = oriented_height as f32 / 2.0;

    // Scale to model-input resolution
    let scale_x = if oriented_width > 0 { model_width as f32 / oriented_width as f32 } else { 1.0 };
    let scale_y = if oriented_height > 0 { model_height as f32 / oriented_height as f32 } else { 1.0 };

    let mut bundle = CalibrationBundle {
        decoded_width,
        decoded_height,
        oriented_width,
        oriented_height,
        model_width,
        model_height,
        orientation: exif.orientation,
        fx_base,
        fy_base,
        cx_base,
        cy_base,
        fx: fx_base * scale_x,
        fy: fy_base * scale_y,
        cx: cx_base * scale_x,
        cy: cy_base * scale_y,
        make: exif.make.clone(),
        model: exif.model.clone(),
        lens_model: exif.lens_model.clone(),
        lens_id,
        lens_id_reason,
        focal_source,
        focal_length_mm: exif.focal_length_mm,
        focal_length_35mm: focal_35mm,
        digital_zoom_ratio: zoom,
        anchoring_mult,
        confidence: Confidence::Low,
        warnings,
        exif_from_server: exif.from_server,
        exif_from_client: exif.from_client,
    };
    bundle.confidence = compute_confidence(&bundle);

    tracing::info!(
        frame_id,
        raw_w = decoded_width,
        raw_h = decoded_height,
        oriented_w = oriented_width,
        oriented_h = oriented_height,
        model_w = model_width,
        model_h = model_height,
        fx_base = bundle.fx_base,
        fx = bundle.fx,
        lens = bundle.lens_id.as_str(),
        lens_reason = bundle.lens_id_reason,
        focal_source = bundle.focal_source.as_str(),
        anchoring_mult = bundle.anchoring_mult,
        confidence = bundle.confidence.as_str(),
        warnings = bundle.warnings.join(","),
        "calibration chain"
    );

    bundle
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exif_full() -> ExifFields {
        ExifFields {
            make: Some("Apple".to_string()),
            model: Some("iPhone 14 Pro".to_string()),
            lens_model: Some("iPhone 14 Pro back triple camera 6.86mm f/1.78".to_string()),
            focal_length_mm: Some(6.86),
            focal_length_35mm: Some(24.0),
            digital_zoom_ratio: Some(1.0),
            orientation: 1,
            from_server: true,
            from_client: false,
        }
    }

    #[test]
    fn full_exif_grades_high() {
        let bundle = build_bundle(&exif_full(), 4032, 3024, 4032, 3024, 1024, 768, "f1");
        assert_eq!(bundle.confidence, Confidence::High);
        assert_eq!(bundle.lens_id, LensId::Main);
        assert_eq!(bundle.focal_source, FocalSource::LensModel);

        // Diagonal formula at oriented resolution, then scaled by width ratio
        let diag = ((4032.0f32).powi(2) + (3024.0f32).powi(2)).sqrt();
        let expected_base = (24.0 / 43.27) * diag;
        assert!((bundle.fx_base - expected_base).abs() < 1.0);
        assert!((bundle.fx - expected_base * (1024.0 / 4032.0)).abs() < 1.0);
    }

    #[test]
    fn no_focal_falls_back_to_fov() {
        let exif = ExifFields { orientation: 1, ..Default::default() };
        let bundle = build_bundle(&exif, 1024, 768, 1024, 768, 1024, 768, "f1");
        assert_eq!(bundle.confidence, Confidence::Low);
        assert!(bundle.warnings.iter().any(|w| w == "fallback_fov_60"));

        let diag = ((1024.0f32).powi(2) + (768.0f32).powi(2)).sqrt();
        let expected = diag / (2.0 * (30.0f32).to_radians().tan());
        assert!((bundle.fx - expected).abs() < 0.5);
    }

    #[test]
    fn derived_f35_from_device_crop() {
        let exif = ExifFields {
            make: Some("Apple".to_string()),
            model: Some("iPhone 13".to_string()),
            focal_length_mm: Some(5.0),
            digital_zoom_ratio: Some(1.0),
            orientation: 1,
            from_server: true,
            ..Default::default()
        };
        let bundle = build_bundle(&exif, 4032, 3024, 4032, 3024, 1024, 768, "f1");
        // 5.0mm x 4.8 crop = 24mm equivalent
        assert_eq!(bundle.focal_length_35mm, Some(24.0));
        assert!(bundle.warnings.iter().any(|w| w.starts_with("focal_35mm_derived")));
    }

    #[test]
    fn unknown_lens_caps_at_med() {
        let exif = ExifFields {
            make: Some("Canon".to_string()),
            model: Some("EOS R5".to_string()),
            focal_length_35mm: Some(50.0),
            digital_zoom_ratio: Some(1.0),
            orientation: 1,
            from_server: true,
            ..Default::default()
        };
        // f35 = 50 identifies a tele lens, so this stays HIGH
        let bundle = build_bundle(&exif, 100, 100, 100, 100, 100, 100, "f1");
        assert_eq!(bundle.lens_id, LensId::Tele);
        assert_eq!(bundle.confidence, Confidence::High);

        // With no focal signals at all the lens is unknown
        let exif = ExifFields {
            make: Some("Canon".to_string()),
            model: Some("EOS R5".to_string()),
            digital_zoom_ratio: Some(1.0),
            orientation: 1,
            from_server: true,
            ..Default::default()
        };
        let bundle = build_bundle(&exif, 100, 100, 100, 100, 100, 100, "f1");
        assert_eq!(bundle.lens_id, LensId::Unknown);
        assert_eq!(bundle.confidence, Confidence::Low);
    }

    #[test]
    fn missing_zoom_applies_soft_penalty() {
        let mut exif = exif_full();
        exif.digital_zoom_ratio = None;
        let bundle = build_bundle(&exif, 4032, 3024, 4032, 3024, 1024, 768, "f1");
        assert_eq!(bundle.anchoring_mult, 0.85);
        assert!(bundle.warnings.iter().any(|w| w == "zoom_unknown_assume_1.0"));
    }

    #[test]
    fn resolution_invariant_is_enforced() {
        let bundle = build_bundle(&exif_full(), 4032, 3024, 4032, 3024, 1024, 768, "f1");
        assert!(bundle.assert_matches_depth(1024, 768).is_ok());
        assert!(matches!(
            bundle.assert_matches_depth(512, 384),
            Err(PipelineError::IntrinsicsResolutionMismatch { .. })
        ));
    }
}
