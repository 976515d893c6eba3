//! EXIF extraction and merging.
//!
//! Client-extracted EXIF is the primary source (browsers read the original
//! file before compression strips metadata); server-side parsing of the
//! uploaded bytes is the backup that fills gaps.

use serde::Deserialize;
use rexif::{ExifTag, TagValue};

/// EXIF entry supplied by the client, matched to an image by SHA-256
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientExif {
    pub server_sha256: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub focal_length: Option<f32>,
    #[serde(rename = "focalLength35mm")]
    pub focal_length_35mm: Option<f32>,
    pub orientation: Option<u16>,
    pub lens_model: Option<String>,
    pub image_width: Option<u32>,
    pub image_height: Option<u32>,
}

/// Normalized metadata view used by the calibration bundle
#[derive(Clone, Debug, Default)]
pub struct ExifFields {
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens_model: Option<String>,
    pub focal_length_mm: Option<f32>,
    pub focal_length_35mm: Option<f32>,
    pub digital_zoom_ratio: Option<f32>,
    pub orientation: u16,
    /// Any server-side EXIF was found at all
    pub from_server: bool,
    /// A client entry was merged in
    pub from_client: bool,
}

impl ExifFields {
    pub fn present(&self) -> bool {
        self.from_server || self.from_client
    }
}

fn tag_string(value: &TagValue) -> Option<String> {
    match value {
        TagValue::Ascii(s) => {
            let trimmed = s.trim().trim_matches('\0').to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        }
        _ => None,
    }
}

/// Parses EXIF out of the uploaded bytes. Bad or missing EXIF is not an
/// error; the frame continues without it.
pub fn extract_server_exif(raw_bytes: &[u8]) -> ExifFields {
    let mut fields = ExifFields { orientation: 1, ..Default::default() };

    let parsed = match rexif::parse_buffer(raw_bytes) {
        Ok(data) => data,
        Err(e) => {
            tracing::debug!(error = e.to_string(), "no usable server-side exif");
            return fields;
        }
    };

    for entry in &parsed.entries {
        match entry.tag {
            ExifTag::Make => fields.make = tag_string(&entry.value),
            ExifTag::Model => fields.model = tag_string(&entry.value),
            ExifTag::LensModel => fields.lens_model = tag_string(&entry.value),
            ExifTag::FocalLength => {
                fields.focal_length_mm = entry.value.to_f64(0).map(|v| v as f32);
            }
            ExifTag::FocalLengthIn35mmFilm => {
                fields.focal_length_35mm = entry.value.to_f64(0).map(|v| v as f32);
            }
            ExifTag::DigitalZoomRatio => {
                // A zero ratio means "no digital zoom" on many devices
                fields.digital_zoom_ratio = entry.value.to_f64(0)
                    .map(|v| v as f32)
                    .filter(|v| *v > 0.0);
            }
            ExifTag::Orientation => {
                if let Some(v) = entry.value.to_i64(0) {
                    if (1..=8).contains(&v) {
                        fields.orientation = v as u16;
                    }
                }
            }
            _ => {}
        }
    }

    fields.from_server = fields.make.is_some()
        || fields.model.is_some()
        || fields.focal_length_mm.is_some()
        || fields.focal_length_35mm.is_some();

    fields
}

/// Merges client EXIF over server EXIF. Client values win where present;
/// server values fill the gaps.
pub fn merge_exif(server: ExifFields, client: Option<&ClientExif>) -> ExifFields {
    let Some(client) = client else {
        return server;
    };

    let mut merged = ExifFields {
        make: client.make.clone().or(server.make),
        model: client.model.clone().or(server.model),
        lens_model: client.lens_model.clone().or(server.lens_model),
        focal_length_mm: client.focal_length.or(server.focal_length_mm),
        focal_length_35mm: client.focal_length_35mm.or(server.focal_length_35mm),
        digital_zoom_ratio: server.digital_zoom_ratio,
        orientation: client.orientation.filter(|o| (1..=8).contains(o)).unwrap_or(server.orientation),
        from_server: server.from_server,
        from_client: true,
    };

    // A client entry with no actual content should not count as present
    if merged.make.is_none()
        && merged.model.is_none()
        && merged.focal_length_mm.is_none()
        && merged.focal_length_35mm.is_none()
        && merged.lens_model.is_none()
    {
        merged.from_client = false;
    }

    merged
}
