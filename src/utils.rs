use anyhow::{Result, Context};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

// Custom modules
pub mod config;

/// Decodes an image payload that may be a bare base64 string or a data URI
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>> {
    let b64 = match payload.split_once(",") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };

    BASE64.decode(b64.trim())
        .context("Error decoding base64 image payload")
}

/// Encodes raw JPEG bytes as a data URI for hosted model requests
pub fn to_data_uri(jpeg_bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg_bytes))
}

/// Full SHA-256 digest as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Percentile over a copied sample, linear interpolation between ranks
pub fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (p / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }

    let frac = rank - lo as f32;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Median of a sample, empty input yields zero
pub fn median(values: &[f32]) -> f32 {
    percentile(values, 50.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_roundtrip() {
        let bytes = vec![1u8, 2, 3, 4];
        let uri = to_data_uri(&bytes);
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        assert_eq!(decode_image_payload(&uri).unwrap(), bytes);
    }

    #[test]
    fn bare_base64_accepted() {
        let encoded = BASE64.encode([9u8, 8, 7]);
        assert_eq!(decode_image_payload(&encoded).unwrap(), vec![9, 8, 7]);
    }

    #[test]
    fn percentile_interpolates() {
        let values = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 50.0), 2.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert!((percentile(&values, 25.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(sha256_hex(b"junk"), sha256_hex(b"junk"));
        assert_ne!(sha256_hex(b"junk"), sha256_hex(b"pile"));
    }
}
