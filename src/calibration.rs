//! Camera calibration: per-frame intrinsics bundles and the scene scale
//! ladder that decides whether "1 meter" can be trusted.

use serde::Serialize;

// Custom modules
pub mod bundle;
pub mod scale;

/// Calibration confidence tier. Ordering is Low < Med < High so stages
/// can gate on `>= Med`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Confidence {
    Low,
    Med,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "HIGH",
            Confidence::Med => "MED",
            Confidence::Low => "LOW",
        }
    }
}
