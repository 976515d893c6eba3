use thiserror::Error;

// Custom modules
pub mod utils;
pub mod mask;
pub mod catalog;
pub mod adapters;
pub mod ingestion;
pub mod calibration;
pub mod perception;
pub mod geometry;
pub mod volumetrics;
pub mod fusion;
pub mod output;
pub mod pipeline;

/// Fatal invariant violations. Everything else in the pipeline is total:
/// stages return degraded result objects instead of erroring.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Intrinsics expressed at a different resolution than the depth map
    #[error("intrinsics at {intrinsics_width}x{intrinsics_height} do not match depth map {depth_width}x{depth_height}")]
    IntrinsicsResolutionMismatch {
        intrinsics_width: u32,
        intrinsics_height: u32,
        depth_width: u32,
        depth_height: u32,
    },
    /// Two different pixel buffers resolved to the same cache key
    #[error("cache key collision for {model}: cached {cached_width}x{cached_height}, requested {width}x{height}")]
    CacheKeyCollision {
        model: &'static str,
        cached_width: u32,
        cached_height: u32,
        width: u32,
        height: u32,
    },
    /// Parallel array shapes disagree at a stage boundary
    #[error("shape mismatch in {context}: {details}")]
    ShapeMismatch {
        context: &'static str,
        details: String,
    },
}
