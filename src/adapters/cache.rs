//! Request-scoped cache for model outputs, keyed on the exact pixels a
//! model saw. Created at request start, discarded at request end. Safe to
//! share across frames within one request because the key is a pure
//! function of content.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

// Custom modules
use crate::PipelineError;
use crate::adapters::ModelId;
use crate::adapters::segmenter::BulkSegOutput;
use crate::adapters::semantic::SemanticRawOutput;
use crate::adapters::depth::DepthOutput;

/// Cache key: which model, which preprocessed pixels, which prompt set
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub model: ModelId,
    pub preproc_sha256: String,
    pub prompt_hash: u64,
}

/// Cached adapter output
#[derive(Clone, Debug)]
pub enum CacheValue {
    Bulk(BulkSegOutput),
    Semantic(SemanticRawOutput),
    Depth(DepthOutput),
}

impl CacheValue {
    /// Raster dimensions of the cached output, when it carries one
    fn dims(&self) -> Option<(u32, u32)> {
        match self {
            CacheValue::Bulk(out) => out.mask.as_ref().map(|m| (m.width, m.height)),
            CacheValue::Semantic(out) => Some((out.width, out.height)),
            CacheValue::Depth(out) => out.depth.as_ref().map(|d| (d.width, d.height)),
        }
    }
}

/// Request-scoped typed cache with hit/miss counters
pub struct MaskCache {
    entries: Mutex<HashMap<CacheKey, CacheValue>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MaskCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a cached output. A hit whose raster dimensions disagree
    /// with the requested image is a fatal key collision.
    pub fn get(
        &self,
        key: &CacheKey,
        image_width: u32,
        image_height: u32,
    ) -> Result<Option<CacheValue>, PipelineError> {
        let entries = self.entries.lock().expect("mask cache lock poisoned");

        match entries.get(key) {
            Some(value) => {
                if let Some((w, h)) = value.dims() {
                    if w != image_width || h != image_height {
                        return Err(PipelineError::CacheKeyCollision {
                            model: key.model.as_str(),
                            cached_width: w,
                            cached_height: h,
                            width: image_width,
                            height: image_height,
                        });
                    }
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn insert(&self, key: CacheKey, value: CacheValue) {
        let mut entries = self.entries.lock().expect("mask cache lock poisoned");
        entries.insert(key, value);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for MaskCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Mask;

    fn key(sha: &str) -> CacheKey {
        CacheKey {
            model: ModelId::BulkSegmenter,
            preproc_sha256: sha.to_string(),
            prompt_hash: 7,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = MaskCache::new();
        let k = key("abc");
        assert!(cache.get(&k, 4, 4).unwrap().is_none());
        assert_eq!(cache.misses(), 1);

        cache.insert(
            k.clone(),
            CacheValue::Bulk(BulkSegOutput {
                mask: Some(Mask::new(4, 4)),
                confidence: 0.5,
            }),
        );

        assert!(cache.get(&k, 4, 4).unwrap().is_some());
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let cache = MaskCache::new();
        let k = key("abc");
        cache.insert(
            k.clone(),
            CacheValue::Bulk(BulkSegOutput {
                mask: Some(Mask::new(4, 4)),
                confidence: 0.5,
            }),
        );

        let err = cache.get(&k, 8, 8).unwrap_err();
        assert!(matches!(err, PipelineError::CacheKeyCollision { .. }));
    }
}
