//! Content-addressed render cache.
//!
//! Keys are an explicit struct fingerprint of everything that affects a
//! layer's rendered raster; a change to any contributing field produces
//! a different key, so entries are invalidated implicitly and expire by
//! TTL, never explicitly.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use framecast_core::layer::{Layer, LayerContent};

use crate::raster::Raster;

/// Render cache TTL.
pub const RENDER_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderFingerprint {
    layer_id: String,
    kind: &'static str,
    /// Position quantized to 0.1px.
    pos: (i32, i32),
    scale_milli: i32,
    rotation_deci: i32,
    opacity_milli: u16,
    content_hash: u64,
}

impl RenderFingerprint {
    #[must_use]
    pub fn of(layer: &Layer) -> Self {
        Self {
            layer_id: layer.id.clone(),
            kind: layer.content.kind(),
            pos: (
                (layer.transform.position.x * 10.0) as i32,
                (layer.transform.position.y * 10.0) as i32,
            ),
            scale_milli: (layer.transform.scale * 1000.0) as i32,
            rotation_deci: (layer.transform.rotation * 10.0) as i32,
            opacity_milli: (layer.opacity.clamp(0.0, 1.0) * 1000.0) as u16,
            content_hash: content_hash(&layer.content),
        }
    }
}

/// Stable in-process hash of the content payload.
fn content_hash(content: &LayerContent) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    format!("{content:?}").hash(&mut hasher);
    hasher.finish()
}

pub struct RenderCache {
    cache: moka::sync::Cache<RenderFingerprint, Arc<Raster>>,
}

impl RenderCache {
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self::with_ttl(max_bytes, RENDER_TTL)
    }

    #[must_use]
    pub fn with_ttl(max_bytes: u64, ttl: Duration) -> Self {
        let cache = moka::sync::Cache::builder()
            .time_to_live(ttl)
            .weigher(|_k: &RenderFingerprint, v: &Arc<Raster>| v.data.len() as u32)
            .max_capacity(max_bytes)
            .build();
        Self { cache }
    }

    #[must_use]
    pub fn get(&self, fingerprint: &RenderFingerprint) -> Option<Arc<Raster>> {
        self.cache.get(fingerprint)
    }

    pub fn insert(&self, fingerprint: RenderFingerprint, raster: Arc<Raster>) {
        self.cache.insert(fingerprint, raster);
    }

    /// Drop every entry. Used by workers under memory pressure.
    pub fn purge(&self) {
        self.cache.invalidate_all();
    }

    /// Estimated resident bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecast_core::layer::{Color, OverlayDescriptor, ShapeSpec, Transform};

    fn layer(id: &str, opacity: f32) -> Layer {
        Layer {
            id: id.to_string(),
            visible: true,
            opacity,
            z_index: 0,
            transform: Transform::default(),
            content: LayerContent::Overlay {
                descriptor: OverlayDescriptor::Shape {
                    spec: ShapeSpec::Circle { radius: 5.0 },
                    color: Color::WHITE,
                    opacity: 1.0,
                },
            },
        }
    }

    #[test]
    fn identical_layers_share_a_fingerprint() {
        assert_eq!(
            RenderFingerprint::of(&layer("a", 1.0)),
            RenderFingerprint::of(&layer("a", 1.0))
        );
    }

    #[test]
    fn opacity_change_invalidates() {
        assert_ne!(
            RenderFingerprint::of(&layer("a", 1.0)),
            RenderFingerprint::of(&layer("a", 0.5))
        );
    }

    #[test]
    fn content_change_invalidates() {
        let mut changed = layer("a", 1.0);
        changed.content = LayerContent::Overlay {
            descriptor: OverlayDescriptor::Shape {
                spec: ShapeSpec::Circle { radius: 6.0 },
                color: Color::WHITE,
                opacity: 1.0,
            },
        };
        assert_ne!(
            RenderFingerprint::of(&layer("a", 1.0)),
            RenderFingerprint::of(&changed)
        );
    }

    #[test]
    fn cache_round_trip_and_purge() {
        let cache = RenderCache::new(10 * 1024 * 1024);
        let fp = RenderFingerprint::of(&layer("a", 1.0));
        let raster = Arc::new(Raster::new(4, 4).expect("raster"));

        assert!(cache.get(&fp).is_none());
        cache.insert(fp.clone(), raster);
        assert!(cache.get(&fp).is_some());
        assert!(cache.memory_bytes() > 0);

        cache.purge();
        assert!(cache.get(&fp).is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = RenderCache::with_ttl(10 * 1024 * 1024, Duration::from_millis(20));
        let fp = RenderFingerprint::of(&layer("a", 1.0));
        cache.insert(fp.clone(), Arc::new(Raster::new(2, 2).expect("raster")));
        assert!(cache.get(&fp).is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&fp).is_none());
    }
}
