//! Layer compositor: z-sorted single-pass flattening of all visible
//! layers onto a transparent canvas of the configured resolution.
//!
//! Individual layer failures never abort a composite: the failed layer
//! is replaced by a visibly marked placeholder. The only composite-level
//! failure is canvas allocation.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use framecast_core::layer::{Layer, LayerContent, OverlayDescriptor, ShapeSpec, Position};

use crate::anim::{AnimationEngine, AnimationEvent};
use crate::cache::{RenderCache, RenderFingerprint};
use crate::chat_panel::{render_chat, PanelStyle};
use crate::error::{RenderError, RenderResult};
use crate::frame::Frame;
use crate::raster::Raster;
use crate::text::{draw_text, layout_text, GlyphSource};

#[derive(Debug, Clone)]
pub struct CompositorConfig {
    pub width: u32,
    pub height: u32,
    pub cache_max_bytes: u64,
    pub chat_style: PanelStyle,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            cache_max_bytes: 256 * 1024 * 1024,
            chat_style: PanelStyle::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeStats {
    /// Layers replaced by a placeholder this pass.
    pub layer_errors: usize,
    pub cache_hits: usize,
}

pub struct Compositor {
    config: CompositorConfig,
    cache: RenderCache,
    anim: AnimationEngine,
    glyphs: Arc<dyn GlyphSource>,
}

impl Compositor {
    pub fn new(
        config: CompositorConfig,
        glyphs: Arc<dyn GlyphSource>,
    ) -> (Self, mpsc::UnboundedReceiver<AnimationEvent>) {
        let cache = RenderCache::new(config.cache_max_bytes);
        let (anim, anim_events) = AnimationEngine::new();
        (
            Self {
                config,
                cache,
                anim,
                glyphs,
            },
            anim_events,
        )
    }

    /// Flatten `layers` into one frame.
    ///
    /// Stable-sorts ascending by `z_index` (ties keep input order),
    /// skips invisible and fully transparent layers, and blends each
    /// remaining raster `over` the canvas at the layer's opacity.
    pub fn composite(&self, layers: &[Layer]) -> RenderResult<Frame> {
        self.composite_with_stats(layers).map(|(frame, _)| frame)
    }

    pub fn composite_with_stats(&self, layers: &[Layer]) -> RenderResult<(Frame, CompositeStats)> {
        let mut canvas = Raster::new(self.config.width, self.config.height)?;
        let mut stats = CompositeStats::default();

        let mut ordered: Vec<&Layer> = layers.iter().collect();
        ordered.sort_by_key(|l| l.z_index);

        for layer in ordered {
            if !layer.visible || layer.opacity <= 0.0 {
                continue;
            }

            let raster = match self.resolve(layer, &mut stats) {
                Ok(raster) => raster,
                Err(e) => {
                    stats.layer_errors += 1;
                    warn!(layer = %layer.id, error = %e, "layer render failed, using placeholder");
                    Arc::new(placeholder())
                }
            };

            let transformed = match self.transform(&raster, layer) {
                Ok(r) => r,
                Err(e) => {
                    stats.layer_errors += 1;
                    warn!(layer = %layer.id, error = %e, "layer transform failed, using placeholder");
                    Arc::new(placeholder())
                }
            };

            // All current layer kinds blend `over`.
            canvas.blit_over(
                &transformed,
                layer.transform.position.x as i64,
                layer.transform.position.y as i64,
                layer.opacity,
            );
        }

        Ok((canvas.into_frame(), stats))
    }

    /// Resolve the untransformed raster for a layer, through the render
    /// cache for time-invariant content.
    fn resolve(&self, layer: &Layer, stats: &mut CompositeStats) -> RenderResult<Arc<Raster>> {
        if Self::cacheable(&layer.content) {
            let fingerprint = RenderFingerprint::of(layer);
            if let Some(hit) = self.cache.get(&fingerprint) {
                stats.cache_hits += 1;
                return Ok(hit);
            }
            let rendered = Arc::new(self.render_content(layer)?);
            self.cache.insert(fingerprint, rendered.clone());
            Ok(rendered)
        } else {
            Ok(Arc::new(self.render_content(layer)?))
        }
    }

    /// Chat panels and animations are time-varying; caching them would
    /// freeze fades and playback for the cache TTL.
    fn cacheable(content: &LayerContent) -> bool {
        !matches!(
            content,
            LayerContent::Chat { .. }
                | LayerContent::Overlay {
                    descriptor: OverlayDescriptor::AnimatedImage { .. }
                }
        )
    }

    fn render_content(&self, layer: &Layer) -> RenderResult<Raster> {
        match &layer.content {
            LayerContent::Host { model_ref, frame }
            | LayerContent::Assistant { model_ref, frame } => frame
                .as_ref()
                .ok_or_else(|| RenderError::MissingPayload(model_ref.clone()))
                .and_then(|data| {
                    data.check().map_err(|e| RenderError::InvalidPayload(e.to_string()))?;
                    Raster::from_straight_rgba(data.width, data.height, &data.rgba)
                }),
            LayerContent::VisualFeed { source_url, frame } => frame
                .as_ref()
                .ok_or_else(|| RenderError::MissingPayload(source_url.clone()))
                .and_then(|data| {
                    data.check().map_err(|e| RenderError::InvalidPayload(e.to_string()))?;
                    Raster::from_straight_rgba(data.width, data.height, &data.rgba)
                }),
            LayerContent::Overlay { descriptor } => self.render_overlay(layer, descriptor),
            LayerContent::Chat { messages, max_messages } => render_chat(
                messages,
                *max_messages,
                &self.config.chat_style,
                self.glyphs.as_ref(),
                Utc::now(),
            ),
        }
    }

    fn render_overlay(&self, layer: &Layer, descriptor: &OverlayDescriptor) -> RenderResult<Raster> {
        match descriptor {
            OverlayDescriptor::Shape { spec, color, opacity } => render_shape(spec, *color, *opacity),
            OverlayDescriptor::Text { spec } => {
                let layout = layout_text(spec, self.glyphs.as_ref());
                let width = (spec.max_width.ceil() as u32).max(1);
                let height = (layout.height().ceil() as u32).max(1);
                let mut raster = Raster::new(width, height)?;
                draw_text(
                    &mut raster,
                    &layout,
                    spec.size,
                    spec.color,
                    1.0,
                    self.glyphs.as_ref(),
                    0.0,
                    0.0,
                );
                Ok(raster)
            }
            OverlayDescriptor::Image { url, data } => data
                .as_ref()
                .ok_or_else(|| RenderError::MissingPayload(url.clone()))
                .and_then(|d| {
                    d.check().map_err(|e| RenderError::InvalidPayload(e.to_string()))?;
                    Raster::from_straight_rgba(d.width, d.height, &d.rgba)
                }),
            OverlayDescriptor::AnimatedImage { animation } => {
                self.anim.current_frame(&layer.id, animation, Instant::now())
            }
        }
    }

    /// Rotation first, then scale. The later blit clips to canvas
    /// bounds, which provides the transparent padding.
    fn transform(&self, raster: &Arc<Raster>, layer: &Layer) -> RenderResult<Arc<Raster>> {
        let rotation = layer.transform.rotation;
        let scale = layer.transform.scale;
        if rotation == 0.0 && (scale - 1.0).abs() < f32::EPSILON {
            return Ok(raster.clone());
        }
        let rotated = raster.rotate(rotation)?;
        Ok(Arc::new(rotated.scale(scale)?))
    }

    /// Estimated cache-resident bytes (render + animation caches).
    #[must_use]
    pub fn cache_memory_bytes(&self) -> u64 {
        self.cache.memory_bytes() + self.anim.memory_bytes()
    }

    /// Drop all cached rasters. Called by workers under memory pressure.
    pub fn purge_caches(&self) {
        self.cache.purge();
        self.anim.purge();
    }

    #[must_use]
    pub fn canvas_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}

fn render_shape(spec: &ShapeSpec, color: framecast_core::layer::Color, opacity: f32) -> RenderResult<Raster> {
    match spec {
        ShapeSpec::Rectangle { width, height } => {
            if *width <= 0.0 || *height <= 0.0 {
                return Err(RenderError::InvalidShape("rectangle sides must be positive".into()));
            }
            let mut raster = Raster::new(width.ceil() as u32, height.ceil() as u32)?;
            raster.fill_rect(0.0, 0.0, *width, *height, color, opacity);
            Ok(raster)
        }
        ShapeSpec::Circle { radius } => {
            if *radius <= 0.0 {
                return Err(RenderError::InvalidShape("circle radius must be positive".into()));
            }
            let d = (radius * 2.0).ceil() as u32;
            let mut raster = Raster::new(d.max(1), d.max(1))?;
            raster.fill_circle(*radius, *radius, *radius, color, opacity);
            Ok(raster)
        }
        ShapeSpec::Polygon { points } => {
            if points.len() < 3 {
                return Err(RenderError::InvalidShape(format!(
                    "polygon needs at least 3 points, got {}",
                    points.len()
                )));
            }
            let min_x = points.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
            let min_y = points.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
            let max_x = points.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
            let max_y = points.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);
            let width = ((max_x - min_x).ceil() as u32).max(1);
            let height = ((max_y - min_y).ceil() as u32).max(1);
            let local: Vec<Position> = points
                .iter()
                .map(|p| Position { x: p.x - min_x, y: p.y - min_y })
                .collect();
            let mut raster = Raster::new(width, height)?;
            raster.fill_polygon(&local, color, opacity)?;
            Ok(raster)
        }
        ShapeSpec::Line { to, thickness } => {
            let width = (to.x.abs().ceil() as u32).max(1) + thickness.ceil() as u32;
            let height = (to.y.abs().ceil() as u32).max(1) + thickness.ceil() as u32;
            let mut raster = Raster::new(width, height)?;
            let half = thickness / 2.0;
            let from = Position {
                x: if to.x < 0.0 { -to.x + half } else { half },
                y: if to.y < 0.0 { -to.y + half } else { half },
            };
            let end = Position { x: from.x + to.x, y: from.y + to.y };
            raster.draw_line(from, end, *thickness, color, opacity);
            Ok(raster)
        }
    }
}

/// Visibly marked error placeholder: magenta tile with black diagonal
/// hatching.
fn placeholder() -> Raster {
    let size = 64u32;
    let mut raster = match Raster::new(size, size) {
        Ok(r) => r,
        Err(_) => return Raster { width: 0, height: 0, data: Vec::new() },
    };
    let magenta = framecast_core::layer::Color { r: 255, g: 0, b: 255, a: 255 };
    raster.fill_rect(0.0, 0.0, size as f32, size as f32, magenta, 1.0);
    for offset in (0..size * 2).step_by(8) {
        raster.draw_line(
            Position { x: offset as f32, y: 0.0 },
            Position { x: offset as f32 - size as f32, y: size as f32 },
            2.0,
            framecast_core::layer::Color::BLACK,
            1.0,
        );
    }
    raster
}
