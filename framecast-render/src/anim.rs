//! Animation subsystem for animated overlay images.
//!
//! Per-instance playback state advances on the frame-delay clock.
//! Lifecycle transitions (start, completion) are emitted as events on a
//! channel the owner subscribes to; on completion without looping the
//! state is evicted, and the subscriber is expected to remove or swap
//! the layer (otherwise the next reference restarts playback).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use framecast_core::layer::{
    AnimationEffect, AnimationSource, AnimationSpec, Easing, ImageData,
};

use crate::error::{RenderError, RenderResult};
use crate::raster::Raster;

/// Decoded-frame cache TTL.
pub const ANIM_FRAME_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnimationEvent {
    Started { layer_id: String },
    Completed { layer_id: String },
}

#[must_use]
pub fn ease(easing: Easing, t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    match easing {
        Easing::Linear => t,
        Easing::EaseIn => t * t,
        Easing::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
        Easing::EaseInOut => {
            if t < 0.5 {
                2.0 * t * t
            } else {
                1.0 - ((-2.0 * t + 2.0).powi(2) / 2.0)
            }
        }
    }
}

fn lerp(from: f32, to: f32, t: f32) -> f32 {
    from + (to - from) * t
}

struct AnimState {
    frame_index: usize,
    last_advance: Instant,
}

struct AnimFrames {
    frames: Vec<Raster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FrameCacheKey {
    layer_id: String,
    source_hash: u64,
}

/// Cheap structural signature of an animation source; payload bytes are
/// sampled, not fully hashed.
fn source_hash(source: &AnimationSource) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    match source {
        AnimationSource::Sequence { frames } => {
            0u8.hash(&mut hasher);
            frames.len().hash(&mut hasher);
            for f in frames {
                (f.width, f.height, f.rgba.len()).hash(&mut hasher);
                f.rgba.iter().take(64).for_each(|b| b.hash(&mut hasher));
            }
        }
        AnimationSource::SpriteSheet { sheet, frame_width, frame_height, frame_count } => {
            1u8.hash(&mut hasher);
            (sheet.width, sheet.height, sheet.rgba.len()).hash(&mut hasher);
            (frame_width, frame_height, frame_count).hash(&mut hasher);
            sheet.rgba.iter().take(64).for_each(|b| b.hash(&mut hasher));
        }
        AnimationSource::FrameFiles { paths } => {
            2u8.hash(&mut hasher);
            paths.hash(&mut hasher);
        }
    }
    hasher.finish()
}

pub struct AnimationEngine {
    states: parking_lot::Mutex<HashMap<String, AnimState>>,
    frames: moka::sync::Cache<FrameCacheKey, Arc<AnimFrames>>,
    events: mpsc::UnboundedSender<AnimationEvent>,
}

impl AnimationEngine {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AnimationEvent>) {
        Self::with_ttl(ANIM_FRAME_TTL)
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> (Self, mpsc::UnboundedReceiver<AnimationEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let frames = moka::sync::Cache::builder()
            .time_to_live(ttl)
            .weigher(|_k: &FrameCacheKey, v: &Arc<AnimFrames>| {
                v.frames.iter().map(|f| f.data.len()).sum::<usize>() as u32
            })
            .max_capacity(512 * 1024 * 1024)
            .build();
        (
            Self {
                states: parking_lot::Mutex::new(HashMap::new()),
                frames,
                events,
            },
            receiver,
        )
    }

    /// Buffer for the layer's current display frame at `now`, with
    /// effects applied.
    pub fn current_frame(
        &self,
        layer_id: &str,
        spec: &AnimationSpec,
        now: Instant,
    ) -> RenderResult<Raster> {
        let frames = self.load_frames(layer_id, spec)?;
        let count = frames.frames.len();
        if count == 0 {
            return Err(RenderError::Animation(format!(
                "animation '{layer_id}' has no frames"
            )));
        }
        let frame_delay = Duration::from_millis(spec.frame_delay_ms.max(1));

        let index = {
            let mut states = self.states.lock();
            match states.get_mut(layer_id) {
                None => {
                    states.insert(
                        layer_id.to_string(),
                        AnimState { frame_index: 0, last_advance: now },
                    );
                    self.emit(AnimationEvent::Started { layer_id: layer_id.to_string() });
                    0
                }
                Some(state) => {
                    if now.saturating_duration_since(state.last_advance) >= frame_delay {
                        state.last_advance = now;
                        if state.frame_index + 1 >= count {
                            if spec.looping {
                                state.frame_index = 0;
                            } else {
                                states.remove(layer_id);
                                self.emit(AnimationEvent::Completed {
                                    layer_id: layer_id.to_string(),
                                });
                                return self.apply_effects(
                                    frames.frames[count - 1].clone(),
                                    spec,
                                    count - 1,
                                    count,
                                );
                            }
                        } else {
                            state.frame_index += 1;
                        }
                    }
                    state.frame_index.min(count - 1)
                }
            }
        };

        self.apply_effects(frames.frames[index].clone(), spec, index, count)
    }

    fn apply_effects(
        &self,
        mut raster: Raster,
        spec: &AnimationSpec,
        index: usize,
        count: usize,
    ) -> RenderResult<Raster> {
        if spec.effects.is_empty() {
            return Ok(raster);
        }
        let progress = if count > 1 {
            index as f32 / (count - 1) as f32
        } else {
            1.0
        };
        let eased = ease(spec.easing, progress);

        for effect in &spec.effects {
            raster = match *effect {
                AnimationEffect::Fade { from, to } => {
                    let factor = lerp(from, to, eased).clamp(0.0, 1.0);
                    fade(&raster, factor)
                }
                AnimationEffect::Scale { from, to } => {
                    let factor = lerp(from, to, eased).max(0.01);
                    raster.scale(factor)?
                }
                AnimationEffect::Rotate { degrees } => raster.rotate(degrees * eased)?,
                AnimationEffect::Slide { dx, dy } => slide(&raster, dx * eased, dy * eased)?,
            };
        }
        Ok(raster)
    }

    fn load_frames(&self, layer_id: &str, spec: &AnimationSpec) -> RenderResult<Arc<AnimFrames>> {
        let key = FrameCacheKey {
            layer_id: layer_id.to_string(),
            source_hash: source_hash(&spec.source),
        };
        if let Some(frames) = self.frames.get(&key) {
            return Ok(frames);
        }
        let decoded = decode_source(&spec.source)?;
        let frames = Arc::new(AnimFrames { frames: decoded });
        self.frames.insert(key, frames.clone());
        Ok(frames)
    }

    fn emit(&self, event: AnimationEvent) {
        if self.events.send(event).is_err() {
            warn!("animation event receiver dropped");
        }
    }

    /// Drop decoded frames and playback state. Used under memory pressure.
    pub fn purge(&self) {
        self.frames.invalidate_all();
        self.states.lock().clear();
    }

    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.frames.run_pending_tasks();
        self.frames.weighted_size()
    }
}

fn fade(raster: &Raster, factor: f32) -> Raster {
    let mut out = raster.clone();
    let f = ((factor * 255.0).round() as i32).clamp(0, 255) as u16;
    for px in out.data.chunks_exact_mut(4) {
        for c in px.iter_mut() {
            *c = crate::raster::mul_div255(u16::from(*c), f);
        }
    }
    out
}

/// Shift content by (dx, dy) inside an expanded transparent canvas.
fn slide(raster: &Raster, dx: f32, dy: f32) -> RenderResult<Raster> {
    let pad_x = dx.abs().ceil() as u32;
    let pad_y = dy.abs().ceil() as u32;
    if pad_x == 0 && pad_y == 0 {
        return Ok(raster.clone());
    }
    let mut out = Raster::new(raster.width + pad_x, raster.height + pad_y)?;
    let x = if dx >= 0.0 { dx as i64 } else { 0 };
    let y = if dy >= 0.0 { dy as i64 } else { pad_y as i64 - (-dy) as i64 };
    out.blit_over(raster, x, y.max(0), 1.0);
    Ok(out)
}

fn decode_source(source: &AnimationSource) -> RenderResult<Vec<Raster>> {
    match source {
        AnimationSource::Sequence { frames } => frames.iter().map(ingest).collect(),
        AnimationSource::SpriteSheet { sheet, frame_width, frame_height, frame_count } => {
            slice_sheet(sheet, *frame_width, *frame_height, *frame_count)
        }
        AnimationSource::FrameFiles { paths } => paths
            .iter()
            .map(|path| {
                let img = image::open(path)?.to_rgba8();
                Raster::from_straight_rgba(img.width(), img.height(), img.as_raw())
            })
            .collect(),
    }
}

fn ingest(data: &ImageData) -> RenderResult<Raster> {
    data.check()
        .map_err(|e| RenderError::InvalidPayload(e.to_string()))?;
    Raster::from_straight_rgba(data.width, data.height, &data.rgba)
}

fn slice_sheet(
    sheet: &ImageData,
    frame_width: u32,
    frame_height: u32,
    frame_count: u32,
) -> RenderResult<Vec<Raster>> {
    if frame_width == 0 || frame_height == 0 || frame_count == 0 {
        return Err(RenderError::Animation("sprite sheet cell size/count must be non-zero".into()));
    }
    let full = ingest(sheet)?;
    let cols = sheet.width / frame_width;
    if cols == 0 {
        return Err(RenderError::Animation("sprite sheet narrower than one cell".into()));
    }

    let mut frames = Vec::with_capacity(frame_count as usize);
    for i in 0..frame_count {
        let sx = (i % cols) * frame_width;
        let sy = (i / cols) * frame_height;
        if sx + frame_width > sheet.width || sy + frame_height > sheet.height {
            return Err(RenderError::Animation(format!(
                "sprite sheet cell {i} out of bounds"
            )));
        }
        let mut cell = Raster::new(frame_width, frame_height)?;
        for row in 0..frame_height {
            let src_start = (((sy + row) as usize * sheet.width as usize) + sx as usize) * 4;
            let dst_start = row as usize * frame_width as usize * 4;
            let len = frame_width as usize * 4;
            cell.data[dst_start..dst_start + len]
                .copy_from_slice(&full.data[src_start..src_start + len]);
        }
        frames.push(cell);
    }
    Ok(frames)
}
