//! Layer data model.
//!
//! Layers are immutable per render pass: the layer manager owns them,
//! the compositor consumes them read-only. Raster payloads (avatar
//! frames, feed images) are resolved by out-of-process collaborators
//! and attached as inline RGBA data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Position,
    pub scale: f32,
    /// Rotation in degrees, clockwise.
    pub rotation: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Position { x: 0.0, y: 0.0 },
            scale: 1.0,
            rotation: 0.0,
        }
    }
}

/// Straight (non-premultiplied) RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Self = Self { r: 255, g: 255, b: 255, a: 255 };
    pub const BLACK: Self = Self { r: 0, g: 0, b: 0, a: 255 };
}

/// Inline RGBA raster payload attached to a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub rgba: Bytes,
}

impl ImageData {
    /// Validate that the byte length matches the declared dimensions.
    pub fn check(&self) -> Result<()> {
        let expected = self.width as usize * self.height as usize * 4;
        if self.rgba.len() != expected {
            return Err(Error::InvalidInput(format!(
                "image data length {} does not match {}x{} rgba",
                self.rgba.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ShapeSpec {
    Rectangle { width: f32, height: f32 },
    Circle { radius: f32 },
    Polygon { points: Vec<Position> },
    Line { to: Position, thickness: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSpec {
    pub text: String,
    pub size: f32,
    pub color: Color,
    pub align: TextAlign,
    pub max_width: f32,
    pub max_lines: usize,
}

/// Animation playback modes for animated overlay images.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AnimationSource {
    /// Pre-decoded frame sequence.
    Sequence { frames: Vec<ImageData> },
    /// Single sheet sliced into fixed-size cells, row-major.
    SpriteSheet {
        sheet: ImageData,
        frame_width: u32,
        frame_height: u32,
        frame_count: u32,
    },
    /// Image files decoded on first use.
    FrameFiles { paths: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum AnimationEffect {
    Fade { from: f32, to: f32 },
    Scale { from: f32, to: f32 },
    Rotate { degrees: f32 },
    Slide { dx: f32, dy: f32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationSpec {
    pub source: AnimationSource,
    /// Delay between frames in milliseconds.
    pub frame_delay_ms: u64,
    #[serde(rename = "loop", default)]
    pub looping: bool,
    #[serde(default)]
    pub effects: Vec<AnimationEffect>,
    #[serde(default = "default_easing")]
    pub easing: Easing,
}

fn default_easing() -> Easing {
    Easing::Linear
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlayDescriptor {
    Shape { spec: ShapeSpec, color: Color, opacity: f32 },
    Text { spec: TextSpec },
    Image { url: String, data: Option<ImageData> },
    AnimatedImage { animation: AnimationSpec },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerContent {
    /// Host avatar; the current pose raster is supplied by the avatar
    /// collaborator each frame.
    Host { model_ref: String, frame: Option<ImageData> },
    /// Secondary assistant avatar.
    Assistant { model_ref: String, frame: Option<ImageData> },
    /// Live visual feed (product camera, screen share).
    VisualFeed { source_url: String, frame: Option<ImageData> },
    Overlay { descriptor: OverlayDescriptor },
    Chat { messages: Vec<ChatMessage>, max_messages: usize },
}

impl LayerContent {
    /// Stable name of the content variant, used in cache keys and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Host { .. } => "host",
            Self::Assistant { .. } => "assistant",
            Self::VisualFeed { .. } => "visual_feed",
            Self::Overlay { .. } => "overlay",
            Self::Chat { .. } => "chat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub visible: bool,
    pub opacity: f32,
    pub z_index: i32,
    #[serde(default)]
    pub transform: Transform,
    pub content: LayerContent,
}

/// Collaborator interface: owns layer lifecycle, consumed read-only by
/// the render path.
pub trait LayerManager: Send + Sync {
    /// All layers in insertion order.
    fn get_all_layers(&self) -> Vec<Layer>;
    fn get_layer(&self, id: &str) -> Option<Layer>;
    fn set_layer_visibility(&self, id: &str, visible: bool) -> Result<()>;
}

/// In-memory, insertion-ordered layer store.
#[derive(Default)]
pub struct LayerStore {
    layers: parking_lot::RwLock<Vec<Layer>>,
}

impl LayerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a layer, preserving insertion order on replace.
    pub fn upsert(&self, layer: Layer) {
        let mut layers = self.layers.write();
        if let Some(existing) = layers.iter_mut().find(|l| l.id == layer.id) {
            *existing = layer;
        } else {
            layers.push(layer);
        }
    }

    pub fn remove(&self, id: &str) -> Option<Layer> {
        let mut layers = self.layers.write();
        let idx = layers.iter().position(|l| l.id == id)?;
        Some(layers.remove(idx))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }
}

impl LayerManager for LayerStore {
    fn get_all_layers(&self) -> Vec<Layer> {
        self.layers.read().clone()
    }

    fn get_layer(&self, id: &str) -> Option<Layer> {
        self.layers.read().iter().find(|l| l.id == id).cloned()
    }

    fn set_layer_visibility(&self, id: &str, visible: bool) -> Result<()> {
        let mut layers = self.layers.write();
        let layer = layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| Error::LayerNotFound(id.to_string()))?;
        layer.visible = visible;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay_layer(id: &str, z: i32) -> Layer {
        Layer {
            id: id.to_string(),
            visible: true,
            opacity: 1.0,
            z_index: z,
            transform: Transform::default(),
            content: LayerContent::Overlay {
                descriptor: OverlayDescriptor::Shape {
                    spec: ShapeSpec::Rectangle { width: 10.0, height: 10.0 },
                    color: Color::WHITE,
                    opacity: 1.0,
                },
            },
        }
    }

    #[test]
    fn store_preserves_insertion_order() {
        let store = LayerStore::new();
        store.upsert(overlay_layer("b", 5));
        store.upsert(overlay_layer("a", 1));
        store.upsert(overlay_layer("c", 3));

        let ids: Vec<_> = store.get_all_layers().into_iter().map(|l| l.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let store = LayerStore::new();
        store.upsert(overlay_layer("a", 1));
        store.upsert(overlay_layer("b", 2));

        let mut replacement = overlay_layer("a", 9);
        replacement.opacity = 0.5;
        store.upsert(replacement);

        let ids: Vec<_> = store.get_all_layers().into_iter().map(|l| l.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get_layer("a").map(|l| l.z_index), Some(9));
    }

    #[test]
    fn visibility_toggle_and_missing_layer() {
        let store = LayerStore::new();
        store.upsert(overlay_layer("a", 1));

        store.set_layer_visibility("a", false).expect("layer exists");
        assert!(!store.get_layer("a").map(|l| l.visible).unwrap_or(true));

        assert!(matches!(
            store.set_layer_visibility("ghost", true),
            Err(Error::LayerNotFound(_))
        ));
    }

    #[test]
    fn image_data_length_check() {
        let good = ImageData {
            width: 2,
            height: 2,
            rgba: Bytes::from(vec![0u8; 16]),
        };
        assert!(good.check().is_ok());

        let bad = ImageData {
            width: 2,
            height: 2,
            rgba: Bytes::from(vec![0u8; 15]),
        };
        assert!(bad.check().is_err());
    }

    #[test]
    fn layer_content_round_trips_through_json() {
        let layer = overlay_layer("a", 1);
        let json = serde_json::to_string(&layer).expect("serialize");
        let back: Layer = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, "a");
        assert_eq!(back.content.kind(), "overlay");
    }
}
