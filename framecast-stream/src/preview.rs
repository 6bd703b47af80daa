//! Preview distribution: per-viewer adaptive quality, small ring
//! buffers, and binary message batching.
//!
//! Each client owns a capacity-3 drop-oldest ring fed by the stream
//! manager, a scheduler that pulls the newest buffered frame at the
//! tier's rate and re-encodes it to tier bounds, and a batcher that
//! accumulates frames and out-of-band state updates for up to a short
//! window before flushing one binary message. Removing a client aborts
//! its tasks synchronously and discards its buffers.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use framecast_core::metrics;
use framecast_render::frame::Frame;

use crate::error::{StreamError, StreamResult};

/// Per-client frame ring capacity.
const RING_CAPACITY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityTier {
    pub max_fps: u32,
    pub jpeg_quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

impl Quality {
    #[must_use]
    pub fn tier(self) -> QualityTier {
        match self {
            Self::High => QualityTier { max_fps: 30, jpeg_quality: 80, max_width: 1280, max_height: 720 },
            Self::Medium => QualityTier { max_fps: 15, jpeg_quality: 60, max_width: 854, max_height: 480 },
            Self::Low => QualityTier { max_fps: 5, jpeg_quality: 40, max_width: 640, max_height: 360 },
        }
    }

    #[must_use]
    pub fn interval(self) -> Duration {
        Duration::from_millis(u64::from(1000 / self.tier().max_fps.max(1)))
    }
}

/// Out-of-band client control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Quality { data: QualityChange },
}

#[derive(Debug, Deserialize)]
pub struct QualityChange {
    pub quality: Quality,
}

/// Parse a client control message.
pub fn parse_control(raw: &str) -> StreamResult<ControlMessage> {
    serde_json::from_str(raw).map_err(|e| StreamError::Preview(format!("bad control message: {e}")))
}

/// Push transport to one connected viewer. `false` means the viewer is
/// gone and the client should be cleared.
pub trait PreviewTransport: Send + Sync + 'static {
    fn deliver(&self, message: Bytes) -> bool;
}

impl PreviewTransport for mpsc::UnboundedSender<Bytes> {
    fn deliver(&self, message: Bytes) -> bool {
        self.send(message).is_ok()
    }
}

/// Drop-oldest ring of pending frames.
pub struct FrameRing {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Take the newest frame, discarding anything older.
    pub fn take_newest(&mut self) -> Option<Frame> {
        let newest = self.frames.pop_back();
        self.frames.clear();
        newest
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

enum BatchItem {
    Frame(Bytes),
    StateUpdate(String),
}

/// Serialize one batch message:
/// `[u32 frame_count][u32 state_count][u64 timestamp_ms]` followed by
/// u32-length-prefixed frame payloads, then u32-length-prefixed UTF-8
/// JSON updates. Big-endian throughout.
#[must_use]
pub fn serialize_batch(frames: &[Bytes], updates: &[String], timestamp_ms: u64) -> Bytes {
    let mut out = Vec::with_capacity(
        16 + frames.iter().map(|f| f.len() + 4).sum::<usize>()
            + updates.iter().map(|u| u.len() + 4).sum::<usize>(),
    );
    // Writes to a Vec cannot fail.
    let _ = out.write_u32::<BigEndian>(frames.len() as u32);
    let _ = out.write_u32::<BigEndian>(updates.len() as u32);
    let _ = out.write_u64::<BigEndian>(timestamp_ms);
    for frame in frames {
        let _ = out.write_u32::<BigEndian>(frame.len() as u32);
        let _ = out.write_all(frame);
    }
    for update in updates {
        let _ = out.write_u32::<BigEndian>(update.len() as u32);
        let _ = out.write_all(update.as_bytes());
    }
    Bytes::from(out)
}

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub batch_window: Duration,
    pub batch_max_frames: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(50),
            batch_max_frames: 4,
        }
    }
}

struct ClientHandle {
    quality: Arc<Mutex<Quality>>,
    ring: Arc<Mutex<FrameRing>>,
    batch_tx: mpsc::UnboundedSender<BatchItem>,
    scheduler: tokio::task::JoinHandle<()>,
    batcher: tokio::task::JoinHandle<()>,
}

pub struct PreviewDistributor {
    config: PreviewConfig,
    clients: DashMap<String, ClientHandle>,
}

impl PreviewDistributor {
    #[must_use]
    pub fn new(config: PreviewConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    /// Register a viewer. Replaces any previous client with the same id.
    pub fn add_client(
        &self,
        client_id: &str,
        transport: Arc<dyn PreviewTransport>,
        initial_quality: Quality,
    ) {
        self.remove_client(client_id);

        let quality = Arc::new(Mutex::new(initial_quality));
        let ring = Arc::new(Mutex::new(FrameRing::new(RING_CAPACITY)));
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        let batcher = tokio::spawn(batcher_task(
            batch_rx,
            transport,
            self.config.clone(),
            client_id.to_string(),
        ));
        let scheduler = tokio::spawn(scheduler_task(
            quality.clone(),
            ring.clone(),
            batch_tx.clone(),
        ));

        self.clients.insert(
            client_id.to_string(),
            ClientHandle { quality, ring, batch_tx, scheduler, batcher },
        );
        metrics::PREVIEW_CLIENTS_ACTIVE.set(self.clients.len() as i64);
        debug!(client = client_id, "preview client added");
    }

    /// Clear a client: cancels its pending timers synchronously and
    /// discards buffered frames.
    pub fn remove_client(&self, client_id: &str) {
        if let Some((_, handle)) = self.clients.remove(client_id) {
            handle.scheduler.abort();
            handle.batcher.abort();
            handle.ring.lock().take_newest();
            metrics::PREVIEW_CLIENTS_ACTIVE.set(self.clients.len() as i64);
            debug!(client = client_id, "preview client removed");
        }
    }

    pub fn set_quality(&self, client_id: &str, quality: Quality) {
        if let Some(handle) = self.clients.get(client_id) {
            *handle.quality.lock() = quality;
            debug!(client = client_id, ?quality, "preview quality changed");
        }
    }

    /// Fan a rendered frame out to every client's ring.
    pub fn push_frame(&self, frame: &Frame) {
        for handle in self.clients.iter() {
            handle.ring.lock().push(frame.clone());
        }
    }

    /// Queue an out-of-band state update for every client's next batch.
    pub fn push_state_update(&self, update: &serde_json::Value) {
        let encoded = update.to_string();
        for handle in self.clients.iter() {
            let _ = handle.batch_tx.send(BatchItem::StateUpdate(encoded.clone()));
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Tear down every client.
    pub fn clear(&self) {
        let ids: Vec<String> = self.clients.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.remove_client(&id);
        }
    }
}

/// Pull the newest ring frame at the tier cadence, re-encode, hand to
/// the batcher.
async fn scheduler_task(
    quality: Arc<Mutex<Quality>>,
    ring: Arc<Mutex<FrameRing>>,
    batch_tx: mpsc::UnboundedSender<BatchItem>,
) {
    loop {
        let current = *quality.lock();
        tokio::time::sleep(current.interval()).await;

        let frame = ring.lock().take_newest();
        let Some(frame) = frame else { continue };

        let tier = current.tier();
        match encode_preview(&frame, &tier) {
            Ok(jpeg) => {
                if batch_tx.send(BatchItem::Frame(jpeg)).is_err() {
                    return;
                }
            }
            Err(e) => warn!("preview encode failed: {e}"),
        }
    }
}

/// Resize to tier bounds (preserving aspect) and JPEG-encode.
fn encode_preview(frame: &Frame, tier: &QualityTier) -> StreamResult<Bytes> {
    let img = image::RgbaImage::from_raw(frame.width, frame.height, frame.data.to_vec())
        .ok_or_else(|| StreamError::Preview("frame buffer does not match dimensions".to_string()))?;

    let rgb = if frame.width > tier.max_width || frame.height > tier.max_height {
        let scale = f32::min(
            tier.max_width as f32 / frame.width as f32,
            tier.max_height as f32 / frame.height as f32,
        );
        let w = ((frame.width as f32 * scale) as u32).max(1);
        let h = ((frame.height as f32 * scale) as u32).max(1);
        let resized = image::imageops::resize(&img, w, h, image::imageops::FilterType::Triangle);
        image::DynamicImage::ImageRgba8(resized).to_rgb8()
    } else {
        image::DynamicImage::ImageRgba8(img).to_rgb8()
    };

    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, tier.jpeg_quality)
        .encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| StreamError::Preview(format!("jpeg encode: {e}")))?;
    Ok(Bytes::from(out))
}

/// Accumulate frames and state updates; flush one binary message per
/// window or when the frame threshold is reached.
async fn batcher_task(
    mut items: mpsc::UnboundedReceiver<BatchItem>,
    transport: Arc<dyn PreviewTransport>,
    config: PreviewConfig,
    client_id: String,
) {
    let mut frames: Vec<Bytes> = Vec::new();
    let mut updates: Vec<String> = Vec::new();
    let mut window = tokio::time::interval(config.batch_window);
    window.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = items.recv() => {
                match item {
                    Some(BatchItem::Frame(frame)) => {
                        frames.push(frame);
                        if frames.len() >= config.batch_max_frames
                            && !flush(&transport, &mut frames, &mut updates) {
                            break;
                        }
                    }
                    Some(BatchItem::StateUpdate(update)) => updates.push(update),
                    None => {
                        flush(&transport, &mut frames, &mut updates);
                        break;
                    }
                }
            }
            _ = window.tick() => {
                if !(frames.is_empty() && updates.is_empty())
                    && !flush(&transport, &mut frames, &mut updates) {
                    break;
                }
            }
        }
    }
    trace!(client = %client_id, "batcher stopped");
}

/// Returns false when the transport is gone.
fn flush(transport: &Arc<dyn PreviewTransport>, frames: &mut Vec<Bytes>, updates: &mut Vec<String>) -> bool {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let message = serialize_batch(frames, updates, timestamp_ms);
    frames.clear();
    updates.clear();
    metrics::PREVIEW_BATCHES_TOTAL.inc();
    transport.deliver(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Read;

    fn frame(value: u8) -> Frame {
        Frame {
            width: 16,
            height: 16,
            data: Bytes::from(vec![value; 16 * 16 * 4]),
        }
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let mut ring = FrameRing::new(3);
        for value in 1..=5 {
            ring.push(frame(value));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.take_newest().map(|f| f.data[0]), Some(5));
        assert!(ring.is_empty());
    }

    #[test]
    fn batch_header_counts_and_lengths() {
        let frames = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")];
        let updates = vec![r#"{"state":"live"}"#.to_string()];
        let message = serialize_batch(&frames, &updates, 1234);

        let mut cursor = std::io::Cursor::new(message.as_ref());
        assert_eq!(cursor.read_u32::<BigEndian>().expect("frame count"), 2);
        assert_eq!(cursor.read_u32::<BigEndian>().expect("update count"), 1);
        assert_eq!(cursor.read_u64::<BigEndian>().expect("timestamp"), 1234);

        let len = cursor.read_u32::<BigEndian>().expect("len") as usize;
        let mut first = vec![0u8; len];
        cursor.read_exact(&mut first).expect("frame bytes");
        assert_eq!(first, b"abc");

        let len = cursor.read_u32::<BigEndian>().expect("len") as usize;
        let mut second = vec![0u8; len];
        cursor.read_exact(&mut second).expect("frame bytes");
        assert_eq!(second, b"defgh");

        let len = cursor.read_u32::<BigEndian>().expect("len") as usize;
        let mut update = vec![0u8; len];
        cursor.read_exact(&mut update).expect("update bytes");
        assert_eq!(String::from_utf8_lossy(&update), r#"{"state":"live"}"#);
    }

    #[test]
    fn control_message_selects_quality() {
        let parsed = parse_control(r#"{"type":"quality","data":{"quality":"low"}}"#)
            .expect("parse");
        let ControlMessage::Quality { data } = parsed;
        assert_eq!(data.quality, Quality::Low);
    }

    #[test]
    fn malformed_control_rejected() {
        assert!(parse_control("not json").is_err());
        assert!(parse_control(r#"{"type":"other"}"#).is_err());
    }

    #[test]
    fn tier_intervals_derive_from_fps() {
        assert_eq!(Quality::Low.interval(), Duration::from_millis(200));
        assert_eq!(Quality::High.interval(), Duration::from_millis(33));
    }

    #[tokio::test]
    async fn low_quality_client_is_rate_limited() {
        let distributor = PreviewDistributor::new(PreviewConfig {
            batch_window: Duration::from_millis(20),
            batch_max_frames: 4,
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        distributor.add_client("viewer-1", Arc::new(tx), Quality::Low);

        // Feed frames far faster than the 5 fps tier for ~700ms.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(700);
        while tokio::time::Instant::now() < deadline {
            distributor.push_frame(&frame(1));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        distributor.remove_client("viewer-1");

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        // 700ms at 200ms cadence: at most 4 flushes, never 70.
        assert!(delivered >= 1, "expected at least one batch");
        assert!(delivered <= 4, "rate limit violated: {delivered} batches");
    }

    #[tokio::test]
    async fn state_updates_flush_with_batches() {
        let distributor = PreviewDistributor::new(PreviewConfig {
            batch_window: Duration::from_millis(10),
            batch_max_frames: 4,
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        distributor.add_client("viewer-1", Arc::new(tx), Quality::High);

        distributor.push_state_update(&serde_json::json!({"status": "live"}));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let message = rx.try_recv().expect("one batch");
        let mut cursor = std::io::Cursor::new(message.as_ref());
        assert_eq!(cursor.read_u32::<BigEndian>().expect("frames"), 0);
        assert_eq!(cursor.read_u32::<BigEndian>().expect("updates"), 1);

        distributor.clear();
        assert_eq!(distributor.client_count(), 0);
    }
}
