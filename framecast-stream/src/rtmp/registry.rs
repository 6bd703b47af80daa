//! Active-stream registry, media fan-out, and typed lifecycle events.
//!
//! The registry is the authoritative "is this broadcast live" source.
//! Media frames fan out to players over a per-stream broadcast channel
//! as zero-copy `Bytes`; late joiners first receive the cached metadata
//! and codec sequence headers so decoding can start mid-stream.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use framecast_core::metrics;

use crate::error::{StreamError, StreamResult};

/// Media fan-out channel depth per stream.
const MEDIA_CHANNEL_CAPACITY: usize = 512;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Metadata,
}

#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: MediaKind,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl MediaFrame {
    /// AVC/AAC sequence headers and stream metadata must be replayed to
    /// late-joining players.
    #[must_use]
    pub fn is_sequence_header(&self) -> bool {
        match self.kind {
            MediaKind::Metadata => true,
            MediaKind::Video => {
                self.payload.len() >= 2
                    && self.payload[0] & 0x0F == 7
                    && self.payload[1] == 0
            }
            MediaKind::Audio => {
                self.payload.len() >= 2
                    && self.payload[0] >> 4 == 10
                    && self.payload[1] == 0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Pending,
    Publisher,
    Player,
}

impl SessionType {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Publisher => "publisher",
            Self::Player => "player",
        }
    }
}

/// One live broadcast, keyed by its stream-key hash.
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub stream_key_hash: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Typed lifecycle events, consumed for metrics, never for control flow.
#[derive(Debug, Clone)]
pub enum RtmpEvent {
    Connection { id: Uuid },
    Disconnection { id: Uuid, session_type: SessionType, duration: Duration },
    PublishStart { id: Uuid, path: String },
    PublishStop { id: Uuid, path: String, duration: Duration },
    PlayStart { id: Uuid, path: String },
    PlayStop { id: Uuid, path: String, duration: Duration },
}

impl RtmpEvent {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Disconnection { .. } => "disconnection",
            Self::PublishStart { .. } => "publish_start",
            Self::PublishStop { .. } => "publish_stop",
            Self::PlayStart { .. } => "play_start",
            Self::PlayStop { .. } => "play_stop",
        }
    }
}

#[derive(Default)]
struct SequenceHeaders {
    metadata: Option<MediaFrame>,
    video: Option<MediaFrame>,
    audio: Option<MediaFrame>,
}

struct LiveStream {
    media: broadcast::Sender<MediaFrame>,
    active: ActiveStream,
    headers: Mutex<SequenceHeaders>,
    is_encoder: bool,
}

pub struct StreamRegistry {
    streams: DashMap<String, LiveStream>,
    events: broadcast::Sender<RtmpEvent>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            streams: DashMap::new(),
            events,
        }
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RtmpEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: RtmpEvent) {
        metrics::RTMP_EVENTS_TOTAL
            .with_label_values(&[event.label()])
            .inc();
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    /// Register a publisher for `key_hash`. A second concurrent
    /// publisher for the same stream is rejected.
    pub fn begin_publish(
        &self,
        key_hash: &str,
        session_id: Uuid,
        is_encoder: bool,
    ) -> StreamResult<PublisherHandle> {
        use dashmap::mapref::entry::Entry;
        match self.streams.entry(key_hash.to_string()) {
            Entry::Occupied(_) => Err(StreamError::Protocol(format!(
                "stream '{key_hash}' already has a publisher"
            ))),
            Entry::Vacant(slot) => {
                let (media, _) = broadcast::channel(MEDIA_CHANNEL_CAPACITY);
                let sender = media.clone();
                slot.insert(LiveStream {
                    media,
                    active: ActiveStream {
                        stream_key_hash: key_hash.to_string(),
                        session_id,
                        started_at: Utc::now(),
                    },
                    headers: Mutex::new(SequenceHeaders::default()),
                    is_encoder,
                });
                Ok(PublisherHandle {
                    key_hash: key_hash.to_string(),
                    session_id,
                    sender,
                })
            }
        }
    }

    /// Remove the stream if this session owns it.
    pub fn end_publish(&self, key_hash: &str, session_id: Uuid) {
        self.streams
            .remove_if(key_hash, |_, stream| stream.active.session_id == session_id);
    }

    /// Record a media frame: caches sequence headers, fans out to
    /// players.
    pub fn publish_frame(&self, handle: &PublisherHandle, frame: MediaFrame) {
        if let Some(stream) = self.streams.get(&handle.key_hash) {
            if frame.is_sequence_header() {
                let mut headers = stream.headers.lock();
                match frame.kind {
                    MediaKind::Metadata => headers.metadata = Some(frame.clone()),
                    MediaKind::Video => headers.video = Some(frame.clone()),
                    MediaKind::Audio => headers.audio = Some(frame.clone()),
                }
            }
            // Lagging or absent players are not the publisher's problem.
            let _ = stream.media.send(frame);
        }
    }

    /// Subscribe a player: cached headers to replay first, then the
    /// live feed.
    #[must_use]
    pub fn subscribe_media(
        &self,
        key_hash: &str,
    ) -> Option<(Vec<MediaFrame>, broadcast::Receiver<MediaFrame>)> {
        let stream = self.streams.get(key_hash)?;
        let headers = stream.headers.lock();
        let mut replay = Vec::new();
        if let Some(metadata) = &headers.metadata {
            replay.push(metadata.clone());
        }
        if let Some(video) = &headers.video {
            replay.push(video.clone());
        }
        if let Some(audio) = &headers.audio {
            replay.push(audio.clone());
        }
        Some((replay, stream.media.subscribe()))
    }

    #[must_use]
    pub fn is_live(&self, key_hash: &str) -> bool {
        self.streams.contains_key(key_hash)
    }

    #[must_use]
    pub fn active_streams(&self) -> Vec<ActiveStream> {
        self.streams.iter().map(|s| s.active.clone()).collect()
    }

    /// Publishers that are real remote encoders (not the internal
    /// `role=encoder` loopback).
    #[must_use]
    pub fn external_publisher_count(&self) -> usize {
        self.streams.iter().filter(|s| !s.is_encoder).count()
    }
}

/// Capability to feed media into one registered stream.
pub struct PublisherHandle {
    key_hash: String,
    session_id: Uuid,
    sender: broadcast::Sender<MediaFrame>,
}

impl PublisherHandle {
    #[must_use]
    pub fn key_hash(&self) -> &str {
        &self.key_hash
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}
