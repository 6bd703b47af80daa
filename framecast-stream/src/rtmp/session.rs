//! Per-connection RTMP session.
//!
//! State machine: pending on connect, promoted to publisher or player
//! by the corresponding command, torn down on disconnect. Publish
//! validation failures terminate the session at the protocol level —
//! there is no error payload on the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{StreamError, StreamResult};

use super::amf::{self, AmfValue};
use super::auth::PublishAuth;
use super::chunk::{self, csid, msg_type, ChunkDecoder, RtmpMessage};
use super::handshake;
use super::registry::{MediaFrame, MediaKind, PublisherHandle, RtmpEvent, SessionType, StreamRegistry};

const WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Shared collaborators handed to every session.
pub struct SessionContext {
    pub app: String,
    pub auth: Arc<dyn PublishAuth>,
    pub registry: Arc<StreamRegistry>,
}

/// Publish target parsed from the stream name: trailing segment plus
/// the `role=encoder` marker for the internal loopback publisher.
#[must_use]
pub fn parse_stream_target(raw: &str) -> (String, bool) {
    let (segment, query) = match raw.split_once('?') {
        Some((s, q)) => (s, Some(q)),
        None => (raw, None),
    };
    let is_encoder = query.is_some_and(|q| {
        q.split('&').any(|pair| pair == "role=encoder")
    });
    (segment.trim_matches('/').to_string(), is_encoder)
}

pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    started: Instant,
    session_type: SessionType,
    decoder: ChunkDecoder,
    out_chunk_size: usize,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    publisher: Option<PublisherHandle>,
    publish_path: Option<String>,
    play_path: Option<String>,
    play_task: Option<tokio::task::JoinHandle<()>>,
    play_started: Option<Instant>,
    publish_started: Option<Instant>,
}

impl Session {
    /// Run a session to completion on an accepted connection.
    pub async fn run(stream: TcpStream, peer: SocketAddr, ctx: Arc<SessionContext>, token: CancellationToken) {
        let id = Uuid::new_v4();
        let mut stream = stream;
        if let Err(e) = handshake::server_handshake(&mut stream).await {
            debug!(%peer, "handshake failed: {e}");
            return;
        }

        let (mut read_half, write_half) = stream.into_split();
        let mut session = Session {
            id,
            peer,
            ctx,
            started: Instant::now(),
            session_type: SessionType::Pending,
            decoder: ChunkDecoder::new(),
            out_chunk_size: chunk::DEFAULT_CHUNK_SIZE,
            writer: Arc::new(Mutex::new(write_half)),
            publisher: None,
            publish_path: None,
            play_path: None,
            play_task: None,
            play_started: None,
            publish_started: None,
        };

        session.ctx.registry.emit(RtmpEvent::Connection { id });
        info!(session = %id, %peer, "rtmp connection");

        let mut buf = bytes::BytesMut::with_capacity(8 * 1024);
        let outcome: StreamResult<()> = loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(session = %id, "session cancelled by shutdown");
                    break Ok(());
                }
                read = tokio::io::AsyncReadExt::read_buf(&mut read_half, &mut buf) => {
                    match read {
                        Ok(0) => break Ok(()),
                        Ok(_) => {
                            session.decoder.extend(&buf.split());
                            match session.drain_messages().await {
                                Ok(()) => {}
                                Err(e) => break Err(e),
                            }
                        }
                        Err(e) => break Err(StreamError::Io(e)),
                    }
                }
            }
        };

        if let Err(e) = outcome {
            match e {
                StreamError::PublishRejected(reason) => {
                    warn!(session = %id, %peer, %reason, "publish rejected, terminating session");
                }
                other => debug!(session = %id, "session ended: {other}"),
            }
        }
        session.teardown().await;
    }

    async fn drain_messages(&mut self) -> StreamResult<()> {
        while let Some(message) = self.decoder.next_message()? {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: RtmpMessage) -> StreamResult<()> {
        match message.type_id {
            msg_type::SET_CHUNK_SIZE => {
                let mut payload = message.payload;
                if payload.len() >= 4 {
                    let size = payload.get_u32() & 0x7FFF_FFFF;
                    trace!(session = %self.id, size, "peer chunk size");
                    self.decoder.set_chunk_size(size as usize);
                }
                Ok(())
            }
            msg_type::ACK | msg_type::WINDOW_ACK_SIZE | msg_type::USER_CONTROL | msg_type::ABORT | msg_type::SET_PEER_BANDWIDTH => {
                trace!(session = %self.id, type_id = message.type_id, "control message");
                Ok(())
            }
            msg_type::COMMAND_AMF0 => self.handle_command(message).await,
            msg_type::AUDIO => self.handle_media(MediaKind::Audio, message),
            msg_type::VIDEO => self.handle_media(MediaKind::Video, message),
            msg_type::DATA_AMF0 => self.handle_media(MediaKind::Metadata, message),
            other => {
                trace!(session = %self.id, type_id = other, "ignoring message type");
                Ok(())
            }
        }
    }

    fn handle_media(&mut self, kind: MediaKind, message: RtmpMessage) -> StreamResult<()> {
        if self.session_type != SessionType::Publisher {
            trace!(session = %self.id, "media from non-publisher ignored");
            return Ok(());
        }
        if let Some(handle) = &self.publisher {
            self.ctx.registry.publish_frame(
                handle,
                MediaFrame {
                    kind,
                    timestamp: message.timestamp,
                    payload: message.payload,
                },
            );
        }
        Ok(())
    }

    async fn handle_command(&mut self, message: RtmpMessage) -> StreamResult<()> {
        let mut payload = message.payload.clone();
        let values = amf::decode_all(&mut payload)?;
        let Some(name) = values.first().and_then(AmfValue::as_str) else {
            return Err(StreamError::Protocol("command without a name".to_string()));
        };
        let transaction = values.get(1).and_then(AmfValue::as_number).unwrap_or(0.0);

        match name {
            "connect" => self.on_connect(transaction, values.get(2)).await,
            "createStream" => self.on_create_stream(transaction).await,
            "publish" => self.on_publish(&values).await,
            "play" => self.on_play(&values).await,
            "deleteStream" | "closeStream" => {
                self.stop_publishing().await;
                Ok(())
            }
            // Courtesy commands various encoders send; no reply needed.
            "releaseStream" | "FCPublish" | "FCUnpublish" | "getStreamLength" => Ok(()),
            other => {
                debug!(session = %self.id, command = other, "unhandled command");
                Ok(())
            }
        }
    }

    async fn on_connect(&mut self, transaction: f64, arg: Option<&AmfValue>) -> StreamResult<()> {
        let app = arg
            .and_then(|v| v.object_field("app"))
            .and_then(AmfValue::as_str)
            .unwrap_or_default()
            .trim_matches('/')
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string();

        if app != self.ctx.app {
            return Err(StreamError::Protocol(format!(
                "unknown application '{app}'"
            )));
        }

        self.send_control(msg_type::WINDOW_ACK_SIZE, chunk::window_ack_size_payload(WINDOW_ACK_SIZE))
            .await?;
        self.send_control(
            msg_type::SET_PEER_BANDWIDTH,
            chunk::set_peer_bandwidth_payload(WINDOW_ACK_SIZE, 2),
        )
        .await?;
        self.send_control(
            msg_type::SET_CHUNK_SIZE,
            chunk::set_chunk_size_payload(chunk::SERVER_CHUNK_SIZE as u32),
        )
        .await?;
        self.out_chunk_size = chunk::SERVER_CHUNK_SIZE;

        let response = amf::encode_all(&[
            AmfValue::String("_result".to_string()),
            AmfValue::Number(transaction),
            amf::object(&[
                ("fmsVer", AmfValue::String("FMS/3,0,1,123".to_string())),
                ("capabilities", AmfValue::Number(31.0)),
            ]),
            amf::object(&[
                ("level", AmfValue::String("status".to_string())),
                ("code", AmfValue::String("NetConnection.Connect.Success".to_string())),
                ("description", AmfValue::String("Connection succeeded.".to_string())),
                ("objectEncoding", AmfValue::Number(0.0)),
            ]),
        ]);
        self.send_command(0, response).await
    }

    async fn on_create_stream(&mut self, transaction: f64) -> StreamResult<()> {
        let response = amf::encode_all(&[
            AmfValue::String("_result".to_string()),
            AmfValue::Number(transaction),
            AmfValue::Null,
            AmfValue::Number(1.0),
        ]);
        self.send_command(0, response).await
    }

    async fn on_publish(&mut self, values: &[AmfValue]) -> StreamResult<()> {
        let Some(raw_name) = values.get(3).and_then(AmfValue::as_str) else {
            return Err(StreamError::Protocol("publish without a stream name".to_string()));
        };
        let (segment, is_encoder) = parse_stream_target(raw_name);

        let grant = self
            .ctx
            .auth
            .authorize_publish(&self.ctx.app, &segment, Some(self.peer.ip()))
            .await
            .map_err(StreamError::PublishRejected)?;

        let handle = self
            .ctx
            .registry
            .begin_publish(&grant.key_hash, self.id, is_encoder)?;

        self.session_type = SessionType::Publisher;
        self.publisher = Some(handle);
        self.publish_path = Some(grant.key_hash.clone());
        self.publish_started = Some(Instant::now());
        self.ctx.registry.emit(RtmpEvent::PublishStart {
            id: self.id,
            path: format!("/{}/{}", self.ctx.app, grant.key_hash),
        });
        info!(session = %self.id, stream = %grant.stream_id, user = %grant.user_id, is_encoder, "publish start");

        self.send_status("NetStream.Publish.Start", "Publishing started.").await
    }

    async fn on_play(&mut self, values: &[AmfValue]) -> StreamResult<()> {
        let Some(raw_name) = values.get(3).and_then(AmfValue::as_str) else {
            return Err(StreamError::Protocol("play without a stream name".to_string()));
        };
        let (segment, _) = parse_stream_target(raw_name);

        let key_hash = self
            .ctx
            .auth
            .resolve_play(&self.ctx.app, &segment)
            .await
            .map_err(|e| StreamError::Protocol(format!("play target rejected: {e}")))?;

        let Some((replay, live)) = self.ctx.registry.subscribe_media(&key_hash) else {
            return Err(StreamError::Protocol(format!(
                "stream '{segment}' is not live"
            )));
        };

        self.send_status("NetStream.Play.Start", "Playing.").await?;

        // Replay cached headers, then forward the live feed until the
        // publisher stops or this session ends.
        let writer = self.writer.clone();
        let out_chunk_size = self.out_chunk_size;
        let task = tokio::spawn(async move {
            for frame in replay {
                if write_media(&writer, &frame, out_chunk_size).await.is_err() {
                    return;
                }
            }
            let mut live = live;
            while let Ok(frame) = live.recv().await {
                if write_media(&writer, &frame, out_chunk_size).await.is_err() {
                    return;
                }
            }
        });

        self.session_type = SessionType::Player;
        self.play_task = Some(task);
        self.play_path = Some(key_hash.clone());
        self.play_started = Some(Instant::now());
        self.ctx.registry.emit(RtmpEvent::PlayStart {
            id: self.id,
            path: format!("/{}/{}", self.ctx.app, key_hash),
        });
        Ok(())
    }

    async fn stop_publishing(&mut self) {
        if let Some(handle) = self.publisher.take() {
            self.ctx.registry.end_publish(handle.key_hash(), self.id);
            if let Some(path) = self.publish_path.take() {
                self.ctx.registry.emit(RtmpEvent::PublishStop {
                    id: self.id,
                    path: format!("/{}/{}", self.ctx.app, path),
                    duration: self.publish_started.take().map_or_else(Default::default, |t| t.elapsed()),
                });
            }
        }
    }

    async fn teardown(&mut self) {
        self.stop_publishing().await;
        if let Some(task) = self.play_task.take() {
            task.abort();
        }
        if let Some(path) = self.play_path.take() {
            self.ctx.registry.emit(RtmpEvent::PlayStop {
                id: self.id,
                path: format!("/{}/{}", self.ctx.app, path),
                duration: self.play_started.take().map_or_else(Default::default, |t| t.elapsed()),
            });
        }
        self.ctx.registry.emit(RtmpEvent::Disconnection {
            id: self.id,
            session_type: self.session_type,
            duration: self.started.elapsed(),
        });
        info!(session = %self.id, peer = %self.peer, "rtmp disconnection");
    }

    async fn send_control(&self, type_id: u8, payload: Bytes) -> StreamResult<()> {
        let message = RtmpMessage {
            type_id,
            stream_id: 0,
            timestamp: 0,
            payload,
        };
        let wire = chunk::encode_message(csid::CONTROL, &message, self.out_chunk_size);
        self.writer.lock().await.write_all(&wire).await?;
        Ok(())
    }

    async fn send_command(&self, stream_id: u32, payload: Bytes) -> StreamResult<()> {
        let message = RtmpMessage {
            type_id: msg_type::COMMAND_AMF0,
            stream_id,
            timestamp: 0,
            payload,
        };
        let wire = chunk::encode_message(csid::COMMAND, &message, self.out_chunk_size);
        self.writer.lock().await.write_all(&wire).await?;
        Ok(())
    }

    async fn send_status(&self, code: &str, description: &str) -> StreamResult<()> {
        let payload = amf::encode_all(&[
            AmfValue::String("onStatus".to_string()),
            AmfValue::Number(0.0),
            AmfValue::Null,
            amf::object(&[
                ("level", AmfValue::String("status".to_string())),
                ("code", AmfValue::String(code.to_string())),
                ("description", AmfValue::String(description.to_string())),
            ]),
        ]);
        self.send_command(1, payload).await
    }
}

async fn write_media(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    frame: &MediaFrame,
    out_chunk_size: usize,
) -> std::io::Result<()> {
    let (type_id, chunk_csid) = match frame.kind {
        MediaKind::Audio => (msg_type::AUDIO, csid::AUDIO),
        MediaKind::Video => (msg_type::VIDEO, csid::VIDEO),
        MediaKind::Metadata => (msg_type::DATA_AMF0, csid::DATA),
    };
    let message = RtmpMessage {
        type_id,
        stream_id: 1,
        timestamp: frame.timestamp,
        payload: frame.payload.clone(),
    };
    let wire = chunk::encode_message(chunk_csid, &message, out_chunk_size);
    writer.lock().await.write_all(&wire).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_target_splits_query() {
        let (segment, is_encoder) = parse_stream_target("abc123?role=encoder");
        assert_eq!(segment, "abc123");
        assert!(is_encoder);
    }

    #[test]
    fn stream_target_without_query() {
        let (segment, is_encoder) = parse_stream_target("main-show");
        assert_eq!(segment, "main-show");
        assert!(!is_encoder);
    }

    #[test]
    fn unrelated_query_params_are_not_the_encoder_marker() {
        let (_, is_encoder) = parse_stream_target("abc?foo=bar&role=viewer");
        assert!(!is_encoder);
        let (_, is_encoder) = parse_stream_target("abc?x=1&role=encoder");
        assert!(is_encoder);
    }

    #[test]
    fn leading_slashes_trimmed() {
        let (segment, _) = parse_stream_target("/abc123");
        assert_eq!(segment, "abc123");
    }
}
