//! Publish authorization seam for the RTMP server.
//!
//! Sessions call through this trait so the server never depends on the
//! key store directly; tests inject hand-written fakes.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use framecast_core::stream_key::StreamKeyService;

#[derive(Debug, Clone)]
pub struct PublishGrant {
    /// Registry identity of the broadcast (the key hash, never the key).
    pub key_hash: String,
    pub user_id: String,
    pub stream_id: String,
}

#[async_trait]
pub trait PublishAuth: Send + Sync {
    /// Authorize a publish attempt for the trailing path `segment`
    /// (direct key or alias) from `remote_ip`.
    async fn authorize_publish(
        &self,
        app: &str,
        segment: &str,
        remote_ip: Option<IpAddr>,
    ) -> framecast_core::Result<PublishGrant>;

    /// Resolve a play-path segment to its registry identity. Playback
    /// is not credential-gated; the segment just has to name a stream.
    async fn resolve_play(&self, app: &str, segment: &str) -> framecast_core::Result<String>;
}

/// Stream-key-store-backed authorization.
pub struct StreamKeyAuth {
    service: Arc<StreamKeyService>,
}

impl StreamKeyAuth {
    #[must_use]
    pub fn new(service: Arc<StreamKeyService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl PublishAuth for StreamKeyAuth {
    async fn authorize_publish(
        &self,
        _app: &str,
        segment: &str,
        remote_ip: Option<IpAddr>,
    ) -> framecast_core::Result<PublishGrant> {
        let validated = self.service.validate_publish(segment, remote_ip).await?;
        Ok(PublishGrant {
            key_hash: validated.key_hash,
            user_id: validated.info.user_id,
            stream_id: validated.info.stream_id,
        })
    }

    async fn resolve_play(&self, _app: &str, segment: &str) -> framecast_core::Result<String> {
        self.service.resolve_segment(segment).await
    }
}
