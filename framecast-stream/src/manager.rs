//! Stream manager: the orchestrator that owns the frame timer, wires
//! every component together, and is the single point of
//! failure-recovery policy.
//!
//! Start order: RTMP server, encoder, frame timer. Stop reverses it.
//! Encoder-fatal events trigger a bounded component cleanup-and-restart
//! instead of process exit; pipeline and RTMP errors are logged and
//! re-raised to the caller.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use framecast_core::layer::LayerManager;
use framecast_core::metrics;
use framecast_core::stream_key::{GeneratedStreamKey, KeyValueStore, StreamKeyService};
use framecast_core::Config;
use framecast_render::compositor::{Compositor, CompositorConfig};
use framecast_render::pool::{CompositorFactory, RenderPool, RenderPoolConfig, TaskPriority};
use framecast_render::text::{FixedGlyphSource, FontGlyphSource, GlyphSource};

use crate::encoder::{EncoderEvent, EncoderStats, StreamEncoder, StreamEncoderConfig};
use crate::error::{StreamError, StreamResult};
use crate::pipeline::{FramePipeline, FramePipelineConfig, PipelineStats};
use crate::preview::{PreviewConfig, PreviewDistributor};
use crate::rtmp::{RtmpServer, RtmpServerConfig, StreamKeyAuth, StreamRegistry};

/// Bounded orchestrator-level encoder recoveries before going offline.
const MAX_RECOVERIES: u32 = 3;

/// Stream-state snapshot pushed to the state-broadcast sink.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub live: bool,
    pub stream_id: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Collaborator sink for stream-state snapshots.
pub trait StateBroadcast: Send + Sync {
    fn publish_state(&self, state: &StreamState);
}

/// No-op sink for tests and headless runs.
pub struct NullStateBroadcast;

impl StateBroadcast for NullStateBroadcast {
    fn publish_state(&self, _state: &StreamState) {}
}

/// Aggregated metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMetrics {
    pub frame_count: u64,
    pub dropped_frames: u64,
    pub encoder_fps: f64,
    pub encoder_bitrate_kbps: u32,
    pub encoder_restarts: u32,
    pub pipeline_queue_depth: usize,
    pub preview_clients: usize,
    pub active_streams: usize,
}

pub type StreamManagerConfig = Config;

struct Inner {
    config: Config,
    layers: Arc<dyn LayerManager>,
    key_service: Arc<StreamKeyService>,
    generated_key: GeneratedStreamKey,
    registry: Arc<StreamRegistry>,
    pool: Arc<RenderPool>,
    pipeline: Arc<FramePipeline>,
    encoder: Arc<StreamEncoder>,
    preview: Arc<PreviewDistributor>,
    state_sink: Arc<dyn StateBroadcast>,
    running: AtomicBool,
    frame_count: AtomicU64,
    recoveries: AtomicU32,
    timer_token: parking_lot::Mutex<CancellationToken>,
    rtmp_token: parking_lot::Mutex<CancellationToken>,
    started_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

pub struct StreamManager {
    inner: Arc<Inner>,
    recovery_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamManager {
    /// Wire all components. Configuration errors abort here, before any
    /// component is started; the generated stream key is validated
    /// active before use.
    pub async fn initialize(
        config: Config,
        layers: Arc<dyn LayerManager>,
        store: Arc<dyn KeyValueStore>,
        state_sink: Arc<dyn StateBroadcast>,
    ) -> StreamResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(StreamError::Core(framecast_core::Error::Config(
                errors.join("; "),
            )));
        }

        let key_service = Arc::new(StreamKeyService::new(
            store,
            config.stream_key.namespace.clone(),
            config.stream_key.key_ttl_hours,
        ));
        let generated_key = key_service
            .generate("framecast", &uuid::Uuid::new_v4().to_string(), None, None)
            .await?;
        key_service.validate_key(&generated_key.key, None).await?;

        let glyphs: Arc<dyn GlyphSource> = match &config.render.font_path {
            Some(path) => Arc::new(FontGlyphSource::from_path(path)?),
            None => {
                debug!("no font configured, text layers render layout only");
                Arc::new(FixedGlyphSource::default())
            }
        };

        let compositor_config = CompositorConfig {
            width: config.canvas.width,
            height: config.canvas.height,
            ..CompositorConfig::default()
        };
        let factory: CompositorFactory = Arc::new(move || {
            Compositor::new(compositor_config.clone(), glyphs.clone()).0
        });
        let pool = Arc::new(RenderPool::new(
            RenderPoolConfig {
                workers: config.pool.workers,
                memory_threshold_bytes: config.pool.memory_threshold_mb as u64 * 1024 * 1024,
            },
            factory,
        ));

        let pipeline = Arc::new(FramePipeline::new(FramePipelineConfig {
            width: config.canvas.width,
            height: config.canvas.height,
            max_queue_size: config.pipeline.max_queue_size,
            buffer_pool_size: config.pipeline.buffer_pool_size,
            frame_interval: config.frame_interval(),
        }));

        let (encoder, encoder_events) = StreamEncoder::new(StreamEncoderConfig {
            ffmpeg_path: config.encoder.ffmpeg_path.clone(),
            width: config.canvas.width,
            height: config.canvas.height,
            fps: config.canvas.fps,
            bitrate_kbps: config.encoder.bitrate_kbps,
            buffer_kbps: config.encoder.buffer_kbps,
            hardware_acceleration: config.encoder.hardware_acceleration,
            max_restarts: config.encoder.max_restarts,
            restart_delay: std::time::Duration::from_millis(config.encoder.restart_delay_ms),
            frame_drop_threshold: std::time::Duration::from_millis(
                config.encoder.frame_drop_threshold_ms,
            ),
            output_urls: vec![config.encoder_publish_url(&generated_key.key)],
        });

        let preview = Arc::new(PreviewDistributor::new(PreviewConfig {
            batch_window: std::time::Duration::from_millis(config.preview.batch_window_ms),
            batch_max_frames: config.preview.batch_max_frames,
        }));

        let inner = Arc::new(Inner {
            config,
            layers,
            key_service,
            generated_key,
            registry: Arc::new(StreamRegistry::new()),
            pool,
            pipeline,
            encoder,
            preview,
            state_sink,
            running: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
            recoveries: AtomicU32::new(0),
            timer_token: parking_lot::Mutex::new(CancellationToken::new()),
            rtmp_token: parking_lot::Mutex::new(CancellationToken::new()),
            started_at: parking_lot::Mutex::new(None),
        });

        let recovery_inner = inner.clone();
        let recovery_task = tokio::spawn(async move {
            recovery_loop(recovery_inner, encoder_events).await;
        });

        Ok(Self {
            inner,
            recovery_task: parking_lot::Mutex::new(Some(recovery_task)),
        })
    }

    /// RTMP server, encoder, frame timer — in that order. Publishes
    /// live state once everything is up.
    pub async fn start(&self) -> StreamResult<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(StreamError::Encoder("already running".to_string()));
        }

        // 1. RTMP server. Bind failure is fatal and aborts startup.
        let rtmp_token = CancellationToken::new();
        *inner.rtmp_token.lock() = rtmp_token.clone();
        let server = RtmpServer::new(
            RtmpServerConfig {
                address: inner.config.rtmp_address(),
                app: inner.config.rtmp.app.clone(),
                max_connections: inner.config.rtmp.max_connections,
            },
            Arc::new(StreamKeyAuth::new(inner.key_service.clone())),
            inner.registry.clone(),
        );
        let bound = match server.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        tokio::spawn(async move {
            if let Err(e) = bound.run(rtmp_token).await {
                error!("rtmp server error: {e}");
            }
        });

        // 2. Encoder.
        if let Err(e) = inner.encoder.start().await {
            inner.rtmp_token.lock().cancel();
            inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        // 3. Frame timer.
        let timer_token = CancellationToken::new();
        *inner.timer_token.lock() = timer_token.clone();
        tokio::spawn(frame_timer(inner.clone(), timer_token));

        *inner.started_at.lock() = Some(Utc::now());
        inner.state_sink.publish_state(&StreamState {
            live: true,
            stream_id: inner.generated_key.info.stream_id.clone(),
            started_at: *inner.started_at.lock(),
        });
        info!("stream manager started");
        Ok(())
    }

    /// Timer, encoder, RTMP server — the reverse of start. Resets
    /// counters and publishes offline state.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        inner.timer_token.lock().cancel();
        inner.encoder.stop();
        inner.rtmp_token.lock().cancel();

        inner.pipeline.clear();
        inner.pipeline.reset_counters();
        inner.encoder.reset_counters();
        inner.frame_count.store(0, Ordering::Relaxed);
        *inner.started_at.lock() = None;

        inner.state_sink.publish_state(&StreamState {
            live: false,
            stream_id: inner.generated_key.info.stream_id.clone(),
            started_at: None,
        });
        info!("stream manager stopped");
    }

    /// Full teardown: stop everything and release preview clients.
    pub fn cleanup(&self) {
        self.stop();
        self.inner.preview.clear();
        if let Some(task) = self.recovery_task.lock().take() {
            task.abort();
        }
        info!("stream manager cleaned up");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn generated_key(&self) -> &GeneratedStreamKey {
        &self.inner.generated_key
    }

    #[must_use]
    pub fn preview(&self) -> Arc<PreviewDistributor> {
        self.inner.preview.clone()
    }

    #[must_use]
    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.inner.registry.clone()
    }

    #[must_use]
    pub fn key_service(&self) -> Arc<StreamKeyService> {
        self.inner.key_service.clone()
    }

    /// One aggregated snapshot across components.
    #[must_use]
    pub fn metrics_snapshot(&self) -> StreamMetrics {
        let inner = &self.inner;
        let pipeline: PipelineStats = inner.pipeline.stats();
        let encoder: EncoderStats = inner.encoder.stats();
        StreamMetrics {
            frame_count: inner.frame_count.load(Ordering::Relaxed),
            dropped_frames: pipeline.dropped_frames + encoder.dropped_frames,
            encoder_fps: encoder.fps,
            encoder_bitrate_kbps: encoder.bitrate_kbps,
            encoder_restarts: encoder.restarts,
            pipeline_queue_depth: pipeline.queue_depth,
            preview_clients: inner.preview.client_count(),
            active_streams: inner.registry.active_streams().len(),
        }
    }
}

/// Frame production: render via the pool, normalize through the
/// pipeline, feed the encoder, and independently feed the preview
/// distributor with the same frame.
async fn frame_timer(inner: Arc<Inner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.frame_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let dims = (inner.config.canvas.width, inner.config.canvas.height);

    loop {
        tokio::select! {
            () = token.cancelled() => {
                debug!("frame timer cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        let layers = inner.layers.get_all_layers();
        let rendered = match inner.pool.render(layers, dims, TaskPriority::High).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("render tick failed: {e}");
                continue;
            }
        };

        match inner.pipeline.submit(rendered) {
            Ok(normalized) => {
                inner.frame_count.fetch_add(1, Ordering::Relaxed);
                metrics::FRAMES_RENDERED_TOTAL.inc();
                inner.preview.push_frame(&normalized);
            }
            Err(e) => {
                warn!("pipeline submit failed: {e}");
                continue;
            }
        }

        // Drain in FIFO order toward the encoder.
        while let Some(frame) = inner.pipeline.next_frame() {
            if let Err(e) = inner.encoder.send_frame(&frame) {
                warn!("encoder send failed: {e}");
                break;
            }
        }
    }
}

/// Central failure policy: encoder-fatal events trigger a bounded
/// cleanup-and-restart of the encoding chain; everything else is
/// logged.
async fn recovery_loop(
    inner: Arc<Inner>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<EncoderEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            EncoderEvent::Started { encoder } => debug!(encoder, "encoder running"),
            EncoderEvent::Exited { status } => debug!(?status, "encoder exited"),
            EncoderEvent::Restarting { attempt } => debug!(attempt, "encoder restarting"),
            EncoderEvent::Fatal { restarts } => {
                let recoveries = inner.recoveries.fetch_add(1, Ordering::Relaxed) + 1;
                if !inner.running.load(Ordering::SeqCst) {
                    continue;
                }
                if recoveries > MAX_RECOVERIES {
                    error!(
                        restarts,
                        recoveries,
                        "encoder unrecoverable, publishing offline state"
                    );
                    inner.state_sink.publish_state(&StreamState {
                        live: false,
                        stream_id: inner.generated_key.info.stream_id.clone(),
                        started_at: None,
                    });
                    continue;
                }

                warn!(
                    restarts,
                    recoveries, "encoder fatal, performing component restart"
                );
                inner.pipeline.clear();
                if let Err(e) = inner.encoder.start().await {
                    error!("encoder component restart failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecast_core::layer::LayerStore;
    use framecast_core::stream_key::MemoryKeyValueStore;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.rtmp.port = 0; // ephemeral
        config.canvas.width = 64;
        config.canvas.height = 64;
        config.canvas.fps = 10;
        config.encoder.hardware_acceleration = false;
        config.pool.workers = 1;
        config
    }

    async fn manager_with(config: Config) -> StreamResult<StreamManager> {
        StreamManager::initialize(
            config,
            Arc::new(LayerStore::new()),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(NullStateBroadcast),
        )
        .await
    }

    #[tokio::test]
    async fn initialize_generates_an_active_key() {
        let manager = manager_with(test_config()).await.expect("initialize");
        let key = manager.generated_key();
        assert!(key.info.is_active);
        assert!(!key.key.is_empty());
        manager.cleanup();
    }

    #[tokio::test]
    async fn invalid_config_aborts_before_startup() {
        let mut config = test_config();
        config.canvas.fps = 0;
        assert!(manager_with(config).await.is_err());
    }

    #[tokio::test]
    async fn metrics_snapshot_reflects_idle_state() {
        let manager = manager_with(test_config()).await.expect("initialize");
        let snapshot = manager.metrics_snapshot();
        assert_eq!(snapshot.frame_count, 0);
        assert_eq!(snapshot.pipeline_queue_depth, 0);
        assert_eq!(snapshot.preview_clients, 0);
        assert!(!manager.is_running());
        manager.cleanup();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_and_stop_cycle() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-encoder.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\n").expect("write stub");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");

        let mut config = test_config();
        config.encoder.ffmpeg_path = script.to_string_lossy().into_owned();

        let manager = manager_with(config).await.expect("initialize");
        manager.start().await.expect("start");
        assert!(manager.is_running());

        // A second start is rejected while running.
        assert!(manager.start().await.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let snapshot = manager.metrics_snapshot();
        assert!(snapshot.frame_count > 0, "timer must produce frames");

        manager.stop();
        assert!(!manager.is_running());
        let snapshot = manager.metrics_snapshot();
        assert_eq!(snapshot.frame_count, 0, "stop resets counters");
        manager.cleanup();
    }
}
