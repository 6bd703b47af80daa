//! External encoder supervision.
//!
//! One ffmpeg process per active broadcast: raw RGBA frames in on
//! stdin, FLV out to RTMP. The child's lifecycle is driven by an
//! explicit supervisor task consuming process events; crashes restart
//! the child after a fixed delay up to a bounded retry budget, past
//! which a fatal event is emitted instead.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use framecast_core::metrics;
use framecast_render::frame::Frame;

use crate::error::{StreamError, StreamResult};

/// Hardware encoders probed in preference order before falling back to
/// software x264.
pub const HW_ENCODER_PREFERENCE: [&str; 4] =
    ["h264_nvenc", "h264_qsv", "h264_vaapi", "h264_videotoolbox"];

pub const SOFTWARE_ENCODER: &str = "libx264";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Stopped,
    Starting,
    Streaming,
    Error,
    Restarting,
}

#[derive(Debug, Clone)]
pub enum EncoderEvent {
    Started { encoder: String },
    Exited { status: Option<i32> },
    Restarting { attempt: u32 },
    /// Restart budget exhausted. The orchestrator owns recovery.
    Fatal { restarts: u32 },
}

#[derive(Debug, Clone)]
pub struct StreamEncoderConfig {
    pub ffmpeg_path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Zero selects 2x bitrate.
    pub buffer_kbps: u32,
    pub hardware_acceleration: bool,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub frame_drop_threshold: Duration,
    pub output_urls: Vec<String>,
}

impl Default for StreamEncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 2500,
            buffer_kbps: 0,
            hardware_acceleration: true,
            max_restarts: 3,
            restart_delay: Duration::from_millis(1000),
            frame_drop_threshold: Duration::from_millis(100),
            output_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderStats {
    pub fps: f64,
    pub bitrate_kbps: u32,
    pub restarts: u32,
    pub dropped_frames: u64,
}

pub struct StreamEncoder {
    config: StreamEncoderConfig,
    state: Mutex<EncoderState>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    selected_encoder: Mutex<Option<String>>,
    shutdown: Mutex<CancellationToken>,
    events: mpsc::UnboundedSender<EncoderEvent>,
    restarts: AtomicU32,
    dropped: AtomicU64,
    /// Duration of the previous completed stdin write, in micros.
    last_write_micros: Arc<AtomicU64>,
    fps_window: Arc<Mutex<std::collections::VecDeque<Instant>>>,
}

impl StreamEncoder {
    #[must_use]
    pub fn new(config: StreamEncoderConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<EncoderEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                state: Mutex::new(EncoderState::Stopped),
                stdin: Arc::new(tokio::sync::Mutex::new(None)),
                selected_encoder: Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
                events,
                restarts: AtomicU32::new(0),
                dropped: AtomicU64::new(0),
                last_write_micros: Arc::new(AtomicU64::new(0)),
                fps_window: Arc::new(Mutex::new(std::collections::VecDeque::new())),
            }),
            receiver,
        )
    }

    #[must_use]
    pub fn state(&self) -> EncoderState {
        *self.state.lock()
    }

    #[must_use]
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            fps: self.current_fps(),
            bitrate_kbps: self.config.bitrate_kbps,
            restarts: self.restarts.load(Ordering::Relaxed),
            dropped_frames: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Start the encoder process and its supervisor.
    pub async fn start(self: &Arc<Self>) -> StreamResult<()> {
        {
            let mut state = self.state.lock();
            if *state != EncoderState::Stopped {
                return Err(StreamError::Encoder(format!(
                    "cannot start from state {:?}",
                    *state
                )));
            }
            *state = EncoderState::Starting;
        }
        self.restarts.store(0, Ordering::Relaxed);
        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let encoder = self.select_encoder().await;
        info!(encoder, "starting stream encoder");
        *self.selected_encoder.lock() = Some(encoder.clone());

        let child = self.spawn_child(&encoder).await?;
        *self.state.lock() = EncoderState::Streaming;
        let _ = self.events.send(EncoderEvent::Started { encoder });

        let this = self.clone();
        tokio::spawn(async move { this.supervise(child, token).await });
        Ok(())
    }

    /// Stop the encoder; the supervisor kills the child and settles the
    /// state machine at Stopped.
    pub fn stop(&self) {
        self.shutdown.lock().cancel();
    }

    pub fn reset_counters(&self) {
        self.dropped.store(0, Ordering::Relaxed);
        self.fps_window.lock().clear();
    }

    /// Feed one frame. Never blocks and never buffers more than one
    /// frame ahead: a write still in flight, or a previous write slower
    /// than the drop threshold, discards the frame.
    pub fn send_frame(&self, frame: &Frame) -> StreamResult<()> {
        if self.state() != EncoderState::Streaming {
            self.drop_frame("not_streaming");
            return Ok(());
        }

        let expected = self.config.width as usize * self.config.height as usize * 4;
        if frame.data.len() != expected {
            return Err(StreamError::FrameSize { got: frame.data.len(), expected });
        }

        let last_micros = self.last_write_micros.load(Ordering::Relaxed);
        if Duration::from_micros(last_micros) > self.config.frame_drop_threshold {
            // One drop per slow write; clear so the next frame retries.
            self.last_write_micros.store(0, Ordering::Relaxed);
            self.drop_frame("encoder_latency");
            return Ok(());
        }

        let Ok(mut guard) = self.stdin.clone().try_lock_owned() else {
            // Previous write still in flight.
            self.drop_frame("write_in_flight");
            return Ok(());
        };

        let data = frame.data.clone();
        let started = Instant::now();
        let write_micros = self.last_write_micros.clone();
        let fps_window = self.fps_window.clone();

        tokio::spawn(async move {
            let Some(stdin) = guard.as_mut() else { return };
            if let Err(e) = stdin.write_all(&data).await {
                debug!("encoder stdin write failed (restart pending): {e}");
                return;
            }
            write_micros.store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

            let mut window = fps_window.lock();
            let cutoff = Instant::now() - Duration::from_secs(1);
            window.push_back(Instant::now());
            while window.front().is_some_and(|t| *t < cutoff) {
                window.pop_front();
            }
            metrics::ENCODER_FPS.set(window.len() as f64);
        });
        Ok(())
    }

    fn drop_frame(&self, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::FRAMES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    fn current_fps(&self) -> f64 {
        let mut window = self.fps_window.lock();
        let cutoff = Instant::now() - Duration::from_secs(1);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        window.len() as f64
    }

    /// Probe hardware encoders in preference order; all-fail lands on
    /// software x264.
    async fn select_encoder(&self) -> String {
        if !self.config.hardware_acceleration {
            return SOFTWARE_ENCODER.to_string();
        }
        for candidate in HW_ENCODER_PREFERENCE {
            if self.probe_encoder(candidate).await {
                info!(encoder = candidate, "hardware encoder probe passed");
                return candidate.to_string();
            }
            debug!(encoder = candidate, "hardware encoder probe failed");
        }
        warn!("no hardware encoder available, falling back to software");
        SOFTWARE_ENCODER.to_string()
    }

    /// Tiny throwaway encode; support is signalled by a zero exit with
    /// no "error" in the diagnostic stream.
    async fn probe_encoder(&self, encoder: &str) -> bool {
        let output = Command::new(&self.config.ffmpeg_path)
            .args([
                "-hide_banner",
                "-f",
                "lavfi",
                "-i",
                "testsrc=duration=0.1:size=320x240:rate=30",
                "-c:v",
                encoder,
                "-f",
                "null",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                probe_passed(output.status.success(), &stderr)
            }
            Err(_) => false,
        }
    }

    async fn spawn_child(&self, encoder: &str) -> StreamResult<Child> {
        let args = build_args(&self.config, encoder);
        debug!(?args, "spawning encoder process");

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::Encoder(format!("failed to spawn encoder: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamError::Encoder("encoder stdin unavailable".to_string()))?;
        *self.stdin.lock().await = Some(stdin);
        self.last_write_micros.store(0, Ordering::Relaxed);

        // Diagnostics are logged, never parsed for control decisions.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "encoder::stderr", "{line}");
                }
            });
        }
        Ok(child)
    }

    async fn supervise(self: Arc<Self>, mut child: Child, token: CancellationToken) {
        'run: loop {
            tokio::select! {
                () = token.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    *self.state.lock() = EncoderState::Stopped;
                    *self.stdin.lock().await = None;
                    info!("encoder stopped");
                    return;
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    warn!(?code, "encoder process exited");
                    *self.state.lock() = EncoderState::Error;
                    *self.stdin.lock().await = None;
                    let _ = self.events.send(EncoderEvent::Exited { status: code });
                }
            }

            // Restart phase: bounded attempts; a failed respawn burns
            // an attempt and retries.
            loop {
                let attempt = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                if attempt > self.config.max_restarts {
                    error!(
                        max_restarts = self.config.max_restarts,
                        "encoder exceeded restart budget, giving up"
                    );
                    *self.state.lock() = EncoderState::Stopped;
                    let _ = self.events.send(EncoderEvent::Fatal {
                        restarts: self.config.max_restarts,
                    });
                    return;
                }

                *self.state.lock() = EncoderState::Restarting;
                let _ = self.events.send(EncoderEvent::Restarting { attempt });
                metrics::ENCODER_RESTARTS_TOTAL.inc();
                tokio::time::sleep(self.config.restart_delay).await;

                if token.is_cancelled() {
                    *self.state.lock() = EncoderState::Stopped;
                    return;
                }

                let encoder = self
                    .selected_encoder
                    .lock()
                    .clone()
                    .unwrap_or_else(|| SOFTWARE_ENCODER.to_string());
                match self.spawn_child(&encoder).await {
                    Ok(new_child) => {
                        child = new_child;
                        *self.state.lock() = EncoderState::Streaming;
                        let _ = self.events.send(EncoderEvent::Started { encoder });
                        continue 'run;
                    }
                    Err(e) => warn!("encoder respawn failed: {e}"),
                }
            }
        }
    }

}

/// Probe verdict: zero exit and a diagnostic stream free of "error".
#[must_use]
pub fn probe_passed(exit_success: bool, stderr: &str) -> bool {
    exit_success && !stderr.to_lowercase().contains("error")
}

/// Build the ffmpeg invocation: rawvideo RGBA on stdin, H.264 with
/// zerolatency tuning, FLV out to every configured RTMP URL.
#[must_use]
pub fn build_args(config: &StreamEncoderConfig, encoder: &str) -> Vec<String> {
    let buffer_kbps = if config.buffer_kbps == 0 {
        config.bitrate_kbps * 2
    } else {
        config.buffer_kbps
    };

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", config.width, config.height),
        "-r".into(),
        config.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-an".into(),
        "-c:v".into(),
        encoder.to_string(),
        "-tune".into(),
        "zerolatency".into(),
        "-b:v".into(),
        format!("{}k", config.bitrate_kbps),
        "-maxrate".into(),
        format!("{}k", config.bitrate_kbps),
        "-bufsize".into(),
        format!("{buffer_kbps}k"),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-g".into(),
        (config.fps * 2).to_string(),
    ];
    if encoder == SOFTWARE_ENCODER {
        args.push("-preset".into());
        args.push("veryfast".into());
    }

    match config.output_urls.len() {
        0 | 1 => {
            args.push("-f".into());
            args.push("flv".into());
            args.push(
                config
                    .output_urls
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "pipe:1".to_string()),
            );
        }
        _ => {
            let tee = config
                .output_urls
                .iter()
                .map(|url| format!("[f=flv]{url}"))
                .collect::<Vec<_>>()
                .join("|");
            args.push("-map".into());
            args.push("0:v".into());
            args.push("-f".into());
            args.push("tee".into());
            args.push(tee);
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config(urls: Vec<String>) -> StreamEncoderConfig {
        StreamEncoderConfig {
            width: 64,
            height: 64,
            fps: 30,
            bitrate_kbps: 1000,
            hardware_acceleration: false,
            output_urls: urls,
            ..StreamEncoderConfig::default()
        }
    }

    #[test]
    fn args_describe_raw_rgba_input_and_flv_output() {
        let args = build_args(
            &config(vec!["rtmp://127.0.0.1/live/key".to_string()]),
            SOFTWARE_ENCODER,
        );
        for expected in [
            "rawvideo",
            "rgba",
            "64x64",
            "zerolatency",
            "libx264",
            "1000k",
            "flv",
            "rtmp://127.0.0.1/live/key",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
    }

    #[test]
    fn multiple_outputs_use_the_tee_muxer() {
        let args = build_args(
            &config(vec![
                "rtmp://a/live/k".to_string(),
                "rtmp://b/live/k".to_string(),
            ]),
            SOFTWARE_ENCODER,
        );
        assert!(args.iter().any(|a| a == "tee"));
        assert!(args.iter().any(|a| a == "[f=flv]rtmp://a/live/k|[f=flv]rtmp://b/live/k"));
    }

    #[test]
    fn default_buffer_is_twice_bitrate() {
        let args = build_args(&config(Vec::new()), SOFTWARE_ENCODER);
        let idx = args.iter().position(|a| a == "-bufsize").expect("bufsize flag");
        assert_eq!(args[idx + 1], "2000k");
    }

    #[test]
    fn probe_verdict_requires_clean_stderr_and_zero_exit() {
        assert!(probe_passed(true, ""));
        assert!(probe_passed(true, "frame=3 fps=30"));
        assert!(!probe_passed(true, "Error initializing device"));
        assert!(!probe_passed(false, ""));
    }

    #[tokio::test]
    async fn frames_dropped_while_stopped() {
        let (encoder, _events) = StreamEncoder::new(config(Vec::new()));
        let frame = Frame {
            width: 64,
            height: 64,
            data: Bytes::from(vec![0u8; 64 * 64 * 4]),
        };
        assert_eq!(encoder.state(), EncoderState::Stopped);
        encoder.send_frame(&frame).expect("drop, not error");
        assert_eq!(encoder.stats().dropped_frames, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashing_process_exhausts_restart_budget_then_fatal() {
        // `false` exits 1 immediately, driving the supervisor through
        // its whole restart budget.
        let cfg = StreamEncoderConfig {
            ffmpeg_path: "false".to_string(),
            max_restarts: 2,
            restart_delay: Duration::from_millis(10),
            ..config(Vec::new())
        };
        let (encoder, mut events) = StreamEncoder::new(cfg);
        encoder.start().await.expect("spawn succeeds");

        let mut restarting_seen = 0u32;
        let fatal = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(EncoderEvent::Restarting { .. }) => restarting_seen += 1,
                    Some(EncoderEvent::Fatal { restarts }) => break restarts,
                    Some(_) => {}
                    None => panic!("event channel closed before fatal"),
                }
            }
        })
        .await
        .expect("fatal within deadline");

        assert_eq!(fatal, 2);
        assert_eq!(restarting_seen, 2);
        assert_eq!(encoder.state(), EncoderState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_settles_at_stopped_without_restarts() {
        use std::os::unix::fs::PermissionsExt;

        // A stub that swallows its args and blocks on stdin until killed.
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-encoder.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\n").expect("write stub");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");

        let cfg = StreamEncoderConfig {
            ffmpeg_path: script.to_string_lossy().into_owned(),
            restart_delay: Duration::from_millis(10),
            ..config(Vec::new())
        };
        let (encoder, mut events) = StreamEncoder::new(cfg);
        encoder.start().await.expect("spawn succeeds");
        assert!(matches!(events.recv().await, Some(EncoderEvent::Started { .. })));

        encoder.stop();
        tokio::time::timeout(Duration::from_secs(5), async {
            while encoder.state() != EncoderState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stopped within deadline");
        assert_eq!(encoder.stats().restarts, 0);
    }
}
