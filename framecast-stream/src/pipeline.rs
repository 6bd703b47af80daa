//! Bounded frame pipeline between the render pool and the encoder.
//!
//! Overflow prefers recency: a full queue drops its oldest frame to
//! admit the newest, with the drop counted and logged. Submission never
//! blocks the caller.
//!
//! A pre-allocated buffer pool backs frame normalization; returned
//! shells are recycled one frame interval after their frame was frozen,
//! so a shell is never reclaimed while downstream consumers may still
//! hold its bytes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::warn;

use framecast_core::metrics;
use framecast_render::frame::Frame;
use framecast_render::raster::Raster;

use crate::error::StreamResult;

#[derive(Debug, Clone)]
pub struct FramePipelineConfig {
    pub width: u32,
    pub height: u32,
    pub max_queue_size: usize,
    pub buffer_pool_size: usize,
    /// Target interval between frames; also the buffer recycle delay.
    pub frame_interval: Duration,
}

impl Default for FramePipelineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            max_queue_size: 10,
            buffer_pool_size: 5,
            frame_interval: Duration::from_millis(33),
        }
    }
}

struct BufferPool {
    shells: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    fn new(buffer_size: usize, capacity: usize) -> Self {
        let shells = (0..capacity)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        Self {
            shells: Mutex::new(shells),
            buffer_size,
            capacity,
        }
    }

    fn checkout(&self) -> BytesMut {
        let mut shells = self.shells.lock();
        while let Some(mut shell) = shells.pop() {
            // A shell still referenced downstream cannot reclaim its
            // capacity yet; skip it and let its recycle task retry.
            if shell.try_reclaim(self.buffer_size) {
                self.update_gauge(&shells);
                return shell;
            }
        }
        self.update_gauge(&shells);
        drop(shells);
        BytesMut::with_capacity(self.buffer_size)
    }

    fn put_back(&self, shell: BytesMut) {
        let mut shells = self.shells.lock();
        if shells.len() < self.capacity {
            shells.push(shell);
        }
        self.update_gauge(&shells);
    }

    fn update_gauge(&self, shells: &[BytesMut]) {
        let bytes = shells.iter().map(BytesMut::capacity).sum::<usize>();
        metrics::PIPELINE_POOL_BYTES.set(bytes as i64);
    }

    fn memory_bytes(&self) -> usize {
        self.shells.lock().iter().map(BytesMut::capacity).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub queue_depth: usize,
    pub dropped_frames: u64,
    pub last_process_ms: f64,
    pub pool_bytes: usize,
}

pub struct FramePipeline {
    config: FramePipelineConfig,
    queue: Mutex<VecDeque<Frame>>,
    pool: Arc<BufferPool>,
    dropped: AtomicU64,
    /// f64 milliseconds stored as bits.
    last_process: AtomicU64,
}

impl FramePipeline {
    #[must_use]
    pub fn new(config: FramePipelineConfig) -> Self {
        let buffer_size = config.width as usize * config.height as usize * 4;
        let pool = Arc::new(BufferPool::new(buffer_size, config.buffer_pool_size));
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            pool,
            dropped: AtomicU64::new(0),
            last_process: AtomicU64::new(0),
        }
    }

    /// Submit a rendered frame. Never blocks: a full queue evicts its
    /// oldest frame so the newest is always retained.
    pub fn submit(&self, frame: Frame) -> StreamResult<Frame> {
        let started = Instant::now();
        let normalized = self.normalize(frame)?;

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.max_queue_size {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::FRAMES_DROPPED_TOTAL.with_label_values(&["pipeline"]).inc();
                warn!(dropped = total, "pipeline queue full, dropped oldest frame");
            }
            queue.push_back(normalized.clone());
            metrics::PIPELINE_QUEUE_DEPTH.set(queue.len() as i64);
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.last_process.store(elapsed_ms.to_bits(), Ordering::Relaxed);
        metrics::PIPELINE_LAST_PROCESS_MS.set(elapsed_ms);
        Ok(normalized)
    }

    /// Pop the next frame for the encoder, FIFO.
    pub fn next_frame(&self) -> Option<Frame> {
        let mut queue = self.queue.lock();
        let frame = queue.pop_front();
        metrics::PIPELINE_QUEUE_DEPTH.set(queue.len() as i64);
        frame
    }

    /// Drop all queued frames.
    pub fn clear(&self) {
        self.queue.lock().clear();
        metrics::PIPELINE_QUEUE_DEPTH.set(0);
    }

    pub fn reset_counters(&self) {
        self.dropped.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queue_depth: self.queue.lock().len(),
            dropped_frames: self.dropped.load(Ordering::Relaxed),
            last_process_ms: f64::from_bits(self.last_process.load(Ordering::Relaxed)),
            pool_bytes: self.pool.memory_bytes(),
        }
    }

    /// Normalize to canvas dimensions. Frames already at canvas size
    /// pass through untouched; everything else is scaled to fit and
    /// centered with transparent padding, built in a pooled buffer.
    fn normalize(&self, frame: Frame) -> StreamResult<Frame> {
        let (cw, ch) = (self.config.width, self.config.height);
        if frame.width == cw && frame.height == ch {
            return Ok(frame);
        }

        let src = Raster {
            width: frame.width,
            height: frame.height,
            data: frame.data.to_vec(),
        };
        let scale = f32::min(cw as f32 / frame.width as f32, ch as f32 / frame.height as f32);
        let fit_w = ((frame.width as f32 * scale).round() as u32).clamp(1, cw);
        let fit_h = ((frame.height as f32 * scale).round() as u32).clamp(1, ch);
        let fitted = src.resize(fit_w, fit_h).map_err(crate::error::StreamError::Render)?;

        let mut canvas = Raster::new(cw, ch).map_err(crate::error::StreamError::Render)?;
        canvas.blit_over(
            &fitted,
            i64::from((cw - fit_w) / 2),
            i64::from((ch - fit_h) / 2),
            1.0,
        );

        let mut shell = self.pool.checkout();
        shell.put_slice(&canvas.data);
        let data: Bytes = shell.split().freeze();

        // Give the shell back one frame interval later; by then the
        // frozen bytes are normally out of downstream hands and the
        // capacity can be reclaimed on next checkout.
        let pool = self.pool.clone();
        let delay = self.config.frame_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.put_back(shell);
        });

        Ok(Frame { width: cw, height: ch, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, value: u8) -> Frame {
        Frame {
            width,
            height,
            data: Bytes::from(vec![value; width as usize * height as usize * 4]),
        }
    }

    fn pipeline(max_queue: usize) -> FramePipeline {
        FramePipeline::new(FramePipelineConfig {
            width: 8,
            height: 8,
            max_queue_size: max_queue,
            buffer_pool_size: 2,
            frame_interval: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn matching_frames_pass_through() {
        let pipeline = pipeline(4);
        let submitted = pipeline.submit(frame(8, 8, 7)).expect("submit");
        assert_eq!((submitted.width, submitted.height), (8, 8));
        assert_eq!(submitted.data[0], 7);
    }

    #[tokio::test]
    async fn frames_drain_fifo() {
        let pipeline = pipeline(4);
        pipeline.submit(frame(8, 8, 1)).expect("submit");
        pipeline.submit(frame(8, 8, 2)).expect("submit");

        assert_eq!(pipeline.next_frame().map(|f| f.data[0]), Some(1));
        assert_eq!(pipeline.next_frame().map(|f| f.data[0]), Some(2));
        assert!(pipeline.next_frame().is_none());
    }

    #[tokio::test]
    async fn overflow_keeps_newest_never_blocks() {
        let pipeline = pipeline(3);
        for value in 1..=6 {
            pipeline.submit(frame(8, 8, value)).expect("submit");
        }

        let stats = pipeline.stats();
        assert_eq!(stats.queue_depth, 3);
        assert_eq!(stats.dropped_frames, 3);

        // Oldest were evicted; the newest survive in order.
        assert_eq!(pipeline.next_frame().map(|f| f.data[0]), Some(4));
        assert_eq!(pipeline.next_frame().map(|f| f.data[0]), Some(5));
        assert_eq!(pipeline.next_frame().map(|f| f.data[0]), Some(6));
    }

    #[tokio::test]
    async fn mismatched_frames_normalize_to_canvas() {
        let pipeline = pipeline(4);
        // 4x8 fits at 4x8 inside the 8x8 canvas, centered horizontally.
        let submitted = pipeline.submit(frame(4, 8, 9)).expect("submit");
        assert_eq!((submitted.width, submitted.height), (8, 8));
        // The left column is transparent padding.
        assert_eq!(submitted.data[3], 0);
    }

    #[tokio::test]
    async fn clear_empties_queue() {
        let pipeline = pipeline(4);
        pipeline.submit(frame(8, 8, 1)).expect("submit");
        pipeline.clear();
        assert!(pipeline.next_frame().is_none());
        assert_eq!(pipeline.stats().queue_depth, 0);
    }
}
