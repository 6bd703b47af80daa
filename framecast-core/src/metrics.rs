//! Prometheus metrics for framecast
//!
//! Components never hold prometheus types directly; they push named
//! gauge/counter updates through the statics below. The registry is the
//! metrics sink — there is no scrape endpoint in this crate.

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// --- Frame production ---

/// Total frames rendered by the worker pool.
pub static FRAMES_RENDERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("frames_rendered_total", "Total frames rendered")
        .expect("failed to create frames_rendered_total")
});

/// Frames dropped, labeled by the stage that dropped them.
pub static FRAMES_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("frames_dropped_total", "Frames dropped, by stage"),
        &["stage"],
    )
    .expect("failed to create frames_dropped_total")
});

// --- Pipeline ---

/// Current pipeline queue depth.
pub static PIPELINE_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("pipeline_queue_depth", "Frames queued in the pipeline")
        .expect("failed to create pipeline_queue_depth")
});

/// Duration of the last pipeline processing pass, in milliseconds.
pub static PIPELINE_LAST_PROCESS_MS: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "pipeline_last_process_ms",
        "Last pipeline processing duration in milliseconds",
    )
    .expect("failed to create pipeline_last_process_ms")
});

/// Bytes currently held by the pipeline buffer pool.
pub static PIPELINE_POOL_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("pipeline_pool_bytes", "Buffer pool memory usage in bytes")
        .expect("failed to create pipeline_pool_bytes")
});

// --- Encoder ---

/// Encoder output rate measured over rolling 1s windows.
pub static ENCODER_FPS: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("encoder_fps", "Encoder frames per second")
        .expect("failed to create encoder_fps")
});

/// Total encoder process restarts.
pub static ENCODER_RESTARTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("encoder_restarts_total", "Encoder process restarts")
        .expect("failed to create encoder_restarts_total")
});

// --- RTMP ---

/// Active RTMP connections.
pub static RTMP_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("rtmp_connections_active", "Active RTMP connections")
        .expect("failed to create rtmp_connections_active")
});

/// RTMP lifecycle events, labeled by event kind.
pub static RTMP_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rtmp_events_total", "RTMP lifecycle events by kind"),
        &["event"],
    )
    .expect("failed to create rtmp_events_total")
});

// --- Preview ---

/// Connected preview clients.
pub static PREVIEW_CLIENTS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("preview_clients_active", "Connected preview clients")
        .expect("failed to create preview_clients_active")
});

/// Preview batches flushed to clients.
pub static PREVIEW_BATCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("preview_batches_total", "Preview batches flushed")
        .expect("failed to create preview_batches_total")
});

// --- Worker pool ---

/// Worker pool tasks completed, labeled by priority tier.
pub static POOL_TASKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pool_tasks_total", "Render tasks completed by priority"),
        &["priority"],
    )
    .expect("failed to create pool_tasks_total")
});

/// Workers replaced after a crash.
pub static POOL_WORKERS_REPLACED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pool_workers_replaced_total", "Render workers replaced")
        .expect("failed to create pool_workers_replaced_total")
});

fn register_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(FRAMES_RENDERED_TOTAL.clone()),
        Box::new(FRAMES_DROPPED_TOTAL.clone()),
        Box::new(PIPELINE_QUEUE_DEPTH.clone()),
        Box::new(PIPELINE_LAST_PROCESS_MS.clone()),
        Box::new(PIPELINE_POOL_BYTES.clone()),
        Box::new(ENCODER_FPS.clone()),
        Box::new(ENCODER_RESTARTS_TOTAL.clone()),
        Box::new(RTMP_CONNECTIONS_ACTIVE.clone()),
        Box::new(RTMP_EVENTS_TOTAL.clone()),
        Box::new(PREVIEW_CLIENTS_ACTIVE.clone()),
        Box::new(PREVIEW_BATCHES_TOTAL.clone()),
        Box::new(POOL_TASKS_TOTAL.clone()),
        Box::new(POOL_WORKERS_REPLACED_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            tracing::warn!("failed to register metric: {e}");
        }
    }
}

/// Gather all registered metric families.
#[must_use]
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}
