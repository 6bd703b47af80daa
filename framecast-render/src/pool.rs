//! Render worker pool.
//!
//! A dispatcher task owns three FIFO priority queues and an idle-worker
//! set; each worker is an OS thread running its own Compositor. All
//! traffic crosses explicit channels: task submission resolves through
//! a oneshot carrying a typed outcome correlated by task id — errors
//! never cross the pool boundary as panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use framecast_core::layer::Layer;
use framecast_core::metrics;

use crate::compositor::Compositor;
use crate::error::{RenderError, RenderResult};
use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    fn label(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderPoolConfig {
    /// Zero selects 75% of available cores (minimum one).
    pub workers: usize,
    /// Per-worker cache bytes that force a purge after a task.
    pub memory_threshold_bytes: u64,
}

impl Default for RenderPoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            memory_threshold_bytes: 256 * 1024 * 1024,
        }
    }
}

impl RenderPoolConfig {
    fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let cores = std::thread::available_parallelism().map_or(4, usize::from);
        ((cores * 3) / 4).max(1)
    }
}

/// Per-task completion report.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub duration: Duration,
    pub cache_memory_bytes: u64,
    pub layer_errors: usize,
}

struct RenderTask {
    id: Uuid,
    layers: Vec<Layer>,
    dims: (u32, u32),
    priority: TaskPriority,
    responder: oneshot::Sender<Result<(Frame, TaskReport), RenderError>>,
}

enum WorkerMsg {
    /// Worker finished a task and is idle again.
    Idle(usize),
    /// Worker thread is gone; its slot needs a replacement.
    Died(usize),
}

/// Three FIFO tiers; pop always drains the highest non-empty tier.
#[derive(Default)]
struct TierQueues {
    high: std::collections::VecDeque<RenderTask>,
    normal: std::collections::VecDeque<RenderTask>,
    low: std::collections::VecDeque<RenderTask>,
}

impl TierQueues {
    fn push(&mut self, task: RenderTask) {
        match task.priority {
            TaskPriority::High => self.high.push_back(task),
            TaskPriority::Normal => self.normal.push_back(task),
            TaskPriority::Low => self.low.push_back(task),
        }
    }

    fn pop(&mut self) -> Option<RenderTask> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}

pub type CompositorFactory = Arc<dyn Fn() -> Compositor + Send + Sync>;

pub struct RenderPool {
    submit: mpsc::UnboundedSender<RenderTask>,
    workers: usize,
}

impl RenderPool {
    #[must_use]
    pub fn new(config: RenderPoolConfig, factory: CompositorFactory) -> Self {
        let workers = config.effective_workers();
        let (submit, submissions) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher(submissions, factory, workers, config.memory_threshold_bytes));
        info!(workers, "render pool started");
        Self { submit, workers }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Render `layers` at `dims` on the next available worker.
    pub async fn render(
        &self,
        layers: Vec<Layer>,
        dims: (u32, u32),
        priority: TaskPriority,
    ) -> RenderResult<Frame> {
        self.render_with_report(layers, dims, priority)
            .await
            .map(|(frame, _)| frame)
    }

    pub async fn render_with_report(
        &self,
        layers: Vec<Layer>,
        dims: (u32, u32),
        priority: TaskPriority,
    ) -> RenderResult<(Frame, TaskReport)> {
        let id = Uuid::new_v4();
        let (responder, response) = oneshot::channel();
        self.submit
            .send(RenderTask { id, layers, dims, priority, responder })
            .map_err(|_| RenderError::WorkerGone("render pool is shut down".to_string()))?;

        match response.await {
            Ok(outcome) => {
                if outcome.is_ok() {
                    metrics::POOL_TASKS_TOTAL
                        .with_label_values(&[priority.label()])
                        .inc();
                }
                outcome
            }
            Err(_) => Err(RenderError::WorkerGone(format!(
                "task {id} was dropped by a dying worker"
            ))),
        }
    }
}

struct WorkerHandle {
    sender: std::sync::mpsc::Sender<RenderTask>,
}

async fn dispatcher(
    mut submissions: mpsc::UnboundedReceiver<RenderTask>,
    factory: CompositorFactory,
    worker_count: usize,
    memory_threshold: u64,
) {
    let (worker_tx, mut worker_rx) = mpsc::unbounded_channel::<WorkerMsg>();

    let mut handles: Vec<WorkerHandle> = (0..worker_count)
        .map(|slot| spawn_worker(slot, factory.clone(), worker_tx.clone(), memory_threshold))
        .collect();
    let mut idle: Vec<usize> = (0..worker_count).collect();
    let mut queues = TierQueues::default();
    let mut open = true;

    loop {
        // Match idle workers with the highest-priority queued work.
        while !queues.is_empty() {
            let Some(slot) = idle.pop() else { break };
            let Some(task) = queues.pop() else {
                idle.push(slot);
                break;
            };
            if let Err(send_err) = handles[slot].sender.send(task) {
                warn!(slot, "worker channel closed, replacing worker");
                handles[slot] = spawn_worker(slot, factory.clone(), worker_tx.clone(), memory_threshold);
                metrics::POOL_WORKERS_REPLACED_TOTAL.inc();
                if let Err(send_err) = handles[slot].sender.send(send_err.0) {
                    // Replacement also unreachable: reject the task.
                    let task = send_err.0;
                    let _ = task.responder.send(Err(RenderError::WorkerGone(format!(
                        "no worker available for task {}",
                        task.id
                    ))));
                }
                // The slot re-idles through the worker's own Idle message.
            }
        }

        if !open && queues.is_empty() {
            break;
        }

        tokio::select! {
            submission = submissions.recv(), if open => {
                match submission {
                    Some(task) => queues.push(task),
                    None => open = false,
                }
            }
            msg = worker_rx.recv() => {
                match msg {
                    Some(WorkerMsg::Idle(slot)) => idle.push(slot),
                    Some(WorkerMsg::Died(slot)) => {
                        error!(slot, "render worker died, spawning replacement");
                        handles[slot] = spawn_worker(slot, factory.clone(), worker_tx.clone(), memory_threshold);
                        metrics::POOL_WORKERS_REPLACED_TOTAL.inc();
                        idle.push(slot);
                    }
                    None => break,
                }
            }
        }
    }
}

fn spawn_worker(
    slot: usize,
    factory: CompositorFactory,
    events: mpsc::UnboundedSender<WorkerMsg>,
    memory_threshold: u64,
) -> WorkerHandle {
    let (sender, tasks) = std::sync::mpsc::channel::<RenderTask>();

    std::thread::Builder::new()
        .name(format!("render-worker-{slot}"))
        .spawn(move || {
            let compositor = factory();
            while let Ok(task) = tasks.recv() {
                let started = Instant::now();
                let task_id = task.id;

                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    run_task(&compositor, &task)
                }));

                match result {
                    Ok(outcome) => {
                        let report_base = started.elapsed();
                        let outcome = outcome.map(|(frame, layer_errors)| {
                            (
                                frame,
                                TaskReport {
                                    task_id,
                                    duration: report_base,
                                    cache_memory_bytes: compositor.cache_memory_bytes(),
                                    layer_errors,
                                },
                            )
                        });
                        // Caller may have gone away; that is fine.
                        let _ = task.responder.send(outcome);

                        // Self-monitor: purge caches past the threshold.
                        if compositor.cache_memory_bytes() > memory_threshold {
                            warn!(slot, "worker cache over threshold, purging");
                            compositor.purge_caches();
                        }
                        if events.send(WorkerMsg::Idle(slot)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        // Reject the in-flight task to its caller, then
                        // die so the dispatcher replaces this worker.
                        let _ = task.responder.send(Err(RenderError::Task(format!(
                            "worker {slot} panicked while rendering task {task_id}"
                        ))));
                        let _ = events.send(WorkerMsg::Died(slot));
                        return;
                    }
                }
            }
        })
        .map_err(|e| error!(slot, "failed to spawn worker thread: {e}"))
        .ok();

    WorkerHandle { sender }
}

fn run_task(compositor: &Compositor, task: &RenderTask) -> RenderResult<(Frame, usize)> {
    if compositor.canvas_size() != task.dims {
        return Err(RenderError::Task(format!(
            "task {} dims {:?} do not match worker canvas {:?}",
            task.id,
            task.dims,
            compositor.canvas_size()
        )));
    }
    let (frame, stats) = compositor.composite_with_stats(&task.layers)?;
    Ok((frame, stats.layer_errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::CompositorConfig;
    use crate::text::FixedGlyphSource;

    fn factory(width: u32, height: u32) -> CompositorFactory {
        Arc::new(move || {
            let config = CompositorConfig { width, height, ..CompositorConfig::default() };
            Compositor::new(config, Arc::new(FixedGlyphSource::default())).0
        })
    }

    #[test]
    fn tier_queues_pop_highest_first_fifo_within_tier() {
        let mut queues = TierQueues::default();
        let mk = |priority| {
            let (responder, _rx) = oneshot::channel();
            RenderTask {
                id: Uuid::new_v4(),
                layers: Vec::new(),
                dims: (8, 8),
                priority,
                responder,
            }
        };

        let low = mk(TaskPriority::Low);
        let normal_1 = mk(TaskPriority::Normal);
        let normal_2 = mk(TaskPriority::Normal);
        let high = mk(TaskPriority::High);

        let (low_id, n1_id, n2_id, high_id) = (low.id, normal_1.id, normal_2.id, high.id);
        queues.push(low);
        queues.push(normal_1);
        queues.push(normal_2);
        queues.push(high);

        assert_eq!(queues.pop().map(|t| t.id), Some(high_id));
        assert_eq!(queues.pop().map(|t| t.id), Some(n1_id));
        assert_eq!(queues.pop().map(|t| t.id), Some(n2_id));
        assert_eq!(queues.pop().map(|t| t.id), Some(low_id));
        assert!(queues.pop().is_none());
    }

    #[tokio::test]
    async fn pool_renders_at_canvas_dims() {
        let pool = RenderPool::new(
            RenderPoolConfig { workers: 2, ..RenderPoolConfig::default() },
            factory(16, 16),
        );
        let frame = pool
            .render(Vec::new(), (16, 16), TaskPriority::Normal)
            .await
            .expect("render");
        assert_eq!((frame.width, frame.height), (16, 16));
    }

    #[tokio::test]
    async fn dim_mismatch_is_a_typed_error() {
        let pool = RenderPool::new(
            RenderPoolConfig { workers: 1, ..RenderPoolConfig::default() },
            factory(16, 16),
        );
        let err = pool
            .render(Vec::new(), (32, 32), TaskPriority::Normal)
            .await
            .expect_err("mismatched dims must fail");
        assert!(matches!(err, RenderError::Task(_)));
    }

    #[tokio::test]
    async fn report_carries_task_correlation() {
        let pool = RenderPool::new(
            RenderPoolConfig { workers: 1, ..RenderPoolConfig::default() },
            factory(8, 8),
        );
        let (_, report) = pool
            .render_with_report(Vec::new(), (8, 8), TaskPriority::High)
            .await
            .expect("render");
        assert!(!report.task_id.is_nil());
        assert_eq!(report.layer_errors, 0);
    }

    #[tokio::test]
    async fn pool_survives_task_errors() {
        let pool = RenderPool::new(
            RenderPoolConfig { workers: 1, ..RenderPoolConfig::default() },
            factory(8, 8),
        );
        // A failing task must not wedge the single worker.
        assert!(pool.render(Vec::new(), (9, 9), TaskPriority::Low).await.is_err());
        assert!(pool.render(Vec::new(), (8, 8), TaskPriority::Low).await.is_ok());
    }
}
