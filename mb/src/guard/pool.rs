//! Bounded concurrent request pool
//!
//! Two FIFO admission queues (priority, normal); the priority queue drains
//! strictly before the normal queue when a slot frees. Priority is an
//! admission ordering only - running work is never preempted.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

/// Admission priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolPriority {
    #[default]
    Normal,
    High,
}

/// Throughput retention window in seconds
const BUCKET_RETENTION_SECS: u64 = 10;

struct ActiveRequest {
    #[allow(dead_code)]
    enqueued_at: Instant,
    started_at: Instant,
    #[allow(dead_code)]
    priority: PoolPriority,
}

#[derive(Debug, Default)]
struct RawMetrics {
    total: u64,
    completed: u64,
    total_response_ms: u64,
    total_queue_wait_ms: u64,
    peak_concurrency: usize,
    /// 1-second completion buckets, pruned past the retention window
    buckets: VecDeque<(u64, u32)>,
}

/// Snapshot of pool metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetrics {
    pub total: u64,
    pub completed: u64,
    pub active: usize,
    pub queued: usize,
    pub avg_response_ms: u64,
    pub avg_queue_wait_ms: u64,
    pub peak_concurrency: usize,
    /// Mean completions/sec over the non-empty buckets of the last 10s
    pub throughput_per_second: f64,
}

struct PoolInner {
    active: HashMap<Uuid, ActiveRequest>,
    priority_q: VecDeque<Uuid>,
    normal_q: VecDeque<Uuid>,
    metrics: RawMetrics,
}

impl PoolInner {
    fn queued(&self, id: Uuid) -> bool {
        self.priority_q.contains(&id) || self.normal_q.contains(&id)
    }

    fn next_eligible(&self) -> Option<Uuid> {
        self.priority_q.front().or(self.normal_q.front()).copied()
    }

    fn remove_queued(&mut self, id: Uuid) {
        self.priority_q.retain(|q| *q != id);
        self.normal_q.retain(|q| *q != id);
    }
}

/// Bounded-parallelism pool with priority scheduling
pub struct RequestPool {
    max_concurrent: usize,
    inner: Mutex<PoolInner>,
    notify: Notify,
    epoch: Instant,
}

impl RequestPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            inner: Mutex::new(PoolInner {
                active: HashMap::new(),
                priority_q: VecDeque::new(),
                normal_q: VecDeque::new(),
                metrics: RawMetrics::default(),
            }),
            notify: Notify::new(),
            epoch: Instant::now(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run `work` under a pool slot, waiting in the appropriate FIFO queue
    /// when the pool is full. The slot is released when the future returns,
    /// success or error alike.
    pub async fn submit<F, T>(&self, priority: PoolPriority, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let id = Uuid::now_v7();
        let enqueued_at = Instant::now();

        loop {
            let mut inner = self.inner.lock().await;

            let at_front = match inner.next_eligible() {
                Some(front) => front == id,
                // Queue empty: anyone may take a free slot
                None => true,
            };
            let has_slot = inner.active.len() < self.max_concurrent;

            if has_slot && at_front {
                inner.remove_queued(id);
                let started_at = Instant::now();
                inner.active.insert(
                    id,
                    ActiveRequest {
                        enqueued_at,
                        started_at,
                        priority,
                    },
                );
                let active = inner.active.len();
                inner.metrics.total += 1;
                inner.metrics.peak_concurrency = inner.metrics.peak_concurrency.max(active);
                inner.metrics.total_queue_wait_ms += enqueued_at.elapsed().as_millis() as u64;
                debug!(%id, active, "Pool slot acquired");
                drop(inner);
                // A second slot may still be free for the next queued waiter
                self.notify.notify_waiters();
                break;
            }

            if !inner.queued(id) {
                match priority {
                    PoolPriority::High => inner.priority_q.push_back(id),
                    PoolPriority::Normal => inner.normal_q.push_back(id),
                }
            }

            // Register interest before releasing the lock so a completion
            // between unlock and await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
        }

        let result = work.await;

        let mut inner = self.inner.lock().await;
        if let Some(request) = inner.active.remove(&id) {
            let response_ms = request.started_at.elapsed().as_millis() as u64;
            inner.metrics.completed += 1;
            inner.metrics.total_response_ms += response_ms;

            let sec = self.epoch.elapsed().as_secs();
            match inner.metrics.buckets.back_mut() {
                Some((bucket_sec, count)) if *bucket_sec == sec => *count += 1,
                _ => inner.metrics.buckets.push_back((sec, 1)),
            }
            while inner
                .metrics
                .buckets
                .front()
                .map(|(s, _)| sec.saturating_sub(*s) >= BUCKET_RETENTION_SECS)
                .unwrap_or(false)
            {
                inner.metrics.buckets.pop_front();
            }
        }
        drop(inner);
        self.notify.notify_waiters();

        result
    }

    /// Current metrics snapshot
    pub async fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.lock().await;
        let m = &inner.metrics;

        let throughput = if m.buckets.is_empty() {
            0.0
        } else {
            m.buckets.iter().map(|(_, c)| *c as f64).sum::<f64>() / m.buckets.len() as f64
        };

        PoolMetrics {
            total: m.total,
            completed: m.completed,
            active: inner.active.len(),
            queued: inner.priority_q.len() + inner.normal_q.len(),
            avg_response_ms: if m.completed == 0 { 0 } else { m.total_response_ms / m.completed },
            avg_queue_wait_ms: if m.total == 0 { 0 } else { m.total_queue_wait_ms / m.total },
            peak_concurrency: m.peak_concurrency,
            throughput_per_second: throughput,
        }
    }

    /// Number of currently running requests
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }
}
