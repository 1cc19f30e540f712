use super::events::LimiterEvent;
use futures::future::{ready, Ready};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};

/// Events kept by [`MemorySink::new`].
pub const DEFAULT_MEMORY_SINK_CAPACITY: usize = 4096;

/// Destination for [`LimiterEvent`]s.
///
/// Any cloneable `tower::Service<LimiterEvent, Response = ()>` qualifies once it names its error
/// type, so buffering, filtering or fan-out come from ordinary tower layers.
pub trait TelemetrySink:
    Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` if the sink becomes ready; failures are traced and dropped.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    let kind = event.kind();
    let delivered = match sink.ready_oneshot().await {
        Ok(mut ready_sink) => ready_sink.call(event).await,
        Err(e) => Err(e),
    };
    if let Err(e) = delivered {
        tracing::trace!(kind, error = %e, "telemetry event dropped");
    }
}

/// Discards every event. The limiter's default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event to `tracing`. Exhausted contention and store failures log at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match event {
            LimiterEvent::ContentionExhausted { .. } | LimiterEvent::StoreFailure { .. } => {
                tracing::warn!(kind = event.kind(), key = event.key(), %event, "limiter_event")
            }
            _ => tracing::info!(kind = event.kind(), key = event.key(), %event, "limiter_event"),
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory; once full, each new event pushes out the oldest.
/// Clones share the buffer.
#[derive(Clone, Debug)]
pub struct MemorySink {
    ring: Arc<Mutex<VecDeque<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_SINK_CAPACITY)
    }

    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn ring(&self) -> MutexGuard<'_, VecDeque<LimiterEvent>> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot, oldest first.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.ring().iter().cloned().collect()
    }

    /// Snapshot of one [`LimiterEvent::kind`], e.g. `"contention"`.
    pub fn events_of(&self, kind: &str) -> Vec<LimiterEvent> {
        self.ring().iter().filter(|e| e.kind() == kind).cloned().collect()
    }

    pub fn clear(&self) {
        self.ring().clear();
    }

    pub fn len(&self) -> usize {
        self.ring().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events pushed out to make room.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn record(&self, event: LimiterEvent) {
        let mut ring = self.ring();
        while ring.len() >= self.capacity {
            ring.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(event);
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        self.record(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
