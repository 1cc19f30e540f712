//! JSONL sink for `keyquota`. Writes one limiter event per line.
//! Always appends; bring your own path.

use keyquota::response::format_timestamp;
use keyquota::telemetry::{LimiterEvent, TelemetrySink};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<LimiterEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::debug!(path = %path.display(), error = %e, "jsonl write failed");
                return Err(e);
            }
            file.flush().await?;
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

/// Flat JSON object for one event; `kind` matches [`LimiterEvent::kind`].
pub fn event_to_json(event: &LimiterEvent) -> serde_json::Value {
    let kind = event.kind();
    match event {
        LimiterEvent::Allowed { key, increment, current, remaining } => {
            json!({ "kind": kind, "key": key, "increment": increment, "current": current, "remaining": remaining })
        }
        LimiterEvent::Denied { key, reason, current, limit } => {
            json!({ "kind": kind, "key": key, "reason": reason.as_str(), "current": current, "limit": limit })
        }
        LimiterEvent::WindowReset { key, window, reset_at } => {
            json!({ "kind": kind, "key": key, "window": window.as_str(), "reset_at": format_timestamp(*reset_at) })
        }
        LimiterEvent::Contention { key, attempt, delay } => {
            json!({ "kind": kind, "key": key, "attempt": attempt, "delay_ms": delay.as_millis() as u64 })
        }
        LimiterEvent::ContentionExhausted { key, attempts } => {
            json!({ "kind": kind, "key": key, "attempts": attempts })
        }
        LimiterEvent::StoreFailure { key, operation } => {
            json!({ "kind": kind, "key": key, "operation": operation.to_string() })
        }
    }
}
