//! Telemetry for usage accounting.
//!
//! The limiter emits a [`LimiterEvent`] at every decision point. Events flow through a
//! [`TelemetrySink`], which is a `tower::Service<LimiterEvent>`, so sinks compose with the
//! usual tower combinators. Emission is best-effort: a slow or failing sink never changes a
//! decision.
//!
//! ```rust
//! use keyquota::telemetry::{LimiterEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(LimiterEvent::ContentionExhausted { key: "api_ab…".into(), attempts: 4 })
//!     .await
//!     .unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

pub mod events;
pub mod sinks;

pub use events::{mask_key, LimiterEvent, StoreOperation};
pub use sinks::{
    emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink, DEFAULT_MEMORY_SINK_CAPACITY,
};
