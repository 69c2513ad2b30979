//! # Event Wiring, Retry Policy and Delivery
//!
//! - [`renderer`]: materializes broker / trigger / DLQ / api-source /
//!   service descriptors from the embedded template pack
//! - [`dlq`]: the retry schedule (exponential backoff with jitter) and the
//!   dead-letter envelope
//! - [`circuit`]: the per-target circuit breaker
//! - [`publisher`]: the CloudEvent delivery pipeline tying the three
//!   together
//! - [`lifecycle`]: the operator's own lifecycle events

pub mod circuit;
pub mod dlq;
pub mod lifecycle;
pub mod publisher;
pub mod renderer;

pub use circuit::{BreakerConfig, BreakerState, CircuitBreaker};
pub use dlq::{DeadLetterEnvelope, RetrySchedule};
pub use lifecycle::{CloudEvent, LifecycleEmitter};
pub use publisher::{DeliveryOutcome, DeliveryPipeline, EventSink, HttpEventSink};
pub use renderer::TopologyRenderer;
