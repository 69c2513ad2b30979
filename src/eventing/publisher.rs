//! # CloudEvent Delivery Pipeline
//!
//! `EventSink` abstracts "publish one CloudEvent somewhere"; the HTTP sink
//! speaks the structured CloudEvents JSON binding to a broker ingress. The
//! pipeline layers policy on top of a sink:
//!
//! 1. the circuit breaker gates every delivery (open breaker ⇒ straight to
//!    the DLQ),
//! 2. transient failures retry on the jittered schedule, permanent ones
//!    don't,
//! 3. whatever cannot be delivered is wrapped in a dead-letter envelope and
//!    published to the DLQ sink.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::models::DlqPolicy;
use crate::{metrics, OperatorError, Result};

use super::circuit::{BreakerConfig, BreakerRegistry};
use super::dlq::{
    DeadLetterEnvelope, RetrySchedule, REASON_CIRCUIT_BREAKER_OPEN, REASON_PERMANENT_FAILURE,
    REASON_RETRIES_EXHAUSTED,
};
use super::lifecycle::CloudEvent;

/// Somewhere a CloudEvent can be published.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &CloudEvent) -> Result<()>;
    /// Stable identity for breaker bookkeeping and logs.
    fn target(&self) -> &str;
}

/// HTTP CloudEvents binding (structured JSON mode) against a broker
/// ingress.
pub struct HttpEventSink {
    http: reqwest::Client,
    url: String,
}

impl HttpEventSink {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn publish(&self, event: &CloudEvent) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .header("content-type", "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .map_err(|e| OperatorError::BrokerTransient(format!("publish to {}: {e}", self.url)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::TOO_MANY_REQUESTS => Err(OperatorError::QueueOverflow(format!(
                "broker {} refused publish (queue full)",
                self.url
            ))),
            status if status.is_server_error() => Err(OperatorError::BrokerTransient(format!(
                "broker {} returned {status}",
                self.url
            ))),
            status => Err(OperatorError::ValidationRejected(format!(
                "broker {} rejected event: {status}",
                self.url
            ))),
        }
    }

    fn target(&self) -> &str {
        &self.url
    }
}

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    DeadLettered { attempts: u32, reason: String },
}

pub struct DeliveryPipeline {
    sink: Arc<dyn EventSink>,
    dlq_sink: Arc<dyn EventSink>,
    schedule: RetrySchedule,
    policy: DlqPolicy,
    breakers: BreakerRegistry,
}

impl DeliveryPipeline {
    pub fn new(
        sink: Arc<dyn EventSink>,
        dlq_sink: Arc<dyn EventSink>,
        policy: DlqPolicy,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            sink,
            dlq_sink,
            schedule: RetrySchedule::new(policy.clone()),
            policy,
            breakers: BreakerRegistry::new(breaker_config),
        }
    }

    /// Deliver an event, or dead-letter it. Errors surface only when even
    /// the DLQ publish fails.
    pub async fn deliver(&self, event: CloudEvent) -> Result<DeliveryOutcome> {
        let breaker = self.breakers.for_target(self.sink.target());

        if !breaker.allow() {
            debug!(event_id = %event.id, "circuit open, routing event to DLQ");
            return self
                .dead_letter(event, 0, REASON_CIRCUIT_BREAKER_OPEN)
                .await;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.sink.publish(&event).await {
                Ok(()) => {
                    breaker.record_success();
                    return Ok(DeliveryOutcome::Delivered { attempts: attempt });
                }
                Err(err) => {
                    breaker.record_failure();
                    metrics::record_error("event-delivery", err.kind());

                    if err.is_permanent() {
                        // Permanent inputs skip the retry loop.
                        warn!(event_id = %event.id, kind = %err.kind(), "permanent delivery failure: {err}");
                        return self.dead_letter(event, attempt, REASON_PERMANENT_FAILURE).await;
                    }
                    if !self.schedule.should_retry(attempt, &err) {
                        warn!(
                            event_id = %event.id,
                            attempts = attempt,
                            "delivery retries exhausted: {err}"
                        );
                        return self.dead_letter(event, attempt, REASON_RETRIES_EXHAUSTED).await;
                    }
                    tokio::time::sleep(self.schedule.delay(attempt)).await;
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        event: CloudEvent,
        attempts: u32,
        reason: &str,
    ) -> Result<DeliveryOutcome> {
        let envelope = DeadLetterEnvelope::new(&self.policy, event, attempts, reason);
        self.dlq_sink.publish(&envelope.to_event()).await?;
        Ok(DeliveryOutcome::DeadLettered {
            attempts,
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory sink with a programmable number of leading failures.
    struct MockSink {
        target: String,
        fail_first: AtomicU32,
        permanent: bool,
        published: Mutex<Vec<CloudEvent>>,
        calls: AtomicU32,
    }

    impl MockSink {
        fn reliable() -> Arc<Self> {
            Arc::new(Self {
                target: "mock".to_string(),
                fail_first: AtomicU32::new(0),
                permanent: false,
                published: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn failing(times: u32, permanent: bool) -> Arc<Self> {
            Arc::new(Self {
                target: "mock".to_string(),
                fail_first: AtomicU32::new(times),
                permanent,
                published: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn published(&self) -> Vec<CloudEvent> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for MockSink {
        async fn publish(&self, event: &CloudEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return if self.permanent {
                    Err(OperatorError::ValidationRejected("bad event".into()))
                } else {
                    Err(OperatorError::BrokerTransient("unreachable".into()))
                };
            }
            self.published.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn target(&self) -> &str {
            &self.target
        }
    }

    /// Policy with zero backoff so retry tests run instantly.
    fn fast_policy() -> DlqPolicy {
        DlqPolicy {
            backoff_base_seconds: 0,
            ..DlqPolicy::default()
        }
    }

    fn event() -> CloudEvent {
        CloudEvent::lifecycle(
            crate::models::EventType::InvokeRequest,
            "default",
            "echo",
            serde_json::json!({}),
        )
    }

    fn pipeline(
        sink: Arc<MockSink>,
        dlq: Arc<MockSink>,
        breaker: BreakerConfig,
    ) -> DeliveryPipeline {
        DeliveryPipeline::new(sink, dlq, fast_policy(), breaker)
    }

    #[tokio::test]
    async fn first_attempt_success_is_one_call() {
        let sink = MockSink::reliable();
        let dlq = MockSink::reliable();
        let pipeline = pipeline(sink.clone(), dlq.clone(), BreakerConfig::default());

        let outcome = pipeline.deliver(event()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
        assert_eq!(sink.calls(), 1);
        assert!(dlq.published().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let sink = MockSink::failing(2, false);
        let dlq = MockSink::reliable();
        let pipeline = pipeline(sink.clone(), dlq.clone(), BreakerConfig::default());

        let outcome = pipeline.deliver(event()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn attempt_five_fails_to_dlq_and_six_never_happens() {
        let sink = MockSink::failing(100, false);
        let dlq = MockSink::reliable();
        // High breaker threshold so retry exhaustion is what we observe.
        let pipeline = pipeline(
            sink.clone(),
            dlq.clone(),
            BreakerConfig {
                failure_threshold: 100,
                reset_timeout: std::time::Duration::from_secs(30),
            },
        );

        let outcome = pipeline.deliver(event()).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                attempts: 5,
                reason: REASON_RETRIES_EXHAUSTED.to_string()
            }
        );
        assert_eq!(sink.calls(), 5, "attempt 6 must not occur");

        let dead = dlq.published();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retrycount, Some(5));
        assert_eq!(dead[0].dlqreason.as_deref(), Some(REASON_RETRIES_EXHAUSTED));
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_on_first_attempt() {
        let sink = MockSink::failing(100, true);
        let dlq = MockSink::reliable();
        let pipeline = pipeline(sink.clone(), dlq.clone(), BreakerConfig::default());

        let outcome = pipeline.deliver(event()).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                attempts: 1,
                reason: REASON_PERMANENT_FAILURE.to_string()
            }
        );
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn open_breaker_routes_directly_to_dlq() {
        let sink = MockSink::failing(100, false);
        let dlq = MockSink::reliable();
        let pipeline = pipeline(sink.clone(), dlq.clone(), BreakerConfig::default());

        // One delivery burns 5 transient attempts; threshold 5 opens the
        // breaker.
        let _ = pipeline.deliver(event()).await.unwrap();
        let calls_after_first = sink.calls();

        let outcome = pipeline.deliver(event()).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                attempts: 0,
                reason: REASON_CIRCUIT_BREAKER_OPEN.to_string()
            }
        );
        assert_eq!(sink.calls(), calls_after_first, "no publish while open");

        let dead = dlq.published();
        assert_eq!(
            dead.last().unwrap().dlqreason.as_deref(),
            Some(REASON_CIRCUIT_BREAKER_OPEN)
        );
    }

    #[tokio::test]
    async fn half_open_probe_recovers_the_pipeline() {
        let sink = MockSink::failing(5, false);
        let dlq = MockSink::reliable();
        let pipeline = pipeline(
            sink.clone(),
            dlq.clone(),
            BreakerConfig {
                failure_threshold: 5,
                reset_timeout: std::time::Duration::ZERO,
            },
        );

        // First delivery burns the 5 failures, dead-letters, and opens the
        // breaker.
        let _ = pipeline.deliver(event()).await.unwrap();

        // Reset timeout zero: next delivery is the half-open probe, and the
        // sink has recovered.
        let outcome = pipeline.deliver(event()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
    }

    #[tokio::test]
    async fn dlq_failure_surfaces_as_an_error() {
        let sink = MockSink::failing(100, true);
        let dlq = MockSink::failing(100, true);
        let pipeline = pipeline(sink, dlq, BreakerConfig::default());

        let err = pipeline.deliver(event()).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
