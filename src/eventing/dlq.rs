//! # Retry Schedule and Dead-Letter Envelope
//!
//! The retry schedule turns a [`DlqPolicy`] into concrete delays:
//! exponential backoff from the base, capped, with ±20% jitter so a broker
//! recovery does not get trampled by a synchronized herd. Classification is
//! by error kind: permanent kinds skip the retry loop entirely and
//! dead-letter on the first failure.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::{sanitize_event_label, DlqPolicy};
use crate::OperatorError;

use super::lifecycle::CloudEvent;

/// Why an event ended up in the DLQ.
pub const REASON_RETRIES_EXHAUSTED: &str = "retries_exhausted";
pub const REASON_PERMANENT_FAILURE: &str = "permanent_failure";
pub const REASON_CIRCUIT_BREAKER_OPEN: &str = "circuit_breaker_open";
pub const REASON_QUEUE_OVERFLOW: &str = "queue_overflow";
pub const REASON_TTL_EXPIRED: &str = "ttl_expired";

/// Jitter fraction applied to every delay.
const JITTER_FRACTION: f64 = 0.2;

/// Concrete delays for a DLQ policy.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: DlqPolicy,
}

impl RetrySchedule {
    pub fn new(policy: DlqPolicy) -> Self {
        Self { policy }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.retry_attempts
    }

    /// Deterministic delay before attempt `attempt` (1-based; the delay
    /// applies between attempt N and N+1).
    pub fn base_delay(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let unscaled =
            self.policy.backoff_base_seconds as f64 * self.policy.backoff_multiplier.powi(exponent as i32);
        let capped = unscaled.min(self.policy.backoff_cap_seconds as f64);
        std::time::Duration::from_secs_f64(capped)
    }

    /// The base delay with ±20% jitter.
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if base == 0.0 {
            return std::time::Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        std::time::Duration::from_secs_f64(base * (1.0 + jitter))
    }

    /// Whether a further attempt is allowed after `attempt` failed with
    /// `error`. Permanent kinds never retry.
    pub fn should_retry(&self, attempt: u32, error: &OperatorError) -> bool {
        !error.is_permanent() && attempt < self.policy.retry_attempts
    }
}

/// The dead-lettered form of an event: the original payload plus routing
/// and failure metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEnvelope {
    pub event: CloudEvent,
    pub retry_count: u32,
    pub reason: String,
    pub routing_key: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    pub fn new(policy: &DlqPolicy, event: CloudEvent, retry_count: u32, reason: &str) -> Self {
        let routing_key = format!(
            "{}.{}",
            policy.routing_prefix(),
            sanitize_event_label(&event.type_)
        );
        Self {
            event,
            retry_count,
            reason: reason.to_string(),
            routing_key,
            failed_at: Utc::now(),
        }
    }

    /// The envelope as a publishable CloudEvent: the original event with
    /// the DLQ extension attributes stamped on.
    pub fn to_event(&self) -> CloudEvent {
        let mut event = self.event.clone();
        event.retrycount = Some(self.retry_count);
        event.dlqreason = Some(self.reason.clone());
        event
    }
}
