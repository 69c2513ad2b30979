//! # Circuit Breaker
//!
//! A three-state breaker sits above the retry loop: after N consecutive
//! failures it opens and publishes route straight to the DLQ; after the
//! reset timeout it half-opens and admits exactly one probe. The probe's
//! outcome decides between closing again and re-opening.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Breaker for a single publish target.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock().unwrap() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Whether a publish may proceed right now. An open breaker whose reset
    /// timeout has elapsed transitions to half-open and admits one probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match *inner {
            Inner::Closed { .. } => true,
            Inner::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    *inner = Inner::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!("circuit breaker half-open, admitting one probe");
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen {
                ref mut probe_in_flight,
            } => {
                if *probe_in_flight {
                    false
                } else {
                    *probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(*inner, Inner::HalfOpen { .. } | Inner::Open { .. }) {
            info!("circuit breaker closed after successful probe");
        }
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        failures,
                        "circuit breaker opened after consecutive failures"
                    );
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!("circuit breaker probe failed, re-opening");
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }
}

/// Per-target breaker registry.
#[derive(Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn for_target(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            reset_timeout: reset,
        })
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let breaker = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let breaker = breaker(Duration::ZERO);
        for _ in 0..5 {
            breaker.record_failure();
        }
        // Reset timeout of zero: the next allow() half-opens immediately.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // The probe is in flight; nothing else gets through.
        assert!(!breaker.allow());
    }

    #[test]
    fn probe_success_closes_and_probe_failure_reopens() {
        let breaker = breaker(Duration::ZERO);
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn registry_hands_out_one_breaker_per_target() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.for_target("broker-a");
        let b = registry.for_target("broker-a");
        let c = registry.for_target("broker-b");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
