use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use srmc_types::CloseCode;

use crate::collaborators::{AuditEvent, AuditSink};
use crate::config::RateLimitConfig;
use crate::registry::{ConnectionContext, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the soft threshold; hold off until the window resets.
    Throttled { retry_after: Duration },
    /// Over the hard threshold; the connection has been terminated.
    Exceeded,
}

/// Per-connection message counts. Owned by the connection loop and dropped
/// with it.
#[derive(Debug, Clone)]
pub struct RateCounter {
    window_start: Instant,
    count: u32,
    hard_window_start: Instant,
    hard_count: u32,
}

impl RateCounter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            window_start: now,
            count: 0,
            hard_window_start: now,
            hard_count: 0,
        }
    }

    pub fn hard_count(&self) -> u32 {
        self.hard_count
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    registry: SessionRegistry,
    audit: Arc<dyn AuditSink>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, registry: SessionRegistry, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            config,
            registry,
            audit,
        }
    }

    /// Count one inbound message and classify it. No side effects.
    pub fn evaluate(&self, counter: &mut RateCounter) -> RateDecision {
        let now = Instant::now();

        if now.duration_since(counter.window_start) >= self.config.window {
            counter.window_start = now;
            counter.count = 0;
        }
        if now.duration_since(counter.hard_window_start) >= self.config.hard_window {
            counter.hard_window_start = now;
            counter.hard_count = 0;
        }

        counter.count = counter.count.saturating_add(1);
        counter.hard_count = counter.hard_count.saturating_add(1);

        if counter.hard_count > self.config.hard_limit {
            return RateDecision::Exceeded;
        }
        if counter.count > self.config.soft_limit {
            let reset = counter.window_start + self.config.window;
            return RateDecision::Throttled {
                retry_after: reset.saturating_duration_since(now),
            };
        }
        RateDecision::Allowed
    }

    /// Count one inbound message on `conn`. On [`RateDecision::Exceeded`]
    /// the connection is terminated here with the rate-exceeded code.
    pub async fn check(&self, conn: &ConnectionContext, counter: &mut RateCounter) -> RateDecision {
        let decision = self.evaluate(counter);
        match decision {
            RateDecision::Allowed => {}
            RateDecision::Throttled { .. } => {
                self.audit.record(AuditEvent::Throttled {
                    connection_id: conn.id,
                    identity: conn.identity.clone(),
                    count: counter.count,
                });
            }
            RateDecision::Exceeded => {
                warn!(
                    "{} ({}) exceeded {} messages per {:?}, closing",
                    conn.identity, conn.id, self.config.hard_limit, self.config.hard_window
                );
                self.audit.record(AuditEvent::RateExceeded {
                    connection_id: conn.id,
                    identity: conn.identity.clone(),
                    count: counter.hard_count,
                });
                self.registry
                    .terminate(conn.id, CloseCode::RateExceeded, "rate limit exceeded")
                    .await;
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullAudit;
    use std::sync::Mutex;

    fn limiter(soft: u32, hard: u32, registry: SessionRegistry, audit: Arc<dyn AuditSink>) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig {
                window: Duration::from_secs(1),
                soft_limit: soft,
                hard_window: Duration::from_secs(10),
                hard_limit: hard,
            },
            registry,
            audit,
        )
    }

    #[derive(Default)]
    struct RecordingAudit(Mutex<Vec<AuditEvent>>);

    impl AuditSink for RecordingAudit {
        fn record(&self, event: AuditEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn soft_limit_throttles_until_window_resets() {
        let limiter = limiter(3, 100, SessionRegistry::new(4), Arc::new(NullAudit));
        let mut counter = RateCounter::new();

        for _ in 0..3 {
            assert_eq!(limiter.evaluate(&mut counter), RateDecision::Allowed);
        }
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            limiter.evaluate(&mut counter),
            RateDecision::Throttled { retry_after: Duration::from_millis(600) }
        );

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(limiter.evaluate(&mut counter), RateDecision::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_window_resets() {
        let limiter = limiter(1000, 5, SessionRegistry::new(4), Arc::new(NullAudit));
        let mut counter = RateCounter::new();
        for _ in 0..5 {
            assert_eq!(limiter.evaluate(&mut counter), RateDecision::Allowed);
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.evaluate(&mut counter), RateDecision::Allowed);
        assert_eq!(counter.hard_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_hard_limit_terminates_connection() {
        let registry = SessionRegistry::new(4);
        let audit = Arc::new(RecordingAudit::default());
        let limiter = limiter(1000, 100, registry.clone(), audit.clone());
        let reg = registry.register("mallory".into(), None, false).await;
        let conn = ConnectionContext {
            id: reg.id,
            identity: "mallory".into(),
            privileged: false,
        };

        let mut counter = RateCounter::new();
        let mut first_exceeded = None;
        for i in 1..=150u32 {
            // 150 messages spread over 10 seconds
            tokio::time::advance(Duration::from_millis(60)).await;
            if limiter.check(&conn, &mut counter).await == RateDecision::Exceeded {
                first_exceeded = Some(i);
                break;
            }
        }

        assert_eq!(first_exceeded, Some(101));
        assert!(reg.cancel.is_cancelled());
        let (code, _) = registry.close_reason(reg.id).await.unwrap();
        assert_eq!(code, CloseCode::RateExceeded);
        assert!(matches!(
            audit.0.lock().unwrap().last(),
            Some(AuditEvent::RateExceeded { count: 101, .. })
        ));
    }
}
