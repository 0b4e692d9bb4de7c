//! Health checks for the event core's three external dependencies (C11,
//! §4.11): Postgres (Event Store / Attempt Recorder), the JetStream-backed
//! Stream Log, and Redis (Retry Scheduler). Each implements the shared
//! `eventcore::traits::HealthCheck` trait so `CompositeHealthChecker` can
//! aggregate them without knowing their concrete types.

use async_trait::async_trait;
use eventcore::traits::{ComponentStatus, HealthCheck};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// `SELECT 1` against the pool, with a short timeout so a degraded database
/// cannot block the health endpoint indefinitely.
pub struct DatabaseHealthCheck {
    pool: PgPool,
    timeout: Duration,
}

impl DatabaseHealthCheck {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl HealthCheck for DatabaseHealthCheck {
    fn name(&self) -> &'static str {
        "event_store"
    }

    async fn check(&self) -> ComponentStatus {
        let probe = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(_)) => ComponentStatus::Up,
            Ok(Err(_)) => ComponentStatus::Down,
            Err(_) => ComponentStatus::Degraded,
        }
    }
}

/// Pings the JetStream connection's underlying NATS client.
pub struct NatsHealthCheck {
    client: async_nats::Client,
    timeout: Duration,
}

impl NatsHealthCheck {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl HealthCheck for NatsHealthCheck {
    fn name(&self) -> &'static str {
        "stream_log"
    }

    async fn check(&self) -> ComponentStatus {
        match tokio::time::timeout(self.timeout, self.client.flush()).await {
            Ok(Ok(())) => match self.client.connection_state() {
                async_nats::connection::State::Connected => ComponentStatus::Up,
                _ => ComponentStatus::Degraded,
            },
            Ok(Err(_)) => ComponentStatus::Down,
            Err(_) => ComponentStatus::Degraded,
        }
    }
}

/// `PING` against the Redis-backed retry scheduler's connection.
pub struct RedisHealthCheck {
    client: redis::Client,
    timeout: Duration,
}

impl RedisHealthCheck {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl HealthCheck for RedisHealthCheck {
    fn name(&self) -> &'static str {
        "retry_scheduler"
    }

    async fn check(&self) -> ComponentStatus {
        let probe = async {
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|_| ())?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map_err(|_| ())
        };

        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(_)) => ComponentStatus::Up,
            Ok(Err(_)) => ComponentStatus::Down,
            Err(_) => ComponentStatus::Degraded,
        }
    }
}

/// Per-component status and the overall rollup reported on `GET /v1/health`
/// (§4.11): `up` only if every component is `up`; `down` if any is `down`;
/// `degraded` otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub components: Vec<ComponentReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub name: &'static str,
    pub status: ComponentStatus,
}

/// Runs every registered `HealthCheck` concurrently and rolls the results
/// up into a single `HealthStatus`.
pub struct CompositeHealthChecker {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl CompositeHealthChecker {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self { checks }
    }

    pub async fn check_all(&self) -> HealthStatus {
        let reports: Vec<ComponentReport> = futures::future::join_all(self.checks.iter().map(|check| async move {
            ComponentReport {
                name: check.name(),
                status: check.check().await,
            }
        }))
        .await;

        let status = if reports.iter().any(|r| r.status == ComponentStatus::Down) {
            "down"
        } else if reports.iter().any(|r| r.status == ComponentStatus::Degraded) {
            "degraded"
        } else {
            "up"
        };

        HealthStatus {
            status,
            components: reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHealthCheck {
        name: &'static str,
        status: ComponentStatus,
    }

    #[async_trait]
    impl HealthCheck for FixedHealthCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check(&self) -> ComponentStatus {
            self.status
        }
    }

    #[tokio::test]
    async fn all_up_rolls_up_to_up() {
        let checker = CompositeHealthChecker::new(vec![
            Arc::new(FixedHealthCheck { name: "event_store", status: ComponentStatus::Up }),
            Arc::new(FixedHealthCheck { name: "stream_log", status: ComponentStatus::Up }),
        ]);
        assert_eq!(checker.check_all().await.status, "up");
    }

    #[tokio::test]
    async fn any_down_rolls_up_to_down_even_with_degraded() {
        let checker = CompositeHealthChecker::new(vec![
            Arc::new(FixedHealthCheck { name: "event_store", status: ComponentStatus::Degraded }),
            Arc::new(FixedHealthCheck { name: "stream_log", status: ComponentStatus::Down }),
        ]);
        assert_eq!(checker.check_all().await.status, "down");
    }

    #[tokio::test]
    async fn degraded_without_any_down_rolls_up_to_degraded() {
        let checker = CompositeHealthChecker::new(vec![
            Arc::new(FixedHealthCheck { name: "event_store", status: ComponentStatus::Up }),
            Arc::new(FixedHealthCheck { name: "retry_scheduler", status: ComponentStatus::Degraded }),
        ]);
        assert_eq!(checker.check_all().await.status, "degraded");
    }
}
