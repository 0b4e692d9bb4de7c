//! Application assembly: reads configuration, builds every component
//! behind its `eventcore` trait, discovers known tenant schemas, and spawns
//! one `Dispatcher` per schema.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use eventcore::config::AppConfig;
use eventcore::traits::{
    AttemptRecorder, DeliveryPlanner, EndpointRegistry, EventStore, HttpDeliveryAdapter,
};
use eventinfra::database::pool::{create_pool, PgPoolConfig};
use eventinfra::database::migrations::run_migrations;
use eventinfra::health::{CompositeHealthChecker, DatabaseHealthCheck, NatsHealthCheck, RedisHealthCheck};
use eventinfra::messaging::nats::{NatsConfig, NatsStreamLog};
use eventinfra::metrics::{MetricsConfig, PrometheusMetrics};
use eventinfra::scheduler::redis_scheduler::{RedisRetryScheduler, RedisSchedulerConfig};
use eventinfra::database::{PgAttemptRecorder, PgEventStore};
use webhookcore::{
    BackoffDeliveryPlanner, CachingSubscriptionMatcher, Dispatcher, EventPublisher,
    HttpAdapterConfig as WebhookHttpAdapterConfig, PgEndpointRegistry, ReqwestHttpDeliveryAdapter,
};

use crate::cli::Args;
use crate::server::Server;

/// Rows of `eventd.tenants`, the bootstrap registry of known schemas. A
/// tenant onboarded after startup is not picked up until the next restart —
/// acceptable for the scale this daemon targets; a hot-reload path would
/// need a notification channel the bootstrap schema doesn't provide.
async fn discover_schemas(pool: &sqlx::PgPool) -> Result<Vec<String>> {
    let rows = sqlx::query_scalar::<_, String>("SELECT schema_name FROM eventd.tenants")
        .fetch_all(pool)
        .await
        .context("failed to enumerate tenant schemas")?;
    Ok(rows)
}

/// Everything the daemon owns for the lifetime of the process: the HTTP
/// API state and one running `Dispatcher` (plus its worker handles) per
/// tenant schema.
pub struct App {
    args: Args,
    api_state: eventapi::AppState,
    dispatchers: Vec<(Arc<Dispatcher>, Vec<JoinHandle<()>>)>,
}

impl App {
    pub async fn build(args: Args) -> Result<Self> {
        args.validate().context("invalid command line arguments")?;

        let config = AppConfig::load().context("failed to load configuration")?;

        let pool = create_pool(&PgPoolConfig {
            url: config.store.url.clone(),
            max_connections: config.store.max_connections,
            min_connections: config.store.min_connections,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
        })
        .await
        .context("failed to connect to the event store")?;

        info!("running database migrations");
        run_migrations(&pool).await.context("failed to run migrations")?;

        let nats_config = NatsConfig::new(config.stream.url.clone());
        let nats_stream_log = NatsStreamLog::connect(nats_config.clone())
            .await
            .context("failed to connect to the stream log")?;
        let stream_log: Arc<dyn eventcore::traits::StreamLog> = Arc::new(nats_stream_log);

        let redis_scheduler = RedisRetryScheduler::new(&RedisSchedulerConfig {
            url: config.scheduler.redis_url.clone(),
            key_prefix: "eventd:retry:".to_string(),
        })
        .context("failed to initialize the retry scheduler")?;
        let retry_scheduler: Arc<dyn eventcore::traits::RetryScheduler> = Arc::new(redis_scheduler);

        let event_store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
        let attempt_recorder: Arc<dyn AttemptRecorder> = Arc::new(PgAttemptRecorder::new(pool.clone()));

        let strict_host_check = config.server.host != "127.0.0.1" && args.env != "dev";
        let registry: Arc<dyn EndpointRegistry> =
            Arc::new(PgEndpointRegistry::new(pool.clone(), strict_host_check));

        let matcher = Arc::new(CachingSubscriptionMatcher::new(registry.clone()));
        let planner: Arc<dyn DeliveryPlanner> = Arc::new(BackoffDeliveryPlanner::new());

        let http_adapter_config = WebhookHttpAdapterConfig {
            max_concurrent_requests: config.http_adapter.max_concurrent_requests,
            pool_max_idle_per_host: config.http_adapter.pool_max_idle_per_host,
            pool_idle_timeout: Duration::from_secs(90),
        };
        let http_adapter: Arc<dyn HttpDeliveryAdapter> =
            Arc::new(ReqwestHttpDeliveryAdapter::new(&http_adapter_config));

        let publisher = Arc::new(EventPublisher::new(event_store.clone(), stream_log.clone()));

        let metrics = Arc::new(PrometheusMetrics::new(MetricsConfig::new("eventd")));

        let redis_client_for_health = redis::Client::open(config.scheduler.redis_url.as_str())
            .context("invalid scheduler.redis_url")?;
        let nats_client_for_health = async_nats::connect(&nats_config.url)
            .await
            .context("failed to connect to NATS for health checks")?;

        let health = Arc::new(CompositeHealthChecker::new(vec![
            Arc::new(DatabaseHealthCheck::new(pool.clone())) as Arc<dyn eventcore::traits::HealthCheck>,
            Arc::new(NatsHealthCheck::new(nats_client_for_health)),
            Arc::new(RedisHealthCheck::new(redis_client_for_health)),
        ]));

        let api_state = eventapi::AppState {
            event_store: event_store.clone(),
            registry: registry.clone(),
            attempt_recorder: attempt_recorder.clone(),
            planner: planner.clone(),
            http_adapter: http_adapter.clone(),
            publisher,
            metrics: metrics.clone(),
            health,
            strict_host_check,
        };

        let schemas = discover_schemas(&pool).await?;
        info!(count = schemas.len(), "discovered tenant schemas");

        let mut dispatchers = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let dispatcher = Arc::new(Dispatcher::new(
                schema.clone(),
                config.dispatcher.clone(),
                event_store.clone(),
                stream_log.clone(),
                matcher.clone(),
                registry.clone(),
                planner.clone(),
                http_adapter.clone(),
                attempt_recorder.clone(),
                retry_scheduler.clone(),
                metrics.clone(),
            ));
            let handles = dispatcher.spawn();
            dispatchers.push((dispatcher, handles));
        }

        Ok(Self { args, api_state, dispatchers })
    }

    pub async fn run(self) -> Result<()> {
        info!(port = self.args.port, "starting server");

        let server = Server::new(self.args.clone(), self.api_state.clone())?;
        let result = server.run().await;

        for (dispatcher, handles) in self.dispatchers {
            dispatcher.shutdown(handles).await;
        }

        result.context("HTTP server error")
    }
}
