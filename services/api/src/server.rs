use crate::cli::ServeArgs;
use crate::infra::{load_seeds, AppState, InMemoryBackend};
use crate::routes::with_underwriting_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use underwriting::config::AppConfig;
use underwriting::error::AppError;
use underwriting::telemetry;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let seeds = load_seeds(args.history_csv.as_deref())?;
    let seeded = seeds.len();
    let backend = InMemoryBackend::build(config.pipeline.clone(), seeds)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let app = with_underwriting_routes(backend.service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        seeded_histories = seeded,
        provider_timeout_ms = config.pipeline.provider_timeout.as_millis() as u64,
        "underwriting service ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
