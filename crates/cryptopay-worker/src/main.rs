use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cryptopay_worker::bootstrap::bootstrap;
use cryptopay_worker::config::ServiceConfig;
use cryptopay_worker::routes;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!(?config, "configuration loaded");

    if config.metrics_token.is_none() && !config.public_metrics {
        tracing::warn!("METRICS_TOKEN not set: /metrics will answer 403");
    }

    let service = match bootstrap(&config).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to start cryptopay worker: {e}");
            std::process::exit(1);
        }
    };

    let state = web::Data::from(service.state.clone());
    let port = config.port;

    tracing::info!("cryptopay worker listening on port {port}");
    tracing::info!("  GET  http://localhost:{port}/health");
    tracing::info!("  GET  http://localhost:{port}/metrics");

    let result = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(routes::health)
            .service(routes::metrics_endpoint)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    service.shutdown();
    tracing::info!("cryptopay worker stopped");
    result
}
