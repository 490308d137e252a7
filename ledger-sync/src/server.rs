use crate::cache::CacheStore;
use crate::config::ServerConfig;
use crate::metrics;
use crate::{SERVICE_NAME, VERSION};
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn CacheStore>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    last_processed_id: Option<i64>,
    timestamp: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(prometheus_metrics));
}

/// Serve health and metrics until shutdown is requested
pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let bind_address = format!("{}:{}", config.host, config.port);
    info!("HTTP server listening on {}", bind_address);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure)
    })
    .workers(1)
    .disable_signals()
    .bind(&bind_address)?
    .run();

    let handle = server.handle();
    tokio::spawn(async move {
        cancel.cancelled().await;
        handle.stop(true).await;
    });

    server.await
}

async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let cursor = match state.cache.last_processed_id().await {
        Ok(cursor) => Some(cursor),
        Err(e) => {
            warn!("Health check could not read cache cursor: {}", e);
            None
        }
    };

    let body = HealthResponse {
        status: if cursor.is_some() { "healthy" } else { "degraded" },
        service: SERVICE_NAME,
        version: VERSION,
        last_processed_id: cursor,
        timestamp: Utc::now().to_rfc3339(),
    };

    if cursor.is_some() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn prometheus_metrics() -> impl Responder {
    match metrics::render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().body(e),
    }
}
