//! Query service for the materialized views of the pipeline.
//!
//! Serves keyed lookups of read models built by the materializers, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError, CounterDiscipline};
pub use error::ApiError;
pub use pipeline::Pipeline;
use routes::greeting::Greeter;
use routes::records::RecordQuery;

/// Creates the Axum application router.
///
/// Every `(path, query)` pair mounts a read-only lookup of one view. A
/// `greeter` adds `GET /greeting`, which publishes the greeted name.
pub fn create_app(
    views: impl IntoIterator<Item = (String, RecordQuery)>,
    greeter: Option<Greeter>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    let mut names = Vec::new();
    let mut app = Router::new();
    for (path, query) in views {
        tracing::debug!(%path, view = query.view, id_param = %query.id_param, "mounting view");
        names.push(query.view);
        app = app.merge(
            Router::new()
                .route(&path, get(routes::records::get))
                .with_state(Arc::new(query)),
        );
    }

    if let Some(greeter) = greeter {
        tracing::debug!(topic = %greeter.topic, "mounting greeting");
        app = app.merge(
            Router::new()
                .route("/greeting", get(routes::greeting::get))
                .with_state(Arc::new(greeter)),
        );
    }

    let health_router = Router::new()
        .route("/health", get(routes::health::check))
        .with_state(Arc::<[&'static str]>::from(names));

    app.merge(health_router)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
