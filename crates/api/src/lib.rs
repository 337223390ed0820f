//! HTTP API server with observability for the order saga service.
//!
//! Provides REST endpoints for placing orders, reading their status,
//! settling payments and managing stock, with structured logging (tracing)
//! and Prometheus metrics.
//! The saga itself runs in background consumer groups started by
//! [`runtime::Runtime`].

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use runtime::{AppState, Runtime, Stores};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::place))
        .route("/orders/{order_number}", get(routes::orders::get))
        .route("/payments/{order_number}", post(routes::payments::settle))
        .route("/products", post(routes::inventory::create_product))
        .route("/inventory", get(routes::inventory::list))
        .route("/inventory/{sku}", get(routes::inventory::get))
        .route("/inventory/{sku}/adjust", post(routes::inventory::adjust))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
