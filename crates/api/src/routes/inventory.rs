//! Product registration and stock endpoints.
//!
//! Writes go through the bus to the shard owning the SKU and are answered
//! with `202 Accepted` plus the position they were logged at. Reads ask the
//! owning shard directly.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{InventoryAdjustment, Sku};
use event_bus::Delivery;
use orders::Product;
use serde::{Deserialize, Serialize};

use super::parse_sku;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateProductRequest {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    #[serde(default)]
    pub initial_quantity: i64,
}

#[derive(Deserialize)]
pub struct AdjustStockRequest {
    pub delta: i64,
    pub reason: String,
}

#[derive(Serialize)]
pub struct StockResponse {
    pub sku: String,
    pub quantity: i64,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub sku: String,
    pub partition: u32,
    pub offset: u64,
}

impl AcceptedResponse {
    fn new(sku: &Sku, delivery: Delivery) -> Self {
        Self {
            sku: sku.to_string(),
            partition: delivery.partition,
            offset: delivery.offset.as_u64(),
        }
    }
}

/// POST /products: register a product and its initial stock.
///
/// Stock for a SKU that already exists is left untouched.
#[tracing::instrument(skip_all, fields(sku = %req.sku))]
pub async fn create_product(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let sku = parse_sku(&req.sku)?;
    if req.price_cents < 0 {
        return Err(ApiError::BadRequest("price_cents must not be negative".into()));
    }

    state
        .catalog
        .insert(Product::new(sku.clone(), req.name, req.price_cents))
        .await;
    let delivery = state
        .ledger
        .initialize(sku.clone(), req.initial_quantity)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::new(&sku, delivery)),
    ))
}

/// GET /inventory: stock for every known SKU, sorted by SKU.
#[tracing::instrument(skip_all)]
pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<StockResponse>>, ApiError> {
    let levels = state.ledger.stock_levels().await?;
    Ok(Json(
        levels
            .into_iter()
            .map(|(sku, quantity)| StockResponse {
                sku: sku.to_string(),
                quantity,
            })
            .collect(),
    ))
}

/// GET /inventory/{sku}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(sku): Path<String>,
) -> Result<Json<StockResponse>, ApiError> {
    let sku = parse_sku(&sku)?;
    let quantity = state
        .ledger
        .stock(&sku)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("SKU {sku} not found")))?;

    Ok(Json(StockResponse {
        sku: sku.to_string(),
        quantity,
    }))
}

/// POST /inventory/{sku}/adjust: manual stock correction, clamped at zero.
#[tracing::instrument(skip(state, req), fields(delta = req.delta))]
pub async fn adjust(
    State(state): State<Arc<AppState>>,
    Path(sku): Path<String>,
    Json(req): Json<AdjustStockRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let sku = parse_sku(&sku)?;
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason is required".into()));
    }

    let delivery = state
        .ledger
        .adjust(InventoryAdjustment::manual(sku.clone(), req.delta, req.reason))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::new(&sku, delivery)),
    ))
}
