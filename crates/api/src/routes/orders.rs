//! Order placement and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{LineItem, OrderNumber};
use orders::{OrderRecord, OrderRepository, OrderStatus};
use saga::PlaceOrderRequest;
use serde::{Deserialize, Serialize};

use super::parse_sku;
use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct PlaceOrderBody {
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub sku: String,
    pub quantity: u32,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderPlacedResponse {
    pub order_number: String,
    pub status: OrderStatus,
}

#[derive(Serialize)]
pub struct OrderResponse {
    pub order_number: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItemResponse>,
    pub total_cents: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: Option<i64>,
}

impl From<OrderRecord> for OrderResponse {
    fn from(order: OrderRecord) -> Self {
        let total_cents = order.total_cents();
        Self {
            order_number: order.order_number.to_string(),
            status: order.status,
            items: order
                .items
                .into_iter()
                .map(|item| OrderItemResponse {
                    sku: item.sku.to_string(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                })
                .collect(),
            total_cents,
            failure_reason: order.failure_reason,
            created_at: order.created_at.to_rfc3339(),
            updated_at: order.updated_at.to_rfc3339(),
        }
    }
}

// -- Handlers --

/// POST /orders: place an order and start its saga.
///
/// Answers `202 Accepted` as soon as the checks are requested; the outcome
/// shows up on `GET /orders/{order_number}`.
#[tracing::instrument(skip_all, fields(items = body.items.len()))]
pub async fn place(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PlaceOrderBody>,
) -> Result<(StatusCode, Json<OrderPlacedResponse>), ApiError> {
    let items = body
        .items
        .into_iter()
        .map(|item| Ok(LineItem::new(parse_sku(&item.sku)?, item.quantity)))
        .collect::<Result<Vec<_>, ApiError>>()?;
    let order_number = state
        .coordinator
        .place_order(PlaceOrderRequest::new(items))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderPlacedResponse {
            order_number: order_number.to_string(),
            status: OrderStatus::Pending,
        }),
    ))
}

/// GET /orders/{order_number}: the order's current status and lines.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = state
        .orders
        .find_by_number(&OrderNumber::new(order_number.as_str()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {order_number} not found")))?;

    Ok(Json(OrderResponse::from(order)))
}
