//! Manual payment settlement.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::OrderNumber;
use orders::{OrderRepository, OrderStatus};
use saga::PaymentOutcome;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct SettlePaymentBody {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentResult {
    Processed,
    Declined,
}

#[derive(Serialize)]
pub struct PaymentResponse {
    pub order_number: String,
    pub result: PaymentResult,
    pub payment_id: Option<String>,
    pub reason: Option<String>,
}

impl PaymentResponse {
    fn new(order_number: &OrderNumber, outcome: PaymentOutcome) -> Self {
        let order_number = order_number.to_string();
        match outcome {
            PaymentOutcome::Processed { payment_id } => Self {
                order_number,
                result: PaymentResult::Processed,
                payment_id: Some(payment_id),
                reason: None,
            },
            PaymentOutcome::Declined { reason } => Self {
                order_number,
                result: PaymentResult::Declined,
                payment_id: None,
                reason: Some(reason),
            },
        }
    }
}

/// POST /payments/{order_number}: approve or decline a validated order's
/// payment.
///
/// Answers `202 Accepted` once the outcome is published; the order status
/// follows asynchronously.
#[tracing::instrument(skip(state, body), fields(approved = body.approved))]
pub async fn settle(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
    Json(body): Json<SettlePaymentBody>,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError> {
    let order_number = OrderNumber::new(order_number.trim());
    let order = state
        .orders
        .find_by_number(&order_number)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {order_number} not found")))?;

    if order.status != OrderStatus::Validated {
        return Err(ApiError::Conflict(format!(
            "Order {order_number} is {} and cannot be paid",
            order.status
        )));
    }

    let reason = body.reason.filter(|r| !r.trim().is_empty());
    let outcome = state
        .payments
        .settle(&order_number, body.approved, reason)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PaymentResponse::new(&order_number, outcome)),
    ))
}
