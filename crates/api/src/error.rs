//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use event_bus::BusError;
use inventory::LedgerError;
use orders::OrderError;
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// The resource is not in a state that allows the request.
    Conflict(String),
    /// Saga placement error.
    Saga(SagaError),
    /// Order lookup error.
    Order(OrderError),
    /// Inventory ledger error.
    Ledger(LedgerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Order(err) => order_error_to_response(err),
            ApiError::Ledger(err) => ledger_error_to_response(err),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::InvalidOrder(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        SagaError::OrderNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        _ if err.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn order_error_to_response(err: OrderError) -> (StatusCode, String) {
    match &err {
        OrderError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        OrderError::AlreadyExists(_) => (StatusCode::CONFLICT, err.to_string()),
        _ if err.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn ledger_error_to_response(err: LedgerError) -> (StatusCode, String) {
    if err.is_transient() {
        (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        ApiError::Order(err)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

/// Errors that stop the service from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Inventory ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderNumber;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_invalid_order_is_bad_request() {
        let err = ApiError::from(SagaError::InvalidOrder("order has no items".into()));
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_order_is_not_found() {
        let err = ApiError::from(OrderError::NotFound(OrderNumber::from("O1")));
        assert_eq!(status_of(err), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_conflict_is_conflict() {
        let err = ApiError::Conflict("order is PENDING".into());
        assert_eq!(status_of(err), StatusCode::CONFLICT);
    }

    #[test]
    fn test_transient_failures_are_unavailable() {
        assert_eq!(
            status_of(ApiError::from(SagaError::StoreUnavailable("down".into()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(ApiError::from(LedgerError::ShardUnavailable(2))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_permanent_failures_are_internal() {
        let err = ApiError::from(OrderError::InvalidStatus("SHIPPED".into()));
        assert_eq!(status_of(err), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
