//! HTTP route handlers.

use common::Sku;

use crate::error::ApiError;

pub mod health;
pub mod inventory;
pub mod metrics;
pub mod orders;
pub mod payments;

/// Trims a SKU from a path or body; blank SKUs are rejected.
pub(crate) fn parse_sku(raw: &str) -> Result<Sku, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("sku must not be empty".into()));
    }
    Ok(Sku::from(trimmed))
}
