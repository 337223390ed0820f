//! Product lookups used to price order lines.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::Sku;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub sku: Sku,
    pub name: String,
    pub price_cents: i64,
}

impl Product {
    pub fn new(sku: impl Into<Sku>, name: impl Into<String>, price_cents: i64) -> Self {
        Self {
            sku: sku.into(),
            name: name.into(),
            price_cents,
        }
    }
}

/// Read access to product data.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get_product(&self, sku: &Sku) -> Result<Option<Product>>;
}

#[async_trait]
impl<T> ProductCatalog for Arc<T>
where
    T: ProductCatalog + ?Sized,
{
    async fn get_product(&self, sku: &Sku) -> Result<Option<Product>> {
        (**self).get_product(sku).await
    }
}

/// In-memory product catalog.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProductCatalog {
    products: Arc<RwLock<HashMap<Sku, Product>>>,
}

impl InMemoryProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a product.
    pub async fn insert(&self, product: Product) {
        self.products
            .write()
            .await
            .insert(product.sku.clone(), product);
    }

    pub async fn len(&self) -> usize {
        self.products.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.products.read().await.is_empty()
    }
}

#[async_trait]
impl ProductCatalog for InMemoryProductCatalog {
    async fn get_product(&self, sku: &Sku) -> Result<Option<Product>> {
        Ok(self.products.read().await.get(sku).cloned())
    }
}
