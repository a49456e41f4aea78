//! Transactional destinations for assembled rows.
//!
//! - [`sql::SqlSink`] -- Postgres or SQLite through sqlx's `Any` driver
//! - [`memory::MemorySink`] -- the same upsert semantics held in memory

pub mod memory;
pub mod sql;

use crate::error::SinkError;
use crate::models::{
    Category, CategoryEdge, EntityKind, Product, ProductCategoryLink, Review, SimilarLink,
};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};

pub use memory::MemorySink;
pub use sql::SqlSink;

/// Rows buffered between two flushes, grouped by entity kind
#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub categories: Vec<Category>,
    pub products: Vec<Product>,
    pub reviews: Vec<Review>,
    pub category_links: Vec<ProductCategoryLink>,
}

impl Batch {
    pub fn len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Product => self.products.len(),
            EntityKind::Review => self.reviews.len(),
            EntityKind::Category => self.categories.len(),
            EntityKind::ProductCategoryLink => self.category_links.len(),
            EntityKind::CategoryEdge | EntityKind::SimilarLink => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
            && self.products.is_empty()
            && self.reviews.is_empty()
            && self.category_links.is_empty()
    }
}

/// A relational store that accepts whole batches atomically.
///
/// `write_batch` commits every row of the batch in one transaction or none
/// of them. Conflicts follow upsert rules: products, categories and links
/// are ignored when already present; reviews are always appended.
#[async_trait]
pub trait Sink: Send {
    async fn write_batch(&mut self, batch: &Batch) -> Result<(), SinkError>;

    /// Asin of every listed product id that exists (`None` when stored without one).
    async fn existing_products(
        &mut self,
        ids: &[i64],
    ) -> Result<FxHashMap<i64, Option<String>>, SinkError>;

    async fn existing_asins(&mut self, asins: &[String]) -> Result<FxHashSet<String>, SinkError>;

    /// Inserts links ignoring duplicates; returns rows actually added.
    async fn insert_similar(&mut self, links: &[SimilarLink]) -> Result<u64, SinkError>;

    /// Inserts edges ignoring duplicates; returns rows actually added.
    async fn insert_category_edges(&mut self, edges: &[CategoryEdge]) -> Result<u64, SinkError>;

    /// Runs once after the load completes.
    async fn finalize(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
