use super::{Batch, Sink};
use crate::error::SinkError;
use crate::models::{CategoryEdge, Product, Review, SimilarLink};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};

/// In-memory sink with the same conflict rules as the SQL tables.
///
/// Used for dry runs and tests. `fail_on_flush(n)` makes the n-th
/// `write_batch` call (1-based) fail without applying anything.
#[derive(Default)]
pub struct MemorySink {
    pub products: BTreeMap<i64, Product>,
    asins: FxHashMap<String, i64>,
    pub categories: BTreeMap<String, String>,
    pub category_links: BTreeSet<(i64, String)>,
    pub reviews: Vec<Review>,
    pub category_edges: BTreeSet<CategoryEdge>,
    pub similar: BTreeSet<SimilarLink>,
    /// Product count of every `write_batch` call, empty flushes included
    pub flushed_batches: Vec<usize>,
    fail_on_flush: Option<usize>,
    finalized: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on_flush(mut self, call: usize) -> Self {
        self.fail_on_flush = Some(call);
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn insert_product(&mut self, product: &Product) {
        if self.products.contains_key(&product.id) {
            return;
        }
        if let Some(asin) = &product.asin {
            if self.asins.contains_key(asin) {
                return;
            }
            self.asins.insert(asin.clone(), product.id);
        }
        self.products.insert(product.id, product.clone());
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write_batch(&mut self, batch: &Batch) -> Result<(), SinkError> {
        let call = self.flushed_batches.len() + 1;
        if self.fail_on_flush == Some(call) {
            return Err(SinkError::Rejected(format!("injected failure on flush {call}")));
        }
        self.flushed_batches.push(batch.products.len());

        for category in &batch.categories {
            self.categories
                .entry(category.id.clone())
                .or_insert_with(|| category.name.clone());
        }
        for product in &batch.products {
            self.insert_product(product);
        }
        self.reviews.extend(batch.reviews.iter().cloned());
        for link in &batch.category_links {
            self.category_links
                .insert((link.product_id, link.category_id.clone()));
        }
        Ok(())
    }

    async fn existing_products(
        &mut self,
        ids: &[i64],
    ) -> Result<FxHashMap<i64, Option<String>>, SinkError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.products.get(id).map(|p| (*id, p.asin.clone())))
            .collect())
    }

    async fn existing_asins(&mut self, asins: &[String]) -> Result<FxHashSet<String>, SinkError> {
        Ok(asins
            .iter()
            .filter(|a| self.asins.contains_key(*a))
            .cloned()
            .collect())
    }

    async fn insert_similar(&mut self, links: &[SimilarLink]) -> Result<u64, SinkError> {
        let before = self.similar.len();
        self.similar.extend(links.iter().cloned());
        Ok((self.similar.len() - before) as u64)
    }

    async fn insert_category_edges(&mut self, edges: &[CategoryEdge]) -> Result<u64, SinkError> {
        if let Some(edge) = edges.iter().find(|e| e.child_id == e.parent_id) {
            return Err(SinkError::Rejected(format!(
                "category {} cannot be its own parent",
                edge.child_id
            )));
        }
        let before = self.category_edges.len();
        self.category_edges.extend(edges.iter().cloned());
        Ok((self.category_edges.len() - before) as u64)
    }

    async fn finalize(&mut self) -> Result<(), SinkError> {
        self.finalized = true;
        Ok(())
    }
}
