use crate::models::{
    Category, EntityKind, Product, ProductCategoryLink, ProductRecord, Review, SimilarLink,
};
use crate::sink::{Batch, Sink};
use crate::stats::IngestStats;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Rows of a single entity kind handed to [`BatchWriter::submit_rows`]
#[derive(Debug, Clone)]
pub enum Rows {
    Products(Vec<Product>),
    Reviews(Vec<Review>),
    Categories(Vec<Category>),
    CategoryLinks(Vec<ProductCategoryLink>),
    Similar(Vec<SimilarLink>),
}

impl Rows {
    pub fn kind(&self) -> EntityKind {
        match self {
            Rows::Products(_) => EntityKind::Product,
            Rows::Reviews(_) => EntityKind::Review,
            Rows::Categories(_) => EntityKind::Category,
            Rows::CategoryLinks(_) => EntityKind::ProductCategoryLink,
            Rows::Similar(_) => EntityKind::SimilarLink,
        }
    }

    /// Splits a record into one row set per entity kind.
    pub fn from_record(record: ProductRecord) -> [Rows; 5] {
        [
            Rows::Categories(record.categories),
            Rows::Products(vec![record.product]),
            Rows::Reviews(record.reviews),
            Rows::CategoryLinks(record.category_links),
            Rows::Similar(record.similar),
        ]
    }
}

/// Row counts committed by one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub products: usize,
    pub reviews: usize,
    pub categories: usize,
    pub category_links: usize,
}

/// Buffers assembled records and commits them to the sink in batches.
///
/// Similar-product candidates are not written here; they are held until the
/// main pass is over and handed to the cross-reference resolver.
pub struct BatchWriter<S> {
    sink: S,
    batch_size: usize,
    buffer: Batch,
    similar: Vec<SimilarLink>,
    stats: Arc<IngestStats>,
}

impl<S: Sink> BatchWriter<S> {
    pub fn new(sink: S, batch_size: usize, stats: Arc<IngestStats>) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            buffer: Batch::default(),
            similar: Vec::new(),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn buffered(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::SimilarLink => self.similar.len(),
            kind => self.buffer.len(kind),
        }
    }

    /// Buffers every row of one record; flushes once the product buffer
    /// reaches the batch size. A record never straddles two batches.
    pub async fn submit(&mut self, record: ProductRecord) -> Result<Option<FlushReport>> {
        for rows in Rows::from_record(record) {
            self.buffer_rows(rows);
        }
        self.flush_if_full().await
    }

    pub async fn submit_rows(&mut self, rows: Rows) -> Result<Option<FlushReport>> {
        self.buffer_rows(rows);
        self.flush_if_full().await
    }

    fn buffer_rows(&mut self, rows: Rows) {
        match rows {
            Rows::Products(r) => self.buffer.products.extend(r),
            Rows::Reviews(r) => self.buffer.reviews.extend(r),
            Rows::Categories(r) => self.buffer.categories.extend(r),
            Rows::CategoryLinks(r) => self.buffer.category_links.extend(r),
            // Held for the resolver, never part of a batch.
            Rows::Similar(r) => self.similar.extend(r),
        }
    }

    async fn flush_if_full(&mut self) -> Result<Option<FlushReport>> {
        if self.buffer.products.len() >= self.batch_size {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// Commits every buffered row in a single transaction.
    pub async fn flush(&mut self) -> Result<FlushReport> {
        let report = FlushReport {
            products: self.buffer.products.len(),
            reviews: self.buffer.reviews.len(),
            categories: self.buffer.categories.len(),
            category_links: self.buffer.category_links.len(),
        };

        self.sink
            .write_batch(&self.buffer)
            .await
            .with_context(|| {
                format!(
                    "Failed to write batch of {} products (flush #{})",
                    report.products,
                    self.stats.flushes() + 1
                )
            })?;

        self.buffer = Batch::default();
        self.stats.inc_flushes();
        self.stats.add_written(
            report.products as u64,
            report.reviews as u64,
            report.categories as u64,
            report.category_links as u64,
        );
        debug!(
            flush = self.stats.flushes(),
            products = report.products,
            reviews = report.reviews,
            "Flushed batch"
        );
        Ok(report)
    }

    /// Final unconditional flush. Returns the sink and the similar candidates.
    pub async fn finish(mut self) -> Result<(S, Vec<SimilarLink>)> {
        let report = self.flush().await?;
        info!(
            flushes = self.stats.flushes(),
            final_products = report.products,
            candidates = self.similar.len(),
            "Main pass written"
        );
        Ok((self.sink, self.similar))
    }
}
