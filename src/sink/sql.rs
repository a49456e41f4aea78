use super::{Batch, Sink};
use crate::config::MAX_BIND_PARAMS;
use crate::error::SinkError;
use crate::models::{
    Category, CategoryEdge, EntityKind, Product, ProductCategoryLink, Review, SimilarLink,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool};
use std::fmt::Write;
use std::time::Instant;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../sql/schema.sql");
const INDEXES: &str = include_str!("../../sql/indexes.sql");

const INSERT_CATEGORIES: &str = "INSERT INTO category (id, name)";
const INSERT_PRODUCTS: &str =
    "INSERT INTO product (id, asin, title, product_group, sales_rank, active)";
const INSERT_REVIEWS: &str =
    "INSERT INTO review (product_id, review_date, customer_id, rating, votes, helpful)";
const INSERT_CATEGORY_LINKS: &str = "INSERT INTO product_category (product_id, category_id)";
const INSERT_CATEGORY_EDGES: &str = "INSERT INTO category_edge (child_id, parent_id)";
const INSERT_SIMILAR: &str = "INSERT INTO similar_product (product_id, similar_asin)";

const IGNORE_CONFLICTS: &str = "ON CONFLICT DO NOTHING";
const APPEND_ONLY: &str = "";

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// A row type with a fixed column list in its target table
trait BindRow {
    const KIND: EntityKind;
    const COLUMNS: usize;

    fn bind<'q>(&self, query: AnyQuery<'q>) -> AnyQuery<'q>;
}

impl BindRow for Category {
    const KIND: EntityKind = EntityKind::Category;
    const COLUMNS: usize = 2;

    fn bind<'q>(&self, query: AnyQuery<'q>) -> AnyQuery<'q> {
        query.bind(self.id.clone()).bind(self.name.clone())
    }
}

impl BindRow for Product {
    const KIND: EntityKind = EntityKind::Product;
    const COLUMNS: usize = 6;

    fn bind<'q>(&self, query: AnyQuery<'q>) -> AnyQuery<'q> {
        query
            .bind(self.id)
            .bind(self.asin.clone())
            .bind(self.title.clone())
            .bind(self.group.clone())
            .bind(self.sales_rank)
            .bind(self.active)
    }
}

impl BindRow for Review {
    const KIND: EntityKind = EntityKind::Review;
    const COLUMNS: usize = 6;

    fn bind<'q>(&self, query: AnyQuery<'q>) -> AnyQuery<'q> {
        query
            .bind(self.product_id)
            .bind(self.date.clone())
            .bind(self.customer_id.clone())
            .bind(self.rating)
            .bind(self.votes)
            .bind(self.helpful)
    }
}

impl BindRow for ProductCategoryLink {
    const KIND: EntityKind = EntityKind::ProductCategoryLink;
    const COLUMNS: usize = 2;

    fn bind<'q>(&self, query: AnyQuery<'q>) -> AnyQuery<'q> {
        query.bind(self.product_id).bind(self.category_id.clone())
    }
}

impl BindRow for CategoryEdge {
    const KIND: EntityKind = EntityKind::CategoryEdge;
    const COLUMNS: usize = 2;

    fn bind<'q>(&self, query: AnyQuery<'q>) -> AnyQuery<'q> {
        query.bind(self.child_id.clone()).bind(self.parent_id.clone())
    }
}

impl BindRow for SimilarLink {
    const KIND: EntityKind = EntityKind::SimilarLink;
    const COLUMNS: usize = 2;

    fn bind<'q>(&self, query: AnyQuery<'q>) -> AnyQuery<'q> {
        query.bind(self.product_id).bind(self.similar_asin.clone())
    }
}

/// `$first, $first+1, ...` for `count` parameters
fn placeholder_list(sql: &mut String, first: usize, count: usize) {
    for n in first..first + count {
        if n > first {
            sql.push_str(", ");
        }
        let _ = write!(sql, "${n}");
    }
}

/// `($1, $2), ($3, $4), ...`
///
/// `$N` placeholders are understood by both Postgres and SQLite.
fn values_clause(rows: usize, columns: usize) -> String {
    let mut sql = String::with_capacity(rows * columns * 6);
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        placeholder_list(&mut sql, row * columns + 1, columns);
        sql.push(')');
    }
    sql
}

/// Multi-row INSERT, chunked to stay under the bind parameter limit.
async fn insert_rows<T: BindRow + Sync>(
    conn: &mut AnyConnection,
    head: &str,
    tail: &str,
    rows: &[T],
) -> Result<u64, sqlx::Error> {
    let per_statement = (MAX_BIND_PARAMS / T::COLUMNS).max(1);
    let mut affected = 0;

    for chunk in rows.chunks(per_statement) {
        let sql = format!(
            "{head} VALUES {} {tail}",
            values_clause(chunk.len(), T::COLUMNS)
        );
        let mut query = sqlx::query(&sql);
        for row in chunk {
            query = row.bind(query);
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }

    debug!(table = T::KIND.table(), rows = rows.len(), affected, "Inserted rows");
    Ok(affected)
}

/// Postgres or SQLite store, picked by the connection URL scheme
pub struct SqlSink {
    pool: AnyPool,
}

impl SqlSink {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SinkError> {
        sqlx::any::install_default_drivers();

        // Every connection to an in-memory SQLite database is a separate database.
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(max_connections, "Connected to relational store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Creates the tables if they are missing.
    pub async fn apply_schema(&self) -> Result<(), SinkError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Schema applied");
        Ok(())
    }

    pub async fn count(&self, kind: EntityKind) -> Result<i64, SinkError> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}

#[async_trait]
impl Sink for SqlSink {
    async fn write_batch(&mut self, batch: &Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let start = Instant::now();

        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await?;
        insert_rows(&mut tx, INSERT_CATEGORIES, IGNORE_CONFLICTS, &batch.categories).await?;
        insert_rows(&mut tx, INSERT_PRODUCTS, IGNORE_CONFLICTS, &batch.products).await?;
        insert_rows(&mut tx, INSERT_REVIEWS, APPEND_ONLY, &batch.reviews).await?;
        insert_rows(
            &mut tx,
            INSERT_CATEGORY_LINKS,
            IGNORE_CONFLICTS,
            &batch.category_links,
        )
        .await?;
        tx.commit().await?;

        debug!(
            products = batch.products.len(),
            reviews = batch.reviews.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch committed"
        );
        Ok(())
    }

    async fn existing_products(
        &mut self,
        ids: &[i64],
    ) -> Result<FxHashMap<i64, Option<String>>, SinkError> {
        let mut found = FxHashMap::default();
        for chunk in ids.chunks(MAX_BIND_PARAMS) {
            let mut sql = String::from("SELECT id, asin FROM product WHERE id IN (");
            placeholder_list(&mut sql, 1, chunk.len());
            sql.push(')');

            let mut query = sqlx::query_as::<_, (i64, Option<String>)>(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            let mut rows = query.fetch(&self.pool);
            while let Some((id, asin)) = rows.try_next().await? {
                found.insert(id, asin);
            }
        }
        Ok(found)
    }

    async fn existing_asins(&mut self, asins: &[String]) -> Result<FxHashSet<String>, SinkError> {
        let mut found = FxHashSet::default();
        for chunk in asins.chunks(MAX_BIND_PARAMS) {
            let mut sql = String::from("SELECT asin FROM product WHERE asin IN (");
            placeholder_list(&mut sql, 1, chunk.len());
            sql.push(')');

            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for asin in chunk {
                query = query.bind(asin.clone());
            }
            let mut rows = query.fetch(&self.pool);
            while let Some(asin) = rows.try_next().await? {
                found.insert(asin);
            }
        }
        Ok(found)
    }

    async fn insert_similar(&mut self, links: &[SimilarLink]) -> Result<u64, SinkError> {
        let mut tx = self.pool.begin().await?;
        let added = insert_rows(&mut tx, INSERT_SIMILAR, IGNORE_CONFLICTS, links).await?;
        tx.commit().await?;
        Ok(added)
    }

    async fn insert_category_edges(&mut self, edges: &[CategoryEdge]) -> Result<u64, SinkError> {
        let mut tx = self.pool.begin().await?;
        let added =
            insert_rows(&mut tx, INSERT_CATEGORY_EDGES, IGNORE_CONFLICTS, edges).await?;
        tx.commit().await?;
        Ok(added)
    }

    async fn finalize(&mut self) -> Result<(), SinkError> {
        sqlx::raw_sql(INDEXES).execute(&self.pool).await?;
        info!("Post-load indexes created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_clause_numbers_sequentially() {
        assert_eq!(values_clause(1, 2), "($1, $2)");
        assert_eq!(values_clause(2, 3), "($1, $2, $3), ($4, $5, $6)");
        assert_eq!(values_clause(0, 3), "");
    }

    #[test]
    fn placeholder_list_offsets() {
        let mut sql = String::from("IN (");
        placeholder_list(&mut sql, 1, 3);
        sql.push(')');
        assert_eq!(sql, "IN ($1, $2, $3)");
    }

    #[test]
    fn statement_chunks_stay_under_bind_limit() {
        assert!((MAX_BIND_PARAMS / Product::COLUMNS) * Product::COLUMNS <= MAX_BIND_PARAMS);
        assert!((MAX_BIND_PARAMS / Review::COLUMNS) * Review::COLUMNS <= MAX_BIND_PARAMS);
    }

    #[test]
    fn schema_covers_every_table() {
        for kind in [
            EntityKind::Product,
            EntityKind::Review,
            EntityKind::Category,
            EntityKind::ProductCategoryLink,
            EntityKind::CategoryEdge,
            EntityKind::SimilarLink,
        ] {
            let ddl = format!("CREATE TABLE IF NOT EXISTS {} (", kind.table());
            assert!(SCHEMA.contains(&ddl), "missing DDL for {}", kind.table());
        }
    }
}
