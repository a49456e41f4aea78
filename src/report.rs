//! Read-only reports over a loaded store, each dumped to its own CSV file.
//!
//! The SQL sticks to what Postgres and SQLite both accept: averages are cast
//! to `DOUBLE PRECISION`, and limited halves of a union are wrapped in
//! subqueries.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, FromRow};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One fixed report
pub struct ReportQuery {
    pub name: &'static str,
    pub file: &'static str,
    pub headers: &'static [&'static str],
    /// Bound to `$1` when set
    pub needs_asin: bool,
    pub sql: &'static str,
}

pub const Q1_REVIEWS: ReportQuery = ReportQuery {
    name: "Most helpful positive and negative reviews",
    file: "q1_reviews.csv",
    headers: &["customer_id", "rating", "votes", "helpful", "review_date"],
    needs_asin: true,
    sql: "SELECT customer_id, rating, votes, helpful, review_date FROM (
            SELECT r.customer_id, r.rating, r.votes, r.helpful, r.review_date
            FROM review r JOIN product p ON p.id = r.product_id
            WHERE p.asin = $1
            ORDER BY r.helpful DESC, r.rating DESC
            LIMIT 5
          ) AS positive
          UNION
          SELECT customer_id, rating, votes, helpful, review_date FROM (
            SELECT r.customer_id, r.rating, r.votes, r.helpful, r.review_date
            FROM review r JOIN product p ON p.id = r.product_id
            WHERE p.asin = $1
            ORDER BY r.helpful DESC, r.rating ASC
            LIMIT 5
          ) AS negative
          ORDER BY helpful DESC, rating DESC",
};

pub const Q2_BETTER_SIMILAR: ReportQuery = ReportQuery {
    name: "Similar products with a better sales rank",
    file: "q2_similar.csv",
    headers: &["similar_asin", "sales_rank"],
    needs_asin: true,
    sql: "SELECT s.similar_asin, p2.sales_rank
          FROM similar_product s
          JOIN product p1 ON p1.id = s.product_id
          JOIN product p2 ON p2.asin = s.similar_asin
          WHERE p1.asin = $1 AND p2.sales_rank < p1.sales_rank
          ORDER BY p2.sales_rank ASC",
};

pub const Q3_DAILY_RATING: ReportQuery = ReportQuery {
    name: "Daily average rating",
    file: "q3_daily_rating.csv",
    headers: &["review_date", "avg_rating"],
    needs_asin: true,
    sql: "SELECT r.review_date, CAST(AVG(r.rating) AS DOUBLE PRECISION) AS avg_rating
          FROM review r JOIN product p ON p.id = r.product_id
          WHERE p.asin = $1
          GROUP BY r.review_date
          ORDER BY r.review_date",
};

pub const Q4_TOP_SALES: ReportQuery = ReportQuery {
    name: "Top 10 sellers per group",
    file: "q4_top_sales.csv",
    headers: &["group", "asin", "title", "sales_rank"],
    needs_asin: false,
    sql: "SELECT product_group, asin, title, sales_rank FROM (
            SELECT product_group, asin, title, sales_rank,
                   ROW_NUMBER() OVER (PARTITION BY product_group ORDER BY sales_rank ASC) AS pos
            FROM product
            WHERE sales_rank IS NOT NULL
          ) AS ranked
          WHERE pos <= 10
          ORDER BY product_group, pos",
};

pub const Q5_TOP_HELPFUL: ReportQuery = ReportQuery {
    name: "Top 10 products by helpful ratio",
    file: "q5_top_helpful.csv",
    headers: &["asin", "title", "avg_helpful"],
    needs_asin: false,
    sql: "SELECT p.asin, p.title,
                 AVG(CAST(r.helpful AS DOUBLE PRECISION) / NULLIF(r.votes, 0)) AS avg_helpful
          FROM review r JOIN product p ON p.id = r.product_id
          GROUP BY p.id, p.asin, p.title
          ORDER BY avg_helpful DESC NULLS LAST
          LIMIT 10",
};

pub const Q6_TOP_CATEGORIES: ReportQuery = ReportQuery {
    name: "Top 5 categories by helpful ratio",
    file: "q6_top_categories.csv",
    headers: &["category", "avg_helpful"],
    needs_asin: false,
    sql: "SELECT c.name,
                 AVG(CAST(r.helpful AS DOUBLE PRECISION) / NULLIF(r.votes, 0)) AS avg_helpful
          FROM review r
          JOIN product_category pc ON pc.product_id = r.product_id
          JOIN category c ON c.id = pc.category_id
          GROUP BY c.name
          ORDER BY avg_helpful DESC NULLS LAST
          LIMIT 5",
};

pub const Q7_TOP_CUSTOMERS: ReportQuery = ReportQuery {
    name: "Top 10 customer/group pairs by review count",
    file: "q7_top_customers.csv",
    headers: &["customer_id", "group", "reviews"],
    needs_asin: false,
    sql: "SELECT r.customer_id, p.product_group, COUNT(*) AS reviews
          FROM review r JOIN product p ON p.id = r.product_id
          GROUP BY r.customer_id, p.product_group
          ORDER BY reviews DESC, r.customer_id
          LIMIT 10",
};

/// A report that was written
#[derive(Debug, Clone)]
pub struct ReportFile {
    pub file: &'static str,
    pub path: PathBuf,
    pub rows: usize,
}

/// Runs every report; the asin-scoped ones are skipped when `asin` is `None`.
pub async fn run_reports(
    pool: &AnyPool,
    asin: Option<&str>,
    output_dir: &Path,
) -> Result<Vec<ReportFile>> {
    fs::create_dir_all(output_dir).with_context(|| {
        format!("Failed to create output directory: {}", output_dir.display())
    })?;

    let mut written = Vec::new();
    match asin {
        Some(asin) => {
            let asin = Some(asin);
            written.push(
                export::<(String, i64, i64, i64, String)>(pool, &Q1_REVIEWS, asin, output_dir)
                    .await?,
            );
            written.push(
                export::<(String, Option<i64>)>(pool, &Q2_BETTER_SIMILAR, asin, output_dir)
                    .await?,
            );
            written.push(
                export::<(String, Option<f64>)>(pool, &Q3_DAILY_RATING, asin, output_dir)
                    .await?,
            );
        }
        None => warn!("No asin given; skipping q1, q2 and q3"),
    }

    type TopSales = (Option<String>, Option<String>, Option<String>, i64);
    type Helpful = (Option<String>, Option<String>, Option<f64>);
    written.push(export::<TopSales>(pool, &Q4_TOP_SALES, None, output_dir).await?);
    written.push(export::<Helpful>(pool, &Q5_TOP_HELPFUL, None, output_dir).await?);
    written.push(
        export::<(String, Option<f64>)>(pool, &Q6_TOP_CATEGORIES, None, output_dir).await?,
    );
    written.push(
        export::<(String, Option<String>, i64)>(pool, &Q7_TOP_CUSTOMERS, None, output_dir)
            .await?,
    );
    Ok(written)
}

async fn export<T>(
    pool: &AnyPool,
    report: &ReportQuery,
    asin: Option<&str>,
    output_dir: &Path,
) -> Result<ReportFile>
where
    T: for<'r> FromRow<'r, AnyRow> + Serialize + Send + Unpin,
{
    let mut query = sqlx::query_as::<_, T>(report.sql);
    if report.needs_asin {
        query = query.bind(asin.unwrap_or_default().to_string());
    }
    let rows = query
        .fetch_all(pool)
        .await
        .with_context(|| format!("Report query failed: {}", report.name))?;

    let path = output_dir.join(report.file);
    write_csv(&path, report.headers, &rows)?;
    info!(report = report.file, rows = rows.len(), "Report written");
    println!("==> {}: {} rows -> {}", report.name, rows.len(), path.display());

    Ok(ReportFile {
        file: report.file,
        path,
        rows: rows.len(),
    })
}

fn write_csv<T: Serialize>(path: &Path, headers: &[&str], rows: &[T]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(headers)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, Product, ProductCategoryLink, Review, SimilarLink};
    use crate::sink::{Batch, Sink, SqlSink};
    use tempfile::TempDir;

    fn product(id: i64, asin: &str, rank: i64) -> Product {
        Product {
            id,
            asin: Some(asin.to_string()),
            title: Some(format!("Item {id}")),
            group: Some("Book".to_string()),
            sales_rank: Some(rank),
            active: true,
        }
    }

    fn review(product_id: i64, customer: &str, rating: i64, votes: i64, helpful: i64) -> Review {
        Review {
            product_id,
            date: "2001-1-1".to_string(),
            customer_id: customer.to_string(),
            rating,
            votes,
            helpful,
        }
    }

    async fn loaded(dir: &TempDir) -> SqlSink {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("report.db").display());
        let mut sink = SqlSink::connect(&url, 1).await.unwrap();
        sink.apply_schema().await.unwrap();
        let batch = Batch {
            categories: vec![Category {
                id: "1".into(),
                name: "Books".into(),
            }],
            products: vec![product(1, "B001", 50), product(2, "B002", 10)],
            reviews: vec![
                review(1, "U1", 5, 4, 4),
                review(1, "U2", 1, 2, 0),
                review(2, "U1", 4, 0, 0),
            ],
            category_links: vec![ProductCategoryLink {
                product_id: 1,
                category_id: "1".into(),
            }],
        };
        sink.write_batch(&batch).await.unwrap();
        sink.insert_similar(&[SimilarLink {
            product_id: 1,
            similar_asin: "B002".into(),
        }])
        .await
        .unwrap();
        sink
    }

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[tokio::test]
    async fn all_reports_with_asin() {
        let dir = TempDir::new().unwrap();
        let sink = loaded(&dir).await;
        let out = dir.path().join("out");

        let files = run_reports(sink.pool(), Some("B001"), &out).await.unwrap();
        assert_eq!(files.len(), 7);

        let q1 = read_rows(&out.join("q1_reviews.csv"));
        assert_eq!(q1.len(), 2);
        assert_eq!(q1[0][0], "U1");

        let q2 = read_rows(&out.join("q2_similar.csv"));
        assert_eq!(q2, vec![vec!["B002".to_string(), "10".to_string()]]);

        let q3 = read_rows(&out.join("q3_daily_rating.csv"));
        assert_eq!(q3.len(), 1);
        assert_eq!(q3[0][1].parse::<f64>().unwrap(), 3.0);

        let q4 = read_rows(&out.join("q4_top_sales.csv"));
        assert_eq!(q4[0][1], "B002");

        let q7 = read_rows(&out.join("q7_top_customers.csv"));
        assert_eq!(q7[0], vec!["U1".to_string(), "Book".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn asin_reports_skipped_without_asin() {
        let dir = TempDir::new().unwrap();
        let sink = loaded(&dir).await;
        let out = dir.path().join("out");

        let files = run_reports(sink.pool(), None, &out).await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file).collect();
        assert_eq!(
            names,
            vec![
                "q4_top_sales.csv",
                "q5_top_helpful.csv",
                "q6_top_categories.csv",
                "q7_top_customers.csv"
            ]
        );
        assert!(!out.join("q1_reviews.csv").exists());

        let q5 = read_rows(&out.join("q5_top_helpful.csv"));
        assert_eq!(q5[0][0], "B001");
        assert_eq!(q5[0][2].parse::<f64>().unwrap(), 0.5);
        // all votes zero leaves the ratio null
        assert_eq!(q5[1][2], "");
    }
}
