use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: i64,
    pub asin: Option<String>,
    pub title: Option<String>,
    pub group: Option<String>,
    pub sales_rank: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Review {
    pub product_id: i64,
    /// Verbatim `YYYY-M-D` token from the dump
    pub date: String,
    pub customer_id: String,
    pub rating: i64,
    pub votes: i64,
    pub helpful: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// Immediate predecessor of `child_id` on one taxonomy path.
/// Roots have no edge row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CategoryEdge {
    pub child_id: String,
    pub parent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProductCategoryLink {
    pub product_id: i64,
    pub category_id: String,
}

/// Candidate edge recorded at parse time; the target may never exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SimilarLink {
    pub product_id: i64,
    pub similar_asin: String,
}

/// Everything the assembler produced for one finalized product.
#[derive(Debug, Clone)]
pub struct ProductRecord {
    pub product: Product,
    pub reviews: Vec<Review>,
    /// Categories first interned while assembling this record
    pub categories: Vec<Category>,
    pub category_links: Vec<ProductCategoryLink>,
    pub similar: Vec<SimilarLink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Product,
    Review,
    Category,
    ProductCategoryLink,
    CategoryEdge,
    SimilarLink,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Review => "review",
            EntityKind::Category => "category",
            EntityKind::ProductCategoryLink => "product_category",
            EntityKind::CategoryEdge => "category_edge",
            EntityKind::SimilarLink => "similar_product",
        }
    }
}
