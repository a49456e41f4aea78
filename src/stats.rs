use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the parser thread and the writer task
#[derive(Default)]
pub struct IngestStats {
    pub lines_read: AtomicU64,
    pub records_emitted: AtomicU64,
    pub records_dropped: AtomicU64,
    pub duplicate_asins: AtomicU64,
    pub stray_fields: AtomicU64,
    pub reviews_parsed: AtomicU64,
    pub reviews_malformed: AtomicU64,
    pub subblocks_truncated: AtomicU64,
    pub categories_interned: AtomicU64,
    pub self_edges_rejected: AtomicU64,
    pub similar_candidates: AtomicU64,
    pub similar_self_refs: AtomicU64,
    pub similar_resolved: AtomicU64,
    pub similar_unresolved: AtomicU64,
    pub flushes: AtomicU64,
    pub products_written: AtomicU64,
    pub reviews_written: AtomicU64,
    pub categories_written: AtomicU64,
    pub category_links_written: AtomicU64,
    pub category_edges_written: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`] for printing and JSON output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub lines_read: u64,
    pub records_emitted: u64,
    pub records_dropped: u64,
    pub duplicate_asins: u64,
    pub stray_fields: u64,
    pub reviews_parsed: u64,
    pub reviews_malformed: u64,
    pub subblocks_truncated: u64,
    pub categories_interned: u64,
    pub self_edges_rejected: u64,
    pub similar_candidates: u64,
    pub similar_self_refs: u64,
    pub similar_resolved: u64,
    pub similar_unresolved: u64,
    pub flushes: u64,
    pub products_written: u64,
    pub reviews_written: u64,
    pub categories_written: u64,
    pub category_links_written: u64,
    pub category_edges_written: u64,
}

fn bump(counter: &AtomicU64, count: u64) {
    counter.fetch_add(count, Ordering::Relaxed);
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lines_read(&self, lines: u64) {
        self.lines_read.store(lines, Ordering::Relaxed);
    }

    pub fn inc_emitted(&self) {
        bump(&self.records_emitted, 1);
    }

    pub fn inc_dropped(&self) {
        bump(&self.records_dropped, 1);
    }

    /// A repeated asin drops the record, so this also bumps `records_dropped`.
    pub fn inc_duplicate_asin(&self) {
        bump(&self.records_dropped, 1);
        bump(&self.duplicate_asins, 1);
    }

    pub fn inc_stray_fields(&self) {
        bump(&self.stray_fields, 1);
    }

    pub fn add_reviews_parsed(&self, count: u64) {
        bump(&self.reviews_parsed, count);
    }

    pub fn inc_reviews_malformed(&self) {
        bump(&self.reviews_malformed, 1);
    }

    pub fn inc_truncated(&self) {
        bump(&self.subblocks_truncated, 1);
    }

    pub fn add_categories_interned(&self, count: u64) {
        bump(&self.categories_interned, count);
    }

    pub fn set_self_edges_rejected(&self, count: u64) {
        self.self_edges_rejected.store(count, Ordering::Relaxed);
    }

    pub fn add_similar_candidates(&self, count: u64) {
        bump(&self.similar_candidates, count);
    }

    pub fn inc_similar_self_refs(&self) {
        bump(&self.similar_self_refs, 1);
    }

    pub fn add_similar_resolved(&self, resolved: u64, unresolved: u64) {
        bump(&self.similar_resolved, resolved);
        bump(&self.similar_unresolved, unresolved);
    }

    pub fn inc_flushes(&self) {
        bump(&self.flushes, 1);
    }

    pub fn add_written(&self, products: u64, reviews: u64, categories: u64, links: u64) {
        bump(&self.products_written, products);
        bump(&self.reviews_written, reviews);
        bump(&self.categories_written, categories);
        bump(&self.category_links_written, links);
    }

    pub fn add_category_edges_written(&self, count: u64) {
        bump(&self.category_edges_written, count);
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.records_emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> IngestSummary {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngestSummary {
            lines_read: get(&self.lines_read),
            records_emitted: get(&self.records_emitted),
            records_dropped: get(&self.records_dropped),
            duplicate_asins: get(&self.duplicate_asins),
            stray_fields: get(&self.stray_fields),
            reviews_parsed: get(&self.reviews_parsed),
            reviews_malformed: get(&self.reviews_malformed),
            subblocks_truncated: get(&self.subblocks_truncated),
            categories_interned: get(&self.categories_interned),
            self_edges_rejected: get(&self.self_edges_rejected),
            similar_candidates: get(&self.similar_candidates),
            similar_self_refs: get(&self.similar_self_refs),
            similar_resolved: get(&self.similar_resolved),
            similar_unresolved: get(&self.similar_unresolved),
            flushes: get(&self.flushes),
            products_written: get(&self.products_written),
            reviews_written: get(&self.reviews_written),
            categories_written: get(&self.categories_written),
            category_links_written: get(&self.category_links_written),
            category_edges_written: get(&self.category_edges_written),
        }
    }
}

impl IngestSummary {
    pub fn print(&self) {
        println!();
        println!("=== Summary ===");
        println!("Lines read:          {}", self.lines_read);
        println!("Records emitted:     {}", self.records_emitted);
        println!("Records dropped:     {}", self.records_dropped);
        println!("Duplicate asins:     {}", self.duplicate_asins);
        println!("Stray fields:        {}", self.stray_fields);
        println!("Reviews parsed:      {}", self.reviews_parsed);
        println!("Reviews malformed:   {}", self.reviews_malformed);
        println!("Truncated blocks:    {}", self.subblocks_truncated);
        println!("Categories interned: {}", self.categories_interned);
        println!("Self-edges rejected: {}", self.self_edges_rejected);
        println!("Similar candidates:  {}", self.similar_candidates);
        println!("Similar resolved:    {}", self.similar_resolved);
        println!("Similar unresolved:  {}", self.similar_unresolved);
        println!("Flushes:             {}", self.flushes);
        println!("Products written:    {}", self.products_written);
        println!("Reviews written:     {}", self.reviews_written);
        println!("Category edges:      {}", self.category_edges_written);
    }
}
