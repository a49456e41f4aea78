//! Post-pass that materializes cross references once every product is stored.
//!
//! Similar-product links are kept only when both ends exist; category edges
//! need no existence check because every category row is committed before
//! the main pass ends.

use crate::config::RESOLVE_CHUNK_SIZE;
use crate::models::{CategoryEdge, SimilarLink};
use crate::sink::Sink;
use crate::stats::IngestStats;
use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of [`resolve_similar`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimilarResolution {
    pub candidates: u64,
    pub inserted: u64,
    pub unresolved: u64,
}

pub async fn resolve_category_edges<S: Sink>(
    sink: &mut S,
    edges: Vec<CategoryEdge>,
    stats: &IngestStats,
) -> Result<u64> {
    let (edges, self_edges): (Vec<_>, Vec<_>) =
        edges.into_iter().partition(|e| e.child_id != e.parent_id);
    if !self_edges.is_empty() {
        warn!(count = self_edges.len(), "Dropping self-referencing category edges");
    }

    let mut inserted = 0;
    for chunk in edges.chunks(RESOLVE_CHUNK_SIZE) {
        inserted += sink
            .insert_category_edges(chunk)
            .await
            .context("Failed to insert category edges")?;
    }
    stats.add_category_edges_written(inserted);
    info!(edges = edges.len(), inserted, "Category hierarchy written");
    Ok(inserted)
}

/// Inserts the candidate links whose source id and target asin both exist.
///
/// Existence is checked a chunk of keys at a time, never per row. A link
/// whose target is its own product's asin is discarded here as well, since
/// the stored asin is authoritative.
pub async fn resolve_similar<S: Sink>(
    sink: &mut S,
    candidates: Vec<SimilarLink>,
    stats: &IngestStats,
) -> Result<SimilarResolution> {
    let start = Instant::now();

    let mut seen = FxHashSet::default();
    let candidates: Vec<SimilarLink> = candidates
        .into_iter()
        .filter(|link| seen.insert(link.clone()))
        .collect();

    let mut ids: Vec<i64> = candidates.iter().map(|l| l.product_id).collect();
    ids.sort_unstable();
    ids.dedup();
    let mut asins: Vec<String> = candidates.iter().map(|l| l.similar_asin.clone()).collect();
    asins.sort_unstable();
    asins.dedup();

    let mut products = FxHashMap::default();
    for chunk in ids.chunks(RESOLVE_CHUNK_SIZE) {
        products.extend(
            sink.existing_products(chunk)
                .await
                .context("Failed to look up product ids")?,
        );
    }
    let mut known_asins = FxHashSet::default();
    for chunk in asins.chunks(RESOLVE_CHUNK_SIZE) {
        known_asins.extend(
            sink.existing_asins(chunk)
                .await
                .context("Failed to look up product asins")?,
        );
    }
    debug!(
        ids = ids.len(),
        ids_found = products.len(),
        asins = asins.len(),
        asins_found = known_asins.len(),
        "Existence sets loaded"
    );

    let survivors: Vec<SimilarLink> = candidates
        .iter()
        .filter(|link| match products.get(&link.product_id) {
            Some(own) => {
                own.as_deref() != Some(link.similar_asin.as_str())
                    && known_asins.contains(&link.similar_asin)
            }
            None => false,
        })
        .cloned()
        .collect();

    let mut inserted = 0;
    for chunk in survivors.chunks(RESOLVE_CHUNK_SIZE) {
        inserted += sink
            .insert_similar(chunk)
            .await
            .context("Failed to insert similar links")?;
    }

    let resolution = SimilarResolution {
        candidates: candidates.len() as u64,
        inserted,
        unresolved: (candidates.len() - survivors.len()) as u64,
    };
    stats.add_similar_resolved(resolution.inserted, resolution.unresolved);
    info!(
        candidates = resolution.candidates,
        inserted = resolution.inserted,
        unresolved = resolution.unresolved,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Similar links resolved"
    );
    Ok(resolution)
}
