use crate::categories::CategoryResolver;
use crate::fields::{is_category_path_line, parse_review_entry, recognize, Field, ReviewEntry};
use crate::models::{Product, ProductCategoryLink, ProductRecord, Review, SimilarLink};
use crate::parser::LineSource;
use crate::stats::IngestStats;
use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fields of the record currently being built
#[derive(Default)]
struct Draft {
    id: Option<i64>,
    asin: Option<String>,
    title: Option<String>,
    group: Option<String>,
    sales_rank: Option<i64>,
    discontinued: bool,
    reviews: Vec<ReviewEntry>,
    category_ids: Vec<String>,
    seen_categories: FxHashSet<String>,
    similar: Vec<String>,
}

impl Draft {
    fn new(id: Option<i64>) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Applies a scalar field; false when the field has no place in a record.
    fn set(&mut self, field: Field) -> bool {
        match field {
            Field::Asin(asin) => self.asin = Some(asin),
            Field::Title(title) => self.title = (!title.is_empty()).then_some(title),
            Field::Group(group) => self.group = (!group.is_empty()).then_some(group),
            Field::SalesRank(rank) => self.sales_rank = rank,
            Field::Similar(asins) => self.similar.extend(asins),
            Field::Discontinued => self.discontinued = true,
            _ => return false,
        }
        true
    }

    fn add_category(&mut self, id: String) {
        if self.seen_categories.insert(id.clone()) {
            self.category_ids.push(id);
        }
    }
}

enum State {
    Idle,
    Building(Draft),
}

/// Turns the line stream into finalized product records.
///
/// A record starts at an `Id:` line and ends at the next one or at end of
/// input; both boundaries go through [`RecordAssembler::finalize`].
pub struct RecordAssembler<R> {
    source: LineSource<R>,
    categories: CategoryResolver,
    stats: Arc<IngestStats>,
    state: State,
    /// Asins already emitted; `product.asin` is unique.
    seen_asins: FxHashSet<String>,
}

impl<R: BufRead> RecordAssembler<R> {
    pub fn new(source: LineSource<R>, categories: CategoryResolver, stats: Arc<IngestStats>) -> Self {
        Self {
            source,
            categories,
            stats,
            state: State::Idle,
            seen_asins: FxHashSet::default(),
        }
    }

    pub fn next_record(&mut self) -> Option<ProductRecord> {
        while let Some(line) = self.source.next_line() {
            let field = recognize(&line);
            if let Some(record) = self.apply(field) {
                return Some(record);
            }
        }

        match std::mem::replace(&mut self.state, State::Idle) {
            State::Building(draft) => self.finalize(draft),
            State::Idle => None,
        }
    }

    /// Hands back the category state once parsing stops. Fails if the input
    /// stream ended on an I/O error rather than a clean end of file.
    pub fn finish(mut self) -> Result<CategoryResolver> {
        self.stats.set_lines_read(self.source.line_number());
        self.stats
            .set_self_edges_rejected(self.categories.self_edges_rejected());
        if let Some(e) = self.source.take_error() {
            return Err(e).with_context(|| {
                format!(
                    "Input stream failed after line {}",
                    self.source.line_number()
                )
            });
        }
        Ok(self.categories)
    }

    fn apply(&mut self, field: Field) -> Option<ProductRecord> {
        match field {
            Field::Id(id) => {
                if id.is_none() {
                    warn!(line = self.source.line_number(), "Record start without a usable id");
                }
                match std::mem::replace(&mut self.state, State::Building(Draft::new(id))) {
                    State::Building(previous) => self.finalize(previous),
                    State::Idle => None,
                }
            }
            Field::CategoriesDeclared(count) => {
                self.read_categories(count);
                None
            }
            Field::ReviewsDeclared { downloaded, .. } => {
                self.read_reviews(downloaded);
                None
            }
            Field::Blank | Field::Unrecognized => None,
            field => {
                let applied = match &mut self.state {
                    State::Building(draft) => draft.set(field),
                    State::Idle => false,
                };
                if !applied {
                    self.stats.inc_stray_fields();
                }
                None
            }
        }
    }

    fn read_categories(&mut self, declared: usize) {
        let lines = self
            .source
            .take_next_while(declared, is_category_path_line);
        if lines.len() < declared {
            self.stats.inc_truncated();
            debug!(
                line = self.source.line_number(),
                declared,
                found = lines.len(),
                "Category block shorter than declared"
            );
        }

        let draft = match &mut self.state {
            State::Building(draft) if draft.id.is_some() => draft,
            _ => return,
        };
        for line in &lines {
            let ids = self.categories.resolve_path(line);
            for pair in ids.windows(2) {
                self.categories.record_edge(&pair[1], &pair[0]);
            }
            for id in ids {
                draft.add_category(id);
            }
        }
    }

    fn read_reviews(&mut self, declared: usize) {
        let mut entries = Vec::with_capacity(declared.min(64));
        let mut consumed = 0;

        while consumed < declared {
            let Some(line) = self.source.next_line() else {
                self.stats.inc_truncated();
                break;
            };
            match parse_review_entry(&line) {
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    // Keywords and blank lines belong to the record, not the block.
                    if !matches!(recognize(&line), Field::Unrecognized) {
                        self.source.push_back(line);
                        self.stats.inc_truncated();
                        break;
                    }
                    self.stats.inc_reviews_malformed();
                    debug!(line = self.source.line_number(), ?reason, "Skipping malformed review");
                }
            }
            consumed += 1;
        }

        if let State::Building(draft) = &mut self.state {
            draft.reviews.extend(entries);
        }
    }

    fn finalize(&mut self, draft: Draft) -> Option<ProductRecord> {
        self.stats.set_lines_read(self.source.line_number());

        let Draft {
            id,
            asin,
            title,
            group,
            sales_rank,
            discontinued,
            reviews,
            category_ids,
            similar,
            ..
        } = draft;

        let Some(id) = id else {
            self.stats.inc_dropped();
            debug!(asin = ?asin, "Dropping record without id");
            return None;
        };

        if let Some(asin) = &asin {
            if !self.seen_asins.insert(asin.clone()) {
                self.stats.inc_duplicate_asin();
                warn!(id, asin = %asin, "Dropping record whose asin was already used");
                return None;
            }
        }

        // Asin may arrive before or after the similar line, so self links are purged here.
        let mut similar_links = Vec::with_capacity(similar.len());
        for target in similar {
            if asin.as_deref() == Some(target.as_str()) {
                self.stats.inc_similar_self_refs();
                continue;
            }
            similar_links.push(SimilarLink {
                product_id: id,
                similar_asin: target,
            });
        }

        let reviews: Vec<Review> = reviews
            .into_iter()
            .map(|r| Review {
                product_id: id,
                date: r.date,
                customer_id: r.customer_id,
                rating: r.rating,
                votes: r.votes,
                helpful: r.helpful,
            })
            .collect();

        let category_links = category_ids
            .into_iter()
            .map(|category_id| ProductCategoryLink {
                product_id: id,
                category_id,
            })
            .collect();

        let categories = self.categories.drain_new();

        self.stats.inc_emitted();
        self.stats.add_reviews_parsed(reviews.len() as u64);
        self.stats.add_categories_interned(categories.len() as u64);
        self.stats.add_similar_candidates(similar_links.len() as u64);
        self.stats
            .set_self_edges_rejected(self.categories.self_edges_rejected());

        Some(ProductRecord {
            product: Product {
                id,
                asin,
                title,
                group,
                sales_rank,
                active: !discontinued,
            },
            reviews,
            categories,
            category_links,
            similar: similar_links,
        })
    }
}

impl<R: BufRead> Iterator for RecordAssembler<R> {
    type Item = ProductRecord;

    fn next(&mut self) -> Option<ProductRecord> {
        self.next_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn assemble(text: &str) -> (Vec<ProductRecord>, Arc<IngestStats>, CategoryResolver) {
        let stats = Arc::new(IngestStats::new());
        let source = LineSource::new(Cursor::new(text.as_bytes().to_vec()));
        let mut assembler = RecordAssembler::new(source, CategoryResolver::new(), stats.clone());
        let records: Vec<ProductRecord> = assembler.by_ref().collect();
        let categories = assembler.finish().unwrap();
        (records, stats, categories)
    }

    const SCENARIO: &str = "Id: 1\nASIN: B001\ntitle: Widget\ngroup: Toy\nsalesrank: 100\n\
similar: 2 B002 B003\ncategories: 1\n|Toys[1]|Blocks[2]\n\
reviews: total: 1 downloaded: 1 avg rating: 5.0\n\
2001-1-1 customer: U1 rating: 5 votes: 2 helpful: 2\n\n\
Id: 2\nASIN: B002\ntitle: Gadget\n";

    #[test]
    fn scenario_records() {
        let (records, stats, categories) = assemble(SCENARIO);
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.product.id, 1);
        assert_eq!(first.product.asin.as_deref(), Some("B001"));
        assert_eq!(first.product.title.as_deref(), Some("Widget"));
        assert_eq!(first.product.group.as_deref(), Some("Toy"));
        assert_eq!(first.product.sales_rank, Some(100));
        assert!(first.product.active);
        assert_eq!(first.reviews.len(), 1);
        assert_eq!(first.reviews[0].customer_id, "U1");
        assert_eq!(first.reviews[0].product_id, 1);

        let links: Vec<&str> = first.category_links.iter().map(|l| l.category_id.as_str()).collect();
        assert_eq!(links, vec!["1", "2"]);
        let similar: Vec<&str> = first.similar.iter().map(|s| s.similar_asin.as_str()).collect();
        assert_eq!(similar, vec!["B002", "B003"]);
        assert_eq!(first.categories.len(), 2);

        let second = &records[1];
        assert_eq!(second.product.id, 2);
        assert!(second.categories.is_empty());

        assert_eq!(categories.pending_edges(), 1);
        let edges = categories.into_edges();
        assert_eq!(edges[0].child_id, "2");
        assert_eq!(edges[0].parent_id, "1");

        assert_eq!(stats.emitted(), 2);
        assert_eq!(stats.dropped(), 0);
        assert_eq!(stats.summary().lines_read, 14);
    }

    #[test]
    fn discontinued_anywhere_marks_inactive() {
        let (records, _, _) = assemble(
            "Id: 1\ndiscontinued product\nASIN: A\n\nId: 2\nASIN: B\ntitle: x\ndiscontinued product\nId: 3\nASIN: C\n",
        );
        let active: Vec<bool> = records.iter().map(|r| r.product.active).collect();
        assert_eq!(active, vec![false, false, true]);
    }

    #[test]
    fn record_without_id_is_dropped() {
        let (records, stats, _) =
            assemble("ASIN: STRAY\nId: abc\nASIN: B001\nreviews: total: 1 downloaded: 1 avg rating: 1\n2001-1-1 customer: U rating: 1 votes: 0 helpful: 0\nId: 5\nASIN: B005\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].product.id, 5);
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.summary().stray_fields, 1);
    }

    #[test]
    fn self_similar_purged_regardless_of_order() {
        let (records, stats, _) = assemble(
            "Id: 1\nsimilar: 2 B001 B002\nASIN: B001\nId: 2\nASIN: B002\nsimilar: 1 B002\n",
        );
        assert_eq!(records[0].similar.len(), 1);
        assert_eq!(records[0].similar[0].similar_asin, "B002");
        assert!(records[1].similar.is_empty());
        assert_eq!(stats.summary().similar_self_refs, 2);
    }

    #[test]
    fn malformed_reviews_are_skipped_not_fatal() {
        let (records, stats, _) = assemble(
            "Id: 1\nASIN: A\nreviews: total: 3 downloaded: 3 avg rating: 4\n\
2001-1-1 customer: U1 rating: 5 votes: 2 helpful: 2\n\
2001-1-2 customer: U2 rating: oops votes: 2 helpful: 2\n\
2001-1-3 customer: U3 rating: 4 votes: 1 helpful: 0\n",
        );
        assert_eq!(records[0].reviews.len(), 2);
        assert_eq!(stats.summary().reviews_malformed, 1);
        assert_eq!(stats.summary().subblocks_truncated, 0);
    }

    #[test]
    fn short_review_block_does_not_swallow_next_record() {
        let (records, stats, _) = assemble(
            "Id: 1\nASIN: A\nreviews: total: 5 downloaded: 5 avg rating: 4\n\
2001-1-1 customer: U1 rating: 5 votes: 2 helpful: 2\n\nId: 2\nASIN: B\n",
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reviews.len(), 1);
        assert_eq!(records[1].product.asin.as_deref(), Some("B"));
        assert_eq!(stats.summary().subblocks_truncated, 1);
    }

    #[test]
    fn short_category_block_does_not_swallow_next_record() {
        let (records, stats, _) =
            assemble("Id: 1\nASIN: A\ncategories: 3\n|Books[10]|Fiction[11]\nId: 2\nASIN: B\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].category_links.len(), 2);
        assert_eq!(stats.summary().subblocks_truncated, 1);
    }

    #[test]
    fn truncated_input_mid_block_emits_record() {
        let (records, stats, _) =
            assemble("Id: 1\nASIN: A\ncategories: 2\n|Books[10]|Fiction[11]");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category_links.len(), 2);
        assert_eq!(stats.summary().subblocks_truncated, 1);
    }

    #[test]
    fn shared_categories_linked_once_and_interned_once() {
        let (records, stats, categories) = assemble(
            "Id: 1\nASIN: A\ncategories: 2\n|Books[10]|Fiction[11]\n|Books[10]|Poetry[12]\n\
Id: 2\nASIN: B\ncategories: 1\n|Books[10]|Fiction[11]\n",
        );
        let first: Vec<&str> = records[0]
            .category_links
            .iter()
            .map(|l| l.category_id.as_str())
            .collect();
        assert_eq!(first, vec!["10", "11", "12"]);
        assert_eq!(records[1].category_links.len(), 2);
        assert!(records[1].categories.is_empty());
        assert_eq!(stats.summary().categories_interned, 3);
        assert_eq!(categories.pending_edges(), 2);
    }

    #[test]
    fn self_edge_in_path_is_rejected() {
        let (_, stats, categories) = assemble("Id: 1\nASIN: A\ncategories: 1\n|Loop[7]|Loop[7]\n");
        assert_eq!(categories.pending_edges(), 0);
        assert_eq!(stats.summary().self_edges_rejected, 1);
    }

    #[test]
    fn header_lines_before_first_record_are_ignored() {
        let (records, stats, _) = assemble(
            "# Full information about Amazon Share the Love products\nTotal items: 1\n\nId: 0\nASIN: 0771044445\n  discontinued product\n",
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].product.id, 0);
        assert!(!records[0].product.active);
        assert_eq!(stats.summary().stray_fields, 0);
    }

    #[test]
    fn repeated_asin_is_dropped() {
        let (records, stats, _) = assemble(
            "Id: 1\nASIN: B001\nId: 2\nASIN: B001\ncategories: 1\n|Toys[1]\n\
reviews: total: 1 downloaded: 1 avg rating: 5\n\
2001-1-1 customer: U1 rating: 5 votes: 0 helpful: 0\nId: 3\nASIN: B003\n",
        );
        let ids: Vec<i64> = records.iter().map(|r| r.product.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(records[1].reviews.is_empty());
        assert!(records[1].category_links.is_empty());
        // The category itself is still carried by the next emitted record.
        assert_eq!(records[1].categories.len(), 1);
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.summary().duplicate_asins, 1);
    }

    #[test]
    fn nul_bytes_never_reach_text_fields() {
        let (records, _, _) = assemble(
            "Id: 1\nASIN: B0\u{0}01\ntitle: Wid\u{0}get\nreviews: total: 1 downloaded: 1 avg rating: 5\n\
2001-1-1 customer: U\u{0}1 rating: 5 votes: 0 helpful: 0\n",
        );
        assert_eq!(records[0].product.asin.as_deref(), Some("B001"));
        assert_eq!(records[0].product.title.as_deref(), Some("Widget"));
        assert_eq!(records[0].reviews[0].customer_id, "U1");
    }

    #[test]
    fn empty_input_yields_nothing() {
        let (records, stats, _) = assemble("");
        assert!(records.is_empty());
        assert_eq!(stats.emitted(), 0);
    }
}
