//! Wires the stages together.
//!
//! The parser and record assembler run on a blocking thread and hand finished
//! records through a bounded channel to the async writer, so parsing and
//! database round trips overlap while buffered records stay bounded by the
//! channel capacity plus one batch. Similar-link candidates and the set of
//! seen asins are kept for the whole run and grow with the product count.
//! Cross references are resolved after the channel drains and the last batch
//! is committed.

use crate::assembler::RecordAssembler;
use crate::categories::CategoryResolver;
use crate::config::{IngestConfig, PROGRESS_INTERVAL};
use crate::models::ProductRecord;
use crate::parser::LineSource;
use crate::resolve::{resolve_category_edges, resolve_similar};
use crate::sink::Sink;
use crate::stats::{IngestStats, IngestSummary};
use crate::writer::{BatchWriter, Rows};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What a finished run hands back: the sink and a snapshot of the counters
pub struct IngestOutcome<S> {
    pub sink: S,
    pub summary: IngestSummary,
    pub elapsed: Duration,
}

/// One ingest run. Owns the category state and the writer, so independent
/// pipelines never share accumulators.
pub struct Pipeline<S> {
    config: IngestConfig,
    categories: CategoryResolver,
    writer: BatchWriter<S>,
    stats: Arc<IngestStats>,
}

impl<S: Sink> Pipeline<S> {
    pub fn new(config: IngestConfig, sink: S) -> Self {
        let writer = BatchWriter::new(sink, config.batch_size, Arc::new(IngestStats::new()));
        Self::from_parts(config, CategoryResolver::new(), writer)
    }

    /// Builds a pipeline around existing stages. The writer's counters
    /// become the run's counters.
    pub fn from_parts(
        config: IngestConfig,
        categories: CategoryResolver,
        writer: BatchWriter<S>,
    ) -> Self {
        let stats = writer.stats();
        Self {
            config,
            categories,
            writer,
            stats,
        }
    }

    /// Live counters; still readable after a failed run.
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub async fn run_file(self, path: impl AsRef<Path>) -> Result<IngestOutcome<S>> {
        let path = path.as_ref();
        let source = LineSource::open(path)
            .with_context(|| format!("Failed to open input: {}", path.display()))?;
        info!(input = %path.display(), "Starting ingest");
        self.run(source).await
    }

    pub async fn run<R>(self, source: LineSource<R>) -> Result<IngestOutcome<S>>
    where
        R: BufRead + Send + 'static,
    {
        self.config.validate()?;
        let start = Instant::now();
        let Self {
            config,
            categories,
            mut writer,
            stats,
        } = self;

        let (tx, mut rx) = mpsc::channel::<ProductRecord>(config.queue_capacity);
        let producer = {
            let stats = Arc::clone(&stats);
            tokio::task::spawn_blocking(move || produce(source, categories, tx, &config, stats))
        };

        while let Some(record) = rx.recv().await {
            if let Err(e) = writer.submit(record).await {
                // Closing the channel makes the parser thread stop at its next send.
                drop(rx);
                if let Err(join) = producer.await {
                    warn!(error = %join, "Parser task did not shut down cleanly");
                }
                return Err(e);
            }
        }

        let mut categories = producer.await.context("Parser task panicked")??;
        // Categories interned after the last emitted record.
        writer
            .submit_rows(Rows::Categories(categories.drain_new()))
            .await?;
        let (mut sink, similar) = writer.finish().await?;

        resolve_category_edges(&mut sink, categories.into_edges(), &stats).await?;
        resolve_similar(&mut sink, similar, &stats).await?;
        sink.finalize()
            .await
            .context("Failed to finalize the store")?;

        let elapsed = start.elapsed();
        info!(
            duration_secs = elapsed.as_secs_f64(),
            records = stats.emitted(),
            "Ingest complete"
        );
        Ok(IngestOutcome {
            sink,
            summary: stats.summary(),
            elapsed,
        })
    }
}

/// Parser side of the channel. Returns the category state for the resolver.
fn produce<R: BufRead>(
    source: LineSource<R>,
    categories: CategoryResolver,
    tx: mpsc::Sender<ProductRecord>,
    config: &IngestConfig,
    stats: Arc<IngestStats>,
) -> Result<CategoryResolver> {
    let pb = make_spinner(config.show_progress)?;
    let mut assembler = RecordAssembler::new(source, categories, Arc::clone(&stats));
    let mut emitted = 0u64;

    while let Some(record) = assembler.next_record() {
        if tx.blocking_send(record).is_err() {
            // Writer gave up; its error is the one reported.
            break;
        }
        emitted += 1;

        if emitted % PROGRESS_INTERVAL == 0 {
            pb.set_message(format!("{emitted} records, {} dropped", stats.dropped()));
            info!(
                records = emitted,
                lines = stats.lines_read(),
                "Parsing progress"
            );
        }
        if config.limit.is_some_and(|limit| emitted >= limit) {
            info!(limit = emitted, "Record limit reached");
            break;
        }
    }

    pb.finish_and_clear();
    assembler.finish()
}

fn make_spinner(visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Parsing ...");
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use std::io::Cursor;

    const TWO_RECORDS: &str = "\
Id:   1
ASIN: B001
  title: Widget
  group: Toy
  salesrank: 100
  similar: 2  B002  B003
  categories: 1
   |Toys[1]|Blocks[2]
  reviews: total: 1  downloaded: 1  avg rating: 5.0
    2001-1-1  customer: U1  rating: 5  votes:   2  helpful:   2

Id:   2
ASIN: B002
  title: Gadget
";

    fn source(text: &str) -> LineSource<Cursor<Vec<u8>>> {
        LineSource::new(Cursor::new(text.as_bytes().to_vec()))
    }

    fn config(batch_size: usize) -> IngestConfig {
        IngestConfig {
            batch_size,
            ..IngestConfig::default()
        }
    }

    #[tokio::test]
    async fn end_to_end_into_memory() {
        let outcome = Pipeline::new(config(10), MemorySink::new())
            .run(source(TWO_RECORDS))
            .await
            .unwrap();
        let sink = outcome.sink;

        assert_eq!(sink.products.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(sink.similar.len(), 1);
        assert_eq!(sink.similar.iter().next().unwrap().similar_asin, "B002");
        assert_eq!(sink.category_edges.len(), 1);
        let edge = sink.category_edges.iter().next().unwrap();
        assert_eq!((edge.child_id.as_str(), edge.parent_id.as_str()), ("2", "1"));
        assert!(sink.category_links.contains(&(1, "1".to_string())));
        assert!(sink.category_links.contains(&(1, "2".to_string())));
        assert_eq!(sink.reviews.len(), 1);
        assert!(sink.is_finalized());

        assert_eq!(outcome.summary.records_emitted, 2);
        assert_eq!(outcome.summary.similar_resolved, 1);
        assert_eq!(outcome.summary.similar_unresolved, 1);
        assert_eq!(outcome.summary.flushes, 1);
    }

    #[tokio::test]
    async fn limit_stops_early() {
        let pipeline = Pipeline::new(
            IngestConfig {
                limit: Some(1),
                ..config(10)
            },
            MemorySink::new(),
        );
        let outcome = pipeline.run(source(TWO_RECORDS)).await.unwrap();
        assert_eq!(outcome.sink.products.len(), 1);
        assert!(outcome.sink.similar.is_empty());
        assert_eq!(outcome.sink.categories.len(), 2);
    }

    #[tokio::test]
    async fn writer_failure_stops_the_run() {
        let pipeline = Pipeline::new(config(1), MemorySink::new().fail_on_flush(1));
        let stats = pipeline.stats();
        let err = pipeline.run(source(TWO_RECORDS)).await.err().unwrap();
        assert!(format!("{err:#}").contains("injected failure"));
        assert_eq!(stats.flushes(), 0);
    }

    #[tokio::test]
    async fn preseeded_categories_keep_their_names() {
        let mut categories = CategoryResolver::new();
        categories.intern_or_create("1", "Seeded");
        let stats = Arc::new(IngestStats::new());
        let writer = BatchWriter::new(MemorySink::new(), 10, Arc::clone(&stats));

        let outcome = Pipeline::from_parts(config(10), categories, writer)
            .run(source(TWO_RECORDS))
            .await
            .unwrap();
        assert_eq!(outcome.sink.categories["1"], "Seeded");
        assert_eq!(outcome.sink.categories["2"], "Blocks");
        assert_eq!(stats.emitted(), 2);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let pipeline = Pipeline::new(config(0), MemorySink::new());
        assert!(pipeline.run(source("")).await.is_err());
    }

    #[tokio::test]
    async fn empty_input_still_finalizes() {
        let outcome = Pipeline::new(config(10), MemorySink::new())
            .run(source(""))
            .await
            .unwrap();
        assert!(outcome.sink.products.is_empty());
        assert_eq!(outcome.sink.flushed_batches, vec![0]);
        assert!(outcome.sink.is_finalized());
    }
}
