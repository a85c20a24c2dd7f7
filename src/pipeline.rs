/// Pipeline Module
///
/// Runs one credit sync: Extract → Load. There is no retry and no internal
/// schedule; an external scheduler starts the process and each run is a full
/// refresh of the staging table.
use crate::etl::{CreditSink, CreditSource, FetchError, LoadError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The staging table was replaced
    Loaded,
    /// The source returned no rows and the staging table was left alone
    SkippedEmpty,
}

/// Statistics for a completed run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub started_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub records_fetched: usize,
    pub rows_inserted: u64,
    pub elapsed_ms: u64,
}

/// A failed run, by stage
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extract failed: {0}")]
    Extract(#[from] FetchError),

    #[error("load failed after fetching {fetched} records: {source}")]
    Load {
        fetched: usize,
        #[source]
        source: LoadError,
    },
}

pub struct Pipeline {
    source: Box<dyn CreditSource>,
    sink: Box<dyn CreditSink>,
}

impl Pipeline {
    pub fn new(source: Box<dyn CreditSource>, sink: Box<dyn CreditSink>) -> Self {
        Self { source, sink }
    }

    /// Check that both stores are reachable without moving any data
    pub async fn check(&self) -> Result<(), PipelineError> {
        self.source.check().await?;
        tracing::info!("Source reachable: {}", self.source.describe());

        self.sink.check().await.map_err(|source| PipelineError::Load { fetched: 0, source })?;
        tracing::info!("Destination reachable: {}", self.sink.describe());

        Ok(())
    }

    /// Fetch every record from the source and, if there are any, replace the
    /// staging table with them
    pub async fn run(&self) -> Result<PipelineStats, PipelineError> {
        let started_at = Utc::now();
        let start_time = Instant::now();

        tracing::info!("Starting credit sync: {} → {}", self.source.describe(), self.sink.describe());

        let records = self.source.fetch().await?;

        if records.is_empty() {
            tracing::warn!("Source returned no credit records; not sending anything to {}", self.sink.describe());
            return Ok(PipelineStats {
                started_at,
                outcome: RunOutcome::SkippedEmpty,
                records_fetched: 0,
                rows_inserted: 0,
                elapsed_ms: start_time.elapsed().as_millis() as u64,
            });
        }

        let rows_inserted = self
            .sink
            .replace(&records)
            .await
            .map_err(|source| PipelineError::Load { fetched: records.len(), source })?;

        if rows_inserted != records.len() as u64 {
            tracing::warn!("Fetched {} records but the destination reported {} inserted", records.len(), rows_inserted);
        }

        let stats = PipelineStats {
            started_at,
            outcome: RunOutcome::Loaded,
            records_fetched: records.len(),
            rows_inserted,
            elapsed_ms: start_time.elapsed().as_millis() as u64,
        };

        tracing::info!(
            "Credit sync complete: {} fetched, {} inserted in {}ms",
            stats.records_fetched,
            stats.rows_inserted,
            stats.elapsed_ms
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreditRecord;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    fn record(code: &str, credit: i64) -> CreditRecord {
        CreditRecord::new(code, Some(format!("Wholesaler {}", code)), Some(Decimal::ONE), Decimal::from(credit))
    }

    struct StaticSource {
        result: Mutex<Option<Result<Vec<CreditRecord>, FetchError>>>,
        rows: Vec<CreditRecord>,
    }

    impl StaticSource {
        fn rows(rows: Vec<CreditRecord>) -> Self {
            Self { result: Mutex::new(None), rows }
        }

        fn failing(error: FetchError) -> Self {
            Self { result: Mutex::new(Some(Err(error))), rows: Vec::new() }
        }
    }

    #[async_trait]
    impl CreditSource for StaticSource {
        fn describe(&self) -> String {
            "static".to_string()
        }

        async fn check(&self) -> Result<(), FetchError> {
            Ok(())
        }

        async fn fetch(&self) -> Result<Vec<CreditRecord>, FetchError> {
            match self.result.lock().unwrap().take() {
                Some(result) => result,
                None => Ok(self.rows.clone()),
            }
        }
    }

    /// Staging table held in memory, with TRUNCATE committed before the insert
    #[derive(Clone, Default)]
    struct MemorySink {
        table: Arc<Mutex<Vec<CreditRecord>>>,
        truncates: Arc<AtomicUsize>,
        rollbacks: Arc<AtomicUsize>,
        fail_insert: bool,
    }

    #[async_trait]
    impl CreditSink for MemorySink {
        fn describe(&self) -> String {
            "memory".to_string()
        }

        async fn check(&self) -> Result<(), LoadError> {
            Ok(())
        }

        async fn replace(&self, records: &[CreditRecord]) -> Result<u64, LoadError> {
            self.table.lock().unwrap().clear();
            self.truncates.fetch_add(1, Ordering::SeqCst);

            if self.fail_insert {
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
                return Err(LoadError::Insert(sqlx::Error::Protocol("duplicate entry".to_string())));
            }

            self.table.lock().unwrap().extend_from_slice(records);
            Ok(records.len() as u64)
        }
    }

    fn pipeline(source: StaticSource, sink: &MemorySink) -> Pipeline {
        Pipeline::new(Box::new(source), Box::new(sink.clone()))
    }

    #[tokio::test]
    async fn test_run_twice_leaves_exactly_one_copy() {
        let rows = vec![record("A", 10), record("B", -5), record("C", 0)];
        let sink = MemorySink::default();
        let pipeline = pipeline(StaticSource::rows(rows.clone()), &sink);

        pipeline.run().await.unwrap();
        let stats = pipeline.run().await.unwrap();

        assert_eq!(stats.outcome, RunOutcome::Loaded);
        assert_eq!(*sink.table.lock().unwrap(), rows);
    }

    #[tokio::test]
    async fn test_empty_source_skips_load() {
        let sink = MemorySink::default();
        sink.table.lock().unwrap().push(record("OLD", 1));

        let stats = pipeline(StaticSource::rows(Vec::new()), &sink).run().await.unwrap();

        assert_eq!(stats.outcome, RunOutcome::SkippedEmpty);
        assert_eq!(stats.records_fetched, 0);
        assert_eq!(sink.truncates.load(Ordering::SeqCst), 0);
        assert_eq!(*sink.table.lock().unwrap(), vec![record("OLD", 1)]);
    }

    #[tokio::test]
    async fn test_inserted_count_matches_fetched() {
        let rows: Vec<_> = (0..250).map(|i| record(&format!("W{:03}", i), i)).collect();
        let sink = MemorySink::default();

        let stats = pipeline(StaticSource::rows(rows), &sink).run().await.unwrap();

        assert_eq!(stats.records_fetched, 250);
        assert_eq!(stats.rows_inserted, 250);
        assert_eq!(sink.table.lock().unwrap().len(), 250);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_load() {
        let sink = MemorySink::default();
        sink.table.lock().unwrap().push(record("OLD", 1));
        let error = FetchError::Query("Invalid object name 'hando'".into());

        let result = pipeline(StaticSource::failing(error), &sink).run().await;

        assert!(matches!(result, Err(PipelineError::Extract(FetchError::Query(_)))));
        assert_eq!(sink.truncates.load(Ordering::SeqCst), 0);
        assert_eq!(sink.table.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_failure_after_truncate_leaves_table_empty() {
        let sink = MemorySink { fail_insert: true, ..Default::default() };
        sink.table.lock().unwrap().push(record("OLD", 1));

        let result = pipeline(StaticSource::rows(vec![record("A", 10)]), &sink).run().await;

        assert!(matches!(result, Err(PipelineError::Load { fetched: 1, source: LoadError::Insert(_) })));
        assert_eq!(sink.rollbacks.load(Ordering::SeqCst), 1);
        assert!(sink.table.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stats_serialize_for_summary() {
        let stats = PipelineStats {
            started_at: Utc::now(),
            outcome: RunOutcome::SkippedEmpty,
            records_fetched: 0,
            rows_inserted: 0,
            elapsed_ms: 12,
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["outcome"], "skipped_empty");
        assert_eq!(json["elapsed_ms"], 12);
    }
}
