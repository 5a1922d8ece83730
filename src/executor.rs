use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

use crate::catalog::Catalog;
use crate::table::Frame;

/// Function run by the executor on one chunk of input rows.
///
/// Implementations must not keep mutable state between calls: chunks of the
/// same step may run concurrently.
#[async_trait]
pub trait ChunkTransform: Send + Sync {
    async fn transform(&self, input: Frame) -> Result<Frame>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Chunks processed concurrently.
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub chunks: usize,
    pub processed: usize,
    pub deleted: usize,
}

#[derive(Debug)]
struct ChunkJob {
    index: usize,
    frame: Frame,
    versions: Vec<(String, String)>,
}

/// Change-driven batch execution of one transform over an input table.
///
/// Only rows whose content changed since they were last processed are handed
/// to the transform, in chunks of at most `chunk_size` rows. Output rows are
/// written keyed by the input primary key.
pub struct BatchTransform {
    name: String,
    input: String,
    output: String,
    primary_keys: Vec<String>,
    chunk_size: usize,
    labels: Vec<(String, String)>,
    executor_config: ExecutorConfig,
    func: Arc<dyn ChunkTransform>,
}

impl BatchTransform {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        primary_keys: Vec<String>,
        chunk_size: usize,
        func: Arc<dyn ChunkTransform>,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            primary_keys,
            chunk_size: chunk_size.max(1),
            labels: Vec::new(),
            executor_config: ExecutorConfig::default(),
            func,
        }
    }

    pub fn with_labels(mut self, labels: Vec<(String, String)>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The registered transform, for invoking it outside the executor.
    pub fn transform(&self) -> Arc<dyn ChunkTransform> {
        self.func.clone()
    }

    /// Process rows that are new or changed since the last successful run.
    pub async fn run(&self, catalog: &dyn Catalog) -> Result<RunStats> {
        self.execute(catalog, false)
            .await
            .with_context(|| format!("step `{}` failed", self.name))
    }

    /// Reprocess every input row regardless of recorded versions.
    pub async fn run_full(&self, catalog: &dyn Catalog) -> Result<RunStats> {
        self.execute(catalog, true)
            .await
            .with_context(|| format!("step `{}` failed", self.name))
    }

    #[tracing::instrument(
        skip(self, catalog),
        fields(step = %self.name, labels = ?self.labels, run_id = %uuid::Uuid::new_v4().simple())
    )]
    async fn execute(&self, catalog: &dyn Catalog, full: bool) -> Result<RunStats> {
        let run_start = Instant::now();
        let input = catalog.read(&self.input).await?;
        let keys = input.row_keys(&self.primary_keys)?;
        let versions = input.row_versions()?;
        let processed = catalog.processed(&self.name).await?;

        let live: HashSet<&String> = keys.iter().collect();
        let deleted: Vec<String> = processed
            .keys()
            .filter(|k| !live.contains(k))
            .cloned()
            .collect();
        if !deleted.is_empty() {
            tracing::info!(count = deleted.len(), "Removing outputs for deleted input rows");
            catalog.delete_keys(&self.output, &deleted).await?;
            catalog.forget_processed(&self.name, &deleted).await?;
        }

        let changed: Vec<usize> = keys
            .iter()
            .zip(&versions)
            .enumerate()
            .filter(|(_, (key, version))| full || processed.get(*key) != Some(*version))
            .map(|(i, _)| i)
            .collect();

        let jobs: Vec<ChunkJob> = changed
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, rows)| ChunkJob {
                index,
                frame: input.select(rows),
                versions: rows
                    .iter()
                    .map(|&i| (keys[i].clone(), versions[i].clone()))
                    .collect(),
            })
            .collect();

        let stats = RunStats {
            chunks: jobs.len(),
            processed: changed.len(),
            deleted: deleted.len(),
        };
        tracing::info!(
            rows = input.len(),
            changed = stats.processed,
            chunks = stats.chunks,
            chunk_size = self.chunk_size,
            "Running step"
        );

        let (job_tx, job_rx) = flume::unbounded();
        for job in jobs {
            job_tx
                .send(job)
                .map_err(|_| anyhow::anyhow!("Chunk queue is closed"))?;
        }
        drop(job_tx);

        let failed = AtomicBool::new(false);
        let workers = (0..self.executor_config.workers.max(1)).map(|worker| {
            let job_rx = job_rx.clone();
            let failed = &failed;
            async move {
                while let Ok(job) = job_rx.recv_async().await {
                    if failed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(err) = self.run_chunk(catalog, job).await {
                        failed.store(true, Ordering::SeqCst);
                        tracing::error!(worker, "Chunk failed: {:#}", err);
                        return Err(err);
                    }
                }
                Ok(())
            }
        });

        for result in futures::future::join_all(workers).await {
            result?;
        }

        tracing::info!(
            processing_time_ms = run_start.elapsed().as_millis(),
            "Step finished"
        );
        Ok(stats)
    }

    #[tracing::instrument(skip(self, catalog, job), fields(chunk_index = job.index, chunk_rows = job.frame.len()))]
    async fn run_chunk(&self, catalog: &dyn Catalog, job: ChunkJob) -> Result<()> {
        let chunk_start = Instant::now();
        let index = job.index;

        let output = self
            .func
            .transform(job.frame)
            .await
            .with_context(|| format!("chunk {index} failed"))?;

        let output_keys = output
            .row_keys(&self.primary_keys)
            .context("transform output is missing primary-key columns")?;

        let returned: HashSet<&String> = output_keys.iter().collect();
        let stale: Vec<String> = job
            .versions
            .iter()
            .map(|(key, _)| key)
            .filter(|key| !returned.contains(key))
            .cloned()
            .collect();

        catalog.store_chunk(&self.output, &output).await?;
        if !stale.is_empty() {
            catalog.delete_keys(&self.output, &stale).await?;
        }
        catalog.mark_processed(&self.name, job.versions).await?;

        counter!("pipeline_chunks_total", "step" => self.name.clone()).increment(1);
        tracing::debug!(
            output_rows = output.len(),
            processing_time_ms = chunk_start.elapsed().as_millis(),
            "Chunk processed"
        );
        Ok(())
    }
}
