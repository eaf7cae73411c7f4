//! `txctl load`: publish JSON-lines to an in-process queue and run the ingestion
//! pipeline until every message is committed.

use super::{emit, open_table};
use crate::config::Config;
use crate::OutputFormat;
use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use txhouse_ingest::{IngestPipeline, MemoryOffsetStore, MemoryQueue};
use txhouse_storage::CompactionScheduler;

#[derive(Args)]
pub struct LoadArgs {
    /// JSON-lines file, one transaction object per line (`-` for stdin)
    pub input: PathBuf,

    /// Queue partitions to spread messages over
    #[arg(short, long)]
    pub queue_partitions: Option<u32>,

    /// Stop a queue partition at its first malformed line instead of skipping it
    #[arg(long)]
    pub halt_on_malformed: bool,

    /// Run background compaction while loading
    #[arg(long)]
    pub compact: bool,
}

#[derive(Debug, Serialize)]
struct LoadReport {
    published: u64,
    accepted: u64,
    skipped: u64,
    runs_written: u64,
    partitions: usize,
    complete: bool,
    elapsed_ms: u64,
    failed_partitions: Vec<u32>,
    halted_queue_partitions: Vec<u32>,
}

async fn open_input(path: &PathBuf) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

pub async fn handle(args: LoadArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let start = Instant::now();
    let (_catalog, table) = open_table(config).await?;

    let partitions = args
        .queue_partitions
        .unwrap_or(config.loader.queue_partitions)
        .max(1);
    let queue = Arc::new(MemoryQueue::new(config.loader.topic.clone(), partitions));

    let mut lines = BufReader::new(open_input(&args.input).await?).lines();
    let mut published = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        queue.publish_round_robin(line.to_string());
        published += 1;
    }
    tracing::info!(published, queue_partitions = partitions, "messages published");

    let mut ingest = config.ingest.clone();
    if args.halt_on_malformed {
        ingest.skip_malformed = false;
    }
    let pipeline = IngestPipeline::new(
        ingest,
        queue.clone(),
        Arc::new(MemoryOffsetStore::new()),
        table.clone(),
    );
    let scheduler = args.compact.then(|| {
        let scheduler = CompactionScheduler::new(table.clone(), config.compaction.clone());
        scheduler.start();
        scheduler
    });

    pipeline.start().await?;
    queue.assign_all();
    let targets: BTreeMap<u32, u64> = (0..partitions)
        .map(|p| (p, queue.high_watermark(p)))
        .collect();
    let complete = pipeline
        .wait_for_offsets(&targets, Duration::from_millis(config.loader.load_timeout_ms))
        .await?;
    pipeline.shutdown().await?;
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    let stats = pipeline.stats();
    let report = LoadReport {
        published,
        accepted: stats.accepted,
        skipped: stats.skipped,
        runs_written: stats.runs_written,
        partitions: table.list_partitions().await.len(),
        complete,
        elapsed_ms: start.elapsed().as_millis() as u64,
        failed_partitions: stats.failed_partitions,
        halted_queue_partitions: stats.halted_queue_partitions,
    };
    emit(format, &report, |r| {
        println!(
            "loaded {} of {} messages ({} skipped) into {} partitions, {} runs written in {} ms",
            r.accepted, r.published, r.skipped, r.partitions, r.runs_written, r.elapsed_ms
        );
        if !r.failed_partitions.is_empty() {
            println!("failed storage partitions: {:?}", r.failed_partitions);
        }
        if !r.halted_queue_partitions.is_empty() {
            println!("halted queue partitions: {:?}", r.halted_queue_partitions);
        }
    })?;

    if !report.complete {
        bail!(
            "load incomplete: not every message was committed within {} ms",
            config.loader.load_timeout_ms
        );
    }
    Ok(())
}
