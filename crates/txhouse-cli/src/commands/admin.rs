use super::{emit, open_table};
use crate::config::Config;
use crate::OutputFormat;
use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;
use txhouse_storage::{CompactionScheduler, PartitionFilter};

#[derive(Args)]
pub struct PartitionArgs {
    /// Single partition (YYYYMM)
    #[arg(short, long, conflicts_with_all = ["from", "to"])]
    pub partition: Option<u32>,

    /// First partition of an inclusive range
    #[arg(long)]
    pub from: Option<u32>,

    /// Last partition of an inclusive range
    #[arg(long)]
    pub to: Option<u32>,
}

impl PartitionArgs {
    pub fn filter(&self) -> PartitionFilter {
        match (self.partition, self.from, self.to) {
            (Some(key), _, _) => PartitionFilter::Eq(key),
            (None, None, None) => PartitionFilter::All,
            (None, from, to) => PartitionFilter::Range {
                from: from.unwrap_or(0),
                to: to.unwrap_or(u32::MAX),
            },
        }
    }
}

#[derive(Serialize)]
struct Count {
    rows: u64,
}

pub async fn count(args: PartitionArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let (_catalog, table) = open_table(config).await?;
    let rows = table.row_count(&args.filter()).await;
    emit(format, &Count { rows }, |c| println!("{}", c.rows))
}

pub async fn partitions(config: &Config, format: OutputFormat) -> Result<()> {
    let (_catalog, table) = open_table(config).await?;
    let partitions = table.list_partitions().await;
    emit(format, &partitions, |partitions| {
        println!("{:<10} {:>6} {:>12} {:>14}", "PARTITION", "RUNS", "ROWS", "BYTES");
        for p in partitions {
            println!(
                "{:<10} {:>6} {:>12} {:>14}",
                p.partition_key, p.runs, p.rows, p.bytes
            );
        }
    })
}

pub async fn compact(partition: Option<u32>, config: &Config, format: OutputFormat) -> Result<()> {
    let (_catalog, table) = open_table(config).await?;
    let scheduler = CompactionScheduler::new(table.clone(), config.compaction.clone());

    let keys: Vec<u32> = match partition {
        Some(key) => vec![key],
        None => table
            .list_partitions()
            .await
            .into_iter()
            .filter(|p| p.runs > 1)
            .map(|p| p.partition_key)
            .collect(),
    };

    let mut outcomes = Vec::new();
    for key in keys {
        if let Some(outcome) = scheduler.trigger(key).await? {
            outcomes.push(outcome);
        }
    }
    emit(format, &outcomes, |outcomes| {
        if outcomes.is_empty() {
            println!("nothing to compact");
        }
        for o in outcomes {
            println!(
                "{}: merged {} runs ({} rows), {} -> {} bytes in {} ms",
                o.partition_key,
                o.runs_merged,
                o.rows,
                o.bytes_before,
                o.bytes_after,
                o.duration.as_millis()
            );
        }
    })
}

#[derive(Serialize)]
struct Dropped {
    partition: u32,
    dropped: bool,
}

pub async fn drop(partition: u32, config: &Config, format: OutputFormat) -> Result<()> {
    let (_catalog, table) = open_table(config).await?;
    let dropped = table.drop_partition(partition).await?;
    emit(format, &Dropped { partition, dropped }, |d| {
        if d.dropped {
            println!("dropped partition {}", d.partition);
        }
    })?;
    if !dropped {
        bail!("partition {} not found", partition);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(partition: Option<u32>, from: Option<u32>, to: Option<u32>) -> PartitionArgs {
        PartitionArgs { partition, from, to }
    }

    #[test]
    fn test_partition_filter_from_args() {
        assert_eq!(args(None, None, None).filter(), PartitionFilter::All);
        assert_eq!(args(Some(201901), None, None).filter(), PartitionFilter::Eq(201901));
        assert_eq!(
            args(None, Some(201902), None).filter(),
            PartitionFilter::Range {
                from: 201902,
                to: u32::MAX
            }
        );
    }
}
