use super::{emit, open_table};
use crate::config::Config;
use crate::OutputFormat;
use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use txhouse_core::{Column, Value};
use txhouse_query::{Aggregation, QueryConfig, QueryProcessor, TopNQuery};
use txhouse_storage::{ColumnPredicate, PartitionFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AggregationArg {
    Max,
    Min,
    Sum,
    Count,
}

impl From<AggregationArg> for Aggregation {
    fn from(arg: AggregationArg) -> Self {
        match arg {
            AggregationArg::Max => Aggregation::Max,
            AggregationArg::Min => Aggregation::Min,
            AggregationArg::Sum => Aggregation::Sum,
            AggregationArg::Count => Aggregation::Count,
        }
    }
}

#[derive(Subcommand)]
pub enum QueryCommands {
    /// Top category per state by aggregated measure (default: max amount)
    TopCategory {
        /// Restrict to one partition (YYYYMM)
        #[arg(short, long)]
        partition: Option<u32>,

        /// Only these states (repeatable)
        #[arg(short, long)]
        state: Vec<String>,

        /// Categories kept per state
        #[arg(short, long, default_value_t = 1)]
        limit: usize,

        /// Column to aggregate
        #[arg(short, long, default_value = "amount")]
        measure: Column,

        #[arg(short, long, value_enum, default_value_t = AggregationArg::Max)]
        aggregation: AggregationArg,

        /// Query budget in milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

pub async fn handle(command: QueryCommands, config: &Config, format: OutputFormat) -> Result<()> {
    match command {
        QueryCommands::TopCategory {
            partition,
            state,
            limit,
            measure,
            aggregation,
            timeout_ms,
        } => {
            let (_catalog, table) = open_table(config).await?;
            let query_config = QueryConfig {
                timeout_ms: timeout_ms.unwrap_or(config.query.timeout_ms),
            };
            let processor = QueryProcessor::new(table, query_config);

            let mut query = TopNQuery::new(Column::UsState, Column::CatId, measure)
                .aggregation(aggregation.into())
                .rank_limit(limit);
            if let Some(key) = partition {
                query = query.partitions(PartitionFilter::Eq(key));
            }
            if !state.is_empty() {
                let values = state.into_iter().map(Value::from).collect();
                query = query.filter(ColumnPredicate::in_list(Column::UsState, values));
            }

            let rows = processor.top_n(&query).await?;
            emit(format, &rows, |rows| {
                if rows.is_empty() {
                    println!("(no rows)");
                }
                for row in rows {
                    if limit > 1 {
                        println!(
                            "{:<4} {:>2}  {:<24} {:>14.2}",
                            row.primary.to_string(),
                            row.rank,
                            row.secondary.to_string(),
                            row.value
                        );
                    } else {
                        println!(
                            "{:<4} {:<24} {:>14.2}",
                            row.primary.to_string(),
                            row.secondary.to_string(),
                            row.value
                        );
                    }
                }
            })
        }
    }
}
