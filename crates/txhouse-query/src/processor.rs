//! Query processor
//!
//! Runs [`TopNQuery`]s against one table:
//!
//! 1. scan with partition pruning, leading-key bounds and skip-index pruning
//! 2. stream rows into a [`GroupAggregator`]
//! 3. rank and trim
//!
//! The whole query runs under `timeout_ms`. Exceeding it is an error; partial
//! results are never returned.

use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::topn::{GroupAggregator, TopNQuery, TopNRow};
use std::sync::Arc;
use std::time::{Duration, Instant};
use txhouse_storage::{PartitionFilter, PartitionInfo, PartitionedStore, ScanRequest};

/// Rows between deadline checks.
const DEADLINE_CHECK_EVERY: u64 = 1000;

pub struct QueryProcessor {
    store: Arc<PartitionedStore>,
    config: QueryConfig,
}

impl QueryProcessor {
    pub fn new(store: Arc<PartitionedStore>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub async fn top_n(&self, query: &TopNQuery) -> Result<Vec<TopNRow>> {
        let budget = self.config.timeout();
        let budget_ms = self.config.timeout_ms;
        match tokio::time::timeout(budget, self.execute_top_n(query, Instant::now(), budget)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout { budget_ms }),
        }
    }

    async fn execute_top_n(
        &self,
        query: &TopNQuery,
        start: Instant,
        budget: Duration,
    ) -> Result<Vec<TopNRow>> {
        query.validate(self.store.schema())?;

        let mut request = ScanRequest::all().partitions(query.partitions.clone());
        for filter in &query.filters {
            request = request.predicate(filter.clone());
        }
        // An equality filter on the leading ordering column also bounds runs by key.
        let leading = self.store.sort_key().leading().map(|c| c.column);
        if let Some(filter) = query
            .filters
            .iter()
            .find(|f| Some(f.column) == leading && f.values.len() == 1)
        {
            request = request.key_prefix(filter.values.clone());
        }

        let mut scan = self.store.scan(request).await?;
        let runs = scan.pending_runs();
        let mut aggregator = GroupAggregator::new(query);
        let mut rows = 0u64;
        check_deadline(start, budget)?;

        while let Some(row) = scan.next().await? {
            aggregator.push(&row);
            rows += 1;
            if rows % DEADLINE_CHECK_EVERY == 0 {
                check_deadline(start, budget)?;
            }
        }
        check_deadline(start, budget)?;

        let groups = aggregator.group_count();
        let result = aggregator.finish(query.rank_limit);
        tracing::debug!(
            runs,
            rows,
            examined = scan.rows_examined(),
            groups,
            result_rows = result.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "top-n query finished"
        );
        Ok(result)
    }

    pub async fn row_count(&self, filter: &PartitionFilter) -> u64 {
        self.store.row_count(filter).await
    }

    pub async fn partitions(&self) -> Vec<PartitionInfo> {
        self.store.list_partitions().await
    }
}

fn check_deadline(start: Instant, budget: Duration) -> Result<()> {
    if start.elapsed() >= budget {
        return Err(QueryError::Timeout {
            budget_ms: budget.as_millis() as u64,
        });
    }
    Ok(())
}
