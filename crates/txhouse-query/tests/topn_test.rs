//! Top-N queries against a real store

use std::sync::Arc;
use tempfile::TempDir;
use txhouse_core::{Column, MaterializedRow, Row, TableSchema, Value};
use txhouse_query::{QueryConfig, QueryError, QueryProcessor, TopNQuery};
use txhouse_storage::{
    ActiveRun, ColumnPredicate, PartitionFilter, PartitionedStore, StoreConfig,
};

fn row(time: &str, state: &str, category: &str, amount: f64) -> MaterializedRow {
    MaterializedRow::from_row(Row {
        transaction_time: time.to_string(),
        merch: "m".to_string(),
        cat_id: category.to_string(),
        name_1: String::new(),
        name_2: String::new(),
        gender: String::new(),
        street: String::new(),
        one_city: String::new(),
        us_state: state.to_string(),
        jobs: String::new(),
        amount,
        lat: 0.0,
        lon: 0.0,
        merchant_lat: 0.0,
        merchant_lon: 0.0,
        population_city: 0.0,
        target: Some(0),
    })
}

async fn store(dir: &TempDir) -> Arc<PartitionedStore> {
    Arc::new(
        PartitionedStore::open(
            TableSchema::transactions(),
            StoreConfig::with_data_dir(dir.path()),
        )
        .await
        .unwrap(),
    )
}

async fn write(store: &PartitionedStore, rows: Vec<MaterializedRow>) {
    let key = rows[0].partition_key;
    let mut active = ActiveRun::new(key);
    for r in rows {
        active.push(r);
    }
    store.write(key, active.seal(store.sort_key())).await.unwrap();
}

fn triples(rows: &[txhouse_query::TopNRow]) -> Vec<(Value, Value, f64)> {
    rows.iter()
        .map(|r| (r.primary.clone(), r.secondary.clone(), r.value))
        .collect()
}

#[tokio::test]
async fn test_top_category_by_state_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    let t = "2019-01-10 12:00:00";
    write(&store, vec![row(t, "CA", "grocery", 50.0), row(t, "CA", "gas", 80.0)]).await;
    write(&store, vec![row(t, "NY", "grocery", 30.0)]).await;

    let processor = QueryProcessor::new(store, QueryConfig::default());
    let result = processor
        .top_n(&TopNQuery::top_category_by_state())
        .await
        .unwrap();
    assert_eq!(
        triples(&result),
        vec![
            (Value::text("CA"), Value::text("gas"), 80.0),
            (Value::text("NY"), Value::text("grocery"), 30.0),
        ]
    );
    assert!(result.iter().all(|r| r.rank == 1));
}

#[tokio::test]
async fn test_result_is_stable_across_compaction_and_partitions() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    write(&store, vec![row("2019-01-01 00:00:00", "TX", "travel", 12.0)]).await;
    write(&store, vec![row("2019-01-02 00:00:00", "TX", "gas", 40.0)]).await;
    write(&store, vec![row("2019-02-01 00:00:00", "TX", "travel", 90.0)]).await;

    let processor = QueryProcessor::new(store.clone(), QueryConfig::default());
    let before = processor
        .top_n(&TopNQuery::top_category_by_state())
        .await
        .unwrap();
    assert_eq!(triples(&before), vec![(Value::text("TX"), Value::text("travel"), 90.0)]);

    store.compact(201901).await.unwrap();
    let after = processor
        .top_n(&TopNQuery::top_category_by_state())
        .await
        .unwrap();
    assert_eq!(before, after);

    let january = processor
        .top_n(&TopNQuery::top_category_by_state().partitions(PartitionFilter::Eq(201901)))
        .await
        .unwrap();
    assert_eq!(triples(&january), vec![(Value::text("TX"), Value::text("gas"), 40.0)]);
}

#[tokio::test]
async fn test_filters_and_rank_limit() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    let t = "2019-03-03 00:00:00";
    write(
        &store,
        vec![
            row(t, "CA", "gas", 5.0),
            row(t, "CA", "food", 7.0),
            row(t, "CA", "travel", 6.0),
            row(t, "NY", "food", 100.0),
        ],
    )
    .await;

    let processor = QueryProcessor::new(store, QueryConfig::default());
    let result = processor
        .top_n(
            &TopNQuery::top_category_by_state()
                .rank_limit(2)
                .filter(ColumnPredicate::eq(Column::UsState, "CA")),
        )
        .await
        .unwrap();
    assert_eq!(
        triples(&result),
        vec![
            (Value::text("CA"), Value::text("food"), 7.0),
            (Value::text("CA"), Value::text("travel"), 6.0),
        ]
    );
    assert_eq!(result[1].rank, 2);
}

#[tokio::test]
async fn test_empty_store_is_empty_result() {
    let dir = TempDir::new().unwrap();
    let processor = QueryProcessor::new(store(&dir).await, QueryConfig::default());
    let result = processor
        .top_n(&TopNQuery::top_category_by_state())
        .await
        .unwrap();
    assert!(result.is_empty());
    assert_eq!(processor.row_count(&PartitionFilter::All).await, 0);
    assert!(processor.partitions().await.is_empty());
}

#[tokio::test]
async fn test_timeout_is_an_error_not_empty() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    write(&store, vec![row("2019-04-04 00:00:00", "CA", "gas", 1.0)]).await;

    let processor = QueryProcessor::new(store, QueryConfig { timeout_ms: 0 });
    let result = processor.top_n(&TopNQuery::top_category_by_state()).await;
    assert!(matches!(result, Err(QueryError::Timeout { budget_ms: 0 })));
}

#[tokio::test]
async fn test_invalid_query_is_rejected() {
    let dir = TempDir::new().unwrap();
    let processor = QueryProcessor::new(store(&dir).await, QueryConfig::default());
    let result = processor
        .top_n(&TopNQuery::new(Column::UsState, Column::CatId, Column::Jobs))
        .await;
    assert!(matches!(result, Err(QueryError::InvalidQuery(_))));
}

#[tokio::test]
async fn test_introspection() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    write(&store, vec![row("2019-05-01 00:00:00", "CA", "gas", 1.0)]).await;
    write(&store, vec![row("2019-06-01 00:00:00", "CA", "gas", 1.0), row("2019-06-02 00:00:00", "CA", "gas", 2.0)]).await;

    let processor = QueryProcessor::new(store, QueryConfig::default());
    assert_eq!(processor.row_count(&PartitionFilter::All).await, 3);
    assert_eq!(processor.row_count(&PartitionFilter::Eq(201906)).await, 2);
    let partitions = processor.partitions().await;
    assert_eq!(
        partitions.iter().map(|p| p.partition_key).collect::<Vec<_>>(),
        vec![201905, 201906]
    );
}
