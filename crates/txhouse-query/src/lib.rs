//! txhouse-query: analytical queries over partitioned transaction storage.
//!
//! ```ignore
//! let processor = QueryProcessor::new(store, QueryConfig::default());
//! let top = processor.top_n(&TopNQuery::top_category_by_state()).await?;
//! for row in top {
//!     println!("{} {} {}", row.primary, row.secondary, row.value);
//! }
//! ```

pub mod config;
pub mod error;
pub mod processor;
pub mod topn;

pub use config::QueryConfig;
pub use error::{QueryError, Result};
pub use processor::QueryProcessor;
pub use topn::{Aggregation, GroupAggregator, TopNQuery, TopNRow};
