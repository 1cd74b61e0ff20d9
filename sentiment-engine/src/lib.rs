//! Batch classification, keyword fallback, ticker aggregation and the
//! ingestion pipeline that ties them together.

pub mod aggregator;
pub mod classifier;
pub mod fallback;
pub mod pipeline;
pub mod query;

pub use aggregator::{AggregationSummary, Aggregator};
pub use classifier::BatchClassifier;
pub use fallback::{
    fallback_analysis, CompanyNameResolver, FallbackHeuristic, SymbolResolver, TickerResolver,
};
pub use pipeline::{IngestionPipeline, PipelineSettings, RunReport};
