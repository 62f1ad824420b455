//! Ingestion core: block fetching, sequence tracking, backfill and gap monitoring
#![allow(clippy::uninlined_format_args)]

/// Inline and deferred recovery of missing blocks
pub mod backfill;
/// Chunked historical backfill by calendar year
pub mod chunked;
/// Single-block fetch with classified retries
pub mod fetcher;
/// Gap tracking, two-tier alerting and the freshness check
pub mod gap_monitor;
/// Streaming ingestor
pub mod ingestor;
/// Sequence gap detection
pub mod sequence;
/// Storage seams
pub mod store;

#[cfg(test)]
mod testing;

pub use chunked::{
    BackfillReport, BulkBlockSource, ChunkPlan, ChunkedBackfill, RangeFill, YearChunk, plan_years,
};
pub use fetcher::{BlockFetcher, BlockSource, FetchError};
pub use gap_monitor::{CycleOutcome, GapMonitor, MonitorConfig, unix_now};
pub use ingestor::{Ingestor, IngestorConfig};
pub use store::{BlockStore, ClickhouseStore, GapSource, GapStore};
