//! `ClickHouse` storage for blocks and tracked gaps

/// Row types
pub mod models;
/// Read-only queries
pub mod reader;
/// Table definitions
pub mod schema;
/// Migrations and inserts
pub mod writer;

pub use models::{BlockRow, BlockStatsRow, GapRow, MissingRangeRow};
pub use reader::ClickhouseReader;
pub use schema::{BLOCKS_TABLE, GAP_TRACKING_TABLE, TABLE_SCHEMAS, TABLES, TableSchema};
pub use writer::ClickhouseWriter;
