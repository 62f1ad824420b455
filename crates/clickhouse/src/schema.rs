/// Table schema definition
#[derive(Debug)]
pub struct TableSchema {
    /// Table name
    pub name: &'static str,
    /// Column definitions
    pub columns: &'static str,
    /// Table engine
    pub engine: &'static str,
    /// Partition expression, if any
    pub partition_by: Option<&'static str>,
    /// Sorting key, which is also the replacing key
    pub order_by: &'static str,
}

/// Block table
pub const BLOCKS_TABLE: &str = "blocks";

/// Gap tracking table
pub const GAP_TRACKING_TABLE: &str = "gap_tracking";

/// Names of all tables
pub const TABLES: &[&str] = &[BLOCKS_TABLE, GAP_TRACKING_TABLE];

/// Schema definitions for tables
pub const TABLE_SCHEMAS: &[TableSchema] = &[
    TableSchema {
        name: BLOCKS_TABLE,
        columns: "number UInt64 CODEC(DoubleDelta, ZSTD),
                 timestamp UInt64 CODEC(DoubleDelta, ZSTD),
                 gas_limit UInt64 CODEC(Delta, ZSTD),
                 gas_used UInt64 CODEC(T64, ZSTD),
                 base_fee_per_gas UInt64 CODEC(T64, ZSTD),
                 transaction_count UInt64 CODEC(T64, ZSTD),
                 difficulty UInt256 CODEC(ZSTD(3)),
                 total_difficulty Nullable(UInt256) CODEC(ZSTD(3)),
                 size UInt64 CODEC(T64, ZSTD),
                 blob_gas_used Nullable(UInt64) CODEC(T64, ZSTD),
                 excess_blob_gas Nullable(UInt64) CODEC(T64, ZSTD),
                 inserted_at DateTime64(3) DEFAULT now64()",
        engine: "ReplacingMergeTree(inserted_at)",
        partition_by: Some("toYYYYMM(toDateTime(timestamp))"),
        order_by: "number",
    },
    TableSchema {
        name: GAP_TRACKING_TABLE,
        columns: "gap_start UInt64,
                 gap_end UInt64,
                 gap_size UInt64,
                 first_seen UInt64,
                 last_seen UInt64,
                 notified Bool DEFAULT false",
        engine: "ReplacingMergeTree(last_seen)",
        partition_by: None,
        order_by: "gap_start, gap_end",
    },
];
