//! Core primitives shared by the collector, the gap monitor and the backfill.
/// Block rows and block number ranges
pub mod block;
/// Head notifications from the live feed
pub mod headers;
/// Retry policies and transport retry helpers
pub mod retries;
