//! Command line and environment configuration shared by the binaries
use std::time::Duration;

use clap::{Parser, Subcommand};
use primitives::{block::BlockRange, retries::RetryPolicy};
use url::Url;

/// Clickhouse database configuration options
#[derive(Debug, Clone, Parser)]
pub struct ClickhouseOpts {
    /// Clickhouse URL
    #[clap(long = "clickhouse-url", env = "CLICKHOUSE_URL")]
    pub url: Url,
    /// Clickhouse database
    #[clap(long = "clickhouse-db", env = "CLICKHOUSE_DB", default_value = "ethereum_mainnet")]
    pub db: String,
    /// Clickhouse username
    #[clap(long = "clickhouse-username", env = "CLICKHOUSE_USERNAME", default_value = "default")]
    pub username: String,
    /// Clickhouse password
    #[clap(long = "clickhouse-password", env = "CLICKHOUSE_PASSWORD", hide_env_values = true)]
    pub password: String,
}

/// Ethereum node endpoints
#[derive(Debug, Clone, Parser)]
pub struct RpcOpts {
    /// WebSocket endpoint used for the live `newHeads` feed and single-block fetches
    #[clap(long, env = "ETH_WS_URL")]
    pub ws_url: Url,
}

/// HTTP endpoint used by the historical backfill
#[derive(Debug, Clone, Parser)]
pub struct HistoricalRpcOpts {
    /// HTTP JSON-RPC endpoint
    #[clap(long, env = "ETH_HTTP_URL")]
    pub http_url: Url,
}

/// Retry policy for single-block fetches
#[derive(Debug, Clone, Parser)]
pub struct FetchOpts {
    /// Total attempts per block, including the first one
    #[clap(long, env = "FETCH_MAX_ATTEMPTS", default_value = "5")]
    pub fetch_max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    #[clap(long, env = "FETCH_BASE_DELAY_MS", default_value = "500")]
    pub fetch_base_delay_ms: u64,
    /// Upper bound for a single retry delay, in milliseconds
    #[clap(long, env = "FETCH_MAX_DELAY_MS", default_value = "30000")]
    pub fetch_max_delay_ms: u64,
    /// Timeout of a single fetch attempt, in seconds
    #[clap(long, env = "FETCH_ATTEMPT_TIMEOUT_SECS", default_value = "10")]
    pub fetch_attempt_timeout_secs: u64,
}

impl FetchOpts {
    /// Retry policy described by these options.
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch_max_attempts,
            Duration::from_millis(self.fetch_base_delay_ms),
            Duration::from_millis(self.fetch_max_delay_ms),
        )
    }

    /// Per-attempt timeout.
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_attempt_timeout_secs)
    }
}

/// Streaming ingestor options
#[derive(Debug, Clone, Parser)]
pub struct CollectorOpts {
    /// Flush the write buffer every N seconds. `0` writes every block immediately.
    #[clap(long, env = "BATCH_INTERVAL_SECONDS", default_value = "300")]
    pub flush_interval_secs: u64,
    /// Flush early once the buffer holds this many blocks
    #[clap(long, env = "MAX_BUFFER_BLOCKS", default_value = "1000")]
    pub max_buffer_blocks: usize,
    /// Largest gap recovered inline, in blocks; bigger gaps are deferred
    #[clap(long, env = "INLINE_BACKFILL_THRESHOLD", default_value = "5")]
    pub inline_threshold: u64,
    /// Consecutive failed flushes before an emergency alert is raised
    #[clap(long, env = "FATAL_FLUSH_FAILURES", default_value = "3")]
    pub fatal_flush_failures: u32,
    /// Heartbeat ping interval, in seconds. `0` is treated as `1`.
    #[clap(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "300")]
    pub heartbeat_interval_secs: u64,
}

impl CollectorOpts {
    /// Flush interval, or `None` in immediate mode.
    pub const fn flush_interval(&self) -> Option<Duration> {
        match self.flush_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Heartbeat interval, at least one second.
    pub const fn heartbeat_interval(&self) -> Duration {
        match self.heartbeat_interval_secs {
            0 => Duration::from_secs(1),
            secs => Duration::from_secs(secs),
        }
    }
}

/// Gap monitor options
#[derive(Debug, Clone, Parser)]
pub struct MonitorOpts {
    /// How long a gap may stay open before an emergency alert, in seconds
    #[clap(long, env = "GAP_GRACE_PERIOD_SECS", default_value = "1800")]
    pub grace_period_secs: u64,
    /// Age of the newest block after which the data is stale, in seconds
    #[clap(long, env = "STALENESS_THRESHOLD_SECS", default_value = "960")]
    pub staleness_threshold_secs: u64,
    /// Tracked gaps not reconfirmed for this long are dropped silently, in seconds
    #[clap(long, env = "GAP_TRACKING_CEILING_SECS", default_value = "604800")]
    pub tracking_ceiling_secs: u64,
    /// Maximum number of missing ranges inspected per cycle
    #[clap(long, env = "GAP_DETECTION_LIMIT", default_value = "20")]
    pub gap_detection_limit: u64,
    /// Run a cycle every N seconds. Without it a single cycle is run.
    #[clap(long, env = "MONITOR_INTERVAL_SECS")]
    pub interval_secs: Option<u64>,
}

impl MonitorOpts {
    /// Grace period.
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Staleness threshold.
    pub const fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    /// Tracking ceiling.
    pub const fn tracking_ceiling(&self) -> Duration {
        Duration::from_secs(self.tracking_ceiling_secs)
    }
}

/// Pushover notification options
#[derive(Debug, Clone, Parser)]
pub struct PushoverOpts {
    /// Pushover application token
    #[clap(long, env = "PUSHOVER_TOKEN", hide_env_values = true)]
    pub pushover_token: Option<String>,
    /// Pushover user key
    #[clap(long, env = "PUSHOVER_USER", hide_env_values = true)]
    pub pushover_user: Option<String>,
    /// Pushover API base URL
    #[clap(long, env = "PUSHOVER_API_URL", default_value = "https://api.pushover.net")]
    pub pushover_api_url: Url,
}

impl PushoverOpts {
    /// Token and user key, if both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.pushover_token, &self.pushover_user) {
            (Some(token), Some(user)) => Some((token.as_str(), user.as_str())),
            _ => None,
        }
    }
}

/// Healthchecks.io dead-man's switch options
#[derive(Debug, Clone, Parser)]
pub struct HealthchecksOpts {
    /// Ping URL. Pings are disabled when unset.
    #[clap(long, env = "HEALTHCHECKS_PING_URL")]
    pub healthchecks_ping_url: Option<Url>,
}

/// Historical backfill options
#[derive(Debug, Clone, Parser)]
pub struct BackfillOpts {
    /// First calendar year to backfill (UTC)
    #[clap(long, env = "START_YEAR", default_value = "2015")]
    pub start_year: i32,
    /// Last calendar year to backfill, inclusive. Defaults to the current year.
    #[clap(long, env = "END_YEAR")]
    pub end_year: Option<i32>,
    /// Number of blocks fetched concurrently
    #[clap(long, env = "FETCH_CONCURRENCY", default_value = "8")]
    pub fetch_concurrency: usize,
    /// Rows per insert batch
    #[clap(long, env = "BATCH_SIZE", default_value = "100000")]
    pub insert_batch_size: usize,
    /// Stop at the first failed chunk instead of moving on
    #[clap(long)]
    pub stop_on_error: bool,
    /// Print the chunk plan without fetching or writing
    #[clap(long, env = "DRY_RUN")]
    pub dry_run: bool,
    /// First block of a targeted range fill, instead of whole years
    #[clap(long, requires = "to_block", conflicts_with_all = ["start_year", "end_year"])]
    pub from_block: Option<u64>,
    /// Last block of a targeted range fill, inclusive
    #[clap(long, requires = "from_block", conflicts_with_all = ["start_year", "end_year"])]
    pub to_block: Option<u64>,
}

impl BackfillOpts {
    /// The block range to fill, when range mode is selected
    pub fn block_range(&self) -> Option<Result<BlockRange, String>> {
        let (from, to) = self.from_block.zip(self.to_block)?;
        Some(if from <= to {
            Ok(BlockRange::new(from, to))
        } else {
            Err(format!("--from-block {from} is after --to-block {to}"))
        })
    }
}

/// CLI options for the real-time collector
#[derive(Debug, Clone, Parser)]
#[clap(name = "collector", about = "Stream new Ethereum blocks into Clickhouse")]
pub struct CollectorCli {
    /// Clickhouse database configuration
    #[clap(flatten)]
    pub clickhouse: ClickhouseOpts,

    /// Node endpoint
    #[clap(flatten)]
    pub rpc: RpcOpts,

    /// Fetch retries
    #[clap(flatten)]
    pub fetch: FetchOpts,

    /// Buffering and backfill
    #[clap(flatten)]
    pub collector: CollectorOpts,

    /// Emergency alerts
    #[clap(flatten)]
    pub pushover: PushoverOpts,

    /// Heartbeat
    #[clap(flatten)]
    pub healthchecks: HealthchecksOpts,

    /// If set, drop & re-create all tables (local/dev only)
    #[clap(long)]
    pub reset_db: bool,
}

/// CLI options for the gap monitor
#[derive(Debug, Clone, Parser)]
#[clap(name = "gap-monitor", about = "Track missing block ranges and alert on persistent gaps")]
pub struct GapMonitorCli {
    /// Clickhouse database configuration
    #[clap(flatten)]
    pub clickhouse: ClickhouseOpts,

    /// Gap tracking
    #[clap(flatten)]
    pub monitor: MonitorOpts,

    /// Notifications
    #[clap(flatten)]
    pub pushover: PushoverOpts,

    /// Dead-man's switch
    #[clap(flatten)]
    pub healthchecks: HealthchecksOpts,
}

/// CLI options for the historical backfill
#[derive(Debug, Clone, Parser)]
#[clap(name = "backfill", about = "Load historical blocks into Clickhouse one calendar year at a time")]
pub struct BackfillCli {
    /// Clickhouse database configuration
    #[clap(flatten)]
    pub clickhouse: ClickhouseOpts,

    /// Historical node endpoint
    #[clap(flatten)]
    pub rpc: HistoricalRpcOpts,

    /// Chunking and batching
    #[clap(flatten)]
    pub backfill: BackfillOpts,

    /// Optional maintenance commands
    #[clap(subcommand)]
    pub command: Option<BackfillCommand>,
}

/// Maintenance commands of the backfill binary
#[derive(Debug, Clone, Subcommand)]
pub enum BackfillCommand {
    /// Create the tables and exit
    InitDb {
        /// Drop & re-create all tables (local/dev only)
        #[clap(long)]
        reset: bool,
    },
}
