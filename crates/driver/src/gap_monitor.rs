//! Periodic gap monitor: persistent gap tracking, two-tier alerting and the
//! freshness check.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alerting::{Heartbeat, Notification, Notifier};
use chrono::{DateTime, Utc};
use clickhouse::{BlockStatsRow, GapRow};
use eyre::{Result, WrapErr};
use primitives::block::BlockRange;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::{GapSource, GapStore};

/// Thresholds of the gap monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// How long a gap may stay open before the emergency alert
    pub grace_period: Duration,
    /// Maximum age of the newest block before the data counts as stale
    pub staleness_threshold: Duration,
    /// Gaps not reconfirmed for this long are dropped silently
    pub tracking_ceiling: Duration,
    /// Maximum number of missing ranges read per cycle
    pub gap_detection_limit: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(1_800),
            staleness_threshold: Duration::from_secs(960),
            tracking_ceiling: Duration::from_secs(7 * 24 * 3_600),
            gap_detection_limit: 20,
        }
    }
}

/// How the tracked gaps change after one observation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapEvaluation {
    /// Ranges seen for the first time, to insert
    pub new: Vec<GapRow>,
    /// Tracked gaps still missing, `last_seen` already moved to now
    pub refreshed: Vec<GapRow>,
    /// Tracked gaps that just outlived the grace period; `notified` is still
    /// `false` and is latched once the alert is out
    pub persistent: Vec<GapRow>,
    /// Tracked gaps no longer missing
    pub resolved: Vec<GapRow>,
    /// Tracked gaps not reconfirmed within the tracking ceiling
    pub expired: Vec<GapRow>,
}

/// Compare the tracked gaps with the ranges observed at `now` (unix seconds).
///
/// When `truncated` is set the observation hit the detection limit, so a
/// tracked gap missing from it may simply not have made the cut: it is left
/// as it is instead of being announced as resolved.
pub fn evaluate_gaps(
    tracked: &[GapRow],
    observed: &[BlockRange],
    now: u64,
    config: &MonitorConfig,
    truncated: bool,
) -> GapEvaluation {
    let grace = config.grace_period.as_secs();
    let ceiling = config.tracking_ceiling.as_secs();
    let mut eval = GapEvaluation::default();

    let mut live: HashMap<BlockRange, GapRow> = HashMap::new();
    for gap in tracked {
        if now.saturating_sub(gap.last_seen) > ceiling {
            eval.expired.push(*gap);
        } else {
            live.insert(gap.range(), *gap);
        }
    }

    for &range in observed {
        match live.remove(&range) {
            None => eval.new.push(GapRow {
                gap_start: range.start,
                gap_end: range.end,
                gap_size: range.len(),
                first_seen: now,
                last_seen: now,
                notified: false,
            }),
            Some(gap) => {
                let gap = GapRow { last_seen: now, ..gap };
                if !gap.notified && now.saturating_sub(gap.first_seen) > grace {
                    eval.persistent.push(gap);
                } else {
                    eval.refreshed.push(gap);
                }
            }
        }
    }

    if !truncated {
        eval.resolved = live.into_values().collect();
        eval.resolved.sort_by_key(|gap| gap.gap_start);
    }
    eval
}

/// Result of one monitor cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Fresh data and no gap newly past the grace period
    pub healthy: bool,
    /// Newest block within the staleness threshold
    pub fresh: bool,
    /// Gaps seen for the first time
    pub new_gaps: usize,
    /// Gaps that triggered the emergency alert this cycle
    pub persistent_gaps: usize,
    /// Gaps reported as filled
    pub resolved_gaps: usize,
    /// Gaps dropped after the tracking ceiling
    pub expired_gaps: usize,
    /// Gaps still tracked after this cycle
    pub tracked_gaps: usize,
    /// Notifications attempted
    pub notifications: usize,
}

impl CycleOutcome {
    /// Diagnostics attached to the heartbeat ping
    pub fn heartbeat_body(&self) -> String {
        format!(
            "Status: {}\nFresh: {}\nNew gaps: {}\nPersistent gaps: {}\nResolved gaps: {}",
            if self.healthy { "HEALTHY" } else { "UNHEALTHY" },
            self.fresh,
            self.new_gaps,
            self.persistent_gaps,
            self.resolved_gaps
        )
    }
}

/// Freshness of the newest stored block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Freshness {
    stats: BlockStatsRow,
    age_secs: u64,
    fresh: bool,
}

/// Gap monitor over a store that both reports missing ranges and keeps the
/// tracking table.
pub struct GapMonitor<G> {
    store: G,
    notifier: Arc<dyn Notifier>,
    heartbeat: Arc<dyn Heartbeat>,
    config: MonitorConfig,
}

impl<G> std::fmt::Debug for GapMonitor<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapMonitor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<G: GapSource + GapStore> GapMonitor<G> {
    /// Create a new monitor
    pub const fn new(
        store: G,
        notifier: Arc<dyn Notifier>,
        heartbeat: Arc<dyn Heartbeat>,
        config: MonitorConfig,
    ) -> Self {
        Self { store, notifier, heartbeat, config }
    }

    /// Run one cycle at `now` (unix seconds).
    pub async fn run_cycle(&self, now: u64) -> Result<CycleOutcome> {
        let stats = self.store.block_stats().await.wrap_err("failed to read block stats")?;
        let freshness = stats.map(|stats| {
            let age_secs = now.saturating_sub(stats.latest_timestamp);
            Freshness { stats, age_secs, fresh: age_secs <= self.config.staleness_threshold.as_secs() }
        });
        let fresh = freshness.is_some_and(|f| f.fresh);

        let limit = self.config.gap_detection_limit;
        let observed =
            self.store.missing_ranges(limit).await.wrap_err("failed to detect missing ranges")?;
        let truncated = observed.len() as u64 >= limit;
        if truncated {
            warn!(limit, "Gap detection hit its limit, more ranges may be missing");
        }

        let tracked = self.store.tracked_gaps().await.wrap_err("failed to read tracked gaps")?;
        let eval = evaluate_gaps(&tracked, &observed, now, &self.config, truncated);
        info!(
            observed = observed.len(),
            tracked = tracked.len(),
            new = eval.new.len(),
            persistent = eval.persistent.len(),
            resolved = eval.resolved.len(),
            expired = eval.expired.len(),
            "Evaluated gaps"
        );

        for gap in &eval.expired {
            warn!(range = %gap.range(), last_seen = gap.last_seen, "Dropping gap past the tracking ceiling");
            self.store.delete_gap(gap.range()).await?;
        }
        for gap in eval.new.iter().chain(&eval.refreshed) {
            self.store.upsert_gap(gap).await?;
        }

        let mut notifications = 0;

        for gap in &eval.resolved {
            notifications += 1;
            let minutes = now.saturating_sub(gap.first_seen) / 60;
            let message = format!(
                "Previously tracked gap has been filled\n\n\
                 Gap: blocks {} to {}\nSize: {} blocks\nFirst detected: {}\nResolved after: {minutes} minutes",
                thousands(gap.gap_start),
                thousands(gap.gap_end),
                gap.gap_size,
                format_ts(gap.first_seen),
            );
            // the record stays until the notice is out, so a failed send is retried
            if self.send(Notification::normal("GAP RESOLVED", message)).await {
                self.store.delete_gap(gap.range()).await?;
            }
        }

        for gap in &eval.persistent {
            notifications += 1;
            let minutes = now.saturating_sub(gap.first_seen) / 60;
            let message = format!(
                "Gap persists for >{} minutes\n\n\
                 Gap: blocks {} to {}\nSize: {} blocks\nFirst detected: {}\nDuration: {minutes} minutes\n\n\
                 Action required: Manual backfill needed\n\
                 backfill --from-block {} --to-block {}",
                self.config.grace_period.as_secs() / 60,
                thousands(gap.gap_start),
                thousands(gap.gap_end),
                gap.gap_size,
                format_ts(gap.first_seen),
                gap.gap_start,
                gap.gap_end,
            );
            let notified = self.send(Notification::emergency("PERSISTENT GAP", message)).await;
            self.store.upsert_gap(&GapRow { notified, ..*gap }).await?;
        }

        if !fresh {
            notifications += 1;
            let threshold = self.config.staleness_threshold.as_secs();
            let message = match freshness {
                Some(f) => format!(
                    "Data is stale (>{threshold}s old)\n\nLatest block: {}\nAge: {}s\nThreshold: {threshold}s",
                    thousands(f.stats.max_number),
                    f.age_secs
                ),
                None => format!("No blocks stored\n\nThreshold: {threshold}s"),
            };
            self.send(Notification::emergency("DATA STALE", message)).await;
        }

        let healthy = fresh && eval.persistent.is_empty();
        let tracked_gaps = eval.new.len() + eval.refreshed.len() + eval.persistent.len();

        if let Some(f) = freshness.filter(|_| healthy && notifications == 0) {
            let threshold = self.config.staleness_threshold.as_secs();
            let open = eval.new.len() + eval.refreshed.len();
            let sequence = if open == 0 {
                "Complete".to_owned()
            } else {
                format!("{open} open gap(s) within grace period")
            };
            let message = format!(
                "Blocks: {}\nRange: {} to {}\nLatest: #{} @ {}\n\
                 Age: {}s / {threshold}s threshold ({}%)\nMargin: {}s until stale\n\
                 Gaps: {} new | {} tracked | {} resolved\nSequence: {sequence}",
                thousands(f.stats.total),
                thousands(f.stats.min_number),
                thousands(f.stats.max_number),
                thousands(f.stats.max_number),
                format_ts(f.stats.latest_timestamp),
                f.age_secs,
                f.age_secs * 100 / threshold.max(1),
                threshold - f.age_secs,
                eval.new.len(),
                tracked_gaps,
                eval.resolved.len(),
            );
            self.send(Notification::normal("HEALTHY", message)).await;
        }

        let outcome = CycleOutcome {
            healthy,
            fresh,
            new_gaps: eval.new.len(),
            persistent_gaps: eval.persistent.len(),
            resolved_gaps: eval.resolved.len(),
            expired_gaps: eval.expired.len(),
            tracked_gaps,
            notifications,
        };

        if let Err(e) = self.heartbeat.ping(&outcome.heartbeat_body(), healthy).await {
            warn!(err = %e, "Failed to ping heartbeat");
        }

        if healthy {
            info!(?outcome, "Monitor cycle complete");
        } else {
            warn!(?outcome, "Monitor cycle complete, system unhealthy");
        }
        Ok(outcome)
    }

    /// Run one cycle; a failing cycle is reported to the heartbeat as a failure.
    pub async fn run_cycle_reporting(&self, now: u64) -> Result<CycleOutcome> {
        match self.run_cycle(now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(err = %e, "Monitor cycle failed");
                let body = format!("FATAL ERROR\n\n{e:#}");
                if let Err(ping_err) = self.heartbeat.ping(&body, false).await {
                    warn!(err = %ping_err, "Failed to report failed cycle to heartbeat");
                }
                Err(e)
            }
        }
    }

    /// Run a cycle every `period` until `token` is cancelled.
    pub async fn run(&self, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Shutdown requested, stopping gap monitor");
                    break;
                }
                _ = ticker.tick() => {
                    // failures are already reported, the next tick retries
                    let _ = self.run_cycle_reporting(unix_now()).await;
                }
            }
        }
    }

    async fn send(&self, notification: Notification) -> bool {
        match self.notifier.notify(&notification).await {
            Ok(()) => true,
            Err(e) => {
                error!(title = %notification.title, err = %e, "Failed to send notification");
                false
            }
        }
    }
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

fn format_ts(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map_or_else(|| ts.to_string(), |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

/// `1234567` as `1,234,567`
fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
