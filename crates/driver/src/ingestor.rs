//! Streaming ingestor: resolves head notifications into blocks, keeps the
//! sequence gapless and flushes the write buffer to the store.

use std::{sync::Arc, time::Duration};

use alerting::{Notification, Notifier};
use eyre::{Result, WrapErr};
use futures::{Stream, StreamExt};
use primitives::{
    block::Block,
    headers::{HeadNotification, NotificationError},
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backfill::{DeferredBackfill, deferred_pass, inline_backfill},
    fetcher::{BlockFetcher, BlockSource},
    sequence::{DEFAULT_INLINE_THRESHOLD, GapAction, SequenceTracker},
    store::BlockStore,
};

/// Deferred blocks retried per pass
pub const DEFERRED_PASS_LIMIT: usize = 100;

/// Late blocks at least this far below the cursor are logged as a possible reorg
const REORG_WARN_DEPTH: u64 = 64;

/// Flush and recovery settings of the [`Ingestor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestorConfig {
    /// Time between flushes; `None` flushes every resolved block right away
    pub flush_interval: Option<Duration>,
    /// Buffer size that triggers an early flush
    pub max_buffer_blocks: usize,
    /// Largest gap recovered inline
    pub inline_threshold: u64,
    /// Consecutive flush failures before the emergency alert
    pub fatal_flush_failures: u32,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Some(Duration::from_secs(300)),
            max_buffer_blocks: 1_000,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            fatal_flush_failures: 3,
        }
    }
}

/// Owns the cursor, the write buffer and the deferred list. Driven by a single
/// task, so none of that state is shared.
pub struct Ingestor<S, W> {
    fetcher: BlockFetcher<S>,
    store: W,
    notifier: Arc<dyn Notifier>,
    config: IngestorConfig,
    tracker: SequenceTracker,
    buffer: Vec<Block>,
    deferred: DeferredBackfill,
    flush_failures: u32,
    failure_alerted: bool,
}

impl<S, W> std::fmt::Debug for Ingestor<S, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("config", &self.config)
            .field("tracker", &self.tracker)
            .field("buffered", &self.buffer.len())
            .field("deferred", &self.deferred.len())
            .field("flush_failures", &self.flush_failures)
            .finish_non_exhaustive()
    }
}

impl<S: BlockSource, W: BlockStore> Ingestor<S, W> {
    /// Create an ingestor whose cursor is seeded from the highest stored block.
    pub async fn new(
        fetcher: BlockFetcher<S>,
        store: W,
        notifier: Arc<dyn Notifier>,
        config: IngestorConfig,
    ) -> Result<Self> {
        let max_stored =
            store.max_block_number().await.wrap_err("failed to read the highest stored block")?;
        match max_stored {
            Some(max) => info!(max_stored = max, "Resuming after highest stored block"),
            None => info!("Store is empty, seeding from the first head"),
        }

        Ok(Self {
            fetcher,
            store,
            notifier,
            config,
            tracker: SequenceTracker::seeded(max_stored, config.inline_threshold),
            buffer: Vec::new(),
            deferred: DeferredBackfill::default(),
            flush_failures: 0,
            failure_alerted: false,
        })
    }

    /// Sequence cursor
    pub const fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Blocks waiting for the next flush
    pub fn buffered(&self) -> &[Block] {
        &self.buffer
    }

    /// Blocks still to be recovered
    pub const fn deferred(&self) -> &DeferredBackfill {
        &self.deferred
    }

    /// Current flush failure streak
    pub const fn consecutive_flush_failures(&self) -> u32 {
        self.flush_failures
    }

    /// Consume head notifications until the stream ends or `token` is cancelled,
    /// then flush what is left.
    pub async fn run<St>(&mut self, mut heads: St, token: CancellationToken)
    where
        St: Stream<Item = Result<HeadNotification, NotificationError>> + Unpin,
    {
        let mut ticker = self.config.flush_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        info!(
            expected_next = ?self.tracker.expected_next(),
            flush_interval = ?self.config.flush_interval,
            "Listening for new heads"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Shutdown requested, stopping head listener");
                    break;
                }
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    self.flush(&token).await;
                }
                maybe_head = heads.next() => match maybe_head {
                    Some(Ok(head)) => self.on_head(head, &token).await,
                    Some(Err(e)) => warn!(err = %e, "Skipping malformed head notification"),
                    None => {
                        warn!("Head stream ended");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Resolve one head, recovering any gap in front of it. Fetches still in
    /// flight when `token` is cancelled are abandoned and their blocks deferred.
    pub async fn on_head(&mut self, head: HeadNotification, token: &CancellationToken) {
        let number = head.number;
        match self.tracker.observe(number) {
            GapAction::Advance => {}
            GapAction::Inline(range) => {
                let blocks =
                    inline_backfill(&self.fetcher, range, &mut self.deferred, token).await;
                self.buffer.extend(blocks);
            }
            GapAction::Defer(range) => {
                warn!(block_number = number, missing = %range, "Gap too large to fill inline");
                self.deferred.push_range(range);
            }
            GapAction::Late { depth } if depth >= REORG_WARN_DEPTH => {
                warn!(block_number = number, depth, "Block far below the cursor, possible reorg");
            }
            GapAction::Late { depth } => {
                debug!(block_number = number, depth, "Late block, overwriting");
            }
        }

        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.fetcher.fetch(number) => Some(result),
        };
        match fetched {
            Some(Ok(block)) => self.buffer.push(block),
            Some(Err(e)) => {
                warn!(block_number = number, err = %e, "Failed to resolve head, deferring");
                self.deferred.push(number);
            }
            None => {
                info!(block_number = number, "Shutdown while resolving head, deferring");
                self.deferred.push(number);
            }
        }

        if self.config.flush_interval.is_none() || self.buffer.len() >= self.config.max_buffer_blocks
        {
            self.flush(token).await;
        }
    }

    /// Write the buffer, then give the deferred blocks one more attempt unless
    /// `token` is cancelled. A failed write keeps the buffer for the next flush.
    pub async fn flush(&mut self, token: &CancellationToken) {
        if self.write_buffer().await {
            self.drain_deferred(token).await;
        }
    }

    /// Returns `false` when the write failed.
    async fn write_buffer(&mut self) -> bool {
        if self.buffer.is_empty() {
            return true;
        }
        if let Err(e) = self.store.upsert_blocks(&self.buffer).await {
            self.on_flush_failure(e).await;
            return false;
        }
        info!(
            blocks = self.buffer.len(),
            first = self.buffer.first().map(|b| b.number),
            last = self.buffer.last().map(|b| b.number),
            "Flushed blocks"
        );
        self.deferred.mark_written(self.buffer.iter().map(|b| &b.number));
        self.buffer.clear();
        self.on_flush_success().await;
        true
    }

    async fn drain_deferred(&mut self, token: &CancellationToken) {
        if self.deferred.is_empty() || token.is_cancelled() {
            return;
        }

        let recovered =
            deferred_pass(&self.fetcher, &self.deferred, DEFERRED_PASS_LIMIT, token).await;
        if recovered.is_empty() {
            info!(pending = self.deferred.len(), "Deferred pass recovered nothing");
            return;
        }

        match self.store.upsert_blocks(&recovered).await {
            Ok(()) => {
                self.deferred.mark_written(recovered.iter().map(|b| &b.number));
                info!(
                    recovered = recovered.len(),
                    pending = self.deferred.len(),
                    "Wrote recovered deferred blocks"
                );
            }
            Err(e) => warn!(
                err = %e,
                pending = self.deferred.len(),
                "Failed to write recovered blocks, keeping them deferred"
            ),
        }
    }

    async fn on_flush_failure(&mut self, err: eyre::Report) {
        self.flush_failures += 1;
        error!(
            err = %err,
            consecutive_failures = self.flush_failures,
            buffered = self.buffer.len(),
            "Flush failed, keeping buffer"
        );

        if self.failure_alerted || self.flush_failures < self.config.fatal_flush_failures {
            return;
        }

        let notification = Notification::emergency(
            "FLUSH FAILING",
            format!(
                "{} consecutive flush failures\n\nBuffered blocks: {}\nLast error: {err:#}",
                self.flush_failures,
                self.buffer.len()
            ),
        );
        match self.notifier.notify(&notification).await {
            Ok(()) => self.failure_alerted = true,
            Err(e) => error!(err = %e, "Failed to send flush failure alert"),
        }
    }

    async fn on_flush_success(&mut self) {
        let streak = std::mem::take(&mut self.flush_failures);
        if !std::mem::take(&mut self.failure_alerted) {
            return;
        }

        let notification = Notification::normal(
            "FLUSH RECOVERED",
            format!("Writes succeed again after {streak} consecutive failures"),
        );
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(err = %e, "Failed to send flush recovery notice");
        }
    }

    /// Final write of the buffer. Deferred blocks are left to the gap monitor.
    async fn shutdown(&mut self) {
        self.write_buffer().await;

        if !self.buffer.is_empty() {
            error!(blocks = self.buffer.len(), "Exiting with unwritten blocks");
        }
        if !self.deferred.is_empty() {
            let ranges: Vec<String> = self.deferred.ranges().iter().map(ToString::to_string).collect();
            error!(
                pending = self.deferred.len(),
                ranges = %ranges.join(", "),
                "Exiting with deferred blocks still missing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::BlockHash;
    use futures::stream;
    use primitives::{block::BlockRange, retries::RetryPolicy};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::{
        fetcher::FetchError,
        testing::{MemoryStore, RecordingNotifier, ScriptedSource},
    };

    type Feed = Result<HeadNotification, NotificationError>;

    fn head(number: u64) -> Feed {
        Ok(HeadNotification { number, hash: BlockHash::ZERO, timestamp: 0 })
    }

    fn immediate() -> IngestorConfig {
        IngestorConfig { flush_interval: None, ..Default::default() }
    }

    async fn ingestor(
        source: ScriptedSource,
        store: MemoryStore,
        notifier: RecordingNotifier,
        config: IngestorConfig,
    ) -> Ingestor<ScriptedSource, MemoryStore> {
        let fetcher = BlockFetcher::new(
            source,
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
            Duration::from_secs(5),
        );
        Ingestor::new(fetcher, store, Arc::new(notifier), config).await.unwrap()
    }

    async fn feed(
        ingestor: &mut Ingestor<ScriptedSource, MemoryStore>,
        items: impl IntoIterator<Item = Feed>,
    ) {
        let items: Vec<Feed> = items.into_iter().collect();
        ingestor.run(stream::iter(items), CancellationToken::new()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_is_seeded_from_store_max() {
        let store = MemoryStore::with_blocks(0..=99);
        let ingestor =
            ingestor(ScriptedSource::default(), store, RecordingNotifier::default(), immediate())
                .await;
        assert_eq!(ingestor.tracker().expected_next(), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn contiguous_heads_are_written() {
        let store = MemoryStore::with_blocks(0..=99);
        let mut ingestor = ingestor(
            ScriptedSource::default(),
            store.clone(),
            RecordingNotifier::default(),
            immediate(),
        )
        .await;

        feed(&mut ingestor, (100..=102).map(head)).await;

        assert_eq!(store.numbers(), (0..=102).collect::<Vec<_>>());
        assert_eq!(ingestor.tracker().expected_next(), Some(103));
        assert!(ingestor.buffered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn small_gap_is_filled_before_the_head() {
        let token = CancellationToken::new();
        let store = MemoryStore::with_blocks([99]);
        let config = IngestorConfig { flush_interval: Some(Duration::from_secs(300)), ..immediate() };
        let mut ingestor =
            ingestor(ScriptedSource::default(), store.clone(), RecordingNotifier::default(), config)
                .await;

        ingestor.on_head(head(100).unwrap(), &token).await;
        ingestor.on_head(head(105).unwrap(), &token).await;

        let order: Vec<u64> = ingestor.buffered().iter().map(|b| b.number).collect();
        assert_eq!(order, (100..=105).collect::<Vec<_>>());
        assert!(ingestor.deferred().is_empty());

        ingestor.flush(&token).await;
        assert_eq!(store.numbers(), (99..=105).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn large_gap_is_deferred_and_recovered_after_flush() {
        let token = CancellationToken::new();
        let source = ScriptedSource::default()
            .always_fail(103, FetchError::Transient("connection reset".into()));
        let store = MemoryStore::with_blocks([99]);
        let mut ingestor =
            ingestor(source.clone(), store.clone(), RecordingNotifier::default(), immediate())
                .await;

        // 101..=106 is one block over the inline threshold
        ingestor.on_head(head(100).unwrap(), &token).await;
        ingestor.on_head(head(107).unwrap(), &token).await;

        assert_eq!(ingestor.tracker().expected_next(), Some(108));
        let stored = store.numbers();
        assert!(stored.contains(&107));
        assert!(stored.contains(&106));
        assert!(!stored.contains(&103));
        // deferred blocks get one attempt per pass, not a retry loop
        assert_eq!(source.calls(103), 1);
        assert_eq!(ingestor.deferred().ranges(), vec![BlockRange::new(103, 103)]);

        source.heal(103);
        ingestor.flush(&token).await;
        assert!(ingestor.deferred().is_empty());
        assert_eq!(store.numbers(), (99..=107).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_head_is_deferred_and_stream_continues() {
        let source =
            ScriptedSource::default().always_fail(11, FetchError::Permanent("not found".into()));
        let store = MemoryStore::with_blocks([9]);
        let mut ingestor =
            ingestor(source, store.clone(), RecordingNotifier::default(), immediate()).await;

        feed(&mut ingestor, (10..=12).map(head)).await;

        assert_eq!(store.numbers(), vec![9, 10, 12]);
        assert!(ingestor.deferred().contains(11));
        assert_eq!(ingestor.tracker().expected_next(), Some(13));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_notifications_are_skipped() {
        let store = MemoryStore::with_blocks([0]);
        let mut ingestor = ingestor(
            ScriptedSource::default(),
            store.clone(),
            RecordingNotifier::default(),
            immediate(),
        )
        .await;

        feed(
            &mut ingestor,
            [
                head(1),
                Err(NotificationError::MissingField("number")),
                Err(NotificationError::NotAnObject),
                head(2),
            ],
        )
        .await;

        assert_eq!(store.numbers(), vec![0, 1, 2]);
        assert!(ingestor.deferred().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_block_overwrites_without_moving_cursor() {
        let store = MemoryStore::with_blocks(0..=200);
        store.remove(BlockRange::new(50, 50));
        let mut ingestor = ingestor(
            ScriptedSource::default(),
            store.clone(),
            RecordingNotifier::default(),
            immediate(),
        )
        .await;

        feed(&mut ingestor, [head(50), head(200)]).await;

        assert_eq!(ingestor.tracker().expected_next(), Some(201));
        assert_eq!(store.numbers(), (0..=200).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_heads_replace_the_stored_payload() {
        let store = MemoryStore::with_blocks(0..=200);
        let source = ScriptedSource::default();
        let mut ingestor =
            ingestor(source.clone(), store.clone(), RecordingNotifier::default(), immediate())
                .await;

        // late block below the cursor
        source.revise(150, 21_000);
        feed(&mut ingestor, [head(150)]).await;
        assert_eq!(store.get(150).map(|b| b.gas_used), Some(21_000));

        // the same head twice, served differently the second time
        feed(&mut ingestor, [head(201)]).await;
        assert_eq!(store.get(201).map(|b| b.gas_used), Some(0));
        source.revise(201, 30_000);
        feed(&mut ingestor, [head(201)]).await;
        assert_eq!(store.get(201).map(|b| b.gas_used), Some(30_000));

        assert_eq!(ingestor.tracker().expected_next(), Some(202));
        assert_eq!(store.numbers(), (0..=201).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_buffer_and_alerts_once_per_streak() {
        let token = CancellationToken::new();
        let store = MemoryStore::default();
        store.fail_writes(5);
        let notifier = RecordingNotifier::default();
        let mut ingestor =
            ingestor(ScriptedSource::default(), store.clone(), notifier.clone(), immediate()).await;

        // four flushes on heads plus the final one at stream end
        feed(&mut ingestor, (1..=4).map(head)).await;

        assert!(store.numbers().is_empty());
        assert_eq!(ingestor.buffered().len(), 4);
        assert_eq!(ingestor.consecutive_flush_failures(), 5);
        assert_eq!(notifier.titles(), vec!["FLUSH FAILING".to_owned()]);

        ingestor.flush(&token).await;
        assert_eq!(store.numbers(), vec![1, 2, 3, 4]);
        assert_eq!(ingestor.consecutive_flush_failures(), 0);
        assert_eq!(
            notifier.titles(),
            vec!["FLUSH FAILING".to_owned(), "FLUSH RECOVERED".to_owned()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_flush_alert_is_retried_on_next_failure() {
        let token = CancellationToken::new();
        let store = MemoryStore::default();
        store.fail_writes(10);
        let notifier = RecordingNotifier::default();
        notifier.set_failing(true);
        let config = IngestorConfig { fatal_flush_failures: 2, ..immediate() };
        let mut ingestor =
            ingestor(ScriptedSource::default(), store, notifier.clone(), config).await;

        ingestor.on_head(head(1).unwrap(), &token).await;
        ingestor.on_head(head(2).unwrap(), &token).await;
        assert!(notifier.sent().is_empty());

        notifier.set_failing(false);
        ingestor.on_head(head(3).unwrap(), &token).await;
        ingestor.on_head(head(4).unwrap(), &token).await;
        assert_eq!(notifier.emergencies().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_triggers_early_flush() {
        let store = MemoryStore::default();
        let config = IngestorConfig {
            flush_interval: Some(Duration::from_secs(300)),
            max_buffer_blocks: 3,
            ..Default::default()
        };
        let mut ingestor =
            ingestor(ScriptedSource::default(), store.clone(), RecordingNotifier::default(), config)
                .await;

        feed(&mut ingestor, (1..=5).map(head)).await;

        // one flush when the buffer filled up, one at stream end
        assert_eq!(store.write_calls(), 2);
        assert_eq!(store.numbers(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flush_and_cancellation() {
        let store = MemoryStore::default();
        let config = IngestorConfig {
            flush_interval: Some(Duration::from_secs(300)),
            ..Default::default()
        };
        let mut ingestor =
            ingestor(ScriptedSource::default(), store.clone(), RecordingNotifier::default(), config)
                .await;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                ingestor.run(UnboundedReceiverStream::new(rx), token).await;
                ingestor
            }
        });

        for number in 1..=3 {
            tx.send(head(number)).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.numbers().is_empty());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(store.numbers(), vec![1, 2, 3]);

        tx.send(head(4)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        let ingestor = handle.await.unwrap();

        // the final flush on shutdown writes the rest
        assert_eq!(store.numbers(), vec![1, 2, 3, 4]);
        assert!(ingestor.buffered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_stalled_fetch_still_writes_buffer() {
        let source = ScriptedSource::default();
        let store = MemoryStore::default();
        let fetcher =
            BlockFetcher::new(source.clone(), RetryPolicy::default(), Duration::from_secs(10));
        let mut ingestor = Ingestor::new(
            fetcher,
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            IngestorConfig::default(),
        )
        .await
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                ingestor.run(UnboundedReceiverStream::new(rx), token).await;
                ingestor
            }
        });

        tx.send(head(1)).unwrap();
        tx.send(head(2)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.numbers().is_empty());

        // the node stops answering while 3..=7 are filled inline
        source.set_delay(Some(Duration::from_secs(3_600)));
        tx.send(head(8)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();

        let ingestor = tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("ingestor should stop within the shutdown timeout")
            .unwrap();

        assert_eq!(store.numbers(), vec![1, 2]);
        assert!(ingestor.buffered().is_empty());
        assert_eq!(ingestor.deferred().ranges(), vec![BlockRange::new(3, 8)]);
        assert_eq!(source.calls(4), 0);
    }
}
