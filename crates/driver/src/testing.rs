//! In-memory fakes for the trait seams

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use alerting::{Heartbeat, Notification, Notifier, Priority};
use async_trait::async_trait;
use clickhouse::{BlockStatsRow, GapRow};
use eyre::{Result, eyre};
use primitives::block::{Block, BlockRange};

use crate::{
    chunked::BulkBlockSource,
    fetcher::{BlockSource, FetchError},
    store::{BlockStore, GapSource, GapStore},
};

/// Timestamp of block zero in the fake chains
pub(crate) const GENESIS_TS: u64 = 1_600_000_000;

/// Block with a 12s slot timestamp
pub(crate) const fn block(number: u64) -> Block {
    Block::empty(number, GENESIS_TS + 12 * number)
}

#[derive(Debug, Default)]
struct ScriptState {
    queued: HashMap<u64, VecDeque<FetchError>>,
    always: HashMap<u64, FetchError>,
    calls: HashMap<u64, u32>,
    revisions: HashMap<u64, u64>,
    delay: Option<Duration>,
}

/// Block source answering every number, except for scripted failures
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedSource {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedSource {
    /// Fail the next fetch of `number` once with `err`
    pub(crate) fn fail(self, number: u64, err: FetchError) -> Self {
        self.state.lock().unwrap().queued.entry(number).or_default().push_back(err);
        self
    }

    /// Fail every fetch of `number` with `err`
    pub(crate) fn always_fail(self, number: u64, err: FetchError) -> Self {
        self.state.lock().unwrap().always.insert(number, err);
        self
    }

    /// Make every fetch take `delay`
    pub(crate) fn delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().delay = Some(delay);
        self
    }

    /// Change the delay of later fetches
    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Serve `number` with a different `gas_used` from now on
    pub(crate) fn revise(&self, number: u64, gas_used: u64) {
        self.state.lock().unwrap().revisions.insert(number, gas_used);
    }

    /// Let `number` be fetched again
    pub(crate) fn heal(&self, number: u64) {
        self.state.lock().unwrap().always.remove(&number);
    }

    /// Number of fetches of `number` so far
    pub(crate) fn calls(&self, number: u64) -> u32 {
        self.state.lock().unwrap().calls.get(&number).copied().unwrap_or_default()
    }
}

#[async_trait]
impl BlockSource for ScriptedSource {
    async fn fetch_block(&self, number: u64) -> Result<Block, FetchError> {
        let (outcome, delay) = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(number).or_default() += 1;
            let queued = state.queued.get_mut(&number).and_then(VecDeque::pop_front);
            let outcome = match queued.or_else(|| state.always.get(&number).cloned()) {
                Some(err) => Err(err),
                None => Ok(match state.revisions.get(&number) {
                    Some(&gas_used) => Block { gas_used, ..block(number) },
                    None => block(number),
                }),
            };
            (outcome, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

#[derive(Debug, Default)]
struct StoreState {
    blocks: BTreeMap<u64, Block>,
    gaps: BTreeMap<(u64, u64), GapRow>,
    failing_writes: u32,
    write_calls: u32,
}

/// Block and gap store kept in memory
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Store holding the given block numbers
    pub(crate) fn with_blocks(numbers: impl IntoIterator<Item = u64>) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().blocks.extend(numbers.into_iter().map(|n| (n, block(n))));
        store
    }

    /// Fail the next `count` block writes
    pub(crate) fn fail_writes(&self, count: u32) {
        self.state.lock().unwrap().failing_writes = count;
    }

    /// Stored block numbers
    pub(crate) fn numbers(&self) -> Vec<u64> {
        self.state.lock().unwrap().blocks.keys().copied().collect()
    }

    /// Stored block `number`
    pub(crate) fn get(&self, number: u64) -> Option<Block> {
        self.state.lock().unwrap().blocks.get(&number).cloned()
    }

    /// Insert blocks directly, bypassing failure injection
    pub(crate) fn insert(&self, numbers: impl IntoIterator<Item = u64>) {
        self.state.lock().unwrap().blocks.extend(numbers.into_iter().map(|n| (n, block(n))));
    }

    /// Remove blocks directly
    pub(crate) fn remove(&self, range: BlockRange) {
        let mut state = self.state.lock().unwrap();
        for number in range.numbers() {
            state.blocks.remove(&number);
        }
    }

    /// Number of block write calls, failed ones included
    pub(crate) fn write_calls(&self) -> u32 {
        self.state.lock().unwrap().write_calls
    }

    /// Tracked gaps
    pub(crate) fn gaps(&self) -> Vec<GapRow> {
        self.state.lock().unwrap().gaps.values().copied().collect()
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn upsert_blocks(&self, blocks: &[Block]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.write_calls += 1;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(eyre!("connection refused"));
        }
        state.blocks.extend(blocks.iter().map(|b| (b.number, b.clone())));
        Ok(())
    }

    async fn max_block_number(&self) -> Result<Option<u64>> {
        Ok(self.state.lock().unwrap().blocks.keys().next_back().copied())
    }

    async fn count_in_range(&self, range: BlockRange) -> Result<u64> {
        Ok(self.state.lock().unwrap().blocks.range(range.start..=range.end).count() as u64)
    }
}

#[async_trait]
impl GapSource for MemoryStore {
    async fn missing_ranges(&self, limit: u64) -> Result<Vec<BlockRange>> {
        let state = self.state.lock().unwrap();
        let numbers: Vec<u64> = state.blocks.keys().copied().collect();
        let mut ranges: Vec<BlockRange> = numbers
            .windows(2)
            .filter(|pair| pair[1] - pair[0] > 1)
            .map(|pair| BlockRange::new(pair[0] + 1, pair[1] - 1))
            .collect();
        ranges.sort_by(|a, b| b.len().cmp(&a.len()).then(a.start.cmp(&b.start)));
        ranges.truncate(limit as usize);
        Ok(ranges)
    }

    async fn block_stats(&self) -> Result<Option<BlockStatsRow>> {
        let state = self.state.lock().unwrap();
        let (Some((min, _)), Some((max, latest))) =
            (state.blocks.first_key_value(), state.blocks.last_key_value())
        else {
            return Ok(None);
        };
        Ok(Some(BlockStatsRow {
            total: state.blocks.len() as u64,
            min_number: *min,
            max_number: *max,
            latest_timestamp: latest.timestamp,
        }))
    }
}

#[async_trait]
impl GapStore for MemoryStore {
    async fn tracked_gaps(&self) -> Result<Vec<GapRow>> {
        Ok(self.gaps())
    }

    async fn upsert_gap(&self, gap: &GapRow) -> Result<()> {
        self.state.lock().unwrap().gaps.insert((gap.gap_start, gap.gap_end), *gap);
        Ok(())
    }

    async fn delete_gap(&self, range: BlockRange) -> Result<()> {
        self.state.lock().unwrap().gaps.remove(&(range.start, range.end));
        Ok(())
    }
}

/// Notifier keeping every notification
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    /// Notifications delivered so far
    pub(crate) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Titles delivered so far
    pub(crate) fn titles(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.title).collect()
    }

    /// Emergency notifications delivered so far
    pub(crate) fn emergencies(&self) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.priority == Priority::Emergency).collect()
    }

    /// Make deliveries fail or succeed
    pub(crate) fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Forget delivered notifications
    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(eyre!("push service unavailable"));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Heartbeat keeping every ping
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingHeartbeat {
    pings: Arc<Mutex<Vec<(String, bool)>>>,
}

impl RecordingHeartbeat {
    /// Pings so far as `(body, healthy)`
    pub(crate) fn pings(&self) -> Vec<(String, bool)> {
        self.pings.lock().unwrap().clone()
    }
}

#[async_trait]
impl Heartbeat for RecordingHeartbeat {
    async fn ping(&self, body: &str, healthy: bool) -> Result<()> {
        self.pings.lock().unwrap().push((body.to_owned(), healthy));
        Ok(())
    }
}

/// Historical source over a contiguous fake chain `0..=head`
#[derive(Debug, Clone)]
pub(crate) struct FakeChain {
    head: u64,
    failing_blocks: Arc<Mutex<HashSet<u64>>>,
    fetched: Arc<Mutex<Vec<BlockRange>>>,
}

impl FakeChain {
    pub(crate) fn new(head: u64) -> Self {
        Self { head, failing_blocks: Arc::default(), fetched: Arc::default() }
    }

    /// Make fetching `number` fail
    pub(crate) fn fail_block(&self, number: u64) {
        self.failing_blocks.lock().unwrap().insert(number);
    }

    /// Let every block be fetched again
    pub(crate) fn heal(&self) {
        self.failing_blocks.lock().unwrap().clear();
    }

    /// Ranges fetched so far
    pub(crate) fn fetched(&self) -> Vec<BlockRange> {
        self.fetched.lock().unwrap().clone()
    }

    fn first_at_or_after(&self, ts: u64) -> u64 {
        ts.saturating_sub(GENESIS_TS).div_ceil(12).min(self.head + 1)
    }
}

#[async_trait]
impl BulkBlockSource for FakeChain {
    async fn range_for_window(&self, start_ts: u64, end_ts: u64) -> Result<Option<BlockRange>> {
        let first = self.first_at_or_after(start_ts);
        let end = self.first_at_or_after(end_ts);
        Ok((first < end).then(|| BlockRange::new(first, end - 1)))
    }

    async fn fetch_range(&self, range: BlockRange) -> Result<Vec<Block>> {
        self.fetched.lock().unwrap().push(range);
        let failing = self.failing_blocks.lock().unwrap().clone();
        if let Some(number) = range.numbers().find(|n| failing.contains(n)) {
            return Err(eyre!("block {number} unavailable"));
        }
        Ok(range.numbers().map(block).collect())
    }
}
