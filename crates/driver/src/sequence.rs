//! Sequence gap detection over the live feed

use primitives::block::BlockRange;

/// Default largest gap recovered inline
pub const DEFAULT_INLINE_THRESHOLD: u64 = 5;

/// What to do about the blocks between the cursor and an observed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapAction {
    /// The block is the expected one (or the first one seen)
    Advance,
    /// Small gap: fetch these blocks before the observed one
    Inline(BlockRange),
    /// Large gap: hand these blocks to the deferred backfill
    Defer(BlockRange),
    /// The block is at or below the cursor: overwrite, cursor unchanged.
    /// `depth` counts how far below the last accepted block it is.
    Late {
        /// Distance from the last accepted block
        depth: u64,
    },
}

/// Cursor over the block sequence, owned by the ingestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceTracker {
    expected_next: Option<u64>,
    inline_threshold: u64,
}

impl SequenceTracker {
    /// Tracker seeded from the highest stored block. An empty store leaves the
    /// cursor unset until the first observation.
    pub fn seeded(max_stored: Option<u64>, inline_threshold: u64) -> Self {
        Self { expected_next: max_stored.map(|max| max.saturating_add(1)), inline_threshold }
    }

    /// Next expected block number
    pub const fn expected_next(&self) -> Option<u64> {
        self.expected_next
    }

    /// Classify block `number` and move the cursor past it when it is new.
    pub fn observe(&mut self, number: u64) -> GapAction {
        let Some(expected) = self.expected_next else {
            self.expected_next = Some(number.saturating_add(1));
            return GapAction::Advance;
        };

        if number < expected {
            return GapAction::Late { depth: expected - 1 - number };
        }

        self.expected_next = Some(number.saturating_add(1));
        if number == expected {
            return GapAction::Advance;
        }

        let missing = BlockRange::new(expected, number - 1);
        if missing.len() <= self.inline_threshold {
            GapAction::Inline(missing)
        } else {
            GapAction::Defer(missing)
        }
    }
}
