//! Tiered Resource Pool
//!
//! Bounded, reusable byte buffers in three exact size classes. Every
//! buffer is either in its tier's LIFO free list or checked out to exactly
//! one owner; the pool tracks which by id. Buffers are created lazily up
//! to the tier limit, reused without zeroing (callers own confidentiality
//! of prior contents), and destroyed only on pool shutdown.
//!
//! Release violations never double-free: an unknown id or a tag mismatch
//! leaves the accounting as-is (the buffer stays counted as in use) and
//! bumps an error counter.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Buffer size classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferTier {
    Small,
    Medium,
    Large,
}

impl BufferTier {
    pub const ALL: [BufferTier; 3] = [BufferTier::Small, BufferTier::Medium, BufferTier::Large];

    /// Exact byte size of buffers in this tier
    pub const fn size(self) -> usize {
        match self {
            BufferTier::Small => 4096,
            BufferTier::Medium => 65536,
            BufferTier::Large => 1_048_576,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BufferTier::Small => "small",
            BufferTier::Medium => "medium",
            BufferTier::Large => "large",
        }
    }

    const fn index(self) -> usize {
        match self {
            BufferTier::Small => 0,
            BufferTier::Medium => 1,
            BufferTier::Large => 2,
        }
    }

    /// Smallest tier that fits `len` payload bytes
    pub fn for_len(len: usize) -> CoreResult<Self> {
        if len == 0 {
            return Err(CoreError::ZeroAllocation);
        }
        for tier in Self::ALL {
            if len <= tier.size() {
                return Ok(tier);
            }
        }
        Err(CoreError::OversizedAllocation(len))
    }
}

/// Stereo channel a resource is bound to; `None` for channel-agnostic use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelSide {
    Left,
    Right,
    None,
}

impl ChannelSide {
    pub const ALL: [ChannelSide; 3] = [ChannelSide::Left, ChannelSide::Right, ChannelSide::None];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelSide::Left => "left",
            ChannelSide::Right => "right",
            ChannelSide::None => "none",
        }
    }

    const fn index(self) -> usize {
        match self {
            ChannelSide::Left => 0,
            ChannelSide::Right => 1,
            ChannelSide::None => 2,
        }
    }
}

/// Ownership tag recorded at allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferTag {
    pub owner: String,
    pub channel: ChannelSide,
}

impl BufferTag {
    pub fn new(owner: impl Into<String>, channel: ChannelSide) -> Self {
        Self {
            owner: owner.into(),
            channel,
        }
    }
}

impl std::fmt::Display for BufferTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.channel.as_str())
    }
}

/// A checked-out pool buffer
///
/// `data` is the full tier-sized backing; callers track their own payload
/// lengths. Moving the struct moves ownership; the pool keeps only the id.
#[derive(Debug)]
pub struct PooledBuffer {
    id: u64,
    tier: BufferTier,
    tag: BufferTag,
    pub data: Vec<u8>,
}

impl PooledBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tier(&self) -> BufferTier {
        self.tier
    }

    pub fn tag(&self) -> &BufferTag {
        &self.tag
    }

    pub fn capacity(&self) -> usize {
        self.tier.size()
    }

    /// Split into raw parts for handing the backing bytes across an
    /// ownership seam (e.g. into a write job).
    pub fn into_parts(self) -> (u64, Vec<u8>) {
        (self.id, self.data)
    }
}

/// Per-tier buffer limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLimits {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            small: 32,
            medium: 16,
            large: 8,
        }
    }
}

impl PoolLimits {
    fn for_tier(&self, tier: BufferTier) -> usize {
        match tier {
            BufferTier::Small => self.small,
            BufferTier::Medium => self.medium,
            BufferTier::Large => self.large,
        }
    }
}

/// Counters for one tier
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStats {
    pub limit: usize,
    pub allocated: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub free: usize,
}

/// Snapshot of the pool's accounting
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    tiers: [TierStats; 3],
    per_channel: [usize; 3],
    pub release_errors: u64,
}

impl PoolStats {
    pub fn tier(&self, tier: BufferTier) -> &TierStats {
        &self.tiers[tier.index()]
    }

    pub fn channel_in_use(&self, channel: ChannelSide) -> usize {
        self.per_channel[channel.index()]
    }

    pub fn total_in_use(&self) -> usize {
        self.tiers.iter().map(|t| t.in_use).sum()
    }
}

struct TierState {
    limit: usize,
    free: Vec<Vec<u8>>,
    allocated: usize,
    in_use: usize,
    peak_in_use: usize,
}

struct CheckedOut {
    tier: BufferTier,
    tag: BufferTag,
}

struct PoolInner {
    tiers: [TierState; 3],
    checked_out: HashMap<u64, CheckedOut>,
    per_channel: [usize; 3],
    next_id: u64,
    release_errors: u64,
}

/// Bounded tiered buffer allocator
pub struct ResourcePool {
    inner: Mutex<PoolInner>,
}

impl ResourcePool {
    pub fn new(limits: PoolLimits) -> Self {
        let tier_state = |tier: BufferTier| TierState {
            limit: limits.for_tier(tier),
            free: Vec::new(),
            allocated: 0,
            in_use: 0,
            peak_in_use: 0,
        };
        Self {
            inner: Mutex::new(PoolInner {
                tiers: [
                    tier_state(BufferTier::Small),
                    tier_state(BufferTier::Medium),
                    tier_state(BufferTier::Large),
                ],
                checked_out: HashMap::new(),
                per_channel: [0; 3],
                next_id: 0,
                release_errors: 0,
            }),
        }
    }

    /// Check out a buffer of the exact tier size. Never blocks.
    pub fn allocate(&self, tier: BufferTier, tag: BufferTag) -> CoreResult<PooledBuffer> {
        let mut inner = self.inner.lock();
        let state = &mut inner.tiers[tier.index()];

        if state.in_use >= state.limit {
            return Err(CoreError::Exhausted { tier });
        }

        let data = match state.free.pop() {
            Some(data) => data,
            None => {
                // Lazy creation up to the limit; the only allocation site
                state.allocated += 1;
                vec![0u8; tier.size()]
            }
        };
        state.in_use += 1;
        state.peak_in_use = state.peak_in_use.max(state.in_use);

        let id = inner.next_id;
        inner.next_id += 1;
        inner.per_channel[tag.channel.index()] += 1;
        inner.checked_out.insert(
            id,
            CheckedOut {
                tier,
                tag: tag.clone(),
            },
        );

        Ok(PooledBuffer {
            id,
            tier,
            tag,
            data,
        })
    }

    /// Check out the smallest buffer that fits `len` payload bytes.
    pub fn allocate_for_len(&self, len: usize, tag: BufferTag) -> CoreResult<PooledBuffer> {
        self.allocate(BufferTier::for_len(len)?, tag)
    }

    /// Return a buffer, verifying the caller is the recorded owner.
    pub fn release(&self, buffer: PooledBuffer, expected: &BufferTag) -> CoreResult<()> {
        let mut inner = self.inner.lock();

        let Some(record) = inner.checked_out.remove(&buffer.id) else {
            inner.release_errors += 1;
            warn!(id = buffer.id, "release of unknown buffer id");
            return Err(CoreError::UnknownBuffer(buffer.id));
        };

        if record.tag != *expected {
            // Ownership violation: keep the id checked out so accounting
            // never double-frees, surface the error to the caller.
            let held = record.tag.to_string();
            inner.checked_out.insert(buffer.id, record);
            inner.release_errors += 1;
            warn!(
                id = buffer.id,
                held, caller = %expected, "buffer tag mismatch on release"
            );
            return Err(CoreError::TagMismatch {
                id: buffer.id,
                held,
                caller: expected.to_string(),
            });
        }

        let channel_slot = record.tag.channel.index();
        inner.per_channel[channel_slot] = inner.per_channel[channel_slot].saturating_sub(1);
        let state = &mut inner.tiers[record.tier.index()];
        state.in_use -= 1;
        state.free.push(buffer.data);
        Ok(())
    }

    /// Return a buffer by id and backing bytes, trusting the recorded tag.
    ///
    /// Used by seams that only carry `(id, bytes)` across, like the storage
    /// write path. Returns the tag that owned the buffer.
    pub fn release_parts(&self, id: u64, data: Vec<u8>) -> CoreResult<BufferTag> {
        let mut inner = self.inner.lock();

        let Some(record) = inner.checked_out.remove(&id) else {
            inner.release_errors += 1;
            warn!(id, "release of unknown buffer id");
            return Err(CoreError::UnknownBuffer(id));
        };

        let channel_slot = record.tag.channel.index();
        inner.per_channel[channel_slot] = inner.per_channel[channel_slot].saturating_sub(1);
        let state = &mut inner.tiers[record.tier.index()];
        state.in_use -= 1;
        state.free.push(data);
        Ok(record.tag)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let tier_stats = |i: usize| {
            let t = &inner.tiers[i];
            TierStats {
                limit: t.limit,
                allocated: t.allocated,
                in_use: t.in_use,
                peak_in_use: t.peak_in_use,
                free: t.free.len(),
            }
        };
        PoolStats {
            tiers: [tier_stats(0), tier_stats(1), tier_stats(2)],
            per_channel: inner.per_channel,
            release_errors: inner.release_errors,
        }
    }

    /// Apply new tier limits. Refused when any tier's new limit is below
    /// its current in-use count.
    pub fn reconfigure(&self, limits: PoolLimits) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        for tier in BufferTier::ALL {
            let state = &inner.tiers[tier.index()];
            let requested = limits.for_tier(tier);
            if requested < state.in_use {
                return Err(CoreError::ReconfigureRefused {
                    tier,
                    requested,
                    in_use: state.in_use,
                });
            }
        }
        for tier in BufferTier::ALL {
            let state = &mut inner.tiers[tier.index()];
            state.limit = limits.for_tier(tier);
            // Shed surplus free buffers beyond the new limit
            while state.allocated > state.limit && !state.free.is_empty() {
                state.free.pop();
                state.allocated -= 1;
            }
        }
        debug!(?limits, "pool reconfigured");
        Ok(())
    }

    /// Buffers currently checked out
    pub fn outstanding(&self) -> usize {
        self.inner.lock().checked_out.len()
    }

    /// Drop all free buffers. Returns the number still checked out.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.inner.lock();
        for state in inner.tiers.iter_mut() {
            let freed = state.free.len();
            state.free.clear();
            state.allocated -= freed;
        }
        let leaked = inner.checked_out.len();
        if leaked > 0 {
            warn!(leaked, "pool shut down with buffers still checked out");
        }
        leaked
    }
}
