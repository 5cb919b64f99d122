//! Interval allocation map
//!
//! Tracks used `[offset, offset+length)` intervals over an address space in
//! a B-tree keyed by start offset. Adjacent intervals are always coalesced,
//! so the stored set is the minimal description of the used space.
//!
//! Overlapping `mark_used` calls happen on real, slightly malformed images.
//! Under [`OverlapPolicy::Warn`] they are logged and the union is recorded;
//! under [`OverlapPolicy::Strict`] they fail without touching the map.

use crate::error::{FlashError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};

/// Tag recorded for regions handed out by [`AllocationMap::find_free`].
pub const FIND_FREE_TAG: &str = "findfree";

/// What to do when a newly marked region overlaps an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Log a warning and keep going
    #[default]
    Warn,
    /// Fail with [`FlashError::Overlap`]
    Strict,
}

/// A used region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub offset: u64,
    pub length: u64,
}

impl Interval {
    pub fn new(offset: u64, length: u64) -> Self {
        Interval { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.offset && pos < self.end()
    }

    /// Check if this interval touches another end-to-start
    pub fn is_adjacent(&self, other: &Interval) -> bool {
        self.end() == other.offset || other.end() == self.offset
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Ordered set of non-overlapping, non-adjacent used intervals
#[derive(Debug, Clone)]
pub struct AllocationMap {
    /// start -> length
    used: BTreeMap<u64, u64>,
    policy: OverlapPolicy,
    /// Exclusive upper bound of the address space
    limit: u64,
    /// Lowest offset `find_free` hands out
    floor: u64,
}

impl Default for AllocationMap {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationMap {
    /// Create an empty map over a 32-bit address space
    pub fn new() -> Self {
        Self::with_policy(OverlapPolicy::Warn)
    }

    pub fn with_policy(policy: OverlapPolicy) -> Self {
        AllocationMap {
            used: BTreeMap::new(),
            policy,
            limit: 1u64 << 32,
            floor: 0,
        }
    }

    /// Restrict the address space to `[0, limit)`.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Never place `find_free` results below `floor`, even when the map is empty.
    pub fn with_floor(mut self, floor: u64) -> Self {
        self.floor = floor;
        self
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: OverlapPolicy) {
        self.policy = policy;
    }

    fn checked_end(&self, offset: u64, length: u64) -> Result<u64> {
        match offset.checked_add(length) {
            Some(end) if end <= self.limit => Ok(end),
            _ => Err(FlashError::AddressOverflow { offset, length }),
        }
    }

    /// First stored interval that intersects `[offset, end)`.
    fn first_overlap(&self, offset: u64, end: u64) -> Option<Interval> {
        if let Some((&s, &l)) = self.used.range(..=offset).next_back() {
            if s + l > offset {
                return Some(Interval::new(s, l));
            }
        }
        self.used
            .range((Excluded(offset), Excluded(end)))
            .next()
            .map(|(&s, &l)| Interval::new(s, l))
    }

    /// Record `[offset, offset+length)` as used, merging with neighbours.
    pub fn mark_used(&mut self, offset: u64, length: u64, tag: &str) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let end = self.checked_end(offset, length)?;

        if let Some(hit) = self.first_overlap(offset, end) {
            if self.policy == OverlapPolicy::Strict {
                return Err(FlashError::Overlap {
                    offset,
                    length,
                    tag: tag.to_string(),
                });
            }
            tracing::warn!(
                "overlap: {} {:#x}-{:#x} collides with used {:#x}-{:#x}",
                tag,
                offset,
                end,
                hit.offset,
                hit.end()
            );
        }

        let mut start = offset;
        let mut stop = end;

        // predecessor that overlaps or abuts
        if let Some((&s, &l)) = self.used.range(..=offset).next_back() {
            if s + l >= offset {
                start = s;
                stop = stop.max(s + l);
                self.used.remove(&s);
            }
        }

        // successors starting inside or right at the end of the new interval
        let absorbed: Vec<(u64, u64)> = self
            .used
            .range((Included(offset), Included(stop)))
            .map(|(&s, &l)| (s, l))
            .collect();
        for (s, l) in absorbed {
            stop = stop.max(s + l);
            self.used.remove(&s);
        }

        self.used.insert(start, stop - start);
        Ok(())
    }

    /// Return `[offset, offset+length)` to the free space.
    ///
    /// The whole region must lie inside one used interval.
    pub fn mark_free(&mut self, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let end = self.checked_end(offset, length)?;

        let (s, l) = match self.used.range(..=offset).next_back() {
            Some((&s, &l)) => (s, l),
            None => {
                return Err(FlashError::InvalidFree {
                    offset,
                    length,
                    reason: "nothing to free",
                })
            }
        };
        if s + l <= offset {
            return Err(FlashError::InvalidFree {
                offset,
                length,
                reason: "nothing to free",
            });
        }
        if s + l < end {
            return Err(FlashError::InvalidFree {
                offset,
                length,
                reason: "region extends past used interval",
            });
        }

        self.used.remove(&s);
        if s < offset {
            self.used.insert(s, offset - s);
        }
        if end < s + l {
            self.used.insert(end, s + l - end);
        }
        Ok(())
    }

    /// First-fit search for `length` free bytes, marked used before returning.
    ///
    /// Gaps are scanned from the lowest used offset upward; when none is
    /// large enough the region is placed after the last interval.
    pub fn find_free(&mut self, length: u64) -> Result<u64> {
        self.find_free_aligned(length, 1)
    }

    /// Like [`find_free`](Self::find_free) with the start rounded up to `align`.
    pub fn find_free_aligned(&mut self, length: u64, align: u64) -> Result<u64> {
        let align = align.max(1);
        let mut cursor = self.used.keys().next().copied().unwrap_or(self.floor);
        if length == 0 {
            return Ok(cursor);
        }

        let mut found = None;
        for (&s, &l) in &self.used {
            let candidate = align_up(cursor.max(self.floor), align)
                .ok_or(FlashError::AddressOverflow { offset: cursor, length })?;
            if candidate
                .checked_add(length)
                .map_or(false, |end| end <= s)
            {
                found = Some(candidate);
                break;
            }
            cursor = s + l;
        }
        let offset = match found {
            Some(o) => o,
            None => align_up(cursor.max(self.floor), align)
                .ok_or(FlashError::AddressOverflow { offset: cursor, length })?,
        };

        self.mark_used(offset, length, FIND_FREE_TAG)?;
        Ok(offset)
    }

    /// Check whether `pos` lies in a used interval
    pub fn is_used(&self, pos: u64) -> bool {
        self.used
            .range(..=pos)
            .next_back()
            .map_or(false, |(&s, &l)| pos < s + l)
    }

    /// Check whether the whole region is used
    pub fn is_range_used(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        self.used
            .range(..=offset)
            .next_back()
            .map_or(false, |(&s, &l)| offset + length <= s + l)
    }

    pub fn intervals(&self) -> impl Iterator<Item = Interval> + '_ {
        self.used.iter().map(|(&s, &l)| Interval::new(s, l))
    }

    /// Number of stored (merged) intervals
    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.values().sum()
    }

    /// End of the highest used interval, 0 when empty
    pub fn end(&self) -> u64 {
        self.used
            .iter()
            .next_back()
            .map_or(0, |(&s, &l)| s + l)
    }

    /// Verify the no-overlap / no-adjacency invariant.
    pub fn check_invariants(&self) -> Result<()> {
        let mut prev: Option<Interval> = None;
        for iv in self.intervals() {
            if iv.length == 0 {
                return Err(FlashError::format(format!(
                    "empty interval stored at {:#x}",
                    iv.offset
                )));
            }
            if let Some(p) = prev {
                if p.end() >= iv.offset {
                    return Err(FlashError::format(format!(
                        "intervals {:#x}-{:#x} and {:#x}-{:#x} not merged",
                        p.offset,
                        p.end(),
                        iv.offset,
                        iv.end()
                    )));
                }
            }
            prev = Some(iv);
        }
        Ok(())
    }
}

fn align_up(value: u64, align: u64) -> Option<u64> {
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}
