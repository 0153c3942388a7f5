// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compact record of terminated epochs.
//!
//! Epochs from one creator mostly terminate in sequence order, so each
//! creator's terminated sequence numbers are kept as a set of disjoint
//! inclusive ranges that merge as gaps close.

use std::collections::{BTreeMap, HashMap};

use weft_common::{EpochId, NodeId};

#[derive(Debug, Default)]
pub(crate) struct EpochWindow {
    per_creator: HashMap<NodeId, RangeSet>,
}

impl EpochWindow {
    /// Record `epoch` as terminated. Returns `false` if it already was.
    pub(crate) fn insert(&mut self, epoch: EpochId) -> bool {
        self.per_creator
            .entry(epoch.node())
            .or_default()
            .insert(epoch.seq())
    }

    pub(crate) fn contains(&self, epoch: EpochId) -> bool {
        self.per_creator
            .get(&epoch.node())
            .is_some_and(|set| set.contains(epoch.seq()))
    }

    #[cfg(test)]
    fn ranges(&self, creator: NodeId) -> usize {
        self.per_creator.get(&creator).map_or(0, |s| s.ranges.len())
    }
}

/// Disjoint inclusive ranges keyed by their start.
#[derive(Debug, Default)]
struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    fn contains(&self, seq: u64) -> bool {
        self.ranges
            .range(..=seq)
            .next_back()
            .is_some_and(|(_, &end)| seq <= end)
    }

    fn insert(&mut self, seq: u64) -> bool {
        if self.contains(seq) {
            return false;
        }

        let mut start = seq;
        let mut end = seq;

        // extend the range ending right before seq
        if let Some((&prev_start, &prev_end)) = self.ranges.range(..seq).next_back()
            && prev_end.checked_add(1) == Some(seq)
        {
            start = prev_start;
            self.ranges.remove(&prev_start);
        }

        // absorb the range starting right after seq
        if let Some(next_start) = seq.checked_add(1)
            && let Some(next_end) = self.ranges.remove(&next_start)
        {
            end = next_end;
        }

        self.ranges.insert(start, end);
        true
    }
}
