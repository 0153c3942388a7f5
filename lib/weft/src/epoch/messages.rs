// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::ops::Add;
use weft_common::EpochId;

pub(crate) const TERM_SWEEP: &str = "_term_sweep";
pub(crate) const TERM_VERDICT: &str = "_term_verdict";

/// Asks every node to contribute its counters to wave `wave` of `epoch`.
/// Travels from the creator to the tree root, then down the tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct TermSweep {
    pub epoch: EpochId,
    pub wave: u64,
}

/// One node's counters for an epoch, or their sum over a subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCounts {
    pub produced: u64,
    pub consumed: u64,
    /// Child epochs created and not yet terminated.
    pub open_children: u64,
}

impl TermCounts {
    pub fn is_balanced(&self) -> bool {
        self.produced == self.consumed && self.open_children == 0
    }
}

impl Add for TermCounts {
    type Output = TermCounts;

    fn add(self, rhs: Self) -> Self {
        TermCounts {
            produced: self.produced + rhs.produced,
            consumed: self.consumed + rhs.consumed,
            open_children: self.open_children + rhs.open_children,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Verdict {
    /// Disseminated down the whole tree.
    Terminated,
    /// Sent to the creator only. `balanced` waves are confirmed right away.
    Continue { wave: u64, balanced: bool },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct TermVerdict {
    pub epoch: EpochId,
    pub verdict: Verdict,
}
