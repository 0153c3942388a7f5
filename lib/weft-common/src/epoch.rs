// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Epoch identifiers.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::{IdError, NodeId, pack, unpack_node, unpack_seq};

/// Identity of a logical phase of causally related work.
///
/// Layout (MSB to LSB): `[creator node: 24 bits][sequence: 40 bits]`
///
/// The creator node is the only node allowed to finish the epoch or attach
/// completion actions to it. Each node hands out sequence numbers from its own
/// counter, so ids never collide across nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochId(u64);

impl EpochId {
    pub fn new(node: NodeId, seq: u64) -> Result<Self, IdError> {
        pack(node, seq).map(Self)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Node that created the epoch.
    pub fn node(&self) -> NodeId {
        unpack_node(self.0)
    }

    /// Per-creator sequence number.
    pub fn seq(&self) -> u64 {
        unpack_seq(self.0)
    }
}

impl Display for EpochId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "E{}.{}", self.node().index(), self.seq())
    }
}
