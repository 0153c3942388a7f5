// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::{IdError, NodeId, pack, unpack_node, unpack_seq};

/// Handle of an addressable entity; outlives any single node's ownership.
///
/// Layout (MSB to LSB): `[home node: 24 bits][sequence: 40 bits]`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    pub fn new(home: NodeId, seq: u64) -> Result<Self, IdError> {
        pack(home, seq).map(Self)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Node that keeps the fallback directory record for this entity.
    pub fn home(&self) -> NodeId {
        unpack_node(self.0)
    }

    pub fn seq(&self) -> u64 {
        unpack_seq(self.0)
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", self.home().index(), self.seq())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_is_encoded() {
        let id = EntityId::new(NodeId::new(5), 99).unwrap();
        assert_eq!(id.home(), NodeId::new(5));
        assert_eq!(id.seq(), 99);
        assert_eq!(id.to_string(), "@5.99");
    }

    #[test]
    fn test_sequence_overflow() {
        assert!(EntityId::new(NodeId::new(0), u64::MAX).is_err());
    }
}
