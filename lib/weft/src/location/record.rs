// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use weft_common::NodeId;

/// A node's belief about where an entity lives.
///
/// On the owning node the record is authoritative; everywhere else it is a
/// hint that may lag behind by any number of migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub owner: NodeId,
    /// Bumped on every migration.
    pub version: u64,
    /// Set on the departing owner until the new owner acknowledges.
    pub migrating: bool,
}

impl LocationRecord {
    pub fn settled(owner: NodeId, version: u64) -> Self {
        Self {
            owner,
            version,
            migrating: false,
        }
    }

    /// Whether this record should replace `current`. Versions never go
    /// backwards; an equal version only clears a pending-migration flag.
    pub fn supersedes(&self, current: &LocationRecord) -> bool {
        self.version > current.version
            || (self.version == current.version
                && self.owner == current.owner
                && current.migrating
                && !self.migrating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(owner: u32, version: u64, migrating: bool) -> LocationRecord {
        LocationRecord {
            owner: NodeId::new(owner),
            version,
            migrating,
        }
    }

    #[test]
    fn test_versions_only_move_forward() {
        assert!(rec(2, 3, false).supersedes(&rec(1, 2, false)));
        assert!(!rec(1, 2, false).supersedes(&rec(2, 3, false)));
        assert!(!rec(4, 3, false).supersedes(&rec(2, 3, false)));
    }

    #[test]
    fn test_ack_clears_pending_flag() {
        assert!(rec(2, 3, false).supersedes(&rec(2, 3, true)));
        assert!(!rec(2, 3, true).supersedes(&rec(2, 3, false)));
    }
}
