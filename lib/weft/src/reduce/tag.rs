// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use weft_common::EpochId;

/// Namespace of a reduction tag.
///
/// Termination waves run in their own scope, so no user tag can collide
/// with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReduceScope {
    User(u64),
    Termination(EpochId),
}

/// Identity of one collective operation. Every participating node must
/// contribute under the same tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReduceTag {
    pub scope: ReduceScope,
    pub seq: u64,
}

impl ReduceTag {
    pub fn user(id: u64, seq: u64) -> Self {
        Self {
            scope: ReduceScope::User(id),
            seq,
        }
    }

    pub(crate) fn termination(epoch: EpochId, wave: u64) -> Self {
        Self {
            scope: ReduceScope::Termination(epoch),
            seq: wave,
        }
    }
}

impl fmt::Display for ReduceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            ReduceScope::User(id) => write!(f, "user:{id}#{}", self.seq),
            ReduceScope::Termination(epoch) => write!(f, "term:{epoch}#{}", self.seq),
        }
    }
}
