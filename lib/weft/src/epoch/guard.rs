// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::error;
use weft_common::EpochId;

use super::EpochManager;

/// Keeps an epoch from terminating while deferred local work is pending.
///
/// Creating the guard counts a produce event on this node, dropping it
/// counts the matching consume.
#[must_use = "the epoch is released as soon as the guard is dropped"]
pub struct WorkGuard {
    manager: Arc<EpochManager>,
    epoch: EpochId,
}

impl WorkGuard {
    pub(super) fn new(manager: Arc<EpochManager>, epoch: EpochId) -> Self {
        Self { manager, epoch }
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if let Err(e) = self.manager.consume(self.epoch) {
            error!(epoch = %self.epoch, error = %e, "work guard released after termination");
        }
    }
}

impl std::fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGuard")
            .field("epoch", &self.epoch)
            .finish()
    }
}
