// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Creator-side state machine of one epoch.
//!
//! `Active -> TryTerminate -> {Active, Terminated}`
//!
//! Completion actions are owned by the non-terminal states. Moving to
//! `Terminated` hands them out, so they can be taken at most once.

use std::mem;

pub(crate) type Action = Box<dyn FnOnce() + Send + Sync + 'static>;

pub(crate) enum Lifecycle {
    Active { actions: Vec<Action> },
    TryTerminate { wave: u64, actions: Vec<Action> },
    Terminated,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Lifecycle::Active {
            actions: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self, Lifecycle::Terminated)
    }

    pub(crate) fn wave(&self) -> Option<u64> {
        match self {
            Lifecycle::TryTerminate { wave, .. } => Some(*wave),
            _ => None,
        }
    }

    /// Queue an action. Hands it back if the epoch already terminated.
    pub(crate) fn push_action(&mut self, action: Action) -> Option<Action> {
        match self {
            Lifecycle::Active { actions } | Lifecycle::TryTerminate { actions, .. } => {
                actions.push(action);
                None
            }
            Lifecycle::Terminated => Some(action),
        }
    }

    /// `Active -> TryTerminate`. Returns `false` from any other state.
    pub(crate) fn begin_wave(&mut self, wave: u64) -> bool {
        match mem::replace(self, Lifecycle::Terminated) {
            Lifecycle::Active { actions } => {
                *self = Lifecycle::TryTerminate { wave, actions };
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// `TryTerminate -> Active` after a wave that did not confirm termination.
    pub(crate) fn abandon_wave(&mut self, wave: u64) -> bool {
        match mem::replace(self, Lifecycle::Terminated) {
            Lifecycle::TryTerminate { wave: w, actions } if w == wave => {
                *self = Lifecycle::Active { actions };
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// Move to `Terminated`, taking the queued actions. `None` if already
    /// terminated.
    pub(crate) fn terminate(&mut self) -> Option<Vec<Action>> {
        match mem::replace(self, Lifecycle::Terminated) {
            Lifecycle::Active { actions } | Lifecycle::TryTerminate { actions, .. } => {
                Some(actions)
            }
            Lifecycle::Terminated => None,
        }
    }
}
