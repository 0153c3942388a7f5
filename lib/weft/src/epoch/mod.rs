// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Epoch-scoped distributed termination detection.
//!
//! Every node counts, per epoch, the messages it produced and consumed under
//! that epoch. Creating a child epoch counts as one produce on the parent
//! (plus one open child) at the creating node, and the child's termination
//! counts the matching consume, so a parent can never balance while a child
//! is still live.
//!
//! Once the creator has called [`EpochManager::finish`], it drives detection
//! in waves:
//!
//! 1. the creator sends a sweep to the tree root, which pushes it down the
//!    spanning tree;
//! 2. every node contributes its counter snapshot to a sum reduction tagged
//!    with `(epoch, wave)`;
//! 3. the root compares the global sums with those of the previous wave.
//!
//! The root declares termination only when the current wave is balanced
//! (`produced == consumed`, no open children) *and* identical to the previous
//! wave. A single balanced wave is not trusted: snapshots are taken at
//! different moments on different nodes, but counters only grow, so two
//! consecutive identical balanced sums mean nothing moved in between. An
//! unbalanced wave is re-driven after the retry interval; a balanced but
//! unconfirmed one is re-driven immediately.
//!
//! Termination is disseminated down the tree. Each node records the epoch in
//! its terminated window and drops its counters; the creator runs the
//! completion actions and releases the parent. Local waiters are woken last,
//! so a resolved [`EpochManager::wait_terminated`] implies both.

mod guard;
mod lifecycle;
mod messages;
mod window;

pub use guard::WorkGuard;
pub use messages::TermCounts;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};
use weft_common::{EpochId, NodeId};

use crate::config::TerminationConfig;
use crate::error::{EpochError, FatalReporter, ProtocolViolation};
use crate::handlers::{Handler, am_handler};
use crate::messenger::Messenger;
use crate::reduce::{ReduceTag, ReductionEngine, Sum};
use crate::tree::SpanningTree;

use lifecycle::{Action, Lifecycle};
use messages::{TERM_SWEEP, TERM_VERDICT, TermSweep, TermVerdict, Verdict};
use window::EpochWindow;

#[derive(Default)]
struct EpochRecord {
    counts: TermCounts,
    listeners: Vec<oneshot::Sender<()>>,
    creator: Option<CreatorState>,
}

/// Present only on the node that created the epoch.
struct CreatorState {
    parent: Option<EpochId>,
    lifecycle: Lifecycle,
    finished: bool,
    last_wave: u64,
}

impl CreatorState {
    fn next_wave(&mut self) -> Option<u64> {
        if !self.finished {
            return None;
        }
        self.last_wave += 1;
        self.lifecycle
            .begin_wave(self.last_wave)
            .then_some(self.last_wave)
    }
}

/// Wave history kept by the tree root.
#[derive(Default)]
struct WaveHistory {
    previous: Option<TermCounts>,
    stalled_waves: u64,
}

pub struct EpochManager {
    node: NodeId,
    tree: Arc<SpanningTree>,
    messenger: Arc<Messenger>,
    reductions: Arc<ReductionEngine>,
    fatal: FatalReporter,
    tracker: TaskTracker,
    cancel: CancellationToken,
    config: TerminationConfig,
    next_seq: AtomicU64,
    hang_warnings: AtomicU64,
    records: DashMap<EpochId, EpochRecord>,
    window: RwLock<EpochWindow>,
    root_waves: DashMap<EpochId, WaveHistory>,
}

impl EpochManager {
    pub(crate) fn new(
        tree: Arc<SpanningTree>,
        messenger: Arc<Messenger>,
        reductions: Arc<ReductionEngine>,
        fatal: FatalReporter,
        tracker: TaskTracker,
        cancel: CancellationToken,
        config: TerminationConfig,
    ) -> Self {
        Self {
            node: tree.node(),
            tree,
            messenger,
            reductions,
            fatal,
            tracker,
            cancel,
            config,
            next_seq: AtomicU64::new(0),
            hang_warnings: AtomicU64::new(0),
            records: DashMap::new(),
            window: RwLock::new(EpochWindow::default()),
            root_waves: DashMap::new(),
        }
    }

    /// Create an epoch owned by this node, optionally nested under `parent`.
    ///
    /// Fails with [`EpochError::ParentTerminated`] if this node has already
    /// seen `parent` terminate.
    pub fn new_epoch(&self, parent: Option<EpochId>) -> Result<EpochId, EpochError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let epoch = EpochId::new(self.node, seq).map_err(|_| EpochError::Exhausted)?;

        if let Some(parent) = parent {
            self.with_record(parent, |record| {
                record.counts.produced += 1;
                record.counts.open_children += 1;
            })
            .map_err(|e| match e {
                EpochError::Terminated(p) => EpochError::ParentTerminated(p),
                other => other,
            })?;
        }

        self.records.insert(
            epoch,
            EpochRecord {
                creator: Some(CreatorState {
                    parent,
                    lifecycle: Lifecycle::new(),
                    finished: false,
                    last_wave: 0,
                }),
                ..Default::default()
            },
        );
        debug!(%epoch, ?parent, "epoch created");
        Ok(epoch)
    }

    /// Declare that the creator has injected all of its root work. Detection
    /// starts now.
    pub fn finish(&self, epoch: EpochId) -> Result<(), EpochError> {
        self.ensure_creator(epoch)?;
        let wave = {
            let mut record = self
                .records
                .get_mut(&epoch)
                .ok_or_else(|| self.missing(epoch))?;
            let creator = record
                .creator
                .as_mut()
                .ok_or_else(|| self.missing(epoch))?;
            if creator.finished {
                return Err(EpochError::AlreadyFinished(epoch));
            }
            creator.finished = true;
            creator.next_wave()
        };
        debug!(%epoch, "epoch finished by creator");
        if let Some(wave) = wave {
            self.send_sweep(epoch, wave);
        }
        Ok(())
    }

    /// Run `action` exactly once when `epoch` terminates. Only the creator
    /// may register actions; registering after termination runs the action
    /// immediately.
    pub fn on_terminated<F>(&self, epoch: EpochId, action: F) -> Result<(), EpochError>
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.ensure_creator(epoch)?;
        let action: Action = Box::new(action);
        let leftover = match self.records.get_mut(&epoch) {
            Some(mut record) if !self.is_terminated(epoch) => match record.creator.as_mut() {
                Some(creator) => creator.lifecycle.push_action(action),
                None => return Err(EpochError::UnknownEpoch(epoch)),
            },
            _ if self.is_terminated(epoch) => Some(action),
            _ => return Err(EpochError::UnknownEpoch(epoch)),
        };
        if let Some(action) = leftover {
            action();
        }
        Ok(())
    }

    /// Resolves once this node learns that `epoch` terminated. On the
    /// creator, completion actions have run by then.
    pub fn wait_terminated(&self, epoch: EpochId) -> impl Future<Output = ()> + Send + 'static {
        // a terminated epoch keeps its record until finalize is done with it
        let rx = match self.records.entry(epoch) {
            Entry::Occupied(mut entry) => {
                let (tx, rx) = oneshot::channel();
                entry.get_mut().listeners.push(tx);
                Some(rx)
            }
            Entry::Vacant(_) if self.is_terminated(epoch) => None,
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(EpochRecord::default()).listeners.push(tx);
                Some(rx)
            }
        };
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
        }
    }

    pub fn is_terminated(&self, epoch: EpochId) -> bool {
        self.window.read().contains(epoch)
    }

    /// Count one message produced under `epoch` on this node.
    pub fn produce(&self, epoch: EpochId) -> Result<(), EpochError> {
        self.with_record(epoch, |record| record.counts.produced += 1)
    }

    /// Count one message consumed under `epoch` on this node.
    pub fn consume(&self, epoch: EpochId) -> Result<(), EpochError> {
        self.with_record(epoch, |record| record.counts.consumed += 1)
    }

    /// This node's counters for `epoch`.
    pub fn counts(&self, epoch: EpochId) -> TermCounts {
        self.records
            .get(&epoch)
            .map(|record| record.counts)
            .unwrap_or_default()
    }

    /// Hang warnings emitted by this node while acting as tree root.
    pub fn hang_warnings(&self) -> u64 {
        self.hang_warnings.load(Ordering::Relaxed)
    }

    /// Epochs this node currently keeps counters for.
    pub fn live_epochs(&self) -> usize {
        self.records.len()
    }

    /// Hold `epoch` open until the returned guard is dropped.
    pub fn hold(self: &Arc<Self>, epoch: EpochId) -> Result<WorkGuard, EpochError> {
        self.produce(epoch)?;
        Ok(WorkGuard::new(self.clone(), epoch))
    }

    /// Send a message tagged with `epoch`. The produce event is counted
    /// before the frame leaves and rolled back if the transport refuses it.
    pub fn send(
        &self,
        epoch: EpochId,
        dest: NodeId,
        handler: &str,
        payload: Bytes,
    ) -> Result<(), EpochError> {
        self.produce(epoch)?;
        if let Err(e) = self
            .messenger
            .send_raw(dest, handler, Some(epoch), payload)
        {
            let _ = self.consume(epoch);
            return Err(e.into());
        }
        Ok(())
    }

    fn ensure_creator(&self, epoch: EpochId) -> Result<(), EpochError> {
        if epoch.node() != self.node {
            return Err(EpochError::NotCreator {
                epoch,
                creator: epoch.node(),
            });
        }
        Ok(())
    }

    fn missing(&self, epoch: EpochId) -> EpochError {
        if self.is_terminated(epoch) {
            EpochError::Terminated(epoch)
        } else {
            EpochError::UnknownEpoch(epoch)
        }
    }

    /// Apply `f` to the live record of `epoch`, creating it if needed. The
    /// terminated check runs under the entry lock, so no record can be
    /// revived once termination has been recorded.
    fn with_record<R>(
        &self,
        epoch: EpochId,
        f: impl FnOnce(&mut EpochRecord) -> R,
    ) -> Result<R, EpochError> {
        match self.records.entry(epoch) {
            _ if self.is_terminated(epoch) => Err(EpochError::Terminated(epoch)),
            Entry::Occupied(mut entry) => Ok(f(entry.get_mut())),
            Entry::Vacant(entry) => Ok(f(&mut entry.insert(EpochRecord::default()))),
        }
    }

    // ---- wave protocol -------------------------------------------------

    fn send_sweep(&self, epoch: EpochId, wave: u64) {
        trace!(%epoch, wave, "starting termination wave");
        let sweep = TermSweep { epoch, wave };
        self.messenger.notify(self.tree.root(), TERM_SWEEP, &sweep);
    }

    fn on_sweep(self: &Arc<Self>, sweep: TermSweep) {
        for child in self.tree.children() {
            self.messenger.notify(*child, TERM_SWEEP, &sweep);
        }

        let counts = self.counts(sweep.epoch);
        let tag = ReduceTag::termination(sweep.epoch, sweep.wave);
        let total = match self.reductions.reduce(tag, counts, Sum, false) {
            Ok(total) => total,
            Err(e) => {
                error!(epoch = %sweep.epoch, wave = sweep.wave, error = %e, "termination wave contribution failed");
                return;
            }
        };

        if !self.tree.is_root() {
            return;
        }
        let this = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                result = total => match result {
                    Ok(Some(total)) => this.decide(sweep, total),
                    Ok(None) => {}
                    Err(e) => error!(epoch = %sweep.epoch, wave = sweep.wave, error = %e, "termination wave failed"),
                },
            }
        });
    }

    /// Runs on the tree root once a wave's sums are in.
    fn decide(self: &Arc<Self>, sweep: TermSweep, total: TermCounts) {
        let TermSweep { epoch, wave } = sweep;
        let balanced = total.is_balanced();
        let confirmed = {
            let mut history = self.root_waves.entry(epoch).or_default();
            let unchanged = history.previous == Some(total);
            if !balanced && unchanged {
                history.stalled_waves += 1;
                if self.config.detect_hangs
                    && history.stalled_waves % self.config.hang_frequency.max(1) == 0
                {
                    self.hang_warnings.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        %epoch,
                        wave,
                        produced = total.produced,
                        consumed = total.consumed,
                        open_children = total.open_children,
                        stalled_waves = history.stalled_waves,
                        "termination hang detected"
                    );
                }
            } else {
                history.stalled_waves = 0;
            }
            history.previous = Some(total);
            balanced && unchanged
        };

        trace!(%epoch, wave, ?total, confirmed, "termination wave decided");

        if confirmed {
            self.root_waves.remove(&epoch);
            self.on_verdict(TermVerdict {
                epoch,
                verdict: Verdict::Terminated,
            });
            return;
        }

        let verdict = TermVerdict {
            epoch,
            verdict: Verdict::Continue { wave, balanced },
        };
        self.messenger.notify(epoch.node(), TERM_VERDICT, &verdict);
    }

    fn on_verdict(self: &Arc<Self>, msg: TermVerdict) {
        match msg.verdict {
            Verdict::Terminated => {
                for child in self.tree.children() {
                    self.messenger.notify(*child, TERM_VERDICT, &msg);
                }
                self.finalize(msg.epoch);
            }
            Verdict::Continue { wave, balanced } => self.continue_detection(msg.epoch, wave, balanced),
        }
    }

    fn continue_detection(self: &Arc<Self>, epoch: EpochId, wave: u64, balanced: bool) {
        let next = {
            let Some(mut record) = self.records.get_mut(&epoch) else {
                return;
            };
            let Some(creator) = record.creator.as_mut() else {
                return;
            };
            if !creator.lifecycle.abandon_wave(wave) {
                debug!(%epoch, wave, current = ?creator.lifecycle.wave(), "stale termination verdict");
                return;
            }
            if balanced { creator.next_wave() } else { None }
        };

        if let Some(next) = next {
            self.send_sweep(epoch, next);
            return;
        }
        if balanced {
            return;
        }

        let this = self.clone();
        let delay = self.config.retry_interval();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let next = this
                        .records
                        .get_mut(&epoch)
                        .and_then(|mut record| record.creator.as_mut().and_then(CreatorState::next_wave));
                    if let Some(next) = next {
                        this.send_sweep(epoch, next);
                    }
                }
            }
        });
    }

    fn finalize(&self, epoch: EpochId) {
        // window first: a concurrent with_record sees it under the entry lock
        if !self.window.write().insert(epoch) {
            self.fatal.report(ProtocolViolation::DoubleTermination(epoch));
            return;
        }

        let creator = match self.records.get_mut(&epoch) {
            Some(mut record) => record.creator.take(),
            None => {
                trace!(%epoch, "terminated epoch had no local state");
                return;
            }
        };

        if let Some(creator) = creator {
            let mut lifecycle = creator.lifecycle;
            let Some(actions) = lifecycle.terminate() else {
                self.fatal.report(ProtocolViolation::DoubleTermination(epoch));
                return;
            };
            debug!(%epoch, waves = creator.last_wave, actions = actions.len(), "epoch terminated");
            for action in actions {
                action();
            }

            if let Some(parent) = creator.parent {
                let closed = self.with_record(parent, |record| {
                    record.counts.consumed += 1;
                    record.counts.open_children = record.counts.open_children.saturating_sub(1);
                });
                if let Err(e) = closed {
                    error!(%epoch, %parent, error = %e, "child outlived its parent epoch");
                }
            }
        }

        if let Some((_, record)) = self.records.remove(&epoch) {
            for listener in record.listeners {
                let _ = listener.send(());
            }
        }
    }

    pub(crate) fn system_handlers(self: &Arc<Self>) -> Vec<Handler> {
        let sweep = {
            let manager = self.clone();
            am_handler(TERM_SWEEP, move |ctx| {
                manager.on_sweep(ctx.decode()?);
                Ok(())
            })
            .inline()
            .build()
        };
        let verdict = {
            let manager = self.clone();
            am_handler(TERM_VERDICT, move |ctx| {
                manager.on_verdict(ctx.decode()?);
                Ok(())
            })
            .inline()
            .build()
        };
        vec![sweep, verdict]
    }
}
