// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-node runtime context.
//!
//! A [`Node`] owns every runtime component of one participant: spanning tree,
//! messenger, handler registry, reduction engine, epoch manager, location
//! directory and migration coordinator. Components reach each other through
//! the node rather than through process-wide state, so any number of nodes
//! can share one process.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use validator::Validate;
use weft_backend::{DataStream, Transport};
use weft_common::{EpochId, NodeId};

use crate::config::{ConfigError, RuntimeConfig};
use crate::epoch::EpochManager;
use crate::error::{FatalReporter, ProtocolViolation};
use crate::handlers::{DispatcherHub, Handler, run_dispatch_loop};
use crate::location::{LocationDirectory, MigrationCoordinator};
use crate::messenger::Messenger;
use crate::reduce::ReductionEngine;
use crate::tree::SpanningTree;

pub struct Node {
    config: RuntimeConfig,
    tree: Arc<SpanningTree>,
    messenger: Arc<Messenger>,
    dispatcher: DispatcherHub,
    reductions: Arc<ReductionEngine>,
    epochs: Arc<EpochManager>,
    directory: Arc<LocationDirectory>,
    migrations: Arc<MigrationCoordinator>,
    fatal: FatalReporter,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Builder for a [`Node`].
pub struct NodeBuilder {
    transport: Option<(Arc<dyn Transport>, DataStream)>,
    config: RuntimeConfig,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Transport for outbound frames and the stream its inbound frames arrive on.
    pub fn transport(mut self, transport: Arc<dyn Transport>, stream: DataStream) -> Self {
        self.transport = Some((transport, stream));
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire up the components and start the dispatch loop. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> Result<Arc<Node>> {
        let (transport, stream) = self
            .transport
            .context("a node needs a transport and its inbound stream")?;
        let config = self.config;
        config.validate().map_err(ConfigError::from)?;

        let cancel = CancellationToken::new();
        let messenger = Arc::new(Messenger::new(transport, cancel.clone()));
        let tree = Arc::new(SpanningTree::with_fanout(
            messenger.num_nodes(),
            messenger.node(),
            config.tree.fanout,
        )?);

        let tracker = TaskTracker::new();
        let fatal = FatalReporter::new(messenger.node(), cancel.clone());

        let reductions = Arc::new(ReductionEngine::new(
            tree.clone(),
            messenger.clone(),
            fatal.clone(),
        ));
        let epochs = Arc::new(EpochManager::new(
            tree.clone(),
            messenger.clone(),
            reductions.clone(),
            fatal.clone(),
            tracker.clone(),
            cancel.clone(),
            config.termination.clone(),
        ));
        let directory = Arc::new(LocationDirectory::new(
            messenger.clone(),
            epochs.clone(),
            fatal.clone(),
            config.location.clone(),
        ));
        let migrations = Arc::new(MigrationCoordinator::new(directory.clone()));

        let dispatcher = DispatcherHub::new(tracker.clone());
        let system = reductions
            .system_handlers()
            .into_iter()
            .chain(epochs.system_handlers())
            .chain(directory.system_handlers())
            .chain(migrations.system_handlers());
        for handler in system {
            dispatcher.register_internal_handler(handler)?;
        }

        let node = Arc::new(Node {
            config,
            tree,
            messenger,
            dispatcher,
            reductions,
            epochs,
            directory,
            migrations,
            fatal,
            tracker: tracker.clone(),
            cancel: cancel.clone(),
        });

        tracker.spawn(run_dispatch_loop(node.clone(), stream, cancel));
        info!(
            node = %node.node_id(),
            num_nodes = node.num_nodes(),
            fanout = node.tree.fanout(),
            "node started"
        );
        Ok(node)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    pub fn node_id(&self) -> NodeId {
        self.messenger.node()
    }

    pub fn num_nodes(&self) -> u32 {
        self.messenger.num_nodes()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<SpanningTree> {
        &self.tree
    }

    pub fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    pub fn reductions(&self) -> &Arc<ReductionEngine> {
        &self.reductions
    }

    pub fn directory(&self) -> &Arc<LocationDirectory> {
        &self.directory
    }

    pub fn migrations(&self) -> &Arc<MigrationCoordinator> {
        &self.migrations
    }

    pub fn fatal(&self) -> &FatalReporter {
        &self.fatal
    }

    /// First protocol violation this node hit, if any.
    pub fn fatal_violation(&self) -> Option<ProtocolViolation> {
        self.fatal.violation().cloned()
    }

    pub(crate) fn dispatcher(&self) -> &DispatcherHub {
        &self.dispatcher
    }

    /// Register an application handler. Names starting with `_` are reserved.
    pub fn register_handler(&self, handler: Handler) -> Result<()> {
        self.dispatcher.register_handler(handler)
    }

    /// Names of every handler registered on this node, runtime handlers included.
    pub fn handler_names(&self) -> Vec<String> {
        self.dispatcher.handler_names()
    }

    /// Frames sent by this node that have not yet been handled by their receiver.
    pub fn in_flight(&self) -> usize {
        self.messenger.in_flight()
    }

    /// Send an active message, counted under `epoch` when one is given.
    pub fn send(
        &self,
        epoch: Option<EpochId>,
        dest: NodeId,
        handler: &str,
        payload: Bytes,
    ) -> Result<()> {
        match epoch {
            Some(epoch) => self.epochs.send(epoch, dest, handler, payload)?,
            None => self.messenger.send_raw(dest, handler, None, payload)?,
        }
        Ok(())
    }

    /// Stop the dispatch loop and wait for every spawned handler to finish.
    /// Stop dispatching without waiting for in-flight work to drain.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(&self) {
        debug!(node = %self.node_id(), "shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(node = %self.node_id(), "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_across_tasks<T: Send + Sync>() {}

    #[test]
    fn test_components_are_thread_safe() {
        shared_across_tasks::<Node>();
        shared_across_tasks::<EpochManager>();
        shared_across_tasks::<ReductionEngine>();
        shared_across_tasks::<LocationDirectory>();
        shared_across_tasks::<MigrationCoordinator>();
    }
}
