// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound frame dispatch.
//!
//! Each node runs one dispatch loop. For every frame it decodes the header,
//! rejects frames tagged with an epoch this node already saw terminate, runs
//! the handler (inline or on the tracker) and then records the consume event
//! for the frame's epoch. The consume is counted only after the handler has
//! returned, so any message the handler sent under the same epoch has already
//! been produced by then.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};
use weft_backend::{DataStream, FrameHeader, InboundFrame};
use weft_common::EpochId;

use super::{Context, DispatchMode, Handler};
use crate::error::ProtocolViolation;
use crate::node::Node;

/// Registry of handlers, keyed by name.
pub(crate) struct DispatcherHub {
    handlers: DashMap<String, Arc<Handler>>,
    tracker: TaskTracker,
}

impl DispatcherHub {
    pub(crate) fn new(tracker: TaskTracker) -> Self {
        Self {
            handlers: DashMap::new(),
            tracker,
        }
    }

    /// Register a user handler. Names starting with `_` are rejected.
    pub(crate) fn register_handler(&self, handler: Handler) -> Result<()> {
        if handler.name().starts_with('_') {
            anyhow::bail!(
                "Handler name '{}' cannot start with '_'. Runtime handlers are registered internally.",
                handler.name()
            );
        }
        self.insert(handler)
    }

    pub(crate) fn register_internal_handler(&self, handler: Handler) -> Result<()> {
        self.insert(handler)
    }

    fn insert(&self, handler: Handler) -> Result<()> {
        let name = handler.name().to_string();
        match self.handlers.entry(name) {
            Entry::Occupied(entry) => {
                anyhow::bail!("Handler '{}' is already registered", entry.key())
            }
            Entry::Vacant(entry) => {
                debug!(handler = %entry.key(), mode = ?handler.mode(), "registered handler");
                entry.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    pub(crate) fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        names.sort();
        names
    }

    async fn dispatch(&self, node: &Arc<Node>, frame: InboundFrame) {
        let InboundFrame {
            header,
            payload,
            guard,
        } = frame;

        let header = match FrameHeader::decode(&header) {
            Ok(header) => header,
            Err(e) => {
                // no epoch can be recovered from a broken header, so nothing to count
                error!(error = %e, "dropping frame with undecodable header");
                return;
            }
        };

        if let Some(epoch) = header.epoch
            && node.epochs().is_terminated(epoch)
        {
            node.fatal().report(ProtocolViolation::MessageAfterTermination {
                epoch,
                handler: header.handler,
            });
            return;
        }

        let Some(handler) = self.handlers.get(&header.handler).map(|h| h.value().clone()) else {
            error!(handler = %header.handler, source = %header.source, "no handler registered; dropping frame");
            complete(node, header.epoch, &header.handler);
            return;
        };

        let ctx = Context {
            source: header.source,
            epoch: header.epoch,
            payload,
            node: node.clone(),
        };

        match handler.mode() {
            DispatchMode::Inline => {
                if let Err(e) = handler.call(ctx).await {
                    warn!(handler = %handler.name(), error = %e, "handler failed");
                }
                complete(node, header.epoch, handler.name());
                drop(guard);
            }
            DispatchMode::Spawn => {
                let node = node.clone();
                self.tracker.spawn(async move {
                    trace!(handler = %handler.name(), "handler task started");
                    if let Err(e) = handler.call(ctx).await {
                        warn!(handler = %handler.name(), error = %e, "handler failed");
                    }
                    complete(&node, header.epoch, handler.name());
                    drop(guard);
                });
            }
        }
    }
}

fn complete(node: &Node, epoch: Option<EpochId>, handler: &str) {
    let Some(epoch) = epoch else {
        return;
    };
    if node.epochs().consume(epoch).is_err() {
        node.fatal().report(ProtocolViolation::MessageAfterTermination {
            epoch,
            handler: handler.to_string(),
        });
    }
}

/// Pull frames off `stream` until the node is cancelled or every sender is gone.
pub(crate) async fn run_dispatch_loop(
    node: Arc<Node>,
    stream: DataStream,
    cancel: CancellationToken,
) {
    debug!(node = %stream.node(), "dispatch loop started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = stream.recv() => match frame {
                Some(frame) => node.dispatcher().dispatch(&node, frame).await,
                None => break,
            },
        }
    }
    debug!(node = %stream.node(), "dispatch loop stopped");
}
