// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process fabric connecting `N` nodes.
//!
//! Every node gets an unbounded inbox. A directed link can be *held*, which
//! parks frames on that link in send order until it is released; this is how
//! tests build adversarial schedules (a frame stuck in transit while the rest
//! of the run makes progress) without breaking per-link FIFO.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;
use weft_common::NodeId;

use crate::transport::{DataStream, InFlightCounter, InboundFrame, Transport, TransportError};

/// Shared switchboard for a set of [`LocalTransport`]s.
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    inboxes: Vec<flume::Sender<InboundFrame>>,
    in_flight: Vec<InFlightCounter>,
    held: Mutex<HashMap<(NodeId, NodeId), VecDeque<InboundFrame>>>,
}

impl LocalFabric {
    /// Build a fabric of `num_nodes` nodes, returning one transport and one
    /// inbound stream per node, indexed by node id.
    pub fn new(num_nodes: u32) -> (Self, Vec<(LocalTransport, DataStream)>) {
        let mut inboxes = Vec::with_capacity(num_nodes as usize);
        let mut receivers = Vec::with_capacity(num_nodes as usize);
        for _ in 0..num_nodes {
            let (tx, rx) = flume::unbounded();
            inboxes.push(tx);
            receivers.push(rx);
        }

        let fabric = Self {
            inner: Arc::new(FabricInner {
                inboxes,
                in_flight: (0..num_nodes).map(|_| InFlightCounter::new()).collect(),
                held: Mutex::new(HashMap::new()),
            }),
        };

        let endpoints = receivers
            .into_iter()
            .enumerate()
            .map(|(index, rx)| {
                let node = NodeId::new(index as u32);
                let transport = LocalTransport {
                    node,
                    fabric: fabric.clone(),
                };
                (transport, DataStream::new(node, rx))
            })
            .collect();

        (fabric, endpoints)
    }

    /// Number of nodes on the fabric.
    pub fn num_nodes(&self) -> u32 {
        self.inner.inboxes.len() as u32
    }

    /// Park every subsequent frame sent from `src` to `dest` until
    /// [`release`](Self::release) is called. Idempotent.
    pub fn hold(&self, src: NodeId, dest: NodeId) {
        self.inner.held.lock().entry((src, dest)).or_default();
    }

    /// Deliver parked frames on the `src -> dest` link in their original order
    /// and reopen the link. Returns the number of frames released.
    pub fn release(&self, src: NodeId, dest: NodeId) -> usize {
        let mut held = self.inner.held.lock();
        let Some(parked) = held.remove(&(src, dest)) else {
            return 0;
        };
        let count = parked.len();
        if let Some(inbox) = self.inner.inboxes.get(dest.as_usize()) {
            for frame in parked {
                // a dropped receiver means the node is gone; its frames go with it
                let _ = inbox.send(frame);
            }
        }
        trace!(%src, %dest, count, "released held link");
        count
    }

    /// Frames currently parked on the `src -> dest` link.
    pub fn held_count(&self, src: NodeId, dest: NodeId) -> usize {
        self.inner
            .held
            .lock()
            .get(&(src, dest))
            .map_or(0, VecDeque::len)
    }

    /// In-flight frame count charged to `node`.
    pub fn in_flight(&self, node: NodeId) -> usize {
        self.inner
            .in_flight
            .get(node.as_usize())
            .map_or(0, InFlightCounter::count)
    }

    fn route(
        &self,
        src: NodeId,
        dest: NodeId,
        header: Bytes,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let inbox = self
            .inner
            .inboxes
            .get(dest.as_usize())
            .ok_or(TransportError::UnknownNode(dest))?;
        let counter = self
            .inner
            .in_flight
            .get(src.as_usize())
            .ok_or(TransportError::UnknownNode(src))?;

        let frame = InboundFrame {
            header,
            payload,
            guard: counter.acquire(),
        };

        // the held-map lock is kept across the send so a concurrent release
        // cannot interleave with it and reorder the link
        let mut held = self.inner.held.lock();
        if let Some(parked) = held.get_mut(&(src, dest)) {
            parked.push_back(frame);
            return Ok(());
        }
        inbox.send(frame).map_err(|_| TransportError::Closed(dest))
    }
}

/// One node's view of a [`LocalFabric`].
#[derive(Clone)]
pub struct LocalTransport {
    node: NodeId,
    fabric: LocalFabric,
}

impl LocalTransport {
    /// The fabric this transport is attached to.
    pub fn fabric(&self) -> &LocalFabric {
        &self.fabric
    }
}

impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn num_nodes(&self) -> u32 {
        self.fabric.num_nodes()
    }

    fn send(&self, dest: NodeId, header: Bytes, payload: Bytes) -> Result<(), TransportError> {
        self.fabric.route(self.node, dest, header, payload)
    }

    fn in_flight(&self) -> usize {
        self.fabric.in_flight(self.node)
    }
}
