// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use weft_common::NodeId;

/// Errors returned by [`Transport`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The destination is outside the node set of this run.
    #[error("unknown destination node {0}")]
    UnknownNode(NodeId),

    /// The destination's inbound stream has been dropped.
    #[error("destination {0} is closed")]
    Closed(NodeId),
}

/// Abstraction over a point-to-point frame transport.
///
/// `send` is fire-and-forget. Frames between any ordered pair of nodes are
/// delivered in the order sent. The trait is object-safe so the runtime
/// stores transports as `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Identity of the node this transport belongs to.
    fn local_node(&self) -> NodeId;

    /// Number of nodes in the run. Node ids are dense, `0..num_nodes`.
    fn num_nodes(&self) -> u32;

    /// Send a frame to `dest`. Sending to the local node loops back through
    /// the local [`DataStream`].
    fn send(&self, dest: NodeId, header: Bytes, payload: Bytes) -> Result<(), TransportError>;

    /// Frames sent by this node that their receivers have not finished with.
    fn in_flight(&self) -> usize;
}

/// Counter of frames a node has in flight.
#[derive(Clone, Default)]
pub struct InFlightCounter {
    inner: Arc<InFlightInner>,
}

#[derive(Default)]
struct InFlightInner {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlightCounter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge one frame to this counter. The frame is released when the
    /// returned guard drops.
    pub fn acquire(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    /// Current number of outstanding frames.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until the count reaches zero. Returns immediately if already zero.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard that decrements an [`InFlightCounter`] on drop.
pub struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl InFlightGuard {
    /// Explicitly release the frame (equivalent to dropping the guard).
    pub fn complete(self) {}
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard").finish_non_exhaustive()
    }
}

/// A frame taken off a [`DataStream`].
///
/// The sender's in-flight count stays charged until this value is dropped,
/// so hold on to it until the frame has been fully handled.
#[derive(Debug)]
pub struct InboundFrame {
    /// Encoded [`crate::FrameHeader`].
    pub header: Bytes,
    /// Opaque payload.
    pub payload: Bytes,
    /// Release handle for the sender's in-flight count.
    pub guard: InFlightGuard,
}

/// Receiver side of a node's inbound frames.
pub struct DataStream {
    node: NodeId,
    rx: flume::Receiver<InboundFrame>,
}

impl DataStream {
    pub(crate) fn new(node: NodeId, rx: flume::Receiver<InboundFrame>) -> Self {
        Self { node, rx }
    }

    /// Node this stream delivers to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Wait for the next inbound frame. `None` once every sender is gone.
    pub async fn recv(&self) -> Option<InboundFrame> {
        self.rx.recv_async().await.ok()
    }

    /// Take a frame if one is ready.
    pub fn try_recv(&self) -> Option<InboundFrame> {
        self.rx.try_recv().ok()
    }

    /// Number of frames queued and not yet received.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` when no frame is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
