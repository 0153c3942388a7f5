// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use weft_backend::{FrameHeader, Transport, encode_payload};
use weft_common::{EpochId, NodeId};

use crate::error::SendError;

/// Frames outbound messages and hands them to the transport.
///
/// Epoch bookkeeping is not done here; callers sending under an epoch go
/// through [`crate::epoch::EpochManager::send`], which counts the produce
/// event before calling in.
pub(crate) struct Messenger {
    node: NodeId,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

impl Messenger {
    pub(crate) fn new(transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        Self {
            node: transport.local_node(),
            transport,
            cancel,
        }
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    pub(crate) fn num_nodes(&self) -> u32 {
        self.transport.num_nodes()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.transport.in_flight()
    }

    pub(crate) fn send_raw(
        &self,
        dest: NodeId,
        handler: &str,
        epoch: Option<EpochId>,
        payload: Bytes,
    ) -> Result<(), SendError> {
        let header = FrameHeader::builder()
            .source(self.node)
            .handler(handler)
            .epoch(epoch)
            .build()?;
        trace!(%dest, handler, ?epoch, len = payload.len(), "send");
        self.transport.send(dest, header.encode()?, payload)?;
        Ok(())
    }

    /// Send an untagged runtime control message.
    pub(crate) fn send_system<T: Serialize>(
        &self,
        dest: NodeId,
        handler: &str,
        message: &T,
    ) -> Result<(), SendError> {
        self.send_raw(dest, handler, None, encode_payload(message)?)
    }

    /// Fire-and-forget control message. Peers stop independently, so a
    /// failure after this node began stopping is expected and logged quietly.
    pub(crate) fn notify<T: Serialize>(&self, dest: NodeId, handler: &str, message: &T) {
        if let Err(error) = self.send_system(dest, handler, message) {
            if self.cancel.is_cancelled() {
                debug!(%dest, handler, %error, "control message dropped during shutdown");
            } else {
                error!(%dest, handler, %error, "failed to send control message");
            }
        }
    }
}
