// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy.
//!
//! Caller misuse comes back synchronously as one of the component error
//! enums. Protocol violations are never returned to a caller: they go to the
//! node's [`FatalReporter`], which records the first one and stops the node.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::error;
use weft_backend::{CodecError, FrameHeaderBuilderError, TransportError};
use weft_common::{EntityId, EpochId, NodeId};

use crate::reduce::ReduceTag;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("a tree needs at least one node")]
    Empty,

    #[error("node {node} is outside 0..{num_nodes}")]
    NodeOutOfRange { node: NodeId, num_nodes: u32 },

    #[error("fanout must be at least 1")]
    ZeroFanout,
}

/// Failure to put a frame on the wire.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid frame header: {0}")]
    Header(#[from] FrameHeaderBuilderError),
}

#[derive(thiserror::Error, Debug)]
pub enum ReduceError {
    #[error("reduction {0} already has a local contribution")]
    TagInUse(ReduceTag),

    #[error("reduction {0} was dropped before it completed")]
    Abandoned(ReduceTag),

    #[error("contribution to {tag} from {from} does not decode as the local value type")]
    Incompatible {
        tag: ReduceTag,
        from: NodeId,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(thiserror::Error, Debug)]
pub enum EpochError {
    #[error("parent epoch {0} has already terminated")]
    ParentTerminated(EpochId),

    #[error("epoch {0} has already terminated")]
    Terminated(EpochId),

    #[error("epoch {epoch} is owned by {creator}; only its creator may do this")]
    NotCreator { epoch: EpochId, creator: NodeId },

    #[error("epoch {0} was already finished")]
    AlreadyFinished(EpochId),

    #[error("epoch {0} is not known on this node")]
    UnknownEpoch(EpochId),

    #[error("epoch sequence space exhausted")]
    Exhausted,

    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(thiserror::Error, Debug)]
pub enum RoutingError {
    #[error("{entity} not resolved within {hops} hops")]
    HopLimitExceeded { entity: EntityId, hops: u32 },

    #[error("{0} is not resident on this node")]
    NotResident(EntityId),

    #[error("{0} is already resident on this node")]
    AlreadyResident(EntityId),

    #[error("{0} has a migration in progress")]
    MigrationInProgress(EntityId),

    #[error("no entity kind named '{0}'")]
    UnknownKind(String),

    #[error("entity kind '{0}' is already registered")]
    KindAlreadyRegistered(String),

    #[error("state of {0} does not match the requested type")]
    StateTypeMismatch(EntityId),

    #[error("entity id space exhausted")]
    Exhausted,

    #[error("resolution of {0} was dropped before a reply arrived")]
    Abandoned(EntityId),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Epoch(#[from] EpochError),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Broken runtime invariant. Continuing after one of these risks silent
/// corruption, so the node stops.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("message for {handler} arrived under terminated epoch {epoch}")]
    MessageAfterTermination { epoch: EpochId, handler: String },

    #[error("epoch {0} terminated twice")]
    DoubleTermination(EpochId),

    #[error("{entity} still unresolved after {hops} hops; forwarding cycle")]
    ForwardingCycle { entity: EntityId, hops: u32 },

    #[error("unexpected contribution to {tag} from {from}")]
    UnexpectedContribution { tag: ReduceTag, from: NodeId },

    #[error("contribution to {tag} from {from} has an incompatible type")]
    IncompatibleContribution { tag: ReduceTag, from: NodeId },
}

/// Records the first protocol violation seen by a node and cancels it.
#[derive(Clone)]
pub struct FatalReporter {
    node: NodeId,
    violation: Arc<OnceLock<ProtocolViolation>>,
    cancel: CancellationToken,
}

impl FatalReporter {
    pub(crate) fn new(node: NodeId, cancel: CancellationToken) -> Self {
        Self {
            node,
            violation: Arc::new(OnceLock::new()),
            cancel,
        }
    }

    pub fn report(&self, violation: ProtocolViolation) {
        error!(node = %self.node, %violation, "fatal protocol violation; stopping node");
        let _ = self.violation.set(violation);
        self.cancel.cancel();
    }

    /// First violation reported, if any.
    pub fn violation(&self) -> Option<&ProtocolViolation> {
        self.violation.get()
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_violation_wins() {
        let cancel = CancellationToken::new();
        let reporter = FatalReporter::new(NodeId::new(1), cancel.clone());
        assert!(reporter.violation().is_none());

        let epoch = EpochId::new(NodeId::new(0), 3).unwrap();
        reporter.report(ProtocolViolation::DoubleTermination(epoch));
        reporter.report(ProtocolViolation::MessageAfterTermination {
            epoch,
            handler: "x".into(),
        });

        assert!(cancel.is_cancelled());
        assert!(reporter.is_aborted());
        assert_eq!(
            reporter.violation(),
            Some(&ProtocolViolation::DoubleTermination(epoch))
        );
    }
}
