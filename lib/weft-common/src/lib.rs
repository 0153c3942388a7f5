// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

mod entity;
mod epoch;
mod node;

pub use entity::EntityId;
pub use epoch::EpochId;
pub use node::NodeId;

/// Errors produced when packing an identity from out-of-range parts.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    #[error("node {0} does not fit in {bits} bits", bits = NODE_BITS)]
    NodeOverflow(u32),

    #[error("sequence {0} does not fit in {bits} bits", bits = SEQ_BITS)]
    SeqOverflow(u64),
}

// Epoch and entity ids share the same layout: [node: 24 bits][seq: 40 bits].
pub(crate) const NODE_BITS: u32 = 24;
pub(crate) const SEQ_BITS: u32 = 40;

pub(crate) const NODE_SHIFT: u32 = SEQ_BITS;
pub(crate) const NODE_MASK: u64 = ((1u64 << NODE_BITS) - 1) << NODE_SHIFT;
pub(crate) const SEQ_MASK: u64 = (1u64 << SEQ_BITS) - 1;

/// Largest node index representable inside an epoch or entity id.
pub const MAX_NODES: u32 = 1 << NODE_BITS;

pub(crate) fn pack(node: NodeId, seq: u64) -> Result<u64, IdError> {
    if node.index() >= MAX_NODES {
        return Err(IdError::NodeOverflow(node.index()));
    }
    if seq > SEQ_MASK {
        return Err(IdError::SeqOverflow(seq));
    }
    Ok(((node.index() as u64) << NODE_SHIFT) | seq)
}

pub(crate) fn unpack_node(raw: u64) -> NodeId {
    NodeId::new(((raw & NODE_MASK) >> NODE_SHIFT) as u32)
}

pub(crate) fn unpack_seq(raw: u64) -> u64 {
    raw & SEQ_MASK
}
