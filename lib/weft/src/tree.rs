// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic spanning tree over the dense node id space.
//!
//! The tree is a k-ary heap: node `0` is the root, node `i > 0` has parent
//! `(i - 1) / k` and children `k*i + 1 ..= k*i + k` (those below `N`). Every
//! node derives the same tree from `(N, k)` alone, without messages.

use weft_common::NodeId;

use crate::error::TopologyError;

pub const DEFAULT_FANOUT: u32 = 2;

/// One node's view of the spanning tree. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanningTree {
    node: NodeId,
    num_nodes: u32,
    fanout: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl SpanningTree {
    /// Binary tree as seen from `node`.
    pub fn new(num_nodes: u32, node: NodeId) -> Result<Self, TopologyError> {
        Self::with_fanout(num_nodes, node, DEFAULT_FANOUT)
    }

    pub fn with_fanout(num_nodes: u32, node: NodeId, fanout: u32) -> Result<Self, TopologyError> {
        if num_nodes == 0 {
            return Err(TopologyError::Empty);
        }
        if fanout == 0 {
            return Err(TopologyError::ZeroFanout);
        }
        let i = node.index();
        if i >= num_nodes {
            return Err(TopologyError::NodeOutOfRange { node, num_nodes });
        }

        let parent = (i > 0).then(|| NodeId::new((i - 1) / fanout));

        // u64 keeps k*i + k from overflowing for large ids
        let first = fanout as u64 * i as u64 + 1;
        let last = (first + fanout as u64).min(num_nodes as u64);
        let children = (first..last).map(|c| NodeId::new(c as u32)).collect();

        Ok(Self {
            node,
            num_nodes,
            fanout,
            parent,
            children,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in ascending id order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn root(&self) -> NodeId {
        NodeId::new(0)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_single_node() {
        let tree = SpanningTree::new(1, NodeId::new(0)).unwrap();
        assert!(tree.is_root());
        assert!(tree.is_leaf());
    }

    #[test]
    fn test_binary_shape() {
        let tree = SpanningTree::new(7, NodeId::new(1)).unwrap();
        assert_eq!(tree.parent(), Some(NodeId::new(0)));
        assert_eq!(tree.children(), &[NodeId::new(3), NodeId::new(4)]);

        let tree = SpanningTree::new(5, NodeId::new(2)).unwrap();
        assert!(tree.is_leaf());
    }

    #[rstest]
    #[case(0, 0, 2, TopologyError::Empty)]
    #[case(4, 4, 2, TopologyError::NodeOutOfRange { node: NodeId::new(4), num_nodes: 4 })]
    #[case(4, 1, 0, TopologyError::ZeroFanout)]
    fn test_invalid_inputs(
        #[case] num_nodes: u32,
        #[case] node: u32,
        #[case] fanout: u32,
        #[case] expected: TopologyError,
    ) {
        assert_eq!(
            SpanningTree::with_fanout(num_nodes, NodeId::new(node), fanout),
            Err(expected)
        );
    }

    #[test]
    fn test_no_overflow_near_u32_max() {
        let tree = SpanningTree::with_fanout(u32::MAX, NodeId::new(u32::MAX - 1), 64).unwrap();
        assert!(tree.is_leaf());
    }
}
