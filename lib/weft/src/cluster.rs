// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process cluster for tests and single-host runs.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use weft_backend::LocalFabric;

use crate::config::RuntimeConfig;
use crate::logging;
use crate::node::Node;

/// `N` nodes sharing one [`LocalFabric`].
pub struct LocalCluster {
    fabric: LocalFabric,
    nodes: Vec<Arc<Node>>,
}

impl LocalCluster {
    /// Start `num_nodes` nodes with the same configuration.
    pub fn start(num_nodes: u32, config: RuntimeConfig) -> Result<Self> {
        logging::init(&config.logging);
        let (fabric, endpoints) = LocalFabric::new(num_nodes);
        let nodes = endpoints
            .into_iter()
            .map(|(transport, stream)| {
                Node::builder()
                    .transport(Arc::new(transport), stream)
                    .config(config.clone())
                    .build()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fabric, nodes })
    }

    /// Node `index`. Panics when out of range, like slice indexing.
    pub fn node(&self, index: u32) -> &Arc<Node> {
        &self.nodes[index as usize]
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// The shared fabric, for holding and releasing links.
    pub fn fabric(&self) -> &LocalFabric {
        &self.fabric
    }

    /// Cancels every node before awaiting any of them.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.stop();
        }
        join_all(self.nodes.iter().map(|node| node.shutdown())).await;
    }
}
