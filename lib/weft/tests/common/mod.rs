// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the cluster-level integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout};
use weft::{EpochId, LocalCluster, Node, RuntimeConfig, am_handler};

pub const DEADLINE: Duration = Duration::from_secs(10);

/// Defaults with a fast retry so tests do not sit on unbalanced waves.
pub fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.termination.retry_interval_ms = 1;
    config.logging.level = "warn".to_string();
    config
}

pub fn cluster(num_nodes: u32) -> LocalCluster {
    LocalCluster::start(num_nodes, test_config()).unwrap()
}

pub fn cluster_with(num_nodes: u32, config: RuntimeConfig) -> LocalCluster {
    LocalCluster::start(num_nodes, config).unwrap()
}

/// Poll `check` until it holds, failing the test after [`DEADLINE`].
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = timeout(DEADLINE, async {
        while !check() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

pub async fn wait_terminated(node: &Node, epoch: EpochId) {
    timeout(DEADLINE, node.epochs().wait_terminated(epoch))
        .await
        .unwrap_or_else(|_| panic!("{epoch} did not terminate"));
}

/// Give in-flight waves a chance to (wrongly) finish.
pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

/// Register a `name` handler on every node that counts invocations.
pub fn counting_handler(cluster: &LocalCluster, name: &str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    for node in cluster.nodes() {
        let count = count.clone();
        node.register_handler(
            am_handler(name, move |_ctx| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build(),
        )
        .unwrap();
    }
    count
}

pub fn empty() -> Bytes {
    Bytes::new()
}
