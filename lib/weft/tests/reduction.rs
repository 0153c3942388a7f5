// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::collections::BTreeSet;

use futures::future::join_all;
use rstest::rstest;
use weft::{FnReducer, Max, NodeId, ProtocolViolation, ReduceError, ReduceTag, Sum, Union};

use common::{cluster, cluster_with, eventually, test_config};

fn concat() -> FnReducer<fn(String, String) -> String> {
    FnReducer(|a: String, b: String| a + &b)
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sum_reaches_root(
    #[values(1, 2, 5, 13)] num_nodes: u32,
    #[values(1, 2, 3)] fanout: u32,
) {
    let mut config = test_config();
    config.tree.fanout = fanout;
    let cluster = cluster_with(num_nodes, config);
    let tag = ReduceTag::user(1, 0);

    let pending: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            node.reductions()
                .reduce(tag, node.node_id().index() as u64 + 1, Sum, false)
                .unwrap()
        })
        .collect();
    let results: Vec<Option<u64>> = join_all(pending)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let n = num_nodes as u64;
    assert_eq!(results[0], Some(n * (n + 1) / 2));
    assert!(results[1..].iter().all(Option::is_none));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_union_broadcast() {
    let cluster = cluster(6);
    let tag = ReduceTag::user(2, 0);

    let pending: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            let i = node.node_id().index();
            node.reductions()
                .reduce(tag, BTreeSet::from([i, i * 10]), Union, true)
                .unwrap()
        })
        .collect();

    let expected: BTreeSet<u32> = (0..6).flat_map(|i| [i, i * 10]).collect();
    for result in join_all(pending).await {
        assert_eq!(result.unwrap(), Some(expected.clone()));
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_tags_stay_apart() {
    let cluster = cluster(5);
    let a = ReduceTag::user(3, 0);
    let b = ReduceTag::user(3, 1);

    // opposite contribution order on alternate nodes
    let mut sums = Vec::new();
    let mut maxes = Vec::new();
    for node in cluster.nodes() {
        let i = node.node_id().index() as u64;
        if i % 2 == 0 {
            sums.push(node.reductions().reduce(a, i, Sum, true).unwrap());
            maxes.push(node.reductions().reduce(b, i, Max, true).unwrap());
        } else {
            maxes.push(node.reductions().reduce(b, i, Max, true).unwrap());
            sums.push(node.reductions().reduce(a, i, Sum, true).unwrap());
        }
    }

    for result in join_all(sums).await {
        assert_eq!(result.unwrap(), Some(10));
    }
    for result in join_all(maxes).await {
        assert_eq!(result.unwrap(), Some(4));
    }
    for node in cluster.nodes() {
        assert_eq!(node.reductions().active(), 0);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reused_tag_is_rejected() {
    let cluster = cluster(3);
    let tag = ReduceTag::user(4, 0);
    let root = cluster.node(0);

    let total = root.reductions().reduce(tag, 1u64, Sum, false).unwrap();
    let err = root.reductions().reduce(tag, 1u64, Sum, false).err().unwrap();
    assert!(matches!(err, ReduceError::TagInUse(t) if t == tag));

    let rest: Vec<_> = cluster.nodes()[1..]
        .iter()
        .map(|node| node.reductions().reduce(tag, 1u64, Sum, false).unwrap())
        .collect();
    join_all(rest).await;
    assert_eq!(total.await.unwrap(), Some(3));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_custom_combine() {
    let cluster = cluster(4);
    let tag = ReduceTag::user(5, 0);

    let pending: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            let i = node.node_id().index() as u64;
            let gcd = FnReducer(|mut a: u64, mut b: u64| {
                while b != 0 {
                    (a, b) = (b, a % b);
                }
                a
            });
            node.reductions().reduce(tag, 12 * (i + 1), gcd, false).unwrap()
        })
        .collect();
    let results = join_all(pending).await;
    assert_eq!(*results[0].as_ref().unwrap(), Some(12));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_local_value_keeps_buffered_children() {
    let cluster = cluster(2);
    let tag = ReduceTag::user(6, 0);
    let root = cluster.node(0);

    let child = cluster.node(1).reductions().reduce(tag, 5u64, Sum, false).unwrap();
    assert_eq!(child.await.unwrap(), None);
    eventually("child value buffered at the root", || {
        root.reductions().active() == 1
    })
    .await;

    let err = root
        .reductions()
        .reduce(tag, "x".to_string(), concat(), false)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ReduceError::Incompatible { tag: t, from, .. } if t == tag && from == NodeId::new(1)
    ));

    // the buffered contribution survived the failed call
    let total = root.reductions().reduce(tag, 1u64, Sum, false).unwrap();
    assert_eq!(total.await.unwrap(), Some(6));
    assert!(root.fatal_violation().is_none());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_incompatible_child_fails_the_reduction() {
    let cluster = cluster(2);
    let tag = ReduceTag::user(7, 0);
    let root = cluster.node(0);

    let total = root
        .reductions()
        .reduce(tag, "x".to_string(), concat(), false)
        .unwrap();
    let child = cluster.node(1).reductions().reduce(tag, 5u64, Sum, false).unwrap();
    assert_eq!(child.await.unwrap(), None);

    assert!(matches!(
        total.await,
        Err(ReduceError::Incompatible { from, .. }) if from == NodeId::new(1)
    ));
    assert_eq!(
        root.fatal_violation(),
        Some(ProtocolViolation::IncompatibleContribution {
            tag,
            from: NodeId::new(1),
        })
    );
    assert_eq!(root.reductions().active(), 0);

    cluster.shutdown().await;
}
