// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use weft::{
    EpochError, LocalFabric, Node, NodeId, ProtocolViolation, RuntimeConfig, Transport,
    am_handler, am_handler_async,
};
use weft_backend::FrameHeader;

use common::{
    cluster, cluster_with, counting_handler, empty, eventually, settle, test_config,
    wait_terminated,
};

fn n(i: u32) -> NodeId {
    NodeId::new(i)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bouncing_work_terminates_once() {
    let cluster = cluster(5);
    let hops = Arc::new(AtomicUsize::new(0));
    for node in cluster.nodes() {
        let hops = hops.clone();
        node.register_handler(
            am_handler("bounce", move |ctx| {
                hops.fetch_add(1, Ordering::SeqCst);
                let left: u32 = ctx.decode()?;
                if left > 0 {
                    let next = NodeId::new((ctx.node.node_id().index() + 1) % ctx.node.num_nodes());
                    ctx.send(next, "bounce", weft_backend::encode_payload(&(left - 1))?)?;
                }
                Ok(())
            })
            .build(),
        )
        .unwrap();
    }

    let root = cluster.node(0);
    let epoch = root.epochs().new_epoch(None).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let fired = fired.clone();
        root.epochs()
            .on_terminated(epoch, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    for dest in 0..5 {
        let payload = weft_backend::encode_payload(&20u32).unwrap();
        root.send(Some(epoch), n(dest), "bounce", payload).unwrap();
    }
    root.epochs().finish(epoch).unwrap();
    wait_terminated(root, epoch).await;

    // every bounce was handled before the epoch was declared done
    assert_eq!(hops.load(Ordering::SeqCst), 5 * 21);
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    // late registrations run immediately, still once each
    let late = fired.clone();
    root.epochs()
        .on_terminated(epoch, move || {
            late.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 3);

    for node in cluster.nodes() {
        wait_terminated(node, epoch).await;
        assert!(node.epochs().is_terminated(epoch));
    }
    eventually("counters released", || {
        cluster.nodes().iter().all(|node| node.epochs().live_epochs() == 0)
    })
    .await;
    assert!(cluster.nodes().iter().all(|node| node.fatal_violation().is_none()));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_epoch_terminates() {
    let cluster = cluster(3);
    let epoch = cluster.node(1).epochs().new_epoch(None).unwrap();
    cluster.node(1).epochs().finish(epoch).unwrap();
    wait_terminated(cluster.node(1), epoch).await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_held_in_transit_blocks_termination() {
    // tree for 4 nodes, fanout 2: 0 -> {1, 2}, 1 -> {3}; link 2 -> 3 carries no waves
    let cluster = cluster(4);
    let sunk = counting_handler(&cluster, "sink");
    for node in cluster.nodes() {
        node.register_handler(
            am_handler("relay", |ctx| {
                ctx.send(NodeId::new(3), "sink", Bytes::new())?;
                Ok(())
            })
            .build(),
        )
        .unwrap();
    }
    cluster.fabric().hold(n(2), n(3));

    let root = cluster.node(0);
    let epoch = root.epochs().new_epoch(None).unwrap();
    root.send(Some(epoch), n(2), "relay", empty()).unwrap();
    root.epochs().finish(epoch).unwrap();

    eventually("sink message parked on the held link", || {
        cluster.fabric().held_count(n(2), n(3)) == 1
    })
    .await;
    settle().await;
    assert!(!root.epochs().is_terminated(epoch));
    assert_eq!(sunk.load(Ordering::SeqCst), 0);

    assert_eq!(cluster.fabric().release(n(2), n(3)), 1);
    wait_terminated(root, epoch).await;
    assert_eq!(sunk.load(Ordering::SeqCst), 1);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_blocked_mid_send_blocks_termination() {
    let cluster = cluster(4);
    let sunk = counting_handler(&cluster, "sink");
    let gate = Arc::new(Semaphore::new(0));
    for node in cluster.nodes() {
        let gate = gate.clone();
        node.register_handler(
            am_handler_async("slow", move |ctx| {
                let gate = gate.clone();
                async move {
                    let _permit = gate.acquire().await?;
                    ctx.send(NodeId::new(3), "sink", Bytes::new())?;
                    Ok(())
                }
            })
            .build(),
        )
        .unwrap();
    }

    let root = cluster.node(0);
    let epoch = root.epochs().new_epoch(None).unwrap();
    root.send(Some(epoch), n(1), "slow", empty()).unwrap();
    root.epochs().finish(epoch).unwrap();

    settle().await;
    assert!(!root.epochs().is_terminated(epoch));

    gate.add_permits(1);
    wait_terminated(root, epoch).await;
    assert_eq!(sunk.load(Ordering::SeqCst), 1);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parent_waits_for_child() {
    let cluster = cluster(3);
    let root = cluster.node(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let parent = root.epochs().new_epoch(None).unwrap();
    let child = root.epochs().new_epoch(Some(parent)).unwrap();
    for (epoch, name) in [(parent, "parent"), (child, "child")] {
        let order = order.clone();
        root.epochs()
            .on_terminated(epoch, move || order.lock().push(name))
            .unwrap();
    }

    root.epochs().finish(parent).unwrap();
    settle().await;
    assert!(!root.epochs().is_terminated(parent));

    root.epochs().finish(child).unwrap();
    wait_terminated(root, parent).await;
    assert_eq!(*order.lock(), vec!["child", "parent"]);
    assert_eq!(root.epochs().counts(parent), Default::default());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_wake_after_actions_and_parent_release() {
    let cluster = cluster(3);
    let root = cluster.node(0);
    let parent = root.epochs().new_epoch(None).unwrap();
    let child = root.epochs().new_epoch(Some(parent)).unwrap();
    assert_eq!(root.epochs().counts(parent).open_children, 1);

    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        root.epochs()
            .on_terminated(child, move || {
                std::thread::sleep(Duration::from_millis(50));
                ran.store(true, Ordering::SeqCst);
            })
            .unwrap();
    }

    root.epochs().finish(child).unwrap();
    wait_terminated(root, child).await;
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(root.epochs().counts(parent).open_children, 0);

    root.epochs().finish(parent).unwrap();
    wait_terminated(root, parent).await;
    cluster.shutdown().await;
}

fn hang_config(detect_hangs: bool) -> RuntimeConfig {
    let mut config = test_config();
    config.termination.detect_hangs = detect_hangs;
    config.termination.hang_frequency = 1;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_waves_raise_hang_warnings() {
    let cluster = cluster_with(4, hang_config(true));
    let sunk = counting_handler(&cluster, "sink");
    // 0 -> 3 is not a tree link, so waves keep flowing
    cluster.fabric().hold(n(0), n(3));

    let root = cluster.node(0);
    let epoch = root.epochs().new_epoch(None).unwrap();
    root.send(Some(epoch), n(3), "sink", empty()).unwrap();
    root.epochs().finish(epoch).unwrap();

    eventually("repeated hang warnings at the tree root", || {
        root.epochs().hang_warnings() >= 3
    })
    .await;
    assert!(!root.epochs().is_terminated(epoch));

    cluster.fabric().release(n(0), n(3));
    wait_terminated(root, epoch).await;
    assert_eq!(sunk.load(Ordering::SeqCst), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hang_warnings_can_be_disabled() {
    let cluster = cluster_with(4, hang_config(false));
    cluster.fabric().hold(n(0), n(3));

    let root = cluster.node(0);
    let epoch = root.epochs().new_epoch(None).unwrap();
    root.send(Some(epoch), n(3), "sink", empty()).unwrap();
    root.epochs().finish(epoch).unwrap();

    settle().await;
    assert!(!root.epochs().is_terminated(epoch));
    assert_eq!(root.epochs().hang_warnings(), 0);
    cluster.shutdown().await;
}

/// Four nodes; node 2 opens E1 under E0 and sends three messages to node 3.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_child_epoch_on_remote_node() {
    let cluster = cluster(4);
    let received = counting_handler(&cluster, "work");
    let order = Arc::new(Mutex::new(Vec::new()));

    let e0 = cluster.node(0).epochs().new_epoch(None).unwrap();
    {
        let order = order.clone();
        cluster
            .node(0)
            .epochs()
            .on_terminated(e0, move || order.lock().push("E0"))
            .unwrap();
    }

    let creator = cluster.node(2);
    let e1 = creator.epochs().new_epoch(Some(e0)).unwrap();
    {
        let order = order.clone();
        creator
            .epochs()
            .on_terminated(e1, move || order.lock().push("E1"))
            .unwrap();
    }

    cluster.fabric().hold(n(2), n(3));
    for _ in 0..3 {
        creator.send(Some(e1), n(3), "work", empty()).unwrap();
    }
    creator.epochs().finish(e1).unwrap();
    cluster.node(0).epochs().finish(e0).unwrap();

    settle().await;
    assert!(!creator.epochs().is_terminated(e1));
    assert!(!cluster.node(0).epochs().is_terminated(e0));

    cluster.fabric().release(n(2), n(3));
    wait_terminated(creator, e1).await;
    assert_eq!(received.load(Ordering::SeqCst), 3);
    wait_terminated(cluster.node(0), e0).await;
    assert_eq!(*order.lock(), vec!["E1", "E0"]);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caller_misuse_is_reported() {
    let cluster = cluster(2);
    let root = cluster.node(0);
    let epoch = root.epochs().new_epoch(None).unwrap();

    let remote = cluster.node(1).epochs();
    assert!(matches!(
        remote.finish(epoch),
        Err(EpochError::NotCreator { creator, .. }) if creator == n(0)
    ));
    assert!(matches!(
        remote.on_terminated(epoch, || {}),
        Err(EpochError::NotCreator { .. })
    ));

    root.epochs().finish(epoch).unwrap();
    assert!(matches!(
        root.epochs().finish(epoch),
        Err(EpochError::AlreadyFinished(e)) if e == epoch
    ));
    wait_terminated(root, epoch).await;

    assert!(matches!(
        root.epochs().new_epoch(Some(epoch)),
        Err(EpochError::ParentTerminated(e)) if e == epoch
    ));
    assert!(matches!(
        root.epochs().send(epoch, n(1), "anything", empty()),
        Err(EpochError::Terminated(e)) if e == epoch
    ));
    assert!(root.send(Some(epoch), n(1), "anything", empty()).is_err());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frame_after_termination_is_fatal() {
    let (fabric, mut endpoints) = LocalFabric::new(2);
    let raw = endpoints[0].0.clone();
    let nodes: Vec<Arc<Node>> = endpoints
        .drain(..)
        .map(|(transport, stream)| {
            Node::builder()
                .transport(Arc::new(transport), stream)
                .config(test_config())
                .build()
                .unwrap()
        })
        .collect();

    let epoch = nodes[0].epochs().new_epoch(None).unwrap();
    nodes[0].epochs().finish(epoch).unwrap();
    wait_terminated(&nodes[1], epoch).await;

    // bypasses the counters, as a buggy sender would
    let header = FrameHeader::builder()
        .source(n(0))
        .handler("late")
        .epoch(Some(epoch))
        .build()
        .unwrap();
    raw.send(n(1), header.encode().unwrap(), empty()).unwrap();

    eventually("node 1 stops", || nodes[1].fatal().is_aborted()).await;
    assert_eq!(
        nodes[1].fatal_violation(),
        Some(ProtocolViolation::MessageAfterTermination {
            epoch,
            handler: "late".to_string(),
        })
    );
    assert!(nodes[0].fatal_violation().is_none());
    assert_eq!(fabric.num_nodes(), 2);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_config_is_validated_on_build() {
    let (_fabric, mut endpoints) = LocalFabric::new(1);
    let (transport, stream) = endpoints.remove(0);
    let mut config = RuntimeConfig::default();
    config.tree.fanout = 0;
    assert!(
        Node::builder()
            .transport(Arc::new(transport), stream)
            .config(config)
            .build()
            .is_err()
    );
}
