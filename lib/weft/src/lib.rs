// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

pub mod cluster;
pub mod config;
pub mod epoch;
pub mod error;
pub mod handlers;
pub mod location;
pub mod logging;
mod messenger;
pub mod node;
pub mod reduce;
pub mod tree;

pub use cluster::LocalCluster;
pub use config::RuntimeConfig;
pub use epoch::{EpochManager, TermCounts, WorkGuard};
pub use error::{
    EpochError, FatalReporter, ProtocolViolation, ReduceError, RoutingError, SendError,
    TopologyError,
};
pub use handlers::{Context, DispatchMode, Handler, HandlerBuilder, am_handler, am_handler_async};
pub use location::{
    EntityContext, EntityKind, LocationDirectory, LocationRecord, MigrationCoordinator,
};
pub use node::{Node, NodeBuilder};
pub use reduce::{FnReducer, Max, Min, ReduceScope, ReduceTag, ReductionEngine, Reducer, Sum, Union};
pub use tree::SpanningTree;

pub use weft_backend::{LocalFabric, LocalTransport, Transport};
pub use weft_common::{EntityId, EpochId, NodeId};
