// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use weft_common::{EntityId, NodeId};

use super::LocationRecord;

pub(crate) const LOC_ROUTE: &str = "_loc_route";
pub(crate) const LOC_QUERY: &str = "_loc_query";
pub(crate) const LOC_REPLY: &str = "_loc_reply";
pub(crate) const LOC_UPDATE: &str = "_loc_update";
pub(crate) const LOC_CONFIRM: &str = "_loc_confirm";
pub(crate) const MIGRATE_IN: &str = "_migrate_in";
pub(crate) const MIGRATE_ACK: &str = "_migrate_ack";

/// Application message on its way to an entity. `hops` counts forwards
/// after the first send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RoutedMessage {
    pub entity: EntityId,
    pub origin: NodeId,
    pub hops: u32,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct LocationQuery {
    pub entity: EntityId,
    pub origin: NodeId,
    pub request_id: u64,
    pub hops: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) enum QueryFailure {
    HopLimit { hops: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct LocationReply {
    pub request_id: u64,
    pub entity: EntityId,
    pub result: Result<LocationRecord, QueryFailure>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct LocationUpdate {
    pub entity: EntityId,
    pub record: LocationRecord,
    /// Departing owner the home should confirm to.
    pub notify: Option<NodeId>,
}

/// Sent by the home to a departing owner once it knows `version`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct LocationConfirm {
    pub entity: EntityId,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MigrateIn {
    pub entity: EntityId,
    pub kind: String,
    pub version: u64,
    pub from: NodeId,
    pub state: Bytes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct MigrateAck {
    pub entity: EntityId,
    pub version: u64,
}
