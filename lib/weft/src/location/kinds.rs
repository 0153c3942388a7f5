// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Entity kinds.
//!
//! A kind is a row in a capability table: how to deliver a message to an
//! entity's state, and how to pack and unpack that state when it migrates.
//! The directory dispatches through the table by kind name.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use weft_backend::{CodecError, decode_payload, encode_payload};
use weft_common::{EntityId, EpochId, NodeId};

use super::LocationDirectory;
use crate::error::RoutingError;

pub(crate) type State = Box<dyn Any + Send>;

type DeliverFn = dyn Fn(&mut (dyn Any + Send), &[u8], &EntityContext) -> anyhow::Result<()>
    + Send
    + Sync;
type PackFn = dyn Fn(&(dyn Any + Send)) -> Option<Result<Bytes, CodecError>> + Send + Sync;
type UnpackFn = dyn Fn(&[u8]) -> Result<State, CodecError> + Send + Sync;

/// Name of an entity kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKind(Arc<str>);

impl EntityKind {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityKind {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) struct KindVTable {
    state_type: TypeId,
    deliver: Box<DeliverFn>,
    pack: Box<PackFn>,
    unpack: Box<UnpackFn>,
}

impl KindVTable {
    pub(crate) fn new<S, M, F>(handler: F) -> Self
    where
        S: Serialize + DeserializeOwned + Send + 'static,
        M: DeserializeOwned + 'static,
        F: Fn(&mut S, M, &EntityContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            state_type: TypeId::of::<S>(),
            deliver: Box::new(move |state, body, ctx| {
                let state = state
                    .downcast_mut::<S>()
                    .ok_or_else(|| anyhow::anyhow!("state of {} has the wrong type", ctx.entity))?;
                let msg: M = decode_payload(body)?;
                handler(state, msg, ctx)
            }),
            pack: Box::new(|state| state.downcast_ref::<S>().map(encode_payload)),
            unpack: Box::new(|bytes| Ok(Box::new(decode_payload::<S>(bytes)?) as State)),
        }
    }

    pub(crate) fn accepts<S: 'static>(&self) -> bool {
        self.state_type == TypeId::of::<S>()
    }

    pub(crate) fn deliver(
        &self,
        state: &mut State,
        body: &[u8],
        ctx: &EntityContext,
    ) -> anyhow::Result<()> {
        (self.deliver)(state.as_mut(), body, ctx)
    }

    pub(crate) fn pack(&self, entity: EntityId, state: &State) -> Result<Bytes, RoutingError> {
        match (self.pack)(state.as_ref()) {
            Some(bytes) => Ok(bytes?),
            None => Err(RoutingError::StateTypeMismatch(entity)),
        }
    }

    pub(crate) fn unpack(&self, bytes: &[u8]) -> Result<State, CodecError> {
        (self.unpack)(bytes)
    }
}

/// Handed to an entity's message handler.
pub struct EntityContext {
    pub(crate) entity: EntityId,
    pub(crate) epoch: Option<EpochId>,
    pub(crate) directory: Arc<LocationDirectory>,
}

impl EntityContext {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Epoch the message was sent under.
    pub fn epoch(&self) -> Option<EpochId> {
        self.epoch
    }

    /// Node currently hosting the entity.
    pub fn node(&self) -> NodeId {
        self.directory.node()
    }

    /// Route a message to another (or the same) entity under the inherited
    /// epoch. Self-sends are queued, never delivered re-entrantly.
    pub fn send_to_entity<M: Serialize>(
        &self,
        target: EntityId,
        msg: &M,
    ) -> Result<(), RoutingError> {
        self.directory.send_to_entity(self.epoch, target, msg)
    }
}
