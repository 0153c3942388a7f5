// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use weft_backend::{decode_payload, encode_payload};
use weft_common::{EntityId, EpochId, NodeId};

use super::kinds::{EntityContext, EntityKind, KindVTable, State};
use super::messages::{
    LOC_CONFIRM, LOC_QUERY, LOC_REPLY, LOC_ROUTE, LOC_UPDATE, LocationConfirm, LocationQuery,
    LocationReply, LocationUpdate, QueryFailure, RoutedMessage,
};
use super::record::LocationRecord;
use crate::config::LocationConfig;
use crate::epoch::{EpochManager, WorkGuard};
use crate::error::{FatalReporter, ProtocolViolation, RoutingError};
use crate::handlers::{Handler, am_handler};
use crate::messenger::Messenger;

/// An entity hosted on this node.
#[derive(Clone)]
pub(super) struct Resident {
    pub(super) kind: EntityKind,
    pub(super) vtable: Arc<KindVTable>,
    /// `None` once the state has been shipped away.
    pub(super) cell: Arc<Mutex<Option<State>>>,
}

/// Work waiting on the home node for an entity nobody has registered yet.
enum Parked {
    Route {
        msg: RoutedMessage,
        epoch: Option<EpochId>,
        guard: Option<WorkGuard>,
    },
    Query(LocationQuery),
}

/// Per-node view of where entities live.
///
/// Records are kept in two places. `records` holds the ones this node must
/// never forget: entities homed here, entities hosted here, and forward
/// pointers left behind by a migration until the home confirms it has heard
/// of the new owner. Every other forward pointer is a hint in the bounded
/// LRU `cache`; losing one only costs a detour through the home node.
pub struct LocationDirectory {
    node: NodeId,
    messenger: Arc<Messenger>,
    epochs: Arc<EpochManager>,
    fatal: FatalReporter,
    config: LocationConfig,
    kinds: DashMap<EntityKind, Arc<KindVTable>>,
    resident: DashMap<EntityId, Resident>,
    records: DashMap<EntityId, LocationRecord>,
    /// Version of the last departure per entity, until the home confirms it.
    departures: DashMap<EntityId, u64>,
    cache: Mutex<LruCache<EntityId, LocationRecord>>,
    pending: DashMap<EntityId, Vec<Parked>>,
    requests: DashMap<u64, oneshot::Sender<Result<NodeId, RoutingError>>>,
    next_entity: AtomicU64,
    next_request: AtomicU64,
}

impl LocationDirectory {
    pub(crate) fn new(
        messenger: Arc<Messenger>,
        epochs: Arc<EpochManager>,
        fatal: FatalReporter,
        config: LocationConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            node: messenger.node(),
            messenger,
            epochs,
            fatal,
            config,
            kinds: DashMap::new(),
            resident: DashMap::new(),
            records: DashMap::new(),
            departures: DashMap::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            pending: DashMap::new(),
            requests: DashMap::new(),
            next_entity: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Add an entity kind to the capability table.
    ///
    /// `handler` runs for every message delivered to an entity of this kind,
    /// with exclusive access to its state. It must not migrate the entity it
    /// is handling.
    pub fn register_kind<S, M, F>(
        &self,
        kind: impl Into<EntityKind>,
        handler: F,
    ) -> Result<(), RoutingError>
    where
        S: Serialize + serde::de::DeserializeOwned + Send + 'static,
        M: serde::de::DeserializeOwned + 'static,
        F: Fn(&mut S, M, &EntityContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        match self.kinds.entry(kind.into()) {
            Entry::Occupied(entry) => {
                Err(RoutingError::KindAlreadyRegistered(entry.key().to_string()))
            }
            Entry::Vacant(entry) => {
                debug!(kind = %entry.key(), "registered entity kind");
                entry.insert(Arc::new(KindVTable::new::<S, M, F>(handler)));
                Ok(())
            }
        }
    }

    /// Mint an entity id homed on this node.
    pub fn new_entity_id(&self) -> Result<EntityId, RoutingError> {
        let seq = self.next_entity.fetch_add(1, Ordering::Relaxed);
        EntityId::new(self.node, seq).map_err(|_| RoutingError::Exhausted)
    }

    /// Host `entity` on this node with initial `state`.
    ///
    /// Registering away from home tells the home node where to find it.
    /// Work parked here for the entity is replayed.
    pub fn register<S: Send + 'static>(
        self: &Arc<Self>,
        entity: EntityId,
        kind: impl Into<EntityKind>,
        state: S,
    ) -> Result<(), RoutingError> {
        let kind = kind.into();
        let vtable = self
            .kinds
            .get(&kind)
            .map(|v| v.value().clone())
            .ok_or_else(|| RoutingError::UnknownKind(kind.to_string()))?;
        if !vtable.accepts::<S>() {
            return Err(RoutingError::StateTypeMismatch(entity));
        }

        let version = self.record(entity).map_or(0, |r| r.version + 1);
        self.host(entity, kind.clone(), vtable, Box::new(state), version)?;
        debug!(%entity, %kind, version, "entity registered");

        if entity.home() != self.node {
            self.send_update(entity.home(), entity);
        }
        self.flush_pending(entity);
        Ok(())
    }

    pub fn is_resident(&self, entity: EntityId) -> bool {
        self.resident.contains_key(&entity)
    }

    /// This node's record for `entity`, if any.
    pub fn cached(&self, entity: EntityId) -> Option<LocationRecord> {
        self.record(entity)
    }

    /// Best current guess of the owner. Resolves on a cache miss.
    pub async fn lookup(self: &Arc<Self>, entity: EntityId) -> Result<NodeId, RoutingError> {
        if self.is_resident(entity) {
            return Ok(self.node);
        }
        if let Some(owner) = self.hint(entity) {
            return Ok(owner);
        }
        self.resolve(entity, None).await
    }

    /// Ask `via` (default: the cached owner, else the home node) where
    /// `entity` lives. The query chases forward pointers until it reaches
    /// the owner, whose answer refreshes this node's cache.
    pub async fn resolve(
        self: &Arc<Self>,
        entity: EntityId,
        via: Option<NodeId>,
    ) -> Result<NodeId, RoutingError> {
        if via.is_none() && self.is_resident(entity) {
            return Ok(self.node);
        }
        let dest = via
            .or_else(|| self.next_hop(entity))
            .unwrap_or(self.node);

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.requests.insert(request_id, tx);

        let query = LocationQuery {
            entity,
            origin: self.node,
            request_id,
            hops: 0,
        };
        if let Err(e) = self.messenger.send_system(dest, LOC_QUERY, &query) {
            self.requests.remove(&request_id);
            return Err(e.into());
        }
        trace!(%entity, %dest, request_id, "resolve");
        rx.await.map_err(|_| RoutingError::Abandoned(entity))?
    }

    /// Apply a post-migration location. Ignored unless it is newer than what
    /// this node already knows.
    pub fn update_after_migration(
        self: &Arc<Self>,
        entity: EntityId,
        new_owner: NodeId,
        version: u64,
    ) -> bool {
        let applied = self.apply(entity, LocationRecord::settled(new_owner, version));
        if applied && entity.home() == self.node {
            self.flush_pending(entity);
        }
        applied
    }

    /// Send `msg` to `entity` wherever it lives, tagged with `epoch`.
    pub fn send_to_entity<M: Serialize>(
        &self,
        epoch: Option<EpochId>,
        entity: EntityId,
        msg: &M,
    ) -> Result<(), RoutingError> {
        let routed = RoutedMessage {
            entity,
            origin: self.node,
            hops: 0,
            body: encode_payload(msg)?,
        };
        let dest = if self.is_resident(entity) {
            self.node
        } else {
            self.next_hop(entity).unwrap_or(self.node)
        };
        self.forward(dest, epoch, &routed)
    }

    /// Read an entity's state in place.
    pub fn inspect<S: 'static, R>(
        &self,
        entity: EntityId,
        f: impl FnOnce(&S) -> R,
    ) -> Result<R, RoutingError> {
        let resident = self
            .resident_handle(entity)
            .ok_or(RoutingError::NotResident(entity))?;
        let cell = resident.cell.lock();
        let state = cell.as_ref().ok_or(RoutingError::NotResident(entity))?;
        let state = state
            .downcast_ref::<S>()
            .ok_or(RoutingError::StateTypeMismatch(entity))?;
        Ok(f(state))
    }

    /// Evictable forward pointers currently cached.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    // ---- crate-private surface used by migration ----------------------

    pub(super) fn kind(&self, kind: &EntityKind) -> Option<Arc<KindVTable>> {
        self.kinds.get(kind).map(|v| v.value().clone())
    }

    pub(super) fn resident_handle(&self, entity: EntityId) -> Option<Resident> {
        self.resident.get(&entity).map(|r| r.value().clone())
    }

    /// Point the departing owner's record at the new owner. The pointer is
    /// pinned until the home confirms `record.version`.
    pub(super) fn record_departure(&self, entity: EntityId, record: LocationRecord) {
        self.records.insert(entity, record);
        if entity.home() != self.node {
            self.departures.insert(entity, record.version);
        }
    }

    /// Undo [`Self::record_departure`] after the state could not be shipped.
    pub(super) fn cancel_departure(&self, entity: EntityId, previous: LocationRecord) {
        self.departures.remove(&entity);
        self.records.insert(entity, previous);
    }

    pub(super) fn remove_resident(&self, entity: EntityId) {
        self.resident.remove(&entity);
    }

    /// Host an entity that just arrived by migration.
    pub(super) fn install(
        self: &Arc<Self>,
        entity: EntityId,
        kind: EntityKind,
        vtable: Arc<KindVTable>,
        state: State,
        version: u64,
    ) -> Result<(), RoutingError> {
        self.host(entity, kind, vtable, state, version)?;
        self.flush_pending(entity);
        Ok(())
    }

    /// The resident map and the record map are never locked together.
    fn host(
        &self,
        entity: EntityId,
        kind: EntityKind,
        vtable: Arc<KindVTable>,
        state: State,
        version: u64,
    ) -> Result<(), RoutingError> {
        match self.resident.entry(entity) {
            Entry::Occupied(_) => return Err(RoutingError::AlreadyResident(entity)),
            Entry::Vacant(entry) => {
                entry.insert(Resident {
                    kind,
                    vtable,
                    cell: Arc::new(Mutex::new(Some(state))),
                });
            }
        }
        self.records
            .insert(entity, LocationRecord::settled(self.node, version));
        self.cache.lock().pop(&entity);
        Ok(())
    }

    /// Clear the pending-migration flag once the new owner confirmed `version`.
    /// A new owner that is also the home confirms the departure as well.
    pub(super) fn acknowledge(&self, entity: EntityId, version: u64) {
        let reached_home = match self.records.get_mut(&entity) {
            Some(mut record) if record.version == version => {
                record.migrating = false;
                record.owner == entity.home()
            }
            _ => false,
        };
        if reached_home {
            self.confirm_departure(entity, version);
        }
    }

    /// The home knows about `version`; the departure pointer becomes an
    /// ordinary evictable hint.
    fn confirm_departure(&self, entity: EntityId, version: u64) {
        if self
            .departures
            .remove_if(&entity, |_, departed| *departed <= version)
            .is_none()
        {
            return;
        }
        if self.is_resident(entity) {
            return;
        }
        if let Some((_, record)) = self.records.remove(&entity) {
            trace!(%entity, version, "departure confirmed by home");
            // the home only hears of a version after it was installed
            self.cache_hint(
                entity,
                LocationRecord {
                    migrating: false,
                    ..record
                },
            );
        }
    }

    pub(super) fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    // ---- routing --------------------------------------------------------

    /// Where to send something for `entity` that is not resident here.
    fn next_hop(&self, entity: EntityId) -> Option<NodeId> {
        match self.hint(entity) {
            Some(owner) => Some(owner),
            None if entity.home() != self.node => Some(entity.home()),
            None => None,
        }
    }

    fn hint(&self, entity: EntityId) -> Option<NodeId> {
        self.record(entity)
            .map(|r| r.owner)
            .filter(|owner| *owner != self.node)
    }

    /// Newest of the pinned record and the cached hint.
    fn record(&self, entity: EntityId) -> Option<LocationRecord> {
        let pinned = self.records.get(&entity).map(|r| *r);
        let hint = self.cache.lock().get(&entity).copied();
        match (pinned, hint) {
            (Some(pinned), Some(hint)) if hint.supersedes(&pinned) => Some(hint),
            (Some(pinned), _) => Some(pinned),
            (None, hint) => hint,
        }
    }

    fn is_pinned(&self, entity: EntityId) -> bool {
        entity.home() == self.node
            || self.departures.contains_key(&entity)
            || self.records.contains_key(&entity)
    }

    fn forward(
        &self,
        dest: NodeId,
        epoch: Option<EpochId>,
        msg: &RoutedMessage,
    ) -> Result<(), RoutingError> {
        let payload = encode_payload(msg)?;
        match epoch {
            Some(epoch) => self.epochs.send(epoch, dest, LOC_ROUTE, payload)?,
            None => self.messenger.send_raw(dest, LOC_ROUTE, None, payload)?,
        }
        Ok(())
    }

    fn on_route(self: &Arc<Self>, epoch: Option<EpochId>, msg: RoutedMessage) {
        if let Some(resident) = self.resident_handle(msg.entity) {
            let mut cell = resident.cell.lock();
            if let Some(state) = cell.as_mut() {
                let ctx = EntityContext {
                    entity: msg.entity,
                    epoch,
                    directory: self.clone(),
                };
                if let Err(e) = resident.vtable.deliver(state, &msg.body, &ctx) {
                    warn!(entity = %msg.entity, kind = %resident.kind, error = %e, "entity handler failed");
                }
                drop(cell);
                if msg.hops > 0 && msg.origin != self.node {
                    self.send_update(msg.origin, msg.entity);
                }
                return;
            }
            // shipped away while we waited for the cell; the record now
            // points at the new owner
        }
        self.forward_route(epoch, msg);
    }

    fn forward_route(self: &Arc<Self>, epoch: Option<EpochId>, mut msg: RoutedMessage) {
        if msg.hops >= self.config.max_hops {
            self.fatal.report(ProtocolViolation::ForwardingCycle {
                entity: msg.entity,
                hops: msg.hops,
            });
            return;
        }

        match self.next_hop(msg.entity) {
            Some(dest) => {
                msg.hops += 1;
                trace!(entity = %msg.entity, %dest, hops = msg.hops, "forwarding");
                if let Err(e) = self.forward(dest, epoch, &msg) {
                    error!(entity = %msg.entity, %dest, error = %e, "failed to forward entity message");
                }
            }
            None => {
                let guard = match epoch.map(|e| self.epochs.hold(e)).transpose() {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!(entity = %msg.entity, error = %e, "cannot park message under a dead epoch");
                        return;
                    }
                };
                let entity = msg.entity;
                if let Some(Parked::Route { msg, epoch, guard }) =
                    self.park(entity, Parked::Route { msg, epoch, guard })
                {
                    self.on_route(epoch, msg);
                    drop(guard);
                }
            }
        }
    }

    fn on_query(self: &Arc<Self>, mut query: LocationQuery) {
        let entity = query.entity;
        if self.is_resident(entity) {
            let record = self
                .cached(entity)
                .unwrap_or(LocationRecord::settled(self.node, 0));
            self.reply(&query, Ok(record));
            return;
        }

        if query.hops >= self.config.max_hops {
            self.reply(&query, Err(QueryFailure::HopLimit { hops: query.hops }));
            self.fatal.report(ProtocolViolation::ForwardingCycle {
                entity,
                hops: query.hops,
            });
            return;
        }

        match self.next_hop(entity) {
            Some(dest) => {
                query.hops += 1;
                self.messenger.notify(dest, LOC_QUERY, &query);
            }
            None => {
                if let Some(Parked::Query(query)) = self.park(entity, Parked::Query(query)) {
                    self.on_query(query);
                }
            }
        }
    }

    fn reply(&self, query: &LocationQuery, result: Result<LocationRecord, QueryFailure>) {
        let reply = LocationReply {
            request_id: query.request_id,
            entity: query.entity,
            result,
        };
        self.messenger.notify(query.origin, LOC_REPLY, &reply);
    }

    fn on_reply(&self, reply: LocationReply) {
        let result = match reply.result {
            Ok(record) => {
                self.apply(reply.entity, record);
                Ok(record.owner)
            }
            Err(QueryFailure::HopLimit { hops }) => Err(RoutingError::HopLimitExceeded {
                entity: reply.entity,
                hops,
            }),
        };
        match self.requests.remove(&reply.request_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => debug!(request_id = reply.request_id, "reply for unknown request"),
        }
    }

    fn on_update(self: &Arc<Self>, update: LocationUpdate) {
        let LocationUpdate {
            entity,
            record,
            notify,
        } = update;
        let at_home = entity.home() == self.node;
        if self.apply(entity, record) && at_home {
            self.flush_pending(entity);
        }

        // applied or not, the home now knows this version or a newer one
        if let Some(previous) = notify
            && at_home
        {
            let confirm = LocationConfirm {
                entity,
                version: record.version,
            };
            self.messenger.notify(previous, LOC_CONFIRM, &confirm);
        }
    }

    fn send_update(&self, dest: NodeId, entity: EntityId) {
        let Some(record) = self.cached(entity) else {
            return;
        };
        let update = LocationUpdate {
            entity,
            record,
            notify: None,
        };
        self.messenger.notify(dest, LOC_UPDATE, &update);
    }

    /// Version-monotonic update. The owner's own record is never
    /// overwritten from outside.
    fn apply(&self, entity: EntityId, record: LocationRecord) -> bool {
        if self.is_resident(entity) {
            return false;
        }
        let applied = if self.is_pinned(entity) {
            match self.records.entry(entity) {
                Entry::Vacant(entry) => {
                    entry.insert(record);
                    true
                }
                Entry::Occupied(mut entry) => {
                    if record.supersedes(entry.get()) {
                        entry.insert(record);
                        true
                    } else {
                        false
                    }
                }
            }
        } else {
            self.cache_hint(entity, record)
        };
        if applied {
            trace!(%entity, owner = %record.owner, version = record.version, "location updated");
        }
        applied
    }

    /// Insert into the LRU cache, evicting the least recently used hint
    /// when full.
    fn cache_hint(&self, entity: EntityId, record: LocationRecord) -> bool {
        let mut cache = self.cache.lock();
        if let Some(current) = cache.peek(&entity)
            && !record.supersedes(current)
        {
            return false;
        }
        cache.put(entity, record);
        true
    }

    /// Park work for an entity this node cannot place. Hands the work back
    /// if the entity became reachable in the meantime.
    fn park(&self, entity: EntityId, work: Parked) -> Option<Parked> {
        let mut parked = self.pending.entry(entity).or_default();
        if self.is_resident(entity) || self.next_hop(entity).is_some() {
            return Some(work);
        }
        trace!(%entity, "parked until the entity registers");
        parked.push(work);
        None
    }

    fn flush_pending(self: &Arc<Self>, entity: EntityId) {
        let Some((_, parked)) = self.pending.remove(&entity) else {
            return;
        };
        debug!(%entity, count = parked.len(), "replaying parked work");
        for work in parked {
            match work {
                Parked::Route { msg, epoch, guard } => {
                    self.on_route(epoch, msg);
                    drop(guard);
                }
                Parked::Query(query) => self.on_query(query),
            }
        }
    }

    pub(crate) fn system_handlers(self: &Arc<Self>) -> Vec<Handler> {
        let route = {
            let directory = self.clone();
            am_handler(LOC_ROUTE, move |ctx| {
                let (_source, epoch, payload, _node) = ctx.dissolve();
                directory.on_route(epoch, decode_payload(&payload)?);
                Ok(())
            })
            .inline()
            .build()
        };
        let query = {
            let directory = self.clone();
            am_handler(LOC_QUERY, move |ctx| {
                directory.on_query(ctx.decode()?);
                Ok(())
            })
            .inline()
            .build()
        };
        let reply = {
            let directory = self.clone();
            am_handler(LOC_REPLY, move |ctx| {
                directory.on_reply(ctx.decode()?);
                Ok(())
            })
            .inline()
            .build()
        };
        let update = {
            let directory = self.clone();
            am_handler(LOC_UPDATE, move |ctx| {
                directory.on_update(ctx.decode()?);
                Ok(())
            })
            .inline()
            .build()
        };
        let confirm = {
            let directory = self.clone();
            am_handler(LOC_CONFIRM, move |ctx| {
                let confirm: LocationConfirm = ctx.decode()?;
                directory.confirm_departure(confirm.entity, confirm.version);
                Ok(())
            })
            .inline()
            .build()
        };
        vec![route, query, reply, update, confirm]
    }
}
