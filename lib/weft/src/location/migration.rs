// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::{debug, error};
use weft_common::{EntityId, NodeId};

use super::directory::LocationDirectory;
use super::kinds::EntityKind;
use super::messages::{
    LOC_UPDATE, LocationUpdate, MIGRATE_ACK, MIGRATE_IN, MigrateAck, MigrateIn,
};
use super::record::LocationRecord;
use crate::error::RoutingError;
use crate::handlers::{Handler, am_handler};

/// Moves entities between nodes.
///
/// The old owner packs the state and points its record at the new owner
/// while it still holds the entity's cell, so every message that was waiting
/// on the cell is forwarded behind the state on the same link.
pub struct MigrationCoordinator {
    directory: Arc<LocationDirectory>,
}

impl MigrationCoordinator {
    pub(crate) fn new(directory: Arc<LocationDirectory>) -> Self {
        Self { directory }
    }

    /// Ship a resident entity to `to`.
    ///
    /// Fails with [`RoutingError::MigrationInProgress`] while an earlier
    /// migration away from this node is unacknowledged. Must not be called
    /// from the entity's own message handler.
    pub fn migrate(&self, entity: EntityId, to: NodeId) -> Result<(), RoutingError> {
        let directory = &self.directory;
        let node = directory.node();
        let Some(resident) = directory.resident_handle(entity) else {
            return Err(self.not_here(entity));
        };
        if to == node {
            return Ok(());
        }

        let mut cell = resident.cell.lock();
        let Some(state) = cell.as_ref() else {
            return Err(self.not_here(entity));
        };
        let current = directory
            .cached(entity)
            .unwrap_or(LocationRecord::settled(node, 0));

        let packed = resident.vtable.pack(entity, state)?;
        let version = current.version + 1;
        directory.record_departure(
            entity,
            LocationRecord {
                owner: to,
                version,
                migrating: true,
            },
        );

        let msg = MigrateIn {
            entity,
            kind: resident.kind.to_string(),
            version,
            from: node,
            state: packed,
        };
        if let Err(e) = directory.messenger().send_system(to, MIGRATE_IN, &msg) {
            directory.cancel_departure(entity, current);
            return Err(e.into());
        }

        cell.take();
        drop(cell);
        directory.remove_resident(entity);
        debug!(%entity, %to, version, "entity migrated out");
        Ok(())
    }

    fn not_here(&self, entity: EntityId) -> RoutingError {
        match self.directory.cached(entity) {
            Some(record) if record.migrating && record.owner != self.directory.node() => {
                RoutingError::MigrationInProgress(entity)
            }
            _ => RoutingError::NotResident(entity),
        }
    }

    fn on_migrate_in(&self, msg: MigrateIn) -> Result<(), RoutingError> {
        let directory = &self.directory;
        let MigrateIn {
            entity,
            kind,
            version,
            from,
            state,
        } = msg;
        let kind = EntityKind::from(kind);
        let vtable = directory
            .kind(&kind)
            .ok_or_else(|| RoutingError::UnknownKind(kind.to_string()))?;
        let state = vtable.unpack(&state)?;
        directory.install(entity, kind, vtable, state, version)?;
        debug!(%entity, %from, version, "entity migrated in");

        let ack = MigrateAck { entity, version };
        directory.messenger().send_system(from, MIGRATE_ACK, &ack)?;

        let home = entity.home();
        if home != directory.node() && home != from {
            let update = LocationUpdate {
                entity,
                record: LocationRecord::settled(directory.node(), version),
                notify: Some(from),
            };
            directory
                .messenger()
                .send_system(home, LOC_UPDATE, &update)?;
        }
        Ok(())
    }

    pub(crate) fn system_handlers(self: &Arc<Self>) -> Vec<Handler> {
        let migrate_in = {
            let coordinator = self.clone();
            am_handler(MIGRATE_IN, move |ctx| {
                let msg: MigrateIn = ctx.decode()?;
                let entity = msg.entity;
                if let Err(e) = coordinator.on_migrate_in(msg) {
                    // the sender already forwards to us; nothing can recover this entity
                    error!(%entity, error = %e, "failed to install migrated entity");
                    return Err(e.into());
                }
                Ok(())
            })
            .inline()
            .build()
        };
        let migrate_ack = {
            let coordinator = self.clone();
            am_handler(MIGRATE_ACK, move |ctx| {
                let ack: MigrateAck = ctx.decode()?;
                coordinator.directory.acknowledge(ack.entity, ack.version);
                Ok(())
            })
            .inline()
            .build()
        };
        vec![migrate_in, migrate_ack]
    }
}
