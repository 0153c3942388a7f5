// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Migration-aware entity location.
//!
//! Every entity has a home node, fixed by its id. The node that currently
//! hosts an entity holds the authoritative [`LocationRecord`]; every other
//! node keeps at most a cached hint. The home node is always told where its
//! entities went, so a node without a hint can ask there.
//!
//! Messages for an entity are sent to the best known owner. A node that no
//! longer hosts the entity forwards along its own record, and the final owner
//! sends the origin a fresher record once the message needed more than one
//! hop. Stale hints therefore cost hops, never misdelivery. A message that is
//! still moving after `location.max_hops` forwards means the records form a
//! cycle, which stops the node.
//!
//! Work for an entity that has not been registered yet waits at its home
//! node and is replayed once the entity appears.

mod directory;
mod kinds;
mod messages;
mod migration;
mod record;

pub use directory::LocationDirectory;
pub use kinds::{EntityContext, EntityKind};
pub use migration::MigrationCoordinator;
pub use record::LocationRecord;
