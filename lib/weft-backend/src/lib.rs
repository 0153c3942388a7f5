// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Point-to-point frame transport for the weft runtime.
//!
//! A [`Transport`] moves opaque `(header, payload)` frames from one node to a
//! named destination node. Delivery is fire-and-forget and FIFO per
//! (source, destination) pair; nothing is guaranteed across different sources.
//!
//! Inbound frames arrive on a [`DataStream`] as [`InboundFrame`]s. Each one
//! carries an [`InFlightGuard`] charged to the sending node, so
//! [`Transport::in_flight`] reports frames that were sent but not yet fully
//! processed by their receiver.
//!
//! [`LocalFabric`] connects `N` transports inside one process and is what
//! the runtime's cluster harness and tests run on.

mod frame;
mod local;
mod transport;

pub use frame::{
    CodecError, FrameHeader, FrameHeaderBuilder, FrameHeaderBuilderError, SCHEMA_VERSION,
    decode_payload, encode_payload,
};
pub use local::{LocalFabric, LocalTransport};
pub use transport::{
    DataStream, InFlightCounter, InFlightGuard, InboundFrame, Transport, TransportError,
};

pub use weft_common::NodeId;
