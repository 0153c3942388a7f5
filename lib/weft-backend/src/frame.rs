// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame header and payload codec.

use bytes::Bytes;
use derive_builder::Builder;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use weft_common::{EpochId, NodeId};

/// Wire schema version stamped into every header.
pub const SCHEMA_VERSION: u8 = 1;

/// Errors encoding or decoding headers and typed payloads.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Deserialization failed.
    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The frame was produced by an incompatible peer.
    #[error("unsupported schema version {found} (expected {SCHEMA_VERSION})")]
    SchemaMismatch {
        /// Version found in the header.
        found: u8,
    },
}

/// Routing envelope of a frame.
///
/// `epoch` is the per-message epoch tag. It is threaded through transparently
/// so the receiving dispatcher can record the consume event without the
/// handler doing any bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(pattern = "owned")]
pub struct FrameHeader {
    /// Wire schema version.
    #[builder(default = "SCHEMA_VERSION")]
    pub schema_version: u8,

    /// Node that sent the frame.
    pub source: NodeId,

    /// Name of the handler to invoke on the receiver.
    #[builder(setter(into))]
    pub handler: String,

    /// Epoch the frame was produced under, if any.
    #[builder(default)]
    pub epoch: Option<EpochId>,
}

impl FrameHeader {
    /// Start building a header.
    pub fn builder() -> FrameHeaderBuilder {
        FrameHeaderBuilder::default()
    }

    /// Serialize the header for the wire.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(rmp_serde::to_vec(self)?))
    }

    /// Parse a header received from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let header: Self = rmp_serde::from_slice(bytes)?;
        if header.schema_version != SCHEMA_VERSION {
            return Err(CodecError::SchemaMismatch {
                found: header.schema_version,
            });
        }
        Ok(header)
    }
}

/// Serialize a typed payload.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(rmp_serde::to_vec(value)?))
}

/// Deserialize a typed payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_builder_defaults() {
        let header = FrameHeader::builder()
            .source(NodeId::new(3))
            .handler("ping")
            .build()
            .unwrap();
        assert_eq!(header.schema_version, SCHEMA_VERSION);
        assert_eq!(header.epoch, None);

        let decoded = FrameHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_missing_handler_fails() {
        let result = FrameHeader::builder().source(NodeId::new(0)).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let header = FrameHeader {
            schema_version: SCHEMA_VERSION + 1,
            source: NodeId::new(0),
            handler: "x".into(),
            epoch: None,
        };
        let bytes = rmp_serde::to_vec(&header).unwrap();
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(CodecError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        let result: Result<(u64, String), _> = decode_payload(b"\xc1\xc1");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
