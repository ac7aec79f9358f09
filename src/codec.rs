//! Canonical serialization, digests, and checksummed binary envelopes.
//!
//! Every component that persists or digests a state goes through this
//! module so the same bytes always produce the same checksum.

use crate::error::{Result, StoreError};
use crate::types::{Checksum, WorkflowState};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes for sealed envelopes.
const SEAL_MAGIC: &[u8; 4] = b"SVK\0";

/// Current envelope format version.
const SEAL_VERSION: u8 = 1;

/// Canonical JSON bytes of a state.
///
/// `WorkflowState` keeps its fields in a `BTreeMap` and `serde_json`
/// sorts object keys, so the output is byte-stable across processes.
pub fn canonical_bytes(state: &WorkflowState) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(state)?)
}

/// Digest of a state's canonical bytes.
pub fn digest(state: &WorkflowState) -> Result<Checksum> {
    Ok(Checksum::from_bytes(&canonical_bytes(state)?))
}

/// Encode a record for persistence (MessagePack).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a persisted record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// Wrap bytes in a checksummed envelope: magic, version, length, payload, CRC32.
pub fn seal(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 13);
    out.extend_from_slice(SEAL_MAGIC);
    out.push(SEAL_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out
}

/// Unwrap a sealed envelope, verifying magic, length, and CRC32.
pub fn unseal(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < 13 {
        return Err(StoreError::InvalidFormat("envelope too short".into()));
    }
    if &bytes[0..4] != SEAL_MAGIC {
        return Err(StoreError::InvalidFormat("bad envelope magic".into()));
    }
    if bytes[4] != SEAL_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "unsupported envelope version: {}",
            bytes[4]
        )));
    }
    let len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    if bytes.len() != 13 + len {
        return Err(StoreError::Corruption(format!(
            "envelope length mismatch: header says {}, have {}",
            len,
            bytes.len().saturating_sub(13)
        )));
    }
    let payload = &bytes[9..9 + len];
    let stored = u32::from_le_bytes([
        bytes[9 + len],
        bytes[10 + len],
        bytes[11 + len],
        bytes[12 + len],
    ]);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(StoreError::Corruption(format!(
            "envelope CRC mismatch: stored {stored:08x}, computed {computed:08x}"
        )));
    }
    Ok(payload.to_vec())
}
