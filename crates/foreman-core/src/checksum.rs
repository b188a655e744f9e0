use sha2::{Digest, Sha256};

use crate::Event;

/// Content hash of an event with its `checksum` field cleared.
///
/// serde_json emits struct fields in declaration order and `Value` objects as sorted maps,
/// so the encoding is stable across processes.
pub fn event_checksum(event: &Event) -> Result<String, serde_json::Error> {
    let mut unsealed = event.clone();
    unsealed.checksum = None;
    let bytes = serde_json::to_vec(&unsealed)?;
    Ok(digest_hex(&bytes))
}

/// True when the stored checksum matches the content. Events without a checksum fail.
pub fn verify(event: &Event) -> bool {
    match (&event.checksum, event_checksum(event)) {
        (Some(stored), Ok(actual)) => stored == &actual,
        _ => false,
    }
}

pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
