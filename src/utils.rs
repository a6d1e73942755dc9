use anyhow::{bail, Result};

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Encode the given u32 as an array of big-endian bytes.
pub fn encode_u32(val: u32) -> [u8; 4] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u32.
pub fn decode_u32(val: &[u8]) -> Result<u32> {
    match val {
        [b0, b1, b2, b3] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => bail!("invalid byte array given to decode as u32, invalid len {} needed 4", val.len()),
    }
}

/// Map a key onto one of `partitions` buckets.
///
/// The hash is stable across processes and restarts, which routing of records to topic
/// partitions depends upon.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    (seahash::hash(key.as_bytes()) % u64::from(partitions)) as u32
}

/// The name of the private control queue of a stage replica.
pub fn control_queue_name(stage: &str, index: u32) -> String {
    format!("{}.control.{}", stage, index)
}

/// Derive the ID of a message published by the given stage for the given input message.
///
/// The derivation is deterministic, so that a redelivered input maps onto the same output ID,
/// while outputs of different stages landing in one queue do not collide.
pub fn derive_message_id(namespace: &str, message_id: u64) -> u64 {
    let mut buf = Vec::with_capacity(namespace.len() + 8);
    buf.extend_from_slice(namespace.as_bytes());
    buf.extend_from_slice(&encode_u64(message_id));
    seahash::hash(&buf)
}
