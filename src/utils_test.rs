use anyhow::Result;

use crate::utils;

#[test]
fn decode_u32_rejects_invalid_len() {
    let res = utils::decode_u32(&[0, 1, 2]);
    assert!(res.is_err(), "expected decode_u32 to reject a 3 byte array");
}

#[test]
fn u32_encoding_keeps_order() -> Result<()> {
    let (low, high) = (utils::encode_u32(255), utils::encode_u32(256));
    assert!(low < high, "expected big-endian encoding to sort like the values");
    assert_eq!(utils::decode_u32(&high)?, 256);
    Ok(())
}

#[test]
fn partition_for_key_is_stable_and_bounded() {
    for key in ["EZE", "JFK", "LAX", "", "a-much-longer-key-with-dashes"] {
        let first = utils::partition_for_key(key, 3);
        let second = utils::partition_for_key(key, 3);
        assert_eq!(first, second, "expected partitioning of {:?} to be stable", key);
        assert!(first < 3, "expected partition of {:?} to be < 3, got {}", key, first);
    }
    assert_eq!(utils::partition_for_key("any", 0), 0, "expected 0 partitions to map to partition 0");
}

#[test]
fn control_queue_name_is_scoped_by_stage_and_index() {
    assert_eq!(utils::control_queue_name("avg_by_route", 2), "avg_by_route.control.2");
}

#[test]
fn derived_message_ids_are_deterministic_per_stage() {
    let first = utils::derive_message_id("filter", 7);
    assert_eq!(first, utils::derive_message_id("filter", 7), "expected redelivered inputs to map to the same id");
    assert_ne!(first, utils::derive_message_id("filter", 8));
    assert_ne!(first, utils::derive_message_id("tagger", 7), "expected stages to have distinct id spaces");
}
