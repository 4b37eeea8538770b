// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for the rendezvous message codec: frame layout, limits, truncation.

use libsmem::codec::{Message, MsgType, BASE_FRAME_SIZE, MAX_VALUE_SIZE};
use libsmem::ErrCode;

#[test]
fn pack_unpack_identity() {
    let mut message = Message::with_key_value(MsgType::Set, "some/key", b"value".to_vec());
    message.user_tag = 42;
    message.keys.push("another".to_string());
    message.values.push(vec![0u8; 100]);

    let packed = message.pack().expect("pack");
    let (unpacked, consumed) = Message::unpack(&packed).expect("unpack");
    assert_eq!(consumed, packed.len());
    assert_eq!(unpacked, message);
}

#[test]
fn pack_empty_message() {
    let message = Message::new(MsgType::Heartbeat);
    let packed = message.pack().expect("pack");
    assert_eq!(packed.len(), BASE_FRAME_SIZE);
    let (unpacked, _) = Message::unpack(&packed).expect("unpack");
    assert_eq!(unpacked.mt, MsgType::Heartbeat);
    assert_eq!(unpacked.user_tag, -1);
    assert!(unpacked.keys.is_empty());
    assert!(unpacked.values.is_empty());
}

#[test]
fn unpack_all_opcodes() {
    for mt in [
        MsgType::Set,
        MsgType::Get,
        MsgType::Add,
        MsgType::Remove,
        MsgType::Append,
        MsgType::Cas,
        MsgType::Write,
        MsgType::WatchRankState,
        MsgType::Heartbeat,
    ] {
        let packed = Message::new(mt).pack().expect("pack");
        let (unpacked, _) = Message::unpack(&packed).expect("unpack");
        assert_eq!(unpacked.mt, mt);
    }
}

#[test]
fn truncated_input_rejected() {
    let packed = Message::with_key(MsgType::Get, "k").pack().expect("pack");
    for len in 0..packed.len() {
        assert_eq!(
            Message::unpack(&packed[..len]),
            Err(ErrCode::InvalidMessage),
            "truncation at {len} must be rejected"
        );
    }
}

#[test]
fn full_and_message_size() {
    let packed = Message::with_key(MsgType::Get, "key").pack().expect("pack");
    assert!(!Message::full(&packed[..BASE_FRAME_SIZE - 1]));
    assert!(!Message::full(&packed[..packed.len() - 1]));
    assert!(Message::full(&packed));
    assert_eq!(Message::message_size(&packed), packed.len() as i64);
    assert_eq!(Message::message_size(&packed[..5]), -1);

    // Trailing bytes after a complete frame stay untouched.
    let mut extended = packed.clone();
    extended.extend_from_slice(b"tail");
    let (_, consumed) = Message::unpack(&extended).expect("unpack");
    assert_eq!(consumed, packed.len());
}

#[test]
fn too_many_keys_rejected() {
    let mut message = Message::new(MsgType::Set);
    for i in 0..11 {
        message.keys.push(format!("key{i}"));
    }
    assert_eq!(message.pack(), Err(ErrCode::InvalidMessage));
}

#[test]
fn too_many_values_rejected() {
    let mut message = Message::new(MsgType::Set);
    for _ in 0..11 {
        message.values.push(vec![0u8; 4]);
    }
    assert_eq!(message.pack(), Err(ErrCode::InvalidMessage));
}

#[test]
fn oversized_key_rejected() {
    let message = Message::with_key(MsgType::Get, "k".repeat(2049));
    assert_eq!(message.pack(), Err(ErrCode::InvalidMessage));
}

#[test]
fn value_size_boundary() {
    let message = Message::with_key_value(
        MsgType::Set,
        "k",
        vec![0u8; MAX_VALUE_SIZE as usize],
    );
    let packed = message.pack().expect("64 MiB value packs");
    assert!(Message::unpack(&packed).is_ok());

    let message = Message::with_key_value(
        MsgType::Set,
        "k",
        vec![0u8; MAX_VALUE_SIZE as usize + 1],
    );
    assert_eq!(message.pack(), Err(ErrCode::InvalidMessage));
}

#[test]
fn corrupt_counts_rejected() {
    let packed = Message::with_key(MsgType::Get, "key").pack().expect("pack");
    // Patch key_count (at offset 18) to an absurd value.
    let mut corrupt = packed.clone();
    corrupt[18..26].copy_from_slice(&u64::MAX.to_le_bytes());
    assert_eq!(Message::unpack(&corrupt), Err(ErrCode::InvalidMessage));
}

#[test]
fn invalid_opcode_rejected() {
    let mut packed = Message::with_key(MsgType::Get, "key").pack().expect("pack");
    // msg_type sits after total_size + user_tag.
    packed[16..18].copy_from_slice(&100i16.to_le_bytes());
    assert_eq!(Message::unpack(&packed), Err(ErrCode::InvalidMessage));
}
