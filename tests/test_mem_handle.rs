// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Randomized serialization round-trips and access-flag behavior for
// memory handles.

use rand::Rng;

use libnal::{Access, MemHandle, Segment, IOV_MAX};

fn random_handle(rng: &mut impl Rng, max_segments: usize) -> MemHandle {
    let count = rng.random_range(1..=max_segments);
    let access = match rng.random_range(0..3) {
        0 => Access::ReadOnly,
        1 => Access::WriteOnly,
        _ => Access::ReadWrite,
    };
    let segments = (0..count)
        .map(|_| Segment {
            base: rng.random::<u64>() & 0x0000_7fff_ffff_ffff,
            len: rng.random_range(1..=1 << 20),
        })
        .collect();
    MemHandle::new(segments, access).unwrap()
}

#[test]
fn serialize_round_trip_randomized() {
    let mut rng = rand::rng();
    for _ in 0..200 {
        let handle = random_handle(&mut rng, 64);
        let bytes = handle.serialize();
        assert_eq!(bytes.len(), handle.serialized_len());
        let back = MemHandle::deserialize(&bytes).unwrap();
        assert_eq!(handle, back);
    }
}

#[test]
fn serialize_round_trip_max_segments() {
    let mut rng = rand::rng();
    let handle = random_handle(&mut rng, IOV_MAX);
    let back = MemHandle::deserialize(&handle.serialize()).unwrap();
    assert_eq!(handle, back);
}

#[test]
fn segment_count_limits() {
    assert!(MemHandle::new(Vec::new(), Access::ReadWrite).is_err());
    let too_many = (0..IOV_MAX + 1)
        .map(|i| Segment {
            base: i as u64,
            len: 1,
        })
        .collect();
    assert!(MemHandle::new(too_many, Access::ReadWrite).is_err());
}

#[test]
fn access_flags() {
    assert!(Access::ReadOnly.readable());
    assert!(!Access::ReadOnly.writable());
    assert!(!Access::WriteOnly.readable());
    assert!(Access::WriteOnly.writable());
    assert!(Access::ReadWrite.readable());
    assert!(Access::ReadWrite.writable());
}

#[test]
fn total_length_is_segment_sum() {
    let h = MemHandle::new(
        vec![
            Segment { base: 0x1000, len: 10 },
            Segment { base: 0x2000, len: 30 },
        ],
        Access::ReadOnly,
    )
    .unwrap();
    assert_eq!(h.len(), 40);
    assert_eq!(h.segments().len(), 2);
}
