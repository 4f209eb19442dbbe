// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Copy-slot arena: 64 fixed-size payload slots in shared memory, managed
// by a 64-bit availability bitmask (bit i set ⇔ slot i free).
//
// Producers reserve a slot with a CAS on the bitmask, copy their payload
// in, and publish the slot index through a ring header. The consumer
// copies the payload out and ORs the bit back. Reservations are
// additionally serialized by a process-local spin lock so concurrent
// local senders do not thrash the same low bits.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::NaResult;
use crate::shm::ShmRegion;
use crate::spin_lock::SpinLock;

/// Number of payload slots.
pub const NUM_BUFS: usize = 64;
/// Size of one payload slot; the transport's maximum message size.
pub const COPY_SIZE: usize = 4096;

#[repr(C)]
struct ArenaLayout {
    available: AtomicU64,
    _pad: [u8; 64 - 8],
    slots: [[u8; COPY_SIZE]; NUM_BUFS],
}

const _: () = assert!(std::mem::size_of::<ArenaLayout>() == 64 + NUM_BUFS * COPY_SIZE);

/// A mapped copy-slot arena. The listening endpoint creates one; every
/// peer that looks the endpoint up maps the same object.
pub struct CopyBuf {
    shm: ShmRegion,
    reserve_lock: SpinLock,
}

impl CopyBuf {
    pub fn create(name: &str) -> NaResult<CopyBuf> {
        let shm = ShmRegion::create(name, std::mem::size_of::<ArenaLayout>())?;
        let arena = CopyBuf {
            shm,
            reserve_lock: SpinLock::new(),
        };
        arena.layout().available.store(u64::MAX, Ordering::Release);
        Ok(arena)
    }

    pub fn open(name: &str) -> NaResult<CopyBuf> {
        let shm = ShmRegion::open(name, std::mem::size_of::<ArenaLayout>())?;
        Ok(CopyBuf {
            shm,
            reserve_lock: SpinLock::new(),
        })
    }

    fn layout(&self) -> &ArenaLayout {
        unsafe { &*(self.shm.as_ptr() as *const ArenaLayout) }
    }

    /// Reserve the lowest free slot and copy `data` into it. Returns the
    /// slot index, or `None` when no slot is free.
    pub fn reserve_and_copy(&self, data: &[u8]) -> Option<u8> {
        assert!(data.len() <= COPY_SIZE);
        self.reserve_lock.lock();
        let slot = self.reserve();
        if let Some(i) = slot {
            let dst = unsafe {
                (self.shm.as_mut_ptr() as *mut ArenaLayout)
                    .cast::<u8>()
                    .add(64 + i as usize * COPY_SIZE)
            };
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        }
        self.reserve_lock.unlock();
        slot
    }

    fn reserve(&self) -> Option<u8> {
        let avail = &self.layout().available;
        let mut mask = avail.load(Ordering::Acquire);
        loop {
            if mask == 0 {
                return None;
            }
            let i = mask.trailing_zeros();
            let bit = 1u64 << i;
            match avail.compare_exchange(mask, mask & !bit, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(i as u8),
                // Lost a race to a peer reservation: retry from the next
                // candidate of the refreshed mask.
                Err(current) => mask = current,
            }
        }
    }

    /// Copy `len` bytes out of slot `i` and free the slot. The pairing is
    /// what keeps the bitmask conserved: every published header is
    /// eventually drained through here (or `release`).
    pub fn copy_out_and_release(&self, i: u8, len: usize) -> Vec<u8> {
        assert!((i as usize) < NUM_BUFS && len <= COPY_SIZE);
        let src = unsafe {
            (self.shm.as_ptr() as *const ArenaLayout)
                .cast::<u8>()
                .add(64 + i as usize * COPY_SIZE)
        };
        let mut out = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
        self.release(i);
        out
    }

    /// Free slot `i` without reading it.
    pub fn release(&self, i: u8) {
        debug_assert!((i as usize) < NUM_BUFS);
        self.layout()
            .available
            .fetch_or(1u64 << i, Ordering::AcqRel);
    }

    /// Current availability bitmask (all-ones when nothing is in flight).
    pub fn available_mask(&self) -> u64 {
        self.layout().available.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(tag: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("nal-arena-test-{}-{}-{}", std::process::id(), tag, n)
    }

    #[test]
    fn reserve_copy_release_round_trip() {
        let arena = CopyBuf::create(&unique_name("rt")).unwrap();
        assert_eq!(arena.available_mask(), u64::MAX);

        let payload = b"some payload bytes";
        let slot = arena.reserve_and_copy(payload).unwrap();
        assert_eq!(arena.available_mask() & (1 << slot), 0);

        let back = arena.copy_out_and_release(slot, payload.len());
        assert_eq!(back, payload);
        assert_eq!(arena.available_mask(), u64::MAX);
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = CopyBuf::create(&unique_name("full")).unwrap();
        let mut slots = Vec::new();
        for _ in 0..NUM_BUFS {
            slots.push(arena.reserve_and_copy(&[0xAB]).unwrap());
        }
        assert_eq!(arena.available_mask(), 0);
        assert!(arena.reserve_and_copy(&[0xCD]).is_none());

        arena.release(slots[17]);
        assert_eq!(arena.reserve_and_copy(&[0xEF]), Some(slots[17]));

        for s in slots {
            arena.release(s);
        }
        assert_eq!(arena.available_mask(), u64::MAX);
    }

    #[test]
    fn lowest_free_bit_first() {
        let arena = CopyBuf::create(&unique_name("low")).unwrap();
        assert_eq!(arena.reserve_and_copy(&[1]), Some(0));
        assert_eq!(arena.reserve_and_copy(&[2]), Some(1));
        arena.release(0);
        assert_eq!(arena.reserve_and_copy(&[3]), Some(0));
    }
}
