// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process SeP model for host tests (register window, DMA, context cache, MLLI)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (test tooling)
//! TEST_COVERAGE: 3 unit tests, backs every queue-level test
//!
//! `SimSep` plays the device side of the ring protocol: it watches the
//! host-to-SeP doorbell, writes return codes into completed slots and
//! publishes its completed counter through the SeP-to-host GPR. Completion
//! is manual (`complete`) unless auto-complete is switched on for a queue.
//!
//! The interrupt handler runs inside the doorbell write, which the queue
//! issues while holding its lock. Handlers must defer the drain (for example
//! to a `CompletionWorker`) instead of calling `process_completed` directly.

use std::collections::HashMap;
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::client::CryptoCtxUid;
use crate::config::SepConfig;
use crate::ctx_cache::{CacheSlot, CtxCache};
use crate::desc::HwDesc;
use crate::driver::{DriverData, DriverError};
use crate::hw::{host_to_sep_gpr, sep_to_host_gpr, DmaAllocator, DmaError, DmaRegion, RingMemory, SepBus};
use crate::mlli::{table_geometry, MlliBuilder, MlliError, MlliTable, MLLI_ENTRY_SIZE, MLLI_MAX_ENTRIES_PER_TABLE};
use crate::queue::DescQueue;
use crate::{QueueId, MAX_QUEUES};

type IrqHandler = Arc<dyn Fn(QueueId) + Send + Sync>;

#[derive(Default)]
struct SimQueue {
    ring: Option<Arc<RingMemory>>,
    /// Last sent counter written by the host.
    host_gpr: u32,
    /// Completed counter published to the host.
    completed: u32,
    auto_rc: Option<u32>,
}

impl SimQueue {
    fn pending(&self) -> u32 {
        self.host_gpr.wrapping_sub(self.completed)
    }

    fn complete_with(&mut self, count: u32, mut rc_for: impl FnMut(&HwDesc) -> u32) -> u32 {
        let Some(ring) = self.ring.as_ref() else {
            return 0;
        };
        let count = count.min(self.pending());
        for _ in 0..count {
            let slot = ring.slot(self.completed);
            let rc = rc_for(&ring.read_desc(slot));
            ring.write_ret_code(slot, rc);
            self.completed = self.completed.wrapping_add(1);
        }
        count
    }
}

#[derive(Default)]
struct SimInner {
    queues: [SimQueue; MAX_QUEUES],
    regs: HashMap<usize, u32>,
}

/// Simulated SeP register window.
pub struct SimSep {
    inner: Mutex<SimInner>,
    irq: Mutex<Option<IrqHandler>>,
}

impl SimSep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(SimInner::default()), irq: Mutex::new(None) })
    }

    /// Gives the device a view of `queue`'s ring and resets its counters.
    pub fn attach(&self, queue: &DescQueue) {
        let mut inner = self.inner.lock();
        let sim = &mut inner.queues[queue.id().index()];
        *sim = SimQueue { ring: Some(Arc::clone(queue.ring_memory())), auto_rc: sim.auto_rc, ..SimQueue::default() };
    }

    /// Descriptors the host has posted that the device has not completed.
    pub fn pending(&self, queue: QueueId) -> u32 {
        self.inner.lock().queues[queue.index()].pending()
    }

    /// Device completed counter.
    pub fn completed(&self, queue: QueueId) -> u32 {
        self.inner.lock().queues[queue.index()].completed
    }

    /// Completes up to `count` pending descriptors with `rc`. Returns how many
    /// were completed. No interrupt is raised.
    pub fn complete(&self, queue: QueueId, count: u32, rc: u32) -> u32 {
        self.complete_with(queue, count, |_| rc)
    }

    /// Like `complete`, choosing the return code per descriptor.
    pub fn complete_with(&self, queue: QueueId, count: u32, rc_for: impl FnMut(&HwDesc) -> u32) -> u32 {
        self.inner.lock().queues[queue.index()].complete_with(count, rc_for)
    }

    /// Overwrites the published completed counter without touching the ring.
    pub fn force_completed(&self, queue: QueueId, value: u32) {
        self.inner.lock().queues[queue.index()].completed = value;
    }

    /// Completes every descriptor with `rc` as soon as its doorbell is rung,
    /// then raises the interrupt. `None` switches back to manual completion.
    pub fn set_auto_complete(&self, queue: QueueId, rc: Option<u32>) {
        self.inner.lock().queues[queue.index()].auto_rc = rc;
    }

    pub fn set_irq_handler<F>(&self, handler: F)
    where
        F: Fn(QueueId) + Send + Sync + 'static,
    {
        *self.irq.lock() = Some(Arc::new(handler));
    }

    pub fn raise_irq(&self, queue: QueueId) {
        let handler = self.irq.lock().clone();
        if let Some(handler) = handler {
            handler(queue);
        }
    }

    /// Last value written to a plain (non-GPR) register, 0 if never written.
    pub fn register(&self, offset: usize) -> u32 {
        self.inner.lock().regs.get(&offset).copied().unwrap_or(0)
    }

    fn queue_for(offset: usize, gpr: fn(QueueId) -> usize) -> Option<QueueId> {
        (0..MAX_QUEUES as u8).map(QueueId).find(|&q| gpr(q) == offset)
    }
}

impl SepBus for SimSep {
    fn read(&self, offset: usize) -> u32 {
        let inner = self.inner.lock();
        if let Some(q) = Self::queue_for(offset, sep_to_host_gpr) {
            return inner.queues[q.index()].completed;
        }
        if let Some(q) = Self::queue_for(offset, host_to_sep_gpr) {
            return inner.queues[q.index()].host_gpr;
        }
        inner.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write(&self, offset: usize, value: u32) {
        let Some(q) = Self::queue_for(offset, host_to_sep_gpr) else {
            self.inner.lock().regs.insert(offset, value);
            return;
        };
        let fired = {
            let mut inner = self.inner.lock();
            let sim = &mut inner.queues[q.index()];
            if value == 0 {
                sim.host_gpr = 0;
                sim.completed = 0;
                trace!("sim {q}: counters reset");
                return;
            }
            sim.host_gpr = value;
            match sim.auto_rc {
                Some(rc) => sim.complete_with(u32::MAX, |_| rc) > 0,
                None => false,
            }
        };
        if fired {
            self.raise_irq(q);
        }
    }
}

struct DmaState {
    next: u64,
    live: HashMap<u64, usize>,
    live_bytes: usize,
}

/// Bump allocator standing in for coherent DMA memory.
pub struct SimDma {
    state: Mutex<DmaState>,
    limit: Option<usize>,
}

impl SimDma {
    const BASE: u64 = 0x8000_0000;
    const ALIGN: u64 = 64;

    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DmaState { next: Self::BASE, live: HashMap::new(), live_bytes: 0 }),
            limit,
        })
    }

    /// Bytes allocated and not yet freed.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }
}

impl DmaAllocator for SimDma {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, DmaError> {
        let mut state = self.state.lock();
        if self.limit.is_some_and(|limit| state.live_bytes + len > limit) {
            return Err(DmaError::OutOfMemory { len });
        }
        let bus_addr = state.next;
        state.next += (len as u64).div_ceil(Self::ALIGN).max(1) * Self::ALIGN;
        state.live.insert(bus_addr, len);
        state.live_bytes += len;
        Ok(DmaRegion { bus_addr, len })
    }

    fn free_coherent(&self, region: DmaRegion) {
        let mut state = self.state.lock();
        match state.live.remove(&region.bus_addr) {
            Some(len) => state.live_bytes -= len,
            None => warn!("sim: free of unknown DMA region {:#x}", region.bus_addr),
        }
    }
}

struct CacheState {
    slots: Vec<Option<CryptoCtxUid>>,
    victim: usize,
    invalidate_all_calls: usize,
}

/// Context cache with round-robin eviction.
pub struct SimCtxCache {
    state: Mutex<CacheState>,
}

impl SimCtxCache {
    pub const DEFAULT_SLOTS: usize = 8;

    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CacheState { slots: vec![None; slots], victim: 0, invalidate_all_calls: 0 }),
        })
    }

    pub fn is_resident(&self, uid: CryptoCtxUid) -> bool {
        self.state.lock().slots.contains(&Some(uid))
    }

    pub fn invalidate_all_calls(&self) -> usize {
        self.state.lock().invalidate_all_calls
    }
}

impl CtxCache for SimCtxCache {
    fn lookup(&self, uid: CryptoCtxUid) -> Option<CacheSlot> {
        let mut state = self.state.lock();
        if let Some(index) = state.slots.iter().position(|slot| *slot == Some(uid)) {
            return Some(CacheSlot { index: index as u8, needs_load: false });
        }
        let index = match state.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None if state.slots.is_empty() => return None,
            None => {
                let victim = state.victim;
                state.victim = (victim + 1) % state.slots.len();
                victim
            }
        };
        state.slots[index] = Some(uid);
        Some(CacheSlot { index: index as u8, needs_load: true })
    }

    fn invalidate(&self, uid: CryptoCtxUid) {
        for slot in self.state.lock().slots.iter_mut() {
            if *slot == Some(uid) {
                *slot = None;
            }
        }
    }

    fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.slots.iter_mut().for_each(|slot| *slot = None);
        state.invalidate_all_calls += 1;
    }
}

struct MlliState {
    next: u32,
    live: usize,
}

/// Table builder that hands out fake table addresses.
pub struct SimMlli {
    state: Mutex<MlliState>,
}

impl SimMlli {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(MlliState { next: 0x4000_0000, live: 0 }) })
    }

    pub fn live_tables(&self) -> usize {
        self.state.lock().live
    }
}

impl MlliBuilder for SimMlli {
    fn build(&self, memref: &crate::client::MemRef) -> Result<MlliTable, MlliError> {
        let (first, num_tables) = table_geometry(memref)?;
        let mut state = self.state.lock();
        let dma_addr = state.next;
        let span = num_tables * MLLI_MAX_ENTRIES_PER_TABLE * MLLI_ENTRY_SIZE;
        state.next = state.next.wrapping_add(span as u32);
        state.live += 1;
        Ok(MlliTable {
            dma_addr,
            table_size: (first * MLLI_ENTRY_SIZE) as u16,
            num_tables: num_tables as u16,
            backing: None,
        })
    }

    fn release(&self, table: MlliTable) {
        let mut state = self.state.lock();
        match state.live.checked_sub(1) {
            Some(live) => state.live = live,
            None => warn!("sim: release of unknown MLLI table {:#x}", table.dma_addr),
        }
    }
}

/// A complete simulated device plus the `DriverData` wired to it.
pub struct SimPlatform {
    pub bus: Arc<SimSep>,
    pub dma: Arc<SimDma>,
    pub cache: Arc<SimCtxCache>,
    pub mlli: Arc<SimMlli>,
    pub driver_data: Arc<DriverData>,
}

impl SimPlatform {
    pub fn try_new(config: SepConfig, dma_limit: Option<usize>) -> Result<Self, DriverError> {
        let bus = SimSep::new();
        let dma = SimDma::new(dma_limit);
        let cache = SimCtxCache::new(SimCtxCache::DEFAULT_SLOTS);
        let mlli = SimMlli::new();
        let driver_data = DriverData::new(config, bus.clone(), dma.clone(), cache.clone(), mlli.clone())?;
        Ok(Self { bus, dma, cache, mlli, driver_data })
    }

    /// # Panics
    /// Panics if `config` does not validate.
    pub fn new(config: SepConfig) -> Self {
        Self::try_new(config, None).unwrap_or_else(|err| panic!("host-sim config rejected: {err}"))
    }

    pub fn with_defaults() -> Self {
        Self::new(SepConfig::default())
    }

    /// # Panics
    /// Panics if `config` does not validate.
    pub fn with_dma_limit(config: SepConfig, limit: usize) -> Self {
        Self::try_new(config, Some(limit)).unwrap_or_else(|err| panic!("host-sim config rejected: {err}"))
    }
}
