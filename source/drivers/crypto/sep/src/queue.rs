// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SeP descriptor queue (ring admission, backlog, completion drain, sleep/reset)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 15 unit tests, tests/queue_scenarios.rs, tests/queue_props.rs
//!
//! PUBLIC API:
//!   - DescQueue::create/destroy: ring allocation and release
//!   - enqueue / enqueue_sleep_request: admission (ring, backlog or OutOfMemory)
//!   - enqueue_all: all-or-nothing admission of every descriptor of one op
//!   - process_completed: single-flight drain plus FIFO backlog promotion
//!   - set_state / state / is_idle / reset: Active <-> Asleep handshake
//!   - mark_invalid_cookie: orphan a cookie whose owner is going away
//!   - get_info_for_hw_init: ring base and size for the init handshake
//!
//! STATES: Uninitialized -[create]-> Active <-> Asleep; destroy returns to Uninitialized.
//!
//! INVARIANTS:
//!   - sent - completed (wrapping) never exceeds the ring size
//!   - a descriptor enters the ring directly only when the backlog is empty
//!   - ring + backlog never exceed ring size + backlog capacity
//!   - one queue lock covers ring, backlog and cookie table; op locks nest inside it
//!   - waiters and callbacks are notified after the queue lock is dropped
//!   - resources of an abandoned op are released only after its last ring
//!     descriptor completed, and outside the queue lock

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cookie::{Cookie, CookieError, CookieLookup, CookieTable};
use crate::desc::{Descriptor, HwDesc};
use crate::driver::DriverData;
use crate::error::rc::SEP_RC_OK;
use crate::hw::{host_to_sep_gpr, sep_to_host_gpr, DmaError, RingMemory};
use crate::op_ctx::{CookieRef, Notification, OpContext, OpResources, OpShared, OpState, OpType};
use crate::QueueId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Uninitialized,
    Active,
    Asleep,
}

/// Where an accepted descriptor went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    InProgress,
    Backlogged,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {0} is not configured")]
    NoSuchQueue(QueueId),
    #[error("no ring slot free and backlog unavailable")]
    OutOfMemory,
    #[error("queue busy: {in_flight} in flight, {backlogged} backlogged")]
    Busy { in_flight: u32, backlogged: usize },
    #[error("invalid queue state transition {from:?} -> {to:?}")]
    InvalidTransition { from: QueueState, to: QueueState },
    #[error("reset requires an asleep queue, state is {0:?}")]
    NotAsleep(QueueState),
    #[error("queue is {0:?}")]
    NotActive(QueueState),
    #[error("operation already has all {0} descriptors enqueued")]
    TooManyDescs(u32),
    #[error("no descriptors to enqueue")]
    EmptyBatch,
    #[error("operation is bound to another queue")]
    ForeignOp,
    #[error("operation already completed")]
    OpCompleted,
    #[error("sleep request needs a SLEEP operation, got {0:?}")]
    NotSleepOp(OpType),
    #[error(transparent)]
    Cookie(#[from] CookieError),
    #[error(transparent)]
    Dma(#[from] DmaError),
}

/// Lifetime counters of one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub backlogged: u64,
    pub promoted: u64,
    pub completed: u64,
    pub rejected: u64,
    /// Completions whose owner was gone.
    pub discarded: u64,
    /// Backlog entries dropped because their owner was gone.
    pub dropped_backlog: u64,
}

struct QueueInner {
    state: QueueState,
    sent: u32,
    completed: u32,
    backlog: VecDeque<HwDesc>,
    cookies: CookieTable<OpShared, OpResources>,
    idle_since: Instant,
    stats: QueueStats,
}

impl QueueInner {
    fn in_flight(&self) -> u32 {
        self.sent.wrapping_sub(self.completed)
    }

    fn is_empty(&self) -> bool {
        self.in_flight() == 0 && self.backlog.is_empty()
    }
}

pub struct DescQueue {
    id: QueueId,
    drv: Arc<DriverData>,
    ring: Arc<RingMemory>,
    backlog_capacity: usize,
    inner: Mutex<QueueInner>,
    draining: AtomicBool,
    rearm: AtomicBool,
}

impl DescQueue {
    /// Allocates the ring for `id` and brings the queue up `Active`.
    pub fn create(id: QueueId, drv: &Arc<DriverData>) -> Result<Arc<Self>, QueueError> {
        let config = drv.config();
        if id.index() >= config.num_queues {
            return Err(QueueError::NoSuchQueue(id));
        }
        let entries = config.ring_entries();
        let region = drv.dma().alloc_coherent(entries as usize * crate::desc::DESC_SIZE_BYTES)?;
        let ring = Arc::new(RingMemory::new(region, entries));
        let backlog_capacity = config.backlog_capacity;

        let queue = Arc::new(Self {
            id,
            drv: Arc::clone(drv),
            ring,
            backlog_capacity,
            inner: Mutex::new(QueueInner {
                state: QueueState::Uninitialized,
                sent: 0,
                completed: 0,
                backlog: VecDeque::with_capacity(backlog_capacity),
                cookies: CookieTable::with_capacity(entries as usize + backlog_capacity),
                idle_since: Instant::now(),
                stats: QueueStats::default(),
            }),
            draining: AtomicBool::new(false),
            rearm: AtomicBool::new(false),
        });
        queue.inner.lock().state = QueueState::Active;
        info!(
            "{id}: created, {entries} ring slots at {:#x}, backlog {backlog_capacity}",
            region.bus_addr
        );
        Ok(queue)
    }

    /// Releases the ring. The caller guarantees nothing is outstanding; any
    /// leftover work is logged and dropped.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.state == QueueState::Uninitialized {
            return;
        }
        if !inner.is_empty() {
            warn!(
                "{}: destroyed with {} in flight and {} backlogged",
                self.id,
                inner.in_flight(),
                inner.backlog.len()
            );
        }
        inner.backlog.clear();
        inner.state = QueueState::Uninitialized;
        self.drv.dma().free_coherent(self.ring.region());
        info!("{}: destroyed", self.id);
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Ring entries.
    pub fn capacity(&self) -> u32 {
        self.ring.entries()
    }

    pub fn backlog_capacity(&self) -> usize {
        self.backlog_capacity
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.lock().in_flight()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Cookies currently live or tombstoned.
    pub fn cookies_in_use(&self) -> usize {
        self.inner.lock().cookies.in_use()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }

    pub fn ring_memory(&self) -> &Arc<RingMemory> {
        &self.ring
    }

    /// Ring DMA base and size in bytes.
    pub fn get_info_for_hw_init(&self) -> (u64, usize) {
        (self.ring.dma_base(), self.ring.size_bytes())
    }

    /// True when `Active` with nothing in the ring or backlog, plus the time the
    /// queue last became idle.
    pub fn is_idle(&self) -> (bool, Instant) {
        let inner = self.inner.lock();
        (inner.state == QueueState::Active && inner.is_empty(), inner.idle_since)
    }

    pub fn set_state(&self, to: QueueState) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        match (from, to) {
            (from, to) if from == to && from != QueueState::Uninitialized => Ok(()),
            (QueueState::Active, QueueState::Asleep) => {
                if !inner.is_empty() {
                    return Err(QueueError::Busy {
                        in_flight: inner.in_flight(),
                        backlogged: inner.backlog.len(),
                    });
                }
                inner.state = QueueState::Asleep;
                info!("{}: asleep", self.id);
                Ok(())
            }
            (QueueState::Asleep, QueueState::Active) => {
                inner.state = QueueState::Active;
                let promoted = self.promote_backlog(&mut inner);
                if inner.is_empty() {
                    inner.idle_since = Instant::now();
                }
                info!("{}: active, {promoted} backlogged descriptor(s) promoted", self.id);
                Ok(())
            }
            (from, to) => Err(QueueError::InvalidTransition { from, to }),
        }
    }

    /// Zeroes the ring counters. Only legal while asleep; a refused reset
    /// changes nothing.
    pub fn reset(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.state != QueueState::Asleep {
            return Err(QueueError::NotAsleep(inner.state));
        }
        inner.sent = 0;
        inner.completed = 0;
        self.ring.clear();
        self.drv.bus().write(host_to_sep_gpr(self.id), 0);
        self.drv.cache().invalidate_all();
        info!("{}: reset", self.id);
        Ok(())
    }

    /// Submits one descriptor of `op`.
    ///
    /// The descriptor enters the ring when the queue is `Active`, a slot is
    /// free and nothing waits in the backlog. Otherwise it is backlogged when
    /// `may_backlog` allows and the backlog has room. Otherwise `OutOfMemory`
    /// is returned and `op` is left untouched.
    pub fn enqueue(
        self: &Arc<Self>,
        op: &OpContext,
        desc: &Descriptor,
        may_backlog: bool,
    ) -> Result<Admission, QueueError> {
        self.admit(op, &mut [desc.encode()], may_backlog)
    }

    /// Submits several descriptors of `op` as one unit under a single hold of
    /// the queue lock. They occupy consecutive positions: the leading ones take
    /// free ring slots, the rest go to the backlog. Either every descriptor is
    /// accepted or none is and `op` is left untouched.
    ///
    /// Returns `Backlogged` when at least one descriptor was backlogged.
    pub fn enqueue_all(
        self: &Arc<Self>,
        op: &OpContext,
        descs: &[Descriptor],
        may_backlog: bool,
    ) -> Result<Admission, QueueError> {
        if descs.is_empty() {
            return Err(QueueError::EmptyBatch);
        }
        let mut encoded: Vec<HwDesc> = descs.iter().map(Descriptor::encode).collect();
        self.admit(op, &mut encoded, may_backlog)
    }

    /// Submits a SLEEP_REQ for `op`. Never backlogged: the queue must be
    /// `Active` with a free ring slot.
    pub fn enqueue_sleep_request(self: &Arc<Self>, op: &OpContext) -> Result<Admission, QueueError> {
        let op_type = op.op_type();
        if op_type != OpType::SLEEP {
            return Err(QueueError::NotSleepOp(op_type));
        }
        let state = self.state();
        if state != QueueState::Active {
            return Err(QueueError::NotActive(state));
        }
        self.admit(op, &mut [Descriptor::Sleep.encode()], false)
    }

    fn admit(
        self: &Arc<Self>,
        op: &OpContext,
        descs: &mut [HwDesc],
        may_backlog: bool,
    ) -> Result<Admission, QueueError> {
        let shared = op.shared();
        let count = descs.len() as u32;
        let mut inner = self.inner.lock();
        if inner.state == QueueState::Uninitialized {
            return Err(QueueError::NotActive(inner.state));
        }
        let mut op_inner = shared.inner.lock();
        if op_inner.state == OpState::Completed {
            return Err(QueueError::OpCompleted);
        }
        if op_inner.enqueued_descs + count > op_inner.pending_descs {
            return Err(QueueError::TooManyDescs(op_inner.pending_descs));
        }
        let existing = match &op_inner.cookie {
            Some(held) if core::ptr::eq(held.queue.as_ptr(), Arc::as_ptr(self)) => Some(held.cookie),
            Some(_) => return Err(QueueError::ForeignOp),
            None => None,
        };

        // Placement is decided up front; a refused batch changes nothing.
        let free_slots = if inner.state == QueueState::Active && inner.backlog.is_empty() {
            self.ring.entries().saturating_sub(inner.in_flight())
        } else {
            0
        };
        let to_ring = count.min(free_slots) as usize;
        let to_backlog = descs.len() - to_ring;
        if to_backlog > 0 && (!may_backlog || inner.backlog.len() + to_backlog > self.backlog_capacity) {
            inner.stats.rejected += 1;
            debug!(
                "{}: rejected {count} descriptor(s) ({:?}, {} backlogged)",
                self.id,
                inner.state,
                inner.backlog.len()
            );
            return Err(QueueError::OutOfMemory);
        }

        let cookie = match existing {
            Some(cookie) => cookie,
            None => inner.cookies.allocate(shared).map_err(|_| QueueError::OutOfMemory)?,
        };
        for _ in 0..count {
            inner.cookies.add_outstanding(cookie)?;
        }
        if existing.is_none() {
            op_inner.cookie = Some(CookieRef { queue: Arc::downgrade(self), cookie });
        }
        op_inner.enqueued_descs += count;
        op_inner.outstanding_descs += count;
        inner.stats.submitted += u64::from(count);
        if to_backlog > 0 {
            op_inner.backlog_descs += to_backlog as u32;
            op_inner.state = OpState::Pending;
        } else if op_inner.backlog_descs == 0 {
            op_inner.state = OpState::InProgress;
        }
        drop(op_inner);

        for hw in descs.iter_mut() {
            hw.set_cookie(cookie.raw());
        }
        let (ring_part, backlog_part) = descs.split_at(to_ring);
        for hw in ring_part {
            self.write_to_ring(&mut inner, hw);
        }
        if !backlog_part.is_empty() {
            inner.backlog.extend(backlog_part.iter().copied());
            inner.stats.backlogged += backlog_part.len() as u64;
            debug!("{}: cookie {cookie} backlogged ({} waiting)", self.id, inner.backlog.len());
        }
        if to_ring > 0 {
            self.ring_doorbell(&inner);
        }
        Ok(if to_backlog > 0 { Admission::Backlogged } else { Admission::InProgress })
    }

    fn write_to_ring(&self, inner: &mut QueueInner, hw: &HwDesc) {
        let slot = self.ring.slot(inner.sent);
        self.ring.write_desc(slot, hw);
        trace!("{}: slot {slot} <- {hw}", self.id);
        inner.sent = inner.sent.wrapping_add(1);
    }

    fn ring_doorbell(&self, inner: &QueueInner) {
        self.drv.bus().write(host_to_sep_gpr(self.id), inner.sent);
    }

    /// Drains completed ring slots and promotes backlog entries into the freed
    /// slots. Returns the number of descriptors retired.
    ///
    /// Callable from any context. If another drain of this queue is running,
    /// the call re-arms it and returns 0 at once; the running drain loops until
    /// no re-arm is left.
    pub fn process_completed(&self) -> usize {
        let mut total = 0;
        self.rearm.store(true, Ordering::SeqCst);
        while self.rearm.load(Ordering::SeqCst) {
            if self.draining.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                return total;
            }
            while self.rearm.swap(false, Ordering::SeqCst) {
                total += self.drain_once();
            }
            self.draining.store(false, Ordering::SeqCst);
        }
        total
    }

    fn drain_once(&self) -> usize {
        let mut notifications = Vec::new();
        let (retired, released) = {
            let mut inner = self.inner.lock();
            if inner.state == QueueState::Uninitialized {
                return 0;
            }
            let in_flight = inner.in_flight();
            let device = self.drv.bus().read(sep_to_host_gpr(self.id));
            let mut done = device.wrapping_sub(inner.completed);
            if done > in_flight {
                error!(
                    "{}: SeP reports {done} completions but only {in_flight} in flight",
                    self.id
                );
                done = in_flight;
            }
            for _ in 0..done {
                let slot = self.ring.slot(inner.completed);
                let hw = self.ring.read_desc(slot);
                inner.completed = inner.completed.wrapping_add(1);
                self.retire(&mut inner, &hw, &mut notifications);
            }
            inner.stats.completed += u64::from(done);
            self.promote_backlog(&mut inner);
            if done > 0 && inner.is_empty() {
                inner.idle_since = Instant::now();
            }
            (done as usize, inner.cookies.take_released())
        };
        if retired > 0 {
            debug!("{}: retired {retired}, notifying {}", self.id, notifications.len());
        }
        for notification in notifications {
            notification.deliver();
        }
        if !released.is_empty() {
            debug!("{}: releasing resources of {} abandoned op(s)", self.id, released.len());
        }
        drop(released);
        retired
    }

    fn retire(&self, inner: &mut QueueInner, hw: &HwDesc, notifications: &mut Vec<Notification>) {
        let cookie = Cookie::from_raw(hw.cookie());
        let rc = hw.ret_code();
        match inner.cookies.lookup(cookie) {
            CookieLookup::Live(shared) => {
                let _ = inner.cookies.complete_outstanding(cookie);
                let mut op = shared.inner.lock();
                if rc != SEP_RC_OK && op.op_type.is_crypto() {
                    if let Some(uid) = op.ctx_uid {
                        self.drv.cache().invalidate(uid);
                    }
                }
                if op.complete_desc(rc) {
                    notifications.push(Notification::new(&shared, &mut op));
                    drop(op);
                    let _ = inner.cookies.free(cookie);
                }
            }
            CookieLookup::Tombstoned => {
                debug!("{}: discarding late completion of cookie {cookie} (rc {rc:#x})", self.id);
                let _ = inner.cookies.complete_outstanding(cookie);
                inner.stats.discarded += 1;
            }
            CookieLookup::Invalid => {
                error!("{}: completion carries unknown cookie {:#x}", self.id, cookie.raw());
            }
        }
    }

    /// Moves backlog entries into free ring slots in FIFO order. Entries whose
    /// owner is gone are dropped.
    fn promote_backlog(&self, inner: &mut QueueInner) -> usize {
        let limit = self.drv.config().promote_batch.unwrap_or(usize::MAX);
        let mut promoted = 0;
        while inner.state == QueueState::Active
            && promoted < limit
            && inner.in_flight() < self.ring.entries()
        {
            let Some(hw) = inner.backlog.pop_front() else {
                break;
            };
            let cookie = Cookie::from_raw(hw.cookie());
            match inner.cookies.lookup(cookie) {
                CookieLookup::Live(shared) => {
                    {
                        let mut op = shared.inner.lock();
                        op.backlog_descs = op.backlog_descs.saturating_sub(1);
                        if op.backlog_descs == 0 && op.state == OpState::Pending {
                            op.state = OpState::InProgress;
                        }
                    }
                    self.write_to_ring(inner, &hw);
                    promoted += 1;
                }
                CookieLookup::Tombstoned => {
                    warn!("{}: dropping backlogged descriptor of abandoned cookie {cookie}", self.id);
                    let _ = inner.cookies.complete_outstanding(cookie);
                    inner.stats.dropped_backlog += 1;
                }
                CookieLookup::Invalid => {
                    error!("{}: backlog entry carries unknown cookie {:#x}", self.id, cookie.raw());
                    inner.stats.dropped_backlog += 1;
                }
            }
        }
        if promoted > 0 {
            inner.stats.promoted += promoted as u64;
            self.ring_doorbell(inner);
            debug!("{}: promoted {promoted} from backlog ({} left)", self.id, inner.backlog.len());
        }
        promoted
    }

    /// Tombstones `cookie` ahead of its owner going away. Backlogged
    /// descriptors carrying it are dropped now; ring-resident ones are
    /// discarded when the SeP completes them.
    pub fn mark_invalid_cookie(&self, cookie: Cookie) -> Result<(), QueueError> {
        let (result, released) = {
            let mut inner = self.inner.lock();
            let result = self.tombstone(&mut inner, cookie, None);
            (result, inner.cookies.take_released())
        };
        drop(released);
        result.map(|_| ())
    }

    /// Detaches `op` from this queue on its way out. Its resources are
    /// released now when nothing of it is left in the ring; otherwise they
    /// stay with the tombstoned cookie until the SeP completes the last
    /// descriptor.
    pub(crate) fn abandon(&self, shared: &OpShared) {
        let (kept, released) = {
            let mut inner = self.inner.lock();
            let mut op = shared.inner.lock();
            let resources = shared.take_resources(&mut op);
            let held = op.cookie.take();
            drop(op);
            let kept = match held {
                Some(held) if core::ptr::eq(held.queue.as_ptr(), self) => {
                    // A cookie the drain already freed hands the resources
                    // straight to the released list.
                    if let Ok(in_ring) = self.tombstone(&mut inner, held.cookie, Some(resources)) {
                        if in_ring > 0 {
                            debug!(
                                "{}: holding resources of cookie {} for {in_ring} descriptor(s)",
                                self.id, held.cookie
                            );
                        }
                    }
                    None
                }
                _ => Some(resources),
            };
            (kept, inner.cookies.take_released())
        };
        drop(kept);
        drop(released);
    }

    /// Returns how many descriptors of `cookie` remain in the ring.
    fn tombstone(
        &self,
        inner: &mut QueueInner,
        cookie: Cookie,
        retained: Option<OpResources>,
    ) -> Result<u32, QueueError> {
        let outstanding = inner.cookies.mark_invalid(cookie, retained)?;
        if outstanding == 0 {
            return Ok(0);
        }
        let before = inner.backlog.len();
        inner.backlog.retain(|hw| hw.cookie() != cookie.raw());
        let dropped = before - inner.backlog.len();
        for _ in 0..dropped {
            let _ = inner.cookies.complete_outstanding(cookie);
        }
        inner.stats.dropped_backlog += dropped as u64;
        debug!(
            "{}: cookie {cookie} tombstoned, {dropped} backlog entries dropped, {} in ring",
            self.id,
            outstanding as usize - dropped
        );
        Ok(outstanding - dropped as u32)
    }
}

impl Drop for DescQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(all(test, feature = "host-sim"))]
mod tests {
    use super::*;
    use crate::client::ClientContext;
    use crate::desc::{RpcMsg, DESC_SIZE_BYTES};
    use crate::sim::SimPlatform;
    use crate::SepConfig;

    fn setup(ring_size_log2: u32, backlog_capacity: usize) -> (SimPlatform, Arc<DescQueue>, Arc<ClientContext>) {
        let config = SepConfig { ring_size_log2, backlog_capacity, ..SepConfig::default() };
        let platform = SimPlatform::new(config);
        let queue = DescQueue::create(QueueId(0), &platform.driver_data).unwrap();
        platform.bus.attach(&queue);
        let client = ClientContext::new(&platform.driver_data);
        (platform, queue, client)
    }

    fn rpc() -> Descriptor {
        Descriptor::Rpc(RpcMsg { agent_id: 1, func_id: 7, hmb_addr: 0x1000, hmb_size: 64 })
    }

    fn rpc_op(client: &Arc<ClientContext>) -> OpContext {
        OpContext::init(client, OpType::RPC).unwrap()
    }

    #[test]
    fn create_rejects_unconfigured_queue() {
        let platform = SimPlatform::new(SepConfig { num_queues: 1, ..SepConfig::default() });
        assert!(matches!(
            DescQueue::create(QueueId(1), &platform.driver_data),
            Err(QueueError::NoSuchQueue(QueueId(1)))
        ));
    }

    #[test]
    fn create_fails_on_dma_exhaustion() {
        let platform = SimPlatform::with_dma_limit(SepConfig::default(), 64);
        assert!(matches!(
            DescQueue::create(QueueId(0), &platform.driver_data),
            Err(QueueError::Dma(DmaError::OutOfMemory { .. }))
        ));
    }

    #[test]
    fn hw_init_info_reports_ring_geometry() {
        let (platform, queue, _client) = setup(3, 4);
        let (base, size) = queue.get_info_for_hw_init();
        assert_eq!(size, 8 * DESC_SIZE_BYTES);
        assert_eq!(base, queue.ring_memory().dma_base());
        assert_eq!(queue.state(), QueueState::Active);
        assert!(platform.dma.live_bytes() >= size);
    }

    #[test]
    fn enqueue_writes_cookie_and_rings_doorbell() {
        let (platform, queue, client) = setup(2, 4);
        let op = rpc_op(&client);
        assert_eq!(queue.enqueue(&op, &rpc(), false), Ok(Admission::InProgress));
        assert_eq!(op.state(), OpState::InProgress);
        let cookie = op.cookie().unwrap();
        let slot = queue.ring_memory().read_desc(0);
        assert_eq!(slot.cookie(), cookie.raw());
        assert_eq!(Descriptor::decode(&slot).unwrap(), rpc());
        assert_eq!(platform.bus.pending(QueueId(0)), 1);
        assert!(!queue.is_idle().0);
    }

    #[test]
    fn full_ring_without_backlog_leaves_op_untouched() {
        let (_platform, queue, client) = setup(1, 0);
        let a = rpc_op(&client);
        let b = rpc_op(&client);
        let c = rpc_op(&client);
        queue.enqueue(&a, &rpc(), true).unwrap();
        queue.enqueue(&b, &rpc(), true).unwrap();
        assert_eq!(queue.enqueue(&c, &rpc(), true), Err(QueueError::OutOfMemory));
        assert_eq!(c.state(), OpState::Nop);
        assert_eq!(c.cookie(), None);
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn batch_admission_is_all_or_nothing() {
        let (platform, queue, client) = setup(1, 1);
        let batch = [rpc(), rpc()];
        let single = rpc_op(&client);
        assert_eq!(queue.enqueue_all(&single, &batch, true), Err(QueueError::TooManyDescs(1)));
        assert_eq!(queue.enqueue_all(&single, &[], true), Err(QueueError::EmptyBatch));

        queue.enqueue(&rpc_op(&client), &rpc(), false).unwrap();
        let op = rpc_op(&client);
        op.set_pending_descs(2).unwrap();
        // Two descriptors against one free slot and no backlog permission.
        assert_eq!(queue.enqueue_all(&op, &batch, false), Err(QueueError::OutOfMemory));
        assert_eq!(op.state(), OpState::Nop);
        assert_eq!(op.cookie(), None);
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.cookies_in_use(), 1);

        assert_eq!(queue.enqueue_all(&op, &batch, true), Ok(Admission::Backlogged));
        let cookie = op.cookie().unwrap();
        assert_eq!(queue.ring_memory().read_desc(1).cookie(), cookie.raw());
        assert_eq!(queue.backlog_len(), 1);
        assert_eq!(queue.stats().submitted, 3);

        platform.bus.complete(QueueId(0), 2, SEP_RC_OK);
        queue.process_completed();
        assert_eq!(queue.ring_memory().read_desc(0).cookie(), cookie.raw());
        platform.bus.complete(QueueId(0), 1, SEP_RC_OK);
        queue.process_completed();
        assert!(op.wait().unwrap().is_success());
    }

    #[test]
    fn abandoned_op_resources_wait_for_the_ring() {
        use crate::client::{DmaDirection, MemRefSource};
        let (platform, queue, client) = setup(1, 4);
        let idx = client
            .register_memref(MemRefSource::Buffer { bus_addr: 0x6000 }, 32, DmaDirection::Bidirectional)
            .unwrap();
        let op = rpc_op(&client);
        op.set_pending_descs(2).unwrap();
        op.attach_memref(client.acquire_memref(idx).unwrap());
        queue.enqueue(&rpc_op(&client), &rpc(), false).unwrap();
        assert_eq!(queue.enqueue_all(&op, &[rpc(), rpc()], true), Ok(Admission::Backlogged));

        op.finalize();
        assert_eq!(queue.backlog_len(), 0);
        assert_eq!(queue.stats().dropped_backlog, 1);
        assert_eq!(client.memref_refs(idx), Some(2));

        platform.bus.complete(QueueId(0), 2, SEP_RC_OK);
        queue.process_completed();
        assert_eq!(client.memref_refs(idx), Some(1));
        assert_eq!(queue.cookies_in_use(), 0);
        assert_eq!(queue.stats().discarded, 2);
    }

    #[test]
    fn completion_reports_ret_code_and_frees_cookie() {
        let (platform, queue, client) = setup(2, 4);
        let op = rpc_op(&client);
        queue.enqueue(&op, &rpc(), false).unwrap();
        platform.bus.complete(QueueId(0), 1, 0x55);
        assert_eq!(queue.process_completed(), 1);
        let outcome = op.wait().unwrap();
        assert_eq!(outcome.ret_code, 0x55);
        assert!(!outcome.internal_error);
        assert_eq!(queue.cookies_in_use(), 0);
        assert!(queue.is_idle().0);
    }

    #[test]
    fn sleep_requires_empty_queue_and_reset_requires_sleep() {
        let (platform, queue, client) = setup(2, 4);
        let op = rpc_op(&client);
        queue.enqueue(&op, &rpc(), false).unwrap();
        assert_eq!(queue.set_state(QueueState::Asleep), Err(QueueError::Busy { in_flight: 1, backlogged: 0 }));
        assert_eq!(queue.reset(), Err(QueueError::NotAsleep(QueueState::Active)));
        assert_eq!(queue.in_flight(), 1);

        platform.bus.complete(QueueId(0), 1, SEP_RC_OK);
        queue.process_completed();
        queue.set_state(QueueState::Asleep).unwrap();
        assert!(!queue.is_idle().0);
        queue.reset().unwrap();
        assert_eq!(platform.bus.completed(QueueId(0)), 0);
        assert_eq!(platform.cache.invalidate_all_calls(), 1);
        assert_eq!(
            queue.set_state(QueueState::Uninitialized),
            Err(QueueError::InvalidTransition { from: QueueState::Asleep, to: QueueState::Uninitialized })
        );
    }

    #[test]
    fn asleep_queue_backlogs_and_wake_promotes() {
        let (platform, queue, client) = setup(2, 4);
        queue.set_state(QueueState::Asleep).unwrap();
        let op = rpc_op(&client);
        assert_eq!(queue.enqueue(&op, &rpc(), true), Ok(Admission::Backlogged));
        assert_eq!(op.state(), OpState::Pending);
        assert_eq!(queue.enqueue(&rpc_op(&client), &rpc(), false), Err(QueueError::OutOfMemory));

        queue.set_state(QueueState::Active).unwrap();
        assert_eq!(op.state(), OpState::InProgress);
        assert_eq!(queue.backlog_len(), 0);
        assert_eq!(platform.bus.pending(QueueId(0)), 1);
    }

    #[test]
    fn sleep_request_is_never_backlogged() {
        let (_platform, queue, client) = setup(1, 4);
        let not_sleep = rpc_op(&client);
        assert_eq!(queue.enqueue_sleep_request(&not_sleep), Err(QueueError::NotSleepOp(OpType::RPC)));

        queue.enqueue(&rpc_op(&client), &rpc(), false).unwrap();
        queue.enqueue(&rpc_op(&client), &rpc(), false).unwrap();
        let sleep = OpContext::init(&client, OpType::SLEEP).unwrap();
        assert_eq!(queue.enqueue_sleep_request(&sleep), Err(QueueError::OutOfMemory));
        assert_eq!(queue.backlog_len(), 0);
    }

    #[test]
    fn dropped_op_completion_is_discarded() {
        let (platform, queue, client) = setup(2, 4);
        let op = rpc_op(&client);
        queue.enqueue(&op, &rpc(), false).unwrap();
        drop(op);
        assert_eq!(queue.cookies_in_use(), 1);

        platform.bus.complete(QueueId(0), 1, SEP_RC_OK);
        assert_eq!(queue.process_completed(), 1);
        assert_eq!(queue.stats().discarded, 1);
        assert_eq!(queue.cookies_in_use(), 0);
    }

    #[test]
    fn invalidating_cookie_drops_backlogged_descriptors() {
        let (_platform, queue, client) = setup(1, 4);
        queue.enqueue(&rpc_op(&client), &rpc(), true).unwrap();
        queue.enqueue(&rpc_op(&client), &rpc(), true).unwrap();
        let op = rpc_op(&client);
        assert_eq!(queue.enqueue(&op, &rpc(), true), Ok(Admission::Backlogged));
        let cookie = op.cookie().unwrap();

        queue.mark_invalid_cookie(cookie).unwrap();
        assert_eq!(queue.backlog_len(), 0);
        assert_eq!(queue.stats().dropped_backlog, 1);
        assert_eq!(queue.mark_invalid_cookie(cookie), Err(QueueError::Cookie(CookieError::Unknown(cookie))));
    }

    #[test]
    fn bogus_device_counter_is_clamped() {
        let (platform, queue, client) = setup(2, 4);
        let op = rpc_op(&client);
        queue.enqueue(&op, &rpc(), false).unwrap();
        platform.bus.force_completed(QueueId(0), 3);
        assert_eq!(queue.process_completed(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn destroy_frees_ring_memory() {
        let (platform, queue, _client) = setup(2, 4);
        let live = platform.dma.live_bytes();
        queue.destroy();
        assert_eq!(queue.state(), QueueState::Uninitialized);
        assert_eq!(platform.dma.live_bytes(), live - queue.get_info_for_hw_init().1);
        queue.destroy();
        assert_eq!(queue.process_completed(), 0);
    }
}
