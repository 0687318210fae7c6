// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-request operation context (state machine, completion signal, owned resources)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 8 unit tests (+ queue tests)
//!
//! STATES: Nop -> Pending (backlogged) -> InProgress (in the ring) -> Completed
//!
//! The queue mutates an op only while holding the queue lock and then the op
//! lock, in that order. Waiters block on the op's own condvar; the queue never
//! blocks on them. Dropping an op that still has descriptors in flight
//! tombstones its cookie so the late completion is discarded. Its memrefs,
//! MLLI tables and scratch memory stay with the tombstone until the SeP has
//! completed every descriptor that may still reference them.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::client::{ClientContext, CryptoCtxUid, MemRefHandle, SessionHandle};
use crate::cookie::Cookie;
use crate::driver::DriverData;
use crate::error::rc::SEP_RC_OK;
use crate::hw::DmaRegion;
use crate::mlli::MlliTable;
use crate::queue::DescQueue;
use crate::MAX_PENDING_DESCS;

bitflags! {
    /// Work carried by an operation. Crypto flags combine; RPC, APP and SLEEP stand alone.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpType: u32 {
        const CRYPTO_INIT = 1 << 0;
        const CRYPTO_PROC = 1 << 1;
        const CRYPTO_FINI = 1 << 2;
        const RPC = 1 << 3;
        const APP = 1 << 4;
        const SLEEP = 1 << 5;

        const CRYPTO = Self::CRYPTO_INIT.bits() | Self::CRYPTO_PROC.bits() | Self::CRYPTO_FINI.bits();
    }
}

impl OpType {
    pub fn is_valid(self) -> bool {
        !self.is_empty()
            && (Self::CRYPTO.contains(self) || self == Self::RPC || self == Self::APP || self == Self::SLEEP)
    }

    pub fn is_crypto(self) -> bool {
        self.intersects(Self::CRYPTO)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    Nop,
    /// At least one descriptor waits in the backlog.
    Pending,
    InProgress,
    Completed,
}

/// Final result of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpOutcome {
    pub ret_code: u32,
    /// Set when the host infrastructure, not the SeP, failed the request.
    pub internal_error: bool,
}

impl OpOutcome {
    pub fn is_success(&self) -> bool {
        self.ret_code == SEP_RC_OK && !self.internal_error
    }
}

pub type CompletionCallback = Box<dyn FnOnce(OpOutcome) + Send + 'static>;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum OpError {
    #[error("invalid operation type {0:?}")]
    InvalidType(OpType),
    #[error("pending descriptor count {0} out of range")]
    PendingOutOfRange(u32),
    #[error("operation already submitted")]
    AlreadySubmitted,
    #[error("operation was never submitted")]
    NotSubmitted,
    #[error("timed out waiting for completion")]
    Timeout,
}

/// Cookie an op holds on one queue.
pub(crate) struct CookieRef {
    pub(crate) queue: Weak<DescQueue>,
    pub(crate) cookie: Cookie,
}

pub(crate) struct OpInner {
    pub(crate) op_type: OpType,
    pub(crate) state: OpState,
    /// Descriptors still expected to complete before the op is done.
    pub(crate) pending_descs: u32,
    /// Descriptors accepted by a queue so far.
    pub(crate) enqueued_descs: u32,
    /// Accepted descriptors not yet completed by the SeP.
    pub(crate) outstanding_descs: u32,
    pub(crate) backlog_descs: u32,
    pub(crate) ret_code: u32,
    pub(crate) internal_error: bool,
    pub(crate) cookie: Option<CookieRef>,
    pub(crate) ctx_uid: Option<CryptoCtxUid>,
    callback: Option<CompletionCallback>,
    ift: Option<MlliTable>,
    oft: Option<MlliTable>,
    scratch: Option<DmaRegion>,
    memrefs: Vec<MemRefHandle>,
    session: Option<SessionHandle>,
}

impl OpInner {
    fn new(op_type: OpType, callback: Option<CompletionCallback>) -> Self {
        Self {
            op_type,
            state: OpState::Nop,
            pending_descs: 1,
            enqueued_descs: 0,
            outstanding_descs: 0,
            backlog_descs: 0,
            ret_code: SEP_RC_OK,
            internal_error: false,
            cookie: None,
            ctx_uid: None,
            callback,
            ift: None,
            oft: None,
            scratch: None,
            memrefs: Vec::new(),
            session: None,
        }
    }

    pub(crate) fn outcome(&self) -> OpOutcome {
        OpOutcome { ret_code: self.ret_code, internal_error: self.internal_error }
    }

    /// Accounts one descriptor completed by the SeP; true when the op just completed.
    pub(crate) fn complete_desc(&mut self, rc: u32) -> bool {
        self.outstanding_descs = self.outstanding_descs.saturating_sub(1);
        self.pending_descs = self.pending_descs.saturating_sub(1);
        if rc != SEP_RC_OK && self.ret_code == SEP_RC_OK {
            self.ret_code = rc;
        }
        if self.pending_descs == 0 {
            self.state = OpState::Completed;
            self.cookie = None;
            true
        } else {
            false
        }
    }
}

/// Memory and references an op keeps alive for the SeP. Dropping it gives
/// everything back.
pub(crate) struct OpResources {
    drv: Arc<DriverData>,
    ift: Option<MlliTable>,
    oft: Option<MlliTable>,
    scratch: Option<DmaRegion>,
    memrefs: Vec<MemRefHandle>,
    session: Option<SessionHandle>,
}

impl Drop for OpResources {
    fn drop(&mut self) {
        for table in [self.ift.take(), self.oft.take()].into_iter().flatten() {
            self.drv.mlli().release(table);
        }
        if let Some(region) = self.scratch.take() {
            self.drv.dma().free_coherent(region);
        }
        self.memrefs.clear();
        self.session = None;
    }
}

pub(crate) struct OpShared {
    client: Arc<ClientContext>,
    pub(crate) inner: Mutex<OpInner>,
    done: Condvar,
}

impl OpShared {
    pub(crate) fn take_resources(&self, inner: &mut OpInner) -> OpResources {
        OpResources {
            drv: Arc::clone(self.client.driver()),
            ift: inner.ift.take(),
            oft: inner.oft.take(),
            scratch: inner.scratch.take(),
            memrefs: std::mem::take(&mut inner.memrefs),
            session: inner.session.take(),
        }
    }
}

/// Completion to deliver once every lock is released.
pub(crate) struct Notification {
    shared: Arc<OpShared>,
    callback: Option<CompletionCallback>,
    outcome: OpOutcome,
}

impl Notification {
    pub(crate) fn new(shared: &Arc<OpShared>, inner: &mut OpInner) -> Self {
        Self { shared: Arc::clone(shared), callback: inner.callback.take(), outcome: inner.outcome() }
    }

    pub(crate) fn deliver(self) {
        self.shared.done.notify_all();
        if let Some(callback) = self.callback {
            callback(self.outcome);
        }
    }
}

/// One client request, spanning up to `MAX_PENDING_DESCS` descriptors.
pub struct OpContext {
    shared: Arc<OpShared>,
    finalized: bool,
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext").field("finalized", &self.finalized).finish_non_exhaustive()
    }
}

impl OpContext {
    /// Creates a synchronous op; the caller collects the result with `wait`.
    pub fn init(client: &Arc<ClientContext>, op_type: OpType) -> Result<Self, OpError> {
        Self::build(client, op_type, None)
    }

    /// Creates an op whose completion runs `callback` from the draining context.
    pub fn with_callback<F>(client: &Arc<ClientContext>, op_type: OpType, callback: F) -> Result<Self, OpError>
    where
        F: FnOnce(OpOutcome) + Send + 'static,
    {
        Self::build(client, op_type, Some(Box::new(callback)))
    }

    fn build(
        client: &Arc<ClientContext>,
        op_type: OpType,
        callback: Option<CompletionCallback>,
    ) -> Result<Self, OpError> {
        if !op_type.is_valid() {
            return Err(OpError::InvalidType(op_type));
        }
        let shared = Arc::new(OpShared {
            client: Arc::clone(client),
            inner: Mutex::new(OpInner::new(op_type, callback)),
            done: Condvar::new(),
        });
        Ok(Self { shared, finalized: false })
    }

    pub(crate) fn shared(&self) -> &Arc<OpShared> {
        &self.shared
    }

    pub fn client(&self) -> &Arc<ClientContext> {
        &self.shared.client
    }

    pub fn op_type(&self) -> OpType {
        self.shared.inner.lock().op_type
    }

    pub fn state(&self) -> OpState {
        self.shared.inner.lock().state
    }

    pub fn pending_descs(&self) -> u32 {
        self.shared.inner.lock().pending_descs
    }

    pub fn backlog_descs(&self) -> u32 {
        self.shared.inner.lock().backlog_descs
    }

    pub fn cookie(&self) -> Option<Cookie> {
        self.shared.inner.lock().cookie.as_ref().map(|c| c.cookie)
    }

    /// Sets how many descriptors the op spans. Only valid before the first enqueue.
    pub fn set_pending_descs(&self, count: u32) -> Result<(), OpError> {
        if count == 0 || count > MAX_PENDING_DESCS {
            return Err(OpError::PendingOutOfRange(count));
        }
        let mut inner = self.shared.inner.lock();
        if inner.enqueued_descs > 0 || inner.state != OpState::Nop {
            return Err(OpError::AlreadySubmitted);
        }
        inner.pending_descs = count;
        Ok(())
    }

    pub fn set_ctx_uid(&self, uid: CryptoCtxUid) {
        self.shared.inner.lock().ctx_uid = Some(uid);
    }

    pub fn ctx_uid(&self) -> Option<CryptoCtxUid> {
        self.shared.inner.lock().ctx_uid
    }

    pub fn attach_input_table(&self, table: MlliTable) {
        let old = self.shared.inner.lock().ift.replace(table);
        if let Some(old) = old {
            self.client().driver().mlli().release(old);
        }
    }

    pub fn attach_output_table(&self, table: MlliTable) {
        let old = self.shared.inner.lock().oft.replace(table);
        if let Some(old) = old {
            self.client().driver().mlli().release(old);
        }
    }

    /// Hands a scratch DMA region to the op; freed on finalize.
    pub fn attach_scratch(&self, region: DmaRegion) {
        let old = self.shared.inner.lock().scratch.replace(region);
        if let Some(old) = old {
            self.client().driver().dma().free_coherent(old);
        }
    }

    pub fn attach_memref(&self, handle: MemRefHandle) {
        self.shared.inner.lock().memrefs.push(handle);
    }

    pub fn attach_session(&self, handle: SessionHandle) {
        self.shared.inner.lock().session = Some(handle);
    }

    /// Fails the op with a host return code. Descriptors already accepted by a
    /// queue still drain; the op completes once the last one does.
    pub fn fail_internal(&self, ret_code: u32) {
        let notification = {
            let mut inner = self.shared.inner.lock();
            if inner.state == OpState::Completed {
                return;
            }
            inner.ret_code = ret_code;
            inner.internal_error = true;
            inner.pending_descs = inner.outstanding_descs;
            if inner.pending_descs == 0 {
                inner.state = OpState::Completed;
                Some(Notification::new(&self.shared, &mut inner))
            } else {
                None
            }
        };
        if let Some(notification) = notification {
            notification.deliver();
        }
    }

    /// Blocks until the op completes.
    pub fn wait(&self) -> Result<OpOutcome, OpError> {
        let mut inner = self.shared.inner.lock();
        if inner.state == OpState::Nop {
            return Err(OpError::NotSubmitted);
        }
        while inner.state != OpState::Completed {
            self.shared.done.wait(&mut inner);
        }
        Ok(inner.outcome())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<OpOutcome, OpError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        if inner.state == OpState::Nop {
            return Err(OpError::NotSubmitted);
        }
        while inner.state != OpState::Completed {
            if self.shared.done.wait_until(&mut inner, deadline).timed_out() {
                if inner.state == OpState::Completed {
                    break;
                }
                return Err(OpError::Timeout);
            }
        }
        Ok(inner.outcome())
    }

    /// Result of a completed op, `None` while still running.
    pub fn outcome(&self) -> Option<OpOutcome> {
        let inner = self.shared.inner.lock();
        (inner.state == OpState::Completed).then(|| inner.outcome())
    }

    /// Value copied into the client ABI `error_info` field.
    pub fn error_info(&self) -> u32 {
        self.shared.inner.lock().ret_code
    }

    /// Releases everything the op owns. Descriptors still in flight are
    /// orphaned: their cookie is tombstoned, their completion discarded, and
    /// the op's resources are released once the SeP has completed them.
    pub fn finalize(mut self) {
        self.release();
        self.finalized = true;
    }

    fn release(&self) {
        let queue = self.shared.inner.lock().cookie.as_ref().and_then(|held| held.queue.upgrade());
        match queue {
            Some(queue) => queue.abandon(&self.shared),
            None => {
                let resources = {
                    let mut inner = self.shared.inner.lock();
                    inner.cookie = None;
                    self.shared.take_resources(&mut inner)
                };
                drop(resources);
            }
        }
    }
}

impl Drop for OpContext {
    fn drop(&mut self) {
        if !self.finalized {
            self.release();
        }
    }
}

#[cfg(all(test, feature = "host-sim"))]
mod tests {
    use super::*;
    use crate::client::{DmaDirection, MemRefSource};
    use crate::error::rc::HOST_RC_NO_RESOURCE;
    use crate::hw::DmaAllocator;
    use crate::mlli::MlliBuilder;
    use crate::sim::SimPlatform;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn client() -> (SimPlatform, Arc<ClientContext>) {
        let platform = SimPlatform::with_defaults();
        let client = ClientContext::new(&platform.driver_data);
        (platform, client)
    }

    #[test]
    fn op_type_combinations() {
        assert!((OpType::CRYPTO_INIT | OpType::CRYPTO_PROC).is_valid());
        assert!(OpType::RPC.is_valid());
        assert!(!(OpType::RPC | OpType::APP).is_valid());
        assert!(!(OpType::CRYPTO_FINI | OpType::SLEEP).is_valid());
        assert!(!OpType::empty().is_valid());
    }

    #[test]
    fn init_defaults_to_one_pending_descriptor() {
        let (_p, client) = client();
        let op = OpContext::init(&client, OpType::RPC).unwrap();
        assert_eq!(op.state(), OpState::Nop);
        assert_eq!(op.pending_descs(), 1);
        assert_eq!(op.cookie(), None);
        assert_eq!(op.outcome(), None);
        assert_eq!(op.wait(), Err(OpError::NotSubmitted));
        assert!(matches!(
            OpContext::init(&client, OpType::APP | OpType::RPC),
            Err(OpError::InvalidType(_))
        ));
    }

    #[test]
    fn pending_descs_bounds() {
        let (_p, client) = client();
        let op = OpContext::init(&client, OpType::CRYPTO_PROC).unwrap();
        assert_eq!(op.set_pending_descs(0), Err(OpError::PendingOutOfRange(0)));
        assert_eq!(op.set_pending_descs(3), Err(OpError::PendingOutOfRange(3)));
        op.set_pending_descs(2).unwrap();
        assert_eq!(op.pending_descs(), 2);
    }

    #[test]
    fn fail_internal_completes_unsubmitted_op_and_runs_callback() {
        let (_p, client) = client();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = Arc::clone(&seen);
        let op = OpContext::with_callback(&client, OpType::APP, move |outcome| {
            assert!(outcome.internal_error);
            seen_cb.store(outcome.ret_code, Ordering::SeqCst);
        })
        .unwrap();

        op.fail_internal(HOST_RC_NO_RESOURCE);
        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(seen.load(Ordering::SeqCst), HOST_RC_NO_RESOURCE);
        assert_eq!(op.error_info(), HOST_RC_NO_RESOURCE);
        let outcome = op.wait().unwrap();
        assert!(!outcome.is_success());
    }

    #[test]
    fn finalize_releases_resources() {
        let (platform, client) = client();
        let idx = client
            .register_memref(MemRefSource::Buffer { bus_addr: 0x3000 }, 64, DmaDirection::ToDevice)
            .unwrap();
        let op = OpContext::init(&client, OpType::CRYPTO_PROC).unwrap();
        let handle = client.acquire_memref(idx).unwrap();
        let table = platform.mlli.build(handle.memref()).unwrap();
        op.attach_input_table(table);
        op.attach_memref(handle);
        let scratch = platform.driver_data.dma().alloc_coherent(256).unwrap();
        op.attach_scratch(scratch);

        assert_eq!(client.memref_refs(idx), Some(2));
        assert_eq!(platform.mlli.live_tables(), 1);
        let before = platform.dma.live_bytes();

        op.finalize();
        assert_eq!(client.memref_refs(idx), Some(1));
        assert_eq!(platform.mlli.live_tables(), 0);
        assert_eq!(platform.dma.live_bytes(), before - 256);
    }

    #[test]
    fn dropping_an_op_releases_like_finalize() {
        let (platform, client) = client();
        let idx = client
            .register_memref(MemRefSource::Buffer { bus_addr: 0x3000 }, 64, DmaDirection::FromDevice)
            .unwrap();
        {
            let op = OpContext::init(&client, OpType::RPC).unwrap();
            op.attach_memref(client.acquire_memref(idx).unwrap());
            assert_eq!(client.free_memref(idx), Err(crate::client::ClientError::Busy { index: idx, refs: 2 }));
        }
        assert_eq!(platform.mlli.live_tables(), 0);
        client.free_memref(idx).unwrap();
    }

    #[test]
    fn dropped_op_keeps_resources_until_ring_descriptor_completes() {
        let (platform, client) = client();
        let queue = crate::queue::DescQueue::create(crate::QueueId(0), &platform.driver_data).unwrap();
        platform.bus.attach(&queue);
        let idx = client
            .register_memref(MemRefSource::Buffer { bus_addr: 0x3000 }, 64, DmaDirection::ToDevice)
            .unwrap();
        let op = OpContext::init(&client, OpType::RPC).unwrap();
        let handle = client.acquire_memref(idx).unwrap();
        op.attach_input_table(platform.mlli.build(handle.memref()).unwrap());
        op.attach_memref(handle);
        queue.enqueue(&op, &crate::desc::Descriptor::Rpc(crate::desc::RpcMsg::default()), false).unwrap();

        drop(op);
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(client.free_memref(idx), Err(crate::client::ClientError::Busy { index: idx, refs: 2 }));
        assert_eq!(platform.mlli.live_tables(), 1);

        platform.bus.complete(crate::QueueId(0), 1, SEP_RC_OK);
        assert_eq!(queue.process_completed(), 1);
        assert_eq!(platform.mlli.live_tables(), 0);
        assert_eq!(queue.cookies_in_use(), 0);
        client.free_memref(idx).unwrap();
    }

    #[test]
    fn finalized_backlogged_op_releases_resources_at_once() {
        let (platform, client) = client();
        let queue = crate::queue::DescQueue::create(crate::QueueId(0), &platform.driver_data).unwrap();
        platform.bus.attach(&queue);
        queue.set_state(crate::queue::QueueState::Asleep).unwrap();
        let op = OpContext::init(&client, OpType::RPC).unwrap();
        let before = platform.dma.live_bytes();
        op.attach_scratch(platform.driver_data.dma().alloc_coherent(128).unwrap());
        queue.enqueue(&op, &crate::desc::Descriptor::Rpc(crate::desc::RpcMsg::default()), true).unwrap();

        op.finalize();
        assert_eq!(queue.backlog_len(), 0);
        assert_eq!(queue.cookies_in_use(), 0);
        assert_eq!(platform.dma.live_bytes(), before);
    }
}
