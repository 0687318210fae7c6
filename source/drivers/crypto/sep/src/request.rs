// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Request builders turning client requests into queued descriptors
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 10 unit tests, tests/concurrency.rs
//!
//! PUBLIC API:
//!   - map_memref(): acquire a memref and attach its MLLI table to an op
//!   - submit_crypto(): CRYPTO_OP with context cache placement
//!   - submit_combined(): LOAD_OP + COMBINED_OP (two descriptors, one op, admitted as a unit)
//!   - submit_rpc(): RPC_MSG
//!   - submit_app_req(): APP_REQ against an open Applet session
//!   - submit_sleep(): SLEEP_REQ for the power handshake
//!
//! Failures before any descriptor is accepted return an error and leave the
//! queue untouched. `RequestError::ret_code` maps them onto the host return
//! codes reported through `error_info`; a request refused by an asleep queue
//! reports `HOST_RC_QUEUE_ASLEEP` rather than `HOST_RC_NO_RESOURCE`.
//!
//! Memrefs are mapped before the context cache is consulted. From the cache
//! lookup until admission the driver placement lock is held, and every
//! context the lookup marked as loaded is invalidated again if the request
//! does not reach the queue.

use std::sync::Arc;

use thiserror::Error;

use crate::client::{ClientContext, ClientError, CryptoCtxUid};
use crate::desc::{
    AppReq, AppReqType, CombinedOp, CryptoOp, Descriptor, LoadEntry, LoadOp, ProcMode, RpcMsg, TableRef,
    LOAD_OP_MAX_CTX,
};
use crate::error::rc;
use crate::mlli::MlliError;
use crate::op_ctx::{OpContext, OpError, OpType};
use crate::queue::{Admission, DescQueue, QueueError, QueueState};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("operation type {actual:?} cannot carry this request (expected {expected:?})")]
    WrongOpType { expected: OpType, actual: OpType },
    #[error("no context cache slot for {0:?}")]
    CacheUnavailable(CryptoCtxUid),
    #[error("combined request names {0} contexts")]
    BadContextCount(usize),
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error(transparent)]
    Op(#[from] OpError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Mlli(#[from] MlliError),
}

impl RequestError {
    /// Host return code reported to the client for this failure.
    pub fn ret_code(&self) -> u32 {
        match self {
            Self::Queue(QueueError::OutOfMemory) | Self::CacheUnavailable(_) => rc::HOST_RC_NO_RESOURCE,
            Self::Queue(QueueError::NotActive(QueueState::Asleep)) => rc::HOST_RC_QUEUE_ASLEEP,
            Self::Queue(QueueError::Dma(_)) | Self::Mlli(MlliError::Dma(_)) => rc::HOST_RC_NO_RESOURCE,
            Self::Client(ClientError::NoFreeSlot(_)) | Self::Client(ClientError::NotOpen(_)) => {
                rc::HOST_RC_SESSION_EXHAUSTED
            }
            _ => rc::HOST_RC_INVALID_PARAM,
        }
    }
}

/// Which descriptor table a mapped memref feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableSlot {
    Input,
    Output,
}

/// Acquires memref `index` of the op's client for the op's lifetime and
/// attaches its MLLI table to the op.
pub fn map_memref(op: &OpContext, index: usize, slot: TableSlot) -> Result<TableRef, RequestError> {
    let client = op.client();
    let handle = client.acquire_memref(index)?;
    let table = client.driver().mlli().build(handle.memref())?;
    let desc_ref = table.desc_ref();
    match slot {
        TableSlot::Input => op.attach_input_table(table),
        TableSlot::Output => op.attach_output_table(table),
    }
    op.attach_memref(handle);
    Ok(desc_ref)
}

fn map_optional(op: &OpContext, index: Option<usize>, slot: TableSlot) -> Result<TableRef, RequestError> {
    match index {
        Some(index) => map_memref(op, index, slot),
        None => Ok(TableRef::default()),
    }
}

/// Reports a refusal by an asleep queue as such; the queue itself only knows
/// it had no room.
fn admission_error(queue: &DescQueue, err: QueueError) -> RequestError {
    match err {
        QueueError::OutOfMemory if queue.state() == QueueState::Asleep => {
            RequestError::Queue(QueueError::NotActive(QueueState::Asleep))
        }
        err => RequestError::Queue(err),
    }
}

fn expect_type(op: &OpContext, expected: OpType, ok: bool) -> Result<(), RequestError> {
    if ok {
        Ok(())
    } else {
        Err(RequestError::WrongOpType { expected, actual: op.op_type() })
    }
}

/// Single-context crypto step.
#[derive(Clone, Copy, Debug)]
pub struct CryptoRequest {
    pub uid: CryptoCtxUid,
    /// DMA address of the host context block.
    pub hcb_addr: u32,
    pub proc_mode: ProcMode,
    pub init: bool,
    /// Memref indices of the client.
    pub input: Option<usize>,
    pub output: Option<usize>,
}

pub fn submit_crypto(
    queue: &Arc<DescQueue>,
    op: &OpContext,
    req: &CryptoRequest,
    may_backlog: bool,
) -> Result<Admission, RequestError> {
    expect_type(op, OpType::CRYPTO, op.op_type().is_crypto())?;
    let ift = map_optional(op, req.input, TableSlot::Input)?;
    let oft = map_optional(op, req.output, TableSlot::Output)?;

    let drv = Arc::clone(op.client().driver());
    let _placement = drv.lock_placement();
    let cache = drv.cache();
    let slot = cache.lookup(req.uid).ok_or(RequestError::CacheUnavailable(req.uid))?;
    op.set_ctx_uid(req.uid);
    let desc = Descriptor::Crypto(CryptoOp {
        proc_mode: req.proc_mode,
        init: req.init,
        load: slot.needs_load,
        fw_cache_idx: slot.index,
        hcb_addr: req.hcb_addr,
        ift,
        oft,
    });
    queue.enqueue(op, &desc, may_backlog).map_err(|err| {
        // The cache already counts the context as loaded.
        if slot.needs_load {
            cache.invalidate(req.uid);
        }
        admission_error(queue, err)
    })
}

/// One context taking part in a combined operation.
#[derive(Clone, Copy, Debug)]
pub struct CombinedCtx {
    pub uid: CryptoCtxUid,
    pub hcb_addr: u32,
    pub init: bool,
}

#[derive(Clone, Debug)]
pub struct CombinedRequest {
    pub contexts: Vec<CombinedCtx>,
    pub config_scheme: u32,
    pub proc_mode: ProcMode,
    pub input: Option<usize>,
    pub output: Option<usize>,
}

/// Loads up to three contexts and chains them in one COMBINED_OP. The op
/// spans two descriptors that are admitted together: both enter the queue
/// back to back, or the request is refused and the op stays unsubmitted.
///
/// Every context block address must survive the LOAD_OP encoding, which
/// drops bit 0 and reserves 0 for an unused entry.
pub fn submit_combined(
    queue: &Arc<DescQueue>,
    op: &OpContext,
    req: &CombinedRequest,
    may_backlog: bool,
) -> Result<Admission, RequestError> {
    expect_type(op, OpType::CRYPTO, op.op_type().is_crypto())?;
    if req.contexts.is_empty() || req.contexts.len() > LOAD_OP_MAX_CTX {
        return Err(RequestError::BadContextCount(req.contexts.len()));
    }
    if req.contexts.iter().any(|ctx| !LoadEntry::encodable_hcb_addr(ctx.hcb_addr)) {
        return Err(RequestError::InvalidParam("context block address lost by LOAD_OP encoding"));
    }
    op.set_pending_descs(2)?;
    let ift = map_optional(op, req.input, TableSlot::Input)?;
    let oft = map_optional(op, req.output, TableSlot::Output)?;

    let drv = Arc::clone(op.client().driver());
    let _placement = drv.lock_placement();
    let cache = drv.cache();
    let mut loaded: Vec<CryptoCtxUid> = Vec::with_capacity(LOAD_OP_MAX_CTX);
    let mut load = LoadOp::default();
    for (entry, ctx) in load.entries.iter_mut().zip(&req.contexts) {
        let Some(slot) = cache.lookup(ctx.uid) else {
            loaded.iter().for_each(|uid| cache.invalidate(*uid));
            return Err(RequestError::CacheUnavailable(ctx.uid));
        };
        if slot.needs_load {
            loaded.push(ctx.uid);
        }
        if slot.needs_load || ctx.init {
            *entry = Some(LoadEntry { cache_idx: slot.index, hcb_addr: ctx.hcb_addr, init: ctx.init });
        }
    }

    let combined = Descriptor::Combined(CombinedOp { proc_mode: req.proc_mode, config_scheme: req.config_scheme, ift, oft });
    queue.enqueue_all(op, &[Descriptor::Load(load), combined], may_backlog).map_err(|err| {
        loaded.iter().for_each(|uid| cache.invalidate(*uid));
        admission_error(queue, err)
    })
}

#[derive(Clone, Copy, Debug)]
pub struct RpcRequest {
    pub agent_id: u8,
    pub func_id: u16,
    /// DMA address and size of the host message buffer.
    pub hmb_addr: u32,
    pub hmb_size: u32,
}

pub fn submit_rpc(
    queue: &Arc<DescQueue>,
    op: &OpContext,
    req: &RpcRequest,
    may_backlog: bool,
) -> Result<Admission, RequestError> {
    expect_type(op, OpType::RPC, op.op_type() == OpType::RPC)?;
    if req.hmb_size == 0 {
        return Err(RequestError::InvalidParam("empty RPC message buffer"));
    }
    let desc = Descriptor::Rpc(RpcMsg {
        agent_id: req.agent_id,
        func_id: req.func_id,
        hmb_addr: req.hmb_addr,
        hmb_size: req.hmb_size,
    });
    queue.enqueue(op, &desc, may_backlog).map_err(|err| admission_error(queue, err))
}

#[derive(Clone, Copy, Debug)]
pub struct AppRequest {
    pub req_type: AppReqType,
    /// Client session slot; ignored for `OpenSession`.
    pub session_index: usize,
    pub command_id: u32,
    pub params_addr: u32,
}

/// Open requests carry session id 0 (the SeP assigns one); close and invoke
/// hold a reference on the open session until the op is finalized.
pub fn submit_app_req(
    queue: &Arc<DescQueue>,
    op: &OpContext,
    req: &AppRequest,
    may_backlog: bool,
) -> Result<Admission, RequestError> {
    expect_type(op, OpType::APP, op.op_type() == OpType::APP)?;
    let session_id = match req.req_type {
        AppReqType::OpenSession => 0,
        AppReqType::CloseSession | AppReqType::CommandInvoke => {
            let handle = op.client().acquire_session(req.session_index)?;
            let id = handle.sep_session_id();
            op.attach_session(handle);
            id
        }
    };
    let desc = Descriptor::AppReq(AppReq {
        req_type: req.req_type,
        session_id,
        command_id: req.command_id,
        params_addr: req.params_addr,
    });
    queue.enqueue(op, &desc, may_backlog).map_err(|err| admission_error(queue, err))
}

/// Creates a SLEEP op for `client` and submits it.
pub fn submit_sleep(queue: &Arc<DescQueue>, client: &Arc<ClientContext>) -> Result<OpContext, RequestError> {
    let op = OpContext::init(client, OpType::SLEEP)?;
    queue.enqueue_sleep_request(&op)?;
    Ok(op)
}

#[cfg(all(test, feature = "host-sim"))]
mod tests {
    use super::*;
    use crate::client::{DmaDirection, MemRefSource};
    use crate::desc::HwDesc;
    use crate::op_ctx::OpState;
    use crate::sim::SimPlatform;
    use crate::{QueueId, SepConfig};

    fn setup(ring_size_log2: u32) -> (SimPlatform, Arc<DescQueue>, Arc<ClientContext>) {
        let platform = SimPlatform::new(SepConfig { ring_size_log2, ..SepConfig::default() });
        let queue = DescQueue::create(QueueId(0), &platform.driver_data).unwrap();
        platform.bus.attach(&queue);
        let client = ClientContext::new(&platform.driver_data);
        (platform, queue, client)
    }

    fn slot(queue: &DescQueue, index: usize) -> Descriptor {
        Descriptor::decode(&queue.ring_memory().read_desc(index)).unwrap()
    }

    #[test]
    fn crypto_request_sets_load_bit_only_on_first_use() {
        let (platform, queue, client) = setup(3);
        let input = client.register_memref(MemRefSource::Buffer { bus_addr: 0x1000 }, 64, DmaDirection::ToDevice).unwrap();
        let output = client.register_memref(MemRefSource::Buffer { bus_addr: 0x2000 }, 64, DmaDirection::FromDevice).unwrap();
        let uid = client.next_ctx_uid();
        let req = CryptoRequest {
            uid,
            hcb_addr: 0x9000,
            proc_mode: ProcMode::ProcessText,
            init: true,
            input: Some(input),
            output: Some(output),
        };

        let first = OpContext::init(&client, OpType::CRYPTO_INIT | OpType::CRYPTO_PROC).unwrap();
        assert_eq!(submit_crypto(&queue, &first, &req, false).unwrap(), Admission::InProgress);
        let second = OpContext::init(&client, OpType::CRYPTO_PROC).unwrap();
        submit_crypto(&queue, &second, &CryptoRequest { init: false, ..req }, false).unwrap();

        match (slot(&queue, 0), slot(&queue, 1)) {
            (Descriptor::Crypto(a), Descriptor::Crypto(b)) => {
                assert!(a.load && a.init);
                assert!(!b.load && !b.init);
                assert_eq!(a.fw_cache_idx, b.fw_cache_idx);
                assert_ne!(a.ift.addr, 0);
                assert_ne!(a.oft.addr, 0);
            }
            other => panic!("unexpected ring contents {other:?}"),
        }
        assert_eq!(client.memref_refs(input), Some(3));
        assert_eq!(platform.mlli.live_tables(), 4);
    }

    #[test]
    fn failed_crypto_op_invalidates_its_context() {
        let (platform, queue, client) = setup(3);
        let uid = client.next_ctx_uid();
        let req = CryptoRequest { uid, hcb_addr: 0x9000, proc_mode: ProcMode::Finalize, init: false, input: None, output: None };
        let op = OpContext::init(&client, OpType::CRYPTO_FINI).unwrap();
        submit_crypto(&queue, &op, &req, false).unwrap();
        assert!(platform.cache.is_resident(uid));

        platform.bus.complete(QueueId(0), 1, 0x0bad);
        queue.process_completed();
        assert_eq!(op.wait().unwrap().ret_code, 0x0bad);
        assert!(!platform.cache.is_resident(uid));
    }

    #[test]
    fn combined_request_spans_two_descriptors() {
        let (platform, queue, client) = setup(3);
        let contexts = vec![
            CombinedCtx { uid: client.next_ctx_uid(), hcb_addr: 0x4000, init: true },
            CombinedCtx { uid: client.next_ctx_uid(), hcb_addr: 0x4100, init: false },
        ];
        let req = CombinedRequest { contexts, config_scheme: 0x21, proc_mode: ProcMode::ProcessText, input: None, output: None };
        let op = OpContext::init(&client, OpType::CRYPTO_PROC).unwrap();
        assert_eq!(submit_combined(&queue, &op, &req, true).unwrap(), Admission::InProgress);
        assert_eq!(op.pending_descs(), 2);

        match slot(&queue, 0) {
            Descriptor::Load(load) => {
                assert_eq!(load.entries[0].map(|e| e.hcb_addr), Some(0x4000));
                assert_eq!(load.entries[1].map(|e| e.hcb_addr), Some(0x4100));
                assert!(load.entries[2].is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(slot(&queue, 1), Descriptor::Combined(CombinedOp { config_scheme: 0x21, .. })));
        let cookie = queue.ring_memory().read_desc(0).cookie();
        assert_eq!(queue.ring_memory().read_desc(1).cookie(), cookie);

        platform.bus.complete(QueueId(0), 1, 0);
        queue.process_completed();
        assert_eq!(op.state(), OpState::InProgress);
        platform.bus.complete(QueueId(0), 1, 0);
        queue.process_completed();
        assert!(op.wait().unwrap().is_success());
    }

    #[test]
    fn combined_request_is_admitted_whole_or_not_at_all() {
        let (platform, queue, client) = setup(1);
        queue.enqueue(&OpContext::init(&client, OpType::RPC).unwrap(), &Descriptor::Rpc(RpcMsg::default()), false).unwrap();
        let uid = client.next_ctx_uid();
        let req = CombinedRequest {
            contexts: vec![CombinedCtx { uid, hcb_addr: 0x4000, init: true }],
            config_scheme: 1,
            proc_mode: ProcMode::Finalize,
            input: None,
            output: None,
        };
        let op = OpContext::init(&client, OpType::CRYPTO_FINI).unwrap();

        // One free slot is not enough for both descriptors.
        let err = submit_combined(&queue, &op, &req, false).unwrap_err();
        assert!(matches!(err, RequestError::Queue(QueueError::OutOfMemory)));
        assert_eq!(op.state(), OpState::Nop);
        assert_eq!(op.cookie(), None);
        assert_eq!(queue.in_flight(), 1);
        assert!(!platform.cache.is_resident(uid));

        assert_eq!(submit_combined(&queue, &op, &req, true).unwrap(), Admission::Backlogged);
        assert_eq!(op.state(), OpState::Pending);
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.backlog_len(), 1);
        assert!(matches!(slot(&queue, 1), Descriptor::Load(_)));

        platform.bus.complete(QueueId(0), 2, 0);
        queue.process_completed();
        assert_eq!(op.state(), OpState::InProgress);
        assert!(matches!(slot(&queue, 0), Descriptor::Combined(_)));
        platform.bus.complete(QueueId(0), 1, 0);
        queue.process_completed();
        let outcome = op.wait().unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn unencodable_context_address_is_rejected() {
        let (_platform, queue, client) = setup(3);
        let req = CombinedRequest {
            contexts: vec![CombinedCtx { uid: client.next_ctx_uid(), hcb_addr: 1, init: true }],
            config_scheme: 1,
            proc_mode: ProcMode::Finalize,
            input: None,
            output: None,
        };
        let op = OpContext::init(&client, OpType::CRYPTO_FINI).unwrap();
        let err = submit_combined(&queue, &op, &req, true).unwrap_err();
        assert!(matches!(err, RequestError::InvalidParam(_)));
        assert_eq!(err.ret_code(), rc::HOST_RC_INVALID_PARAM);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn failed_memref_mapping_leaves_context_unloaded() {
        let (platform, queue, client) = setup(3);
        let uid = client.next_ctx_uid();
        let req = CryptoRequest { uid, hcb_addr: 0x9000, proc_mode: ProcMode::ProcessText, init: true, input: Some(9), output: None };
        let op = OpContext::init(&client, OpType::CRYPTO_PROC).unwrap();
        assert!(matches!(submit_crypto(&queue, &op, &req, false), Err(RequestError::Client(_))));
        assert!(!platform.cache.is_resident(uid));

        let combined = CombinedRequest {
            contexts: vec![CombinedCtx { uid, hcb_addr: 0x4000, init: false }],
            config_scheme: 1,
            proc_mode: ProcMode::ProcessText,
            input: None,
            output: Some(9),
        };
        let op = OpContext::init(&client, OpType::CRYPTO_PROC).unwrap();
        assert!(matches!(submit_combined(&queue, &op, &combined, false), Err(RequestError::Client(_))));
        assert!(!platform.cache.is_resident(uid));

        let op = OpContext::init(&client, OpType::CRYPTO_PROC).unwrap();
        submit_crypto(&queue, &op, &CryptoRequest { input: None, ..req }, false).unwrap();
        match slot(&queue, 0) {
            Descriptor::Crypto(desc) => assert!(desc.load),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn asleep_queue_refusal_reports_queue_asleep() {
        let (_platform, queue, client) = setup(3);
        queue.set_state(QueueState::Asleep).unwrap();
        let op = OpContext::init(&client, OpType::RPC).unwrap();
        let req = RpcRequest { agent_id: 2, func_id: 3, hmb_addr: 0x100, hmb_size: 16 };
        let err = submit_rpc(&queue, &op, &req, false).unwrap_err();
        assert!(matches!(err, RequestError::Queue(QueueError::NotActive(QueueState::Asleep))));
        assert_eq!(err.ret_code(), rc::HOST_RC_QUEUE_ASLEEP);
        assert_eq!(op.state(), OpState::Nop);
        assert_eq!(submit_rpc(&queue, &op, &req, true).unwrap(), Admission::Backlogged);
    }

    #[test]
    fn rpc_and_type_checks() {
        let (_platform, queue, client) = setup(3);
        let app_op = OpContext::init(&client, OpType::APP).unwrap();
        let req = RpcRequest { agent_id: 2, func_id: 3, hmb_addr: 0x100, hmb_size: 16 };
        let err = submit_rpc(&queue, &app_op, &req, false).unwrap_err();
        assert!(matches!(err, RequestError::WrongOpType { .. }));
        assert_eq!(err.ret_code(), rc::HOST_RC_INVALID_PARAM);

        let op = OpContext::init(&client, OpType::RPC).unwrap();
        assert!(matches!(
            submit_rpc(&queue, &op, &RpcRequest { hmb_size: 0, ..req }, false),
            Err(RequestError::InvalidParam(_))
        ));
        submit_rpc(&queue, &op, &req, false).unwrap();
        assert_eq!(slot(&queue, 0), Descriptor::Rpc(RpcMsg { agent_id: 2, func_id: 3, hmb_addr: 0x100, hmb_size: 16 }));
    }

    #[test]
    fn app_request_needs_open_session() {
        let (_platform, queue, client) = setup(3);
        let op = OpContext::init(&client, OpType::APP).unwrap();
        let invoke = AppRequest { req_type: AppReqType::CommandInvoke, session_index: 0, command_id: 9, params_addr: 0x500 };
        let err = submit_app_req(&queue, &op, &invoke, false).unwrap_err();
        assert_eq!(err.ret_code(), rc::HOST_RC_SESSION_EXHAUSTED);

        let index = client.reserve_session().unwrap();
        client.activate_session(index, 0x77).unwrap();
        submit_app_req(&queue, &op, &AppRequest { session_index: index, ..invoke }, false).unwrap();
        match slot(&queue, 0) {
            Descriptor::AppReq(req) => assert_eq!(req.session_id, 0x77),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(client.close_session(index), Err(ClientError::Busy { .. })));
        op.finalize();
        assert_eq!(client.close_session(index), Ok(0x77));
    }

    #[test]
    fn sleep_request_uses_sleep_descriptor() {
        let (_platform, queue, client) = setup(3);
        let op = submit_sleep(&queue, &client).unwrap();
        assert_eq!(op.state(), OpState::InProgress);
        assert_eq!(queue.ring_memory().read_desc(0).desc_type(), Ok(crate::desc::DescType::SleepReq));
        let raw: HwDesc = queue.ring_memory().read_desc(0);
        assert_eq!(raw.cookie(), op.cookie().unwrap().raw());
    }
}
