// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-handle client context (registered memory references, Applet sessions, ctx uids)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 6 unit tests
//!
//! Slots are fixed-size arrays; exhaustion is a reportable error. Each slot has
//! its own lock, independent of any queue lock. Freeing or closing a slot is a
//! checked transition that fails with `Busy` while a handle is still held, so
//! the SeP never DMAs into memory the client already released.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::driver::DriverData;
use crate::{MAX_REG_MEMREF_PER_CLIENT_CTX, MAX_SEPAPP_SESSION_PER_CLIENT_CTX};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique client identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Globally unique crypto context identifier (`{client, counter}`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CryptoCtxUid {
    pub client: ClientId,
    pub counter: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// One contiguous piece of a scatter list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSegment {
    pub bus_addr: u64,
    pub len: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemRefSource {
    /// A single device-visible buffer.
    Buffer { bus_addr: u64 },
    ScatterList(Vec<DmaSegment>),
}

/// A registered DMA memory reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub source: MemRefSource,
    pub size: usize,
    pub direction: DmaDirection,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("no free {0} slot")]
    NoFreeSlot(&'static str),
    #[error("slot index {0} out of range or unused")]
    InvalidIndex(usize),
    #[error("slot {index} busy ({refs} references)")]
    Busy { index: usize, refs: u32 },
    #[error("session {0} is not reserved")]
    NotReserved(usize),
    #[error("session {0} is not open")]
    NotOpen(usize),
}

enum MemRefSlot {
    Free,
    Registered { memref: MemRef, refs: u32 },
}

#[derive(Clone, Copy)]
enum SessionSlot {
    Free,
    /// Open request in flight; no SeP session id yet.
    Reserved,
    Open { sep_session_id: u16, refs: u32 },
}

pub struct ClientContext {
    id: ClientId,
    drv: Arc<DriverData>,
    memrefs: Box<[Mutex<MemRefSlot>]>,
    sessions: Box<[Mutex<SessionSlot>]>,
    uid_cntr: AtomicU64,
}

impl ClientContext {
    pub fn new(drv: &Arc<DriverData>) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)),
            drv: Arc::clone(drv),
            memrefs: (0..MAX_REG_MEMREF_PER_CLIENT_CTX).map(|_| Mutex::new(MemRefSlot::Free)).collect(),
            sessions: (0..MAX_SEPAPP_SESSION_PER_CLIENT_CTX)
                .map(|_| Mutex::new(SessionSlot::Free))
                .collect(),
            uid_cntr: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn driver(&self) -> &Arc<DriverData> {
        &self.drv
    }

    /// Next crypto context uid of this client; never repeats.
    pub fn next_ctx_uid(&self) -> CryptoCtxUid {
        CryptoCtxUid { client: self.id, counter: self.uid_cntr.fetch_add(1, Ordering::Relaxed) }
    }

    // -- memory references ---------------------------------------------------

    /// Records a buffer or scatter list; the registration holds the first reference.
    pub fn register_memref(
        &self,
        source: MemRefSource,
        size: usize,
        direction: DmaDirection,
    ) -> Result<usize, ClientError> {
        for (index, slot) in self.memrefs.iter().enumerate() {
            let mut slot = slot.lock();
            if matches!(*slot, MemRefSlot::Free) {
                *slot = MemRefSlot::Registered { memref: MemRef { source, size, direction }, refs: 1 };
                return Ok(index);
            }
        }
        Err(ClientError::NoFreeSlot("memref"))
    }

    /// Takes a reference on a registered memref for the duration of an operation.
    pub fn acquire_memref(self: &Arc<Self>, index: usize) -> Result<MemRefHandle, ClientError> {
        let mut slot = self.memrefs.get(index).ok_or(ClientError::InvalidIndex(index))?.lock();
        match &mut *slot {
            MemRefSlot::Registered { memref, refs } => {
                *refs += 1;
                Ok(MemRefHandle { client: Arc::clone(self), index, memref: memref.clone() })
            }
            MemRefSlot::Free => Err(ClientError::InvalidIndex(index)),
        }
    }

    fn release_memref(&self, index: usize) {
        if let Some(slot) = self.memrefs.get(index) {
            if let MemRefSlot::Registered { refs, .. } = &mut *slot.lock() {
                *refs = refs.saturating_sub(1).max(1);
            }
        }
    }

    /// Drops the registration; fails while any operation still holds a handle.
    pub fn free_memref(&self, index: usize) -> Result<(), ClientError> {
        let mut slot = self.memrefs.get(index).ok_or(ClientError::InvalidIndex(index))?.lock();
        match *slot {
            MemRefSlot::Registered { refs, .. } if refs > 1 => Err(ClientError::Busy { index, refs }),
            MemRefSlot::Registered { .. } => {
                *slot = MemRefSlot::Free;
                Ok(())
            }
            MemRefSlot::Free => Err(ClientError::InvalidIndex(index)),
        }
    }

    /// Current reference count of a memref slot, `None` when unused.
    pub fn memref_refs(&self, index: usize) -> Option<u32> {
        match *self.memrefs.get(index)?.lock() {
            MemRefSlot::Registered { refs, .. } => Some(refs),
            MemRefSlot::Free => None,
        }
    }

    // -- Applet sessions -----------------------------------------------------

    /// Claims a session slot for an open request.
    pub fn reserve_session(&self) -> Result<usize, ClientError> {
        for (index, slot) in self.sessions.iter().enumerate() {
            let mut slot = slot.lock();
            if matches!(*slot, SessionSlot::Free) {
                *slot = SessionSlot::Reserved;
                return Ok(index);
            }
        }
        Err(ClientError::NoFreeSlot("session"))
    }

    /// Completes an open request with the id assigned by the SeP.
    pub fn activate_session(&self, index: usize, sep_session_id: u16) -> Result<(), ClientError> {
        let mut slot = self.sessions.get(index).ok_or(ClientError::InvalidIndex(index))?.lock();
        match *slot {
            SessionSlot::Reserved => {
                *slot = SessionSlot::Open { sep_session_id, refs: 1 };
                Ok(())
            }
            _ => Err(ClientError::NotReserved(index)),
        }
    }

    /// Returns a reserved slot after a failed open request.
    pub fn abort_session(&self, index: usize) -> Result<(), ClientError> {
        let mut slot = self.sessions.get(index).ok_or(ClientError::InvalidIndex(index))?.lock();
        match *slot {
            SessionSlot::Reserved => {
                *slot = SessionSlot::Free;
                Ok(())
            }
            _ => Err(ClientError::NotReserved(index)),
        }
    }

    pub fn acquire_session(self: &Arc<Self>, index: usize) -> Result<SessionHandle, ClientError> {
        let mut slot = self.sessions.get(index).ok_or(ClientError::InvalidIndex(index))?.lock();
        match &mut *slot {
            SessionSlot::Open { sep_session_id, refs } => {
                *refs += 1;
                Ok(SessionHandle { client: Arc::clone(self), index, sep_session_id: *sep_session_id })
            }
            _ => Err(ClientError::NotOpen(index)),
        }
    }

    fn release_session(&self, index: usize) {
        if let Some(slot) = self.sessions.get(index) {
            if let SessionSlot::Open { refs, .. } = &mut *slot.lock() {
                *refs = refs.saturating_sub(1).max(1);
            }
        }
    }

    /// Frees an open session slot and returns its SeP session id.
    pub fn close_session(&self, index: usize) -> Result<u16, ClientError> {
        let mut slot = self.sessions.get(index).ok_or(ClientError::InvalidIndex(index))?.lock();
        match *slot {
            SessionSlot::Open { refs, .. } if refs > 1 => Err(ClientError::Busy { index, refs }),
            SessionSlot::Open { sep_session_id, .. } => {
                *slot = SessionSlot::Free;
                Ok(sep_session_id)
            }
            _ => Err(ClientError::NotOpen(index)),
        }
    }

    /// SeP session id of an open slot.
    pub fn session_id(&self, index: usize) -> Option<u16> {
        match *self.sessions.get(index)?.lock() {
            SessionSlot::Open { sep_session_id, .. } => Some(sep_session_id),
            _ => None,
        }
    }
}

/// Reference on a registered memref; released on drop.
pub struct MemRefHandle {
    client: Arc<ClientContext>,
    index: usize,
    memref: MemRef,
}

impl MemRefHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn memref(&self) -> &MemRef {
        &self.memref
    }

    pub fn release(self) {}
}

impl Drop for MemRefHandle {
    fn drop(&mut self) {
        self.client.release_memref(self.index);
    }
}

/// Reference on an open Applet session; released on drop.
pub struct SessionHandle {
    client: Arc<ClientContext>,
    index: usize,
    sep_session_id: u16,
}

impl SessionHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sep_session_id(&self) -> u16 {
        self.sep_session_id
    }

    pub fn release(self) {}
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.client.release_session(self.index);
    }
}
