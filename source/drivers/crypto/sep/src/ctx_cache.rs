// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boundary to the SeP crypto context cache
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Exercised through queue and request tests
//!
//! The cache tracks which crypto contexts are resident in SeP fast memory.
//! The queue only needs three things from it: a slot for a context (and
//! whether the SeP must load it first), dropping one context after a failed
//! operation, and forgetting everything after a queue reset.

use crate::client::CryptoCtxUid;

/// Cache slot assigned to a crypto context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSlot {
    pub index: u8,
    /// The context is not resident; the descriptor must ask the SeP to load it.
    pub needs_load: bool,
}

pub trait CtxCache: Send + Sync {
    /// Returns the slot for `uid`, assigning (and possibly evicting) one when
    /// the context is not resident. `None` when no slot can be assigned.
    fn lookup(&self, uid: CryptoCtxUid) -> Option<CacheSlot>;
    fn invalidate(&self, uid: CryptoCtxUid);
    fn invalidate_all(&self);
}
