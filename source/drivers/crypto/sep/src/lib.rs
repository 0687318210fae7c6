// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SeP crypto co-processor descriptor queue dispatch engine
//! OWNERS: @runtime
//! STATUS: Functional (host-sim backed)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, integration tests under tests/
//!
//! PUBLIC API:
//!   - desc: 8-word hardware descriptor codec
//!   - queue::DescQueue: ring + backlog admission and completion drain
//!   - op_ctx::OpContext: per-request state machine and completion signal
//!   - client::ClientContext: memory reference and Applet session slots
//!   - driver::SepDriver: probe, queue ownership and init handshake
//!   - request: crypto / combined / RPC / Applet / sleep submission helpers
//!   - worker::CompletionWorker: deferred completion draining
//!   - power::PowerManager: idle detection and sleep handshake
//!
//! DEPENDENCIES:
//!   - parking_lot: queue, op and slot locks
//!   - bitflags: operation type flags
//!   - thiserror: error enums
//!   - log: lifecycle and drain tracing
//!   - serde/toml: driver configuration

#![forbid(unsafe_code)]

use core::fmt;

pub mod client;
pub mod config;
pub mod cookie;
pub mod ctx_cache;
pub mod desc;
pub mod driver;
pub mod error;
pub mod hw;
pub mod mlli;
pub mod op_ctx;
pub mod power;
pub mod queue;
pub mod request;
#[cfg(feature = "host-sim")]
pub mod sim;
pub mod worker;

pub use client::{ClientContext, CryptoCtxUid};
pub use config::SepConfig;
pub use desc::{Descriptor, HwDesc};
pub use driver::{DriverData, SepDriver};
pub use op_ctx::{OpContext, OpOutcome, OpState, OpType};
pub use queue::{Admission, DescQueue, QueueError, QueueState};

/// Number of hardware descriptor queues exposed by the SeP.
pub const MAX_QUEUES: usize = 2;
/// Upper bound on descriptors one operation may need (combined operations use two).
pub const MAX_PENDING_DESCS: u32 = 2;
/// Registered memory references per client context.
pub const MAX_REG_MEMREF_PER_CLIENT_CTX: usize = 16;
/// Applet sessions per client context.
pub const MAX_SEPAPP_SESSION_PER_CLIENT_CTX: usize = 16;

/// Hardware queue index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u8);

impl QueueId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}
