// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Numeric return codes shared by the SeP and the host driver
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (client ABI)
//! TEST_COVERAGE: 1 unit test
//!
//! Every operation resolves to one `u32` return code plus the `internal_error`
//! flag of its op context. Codes reported by the SeP pass through untouched;
//! failures of the host infrastructure use the `HOST_RC_*` range.
//! Per-module error enums live next to the code that raises them.

/// Return codes copied into the client-visible `error_info` field.
pub mod rc {
    /// Operation completed successfully.
    pub const SEP_RC_OK: u32 = 0;

    const HOST_RC_PREFIX: u32 = 0xE000_0000;

    /// No ring slot, backlog slot or DMA memory was available.
    pub const HOST_RC_NO_RESOURCE: u32 = HOST_RC_PREFIX | 0x01;
    /// The queue is asleep and the request could not be backlogged.
    pub const HOST_RC_QUEUE_ASLEEP: u32 = HOST_RC_PREFIX | 0x02;
    /// All Applet session slots of the client are in use, or the session is not open.
    pub const HOST_RC_SESSION_EXHAUSTED: u32 = HOST_RC_PREFIX | 0x03;
    /// A request parameter was rejected before reaching the SeP.
    pub const HOST_RC_INVALID_PARAM: u32 = HOST_RC_PREFIX | 0x04;
    /// The SeP did not complete the request in time.
    pub const HOST_RC_TIMEOUT: u32 = HOST_RC_PREFIX | 0x05;
    /// The request was abandoned before the SeP completed it.
    pub const HOST_RC_ABORTED: u32 = HOST_RC_PREFIX | 0x06;

    /// Returns true when `code` was produced by the host rather than the SeP.
    pub const fn is_host_rc(code: u32) -> bool {
        code & 0xF000_0000 == HOST_RC_PREFIX
    }
}

#[cfg(test)]
mod tests {
    use super::rc::*;

    #[test]
    fn host_codes_are_distinguishable_from_sep_codes() {
        for code in [
            HOST_RC_NO_RESOURCE,
            HOST_RC_QUEUE_ASLEEP,
            HOST_RC_SESSION_EXHAUSTED,
            HOST_RC_INVALID_PARAM,
            HOST_RC_TIMEOUT,
            HOST_RC_ABORTED,
        ] {
            assert!(is_host_rc(code), "{code:#x}");
        }
        assert!(!is_host_rc(SEP_RC_OK));
        assert!(!is_host_rc(0x0000_0102));
    }
}
