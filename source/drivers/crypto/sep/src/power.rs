// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Queue power management (idle detection, SLEEP_REQ handshake, wake)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 3 unit tests, tests/power.rs
//!
//! A queue may go to sleep once it has been idle for `idle_sleep_ms`. The
//! host sends a SLEEP_REQ, waits up to `sleep_timeout_ms` for the SeP to
//! acknowledge it and only then marks the queue `Asleep`. Descriptors that
//! arrive while asleep are backlogged and promoted on `resume`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::client::ClientContext;
use crate::config::SepConfig;
use crate::error::rc;
use crate::op_ctx::OpError;
use crate::queue::{DescQueue, QueueError, QueueState};
use crate::request::{submit_sleep, RequestError};

#[derive(Debug, Error)]
pub enum PowerError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("SeP did not acknowledge the sleep request")]
    Timeout,
    #[error("SeP refused the sleep request (rc {0:#x})")]
    Rejected(u32),
}

impl PowerError {
    /// Return code reported for a failed power transition.
    pub fn ret_code(&self) -> u32 {
        match self {
            Self::Request(err) => err.ret_code(),
            Self::Queue(err) => RequestError::Queue(*err).ret_code(),
            Self::Timeout => rc::HOST_RC_TIMEOUT,
            Self::Rejected(code) => *code,
        }
    }
}

pub struct PowerManager {
    idle_sleep: Duration,
    sleep_timeout: Duration,
}

impl PowerManager {
    pub fn new(config: &SepConfig) -> Self {
        Self { idle_sleep: config.idle_sleep(), sleep_timeout: config.sleep_timeout() }
    }

    /// True when `queue` has been idle long enough to be put to sleep.
    pub fn should_suspend(&self, queue: &DescQueue) -> bool {
        let (idle, since) = queue.is_idle();
        idle && Instant::now().saturating_duration_since(since) >= self.idle_sleep
    }

    /// Puts `queue` to sleep if it is idle. Returns whether the queue is asleep
    /// afterwards; `Ok(false)` means it was busy or not idle long enough.
    ///
    /// The acknowledgement arrives through the normal completion path, so a
    /// drain (interrupt worker or caller) must run while this blocks.
    pub fn try_suspend(&self, queue: &Arc<DescQueue>, client: &Arc<ClientContext>) -> Result<bool, PowerError> {
        if queue.state() == QueueState::Asleep {
            return Ok(true);
        }
        if !self.should_suspend(queue) {
            return Ok(false);
        }

        let op = match submit_sleep(queue, client) {
            Ok(op) => op,
            Err(RequestError::Queue(QueueError::OutOfMemory)) => {
                debug!("{}: sleep request lost the race for a ring slot", queue.id());
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        let outcome = match op.wait_timeout(self.sleep_timeout) {
            Ok(outcome) => outcome,
            Err(OpError::Timeout) => {
                warn!("{}: sleep request timed out after {:?}", queue.id(), self.sleep_timeout);
                return Err(PowerError::Timeout);
            }
            Err(err) => return Err(RequestError::from(err).into()),
        };
        op.finalize();
        if !outcome.is_success() {
            return Err(PowerError::Rejected(outcome.ret_code));
        }

        match queue.set_state(QueueState::Asleep) {
            Ok(()) => Ok(true),
            Err(QueueError::Busy { in_flight, backlogged }) => {
                debug!("{}: new work ({in_flight} in flight, {backlogged} backlogged) cancelled sleep", queue.id());
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Wakes `queue` and promotes whatever accumulated in its backlog.
    pub fn resume(&self, queue: &DescQueue) -> Result<(), PowerError> {
        queue.set_state(QueueState::Active)?;
        info!("{}: resumed", queue.id());
        Ok(())
    }
}

#[cfg(all(test, feature = "host-sim"))]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;
    use crate::worker::CompletionWorker;
    use crate::{QueueId, SepConfig};

    fn setup(idle_sleep_ms: u64) -> (SimPlatform, Arc<DescQueue>, Arc<ClientContext>, PowerManager) {
        let config = SepConfig { idle_sleep_ms, sleep_timeout_ms: 50, ..SepConfig::default() };
        let platform = SimPlatform::new(config.clone());
        let queue = DescQueue::create(QueueId(0), &platform.driver_data).unwrap();
        platform.bus.attach(&queue);
        let client = ClientContext::new(&platform.driver_data);
        (platform, queue, client, PowerManager::new(&config))
    }

    #[test]
    fn recently_active_queue_stays_awake() {
        let (_platform, queue, client, power) = setup(60_000);
        assert!(!power.try_suspend(&queue, &client).unwrap());
        assert_eq!(queue.state(), QueueState::Active);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn unacknowledged_sleep_times_out() {
        let (platform, queue, client, power) = setup(0);
        let err = power.try_suspend(&queue, &client).unwrap_err();
        assert!(matches!(err, PowerError::Timeout));
        assert_eq!(err.ret_code(), rc::HOST_RC_TIMEOUT);
        assert_eq!(queue.state(), QueueState::Active);

        // The abandoned SLEEP_REQ still owns its ring slot until the SeP answers.
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.cookies_in_use(), 1);
        platform.bus.complete(QueueId(0), 1, 0);
        queue.process_completed();
        assert_eq!(queue.stats().discarded, 1);
        assert_eq!(queue.cookies_in_use(), 0);
    }

    #[test]
    fn acknowledged_sleep_then_resume() {
        let (platform, queue, client, power) = setup(0);
        let worker = CompletionWorker::spawn(vec![Arc::clone(&queue)]).unwrap();
        let kick = worker.handle();
        platform.bus.set_irq_handler(move |id| kick.kick(id));
        platform.bus.set_auto_complete(QueueId(0), Some(0));

        assert!(power.try_suspend(&queue, &client).unwrap());
        assert_eq!(queue.state(), QueueState::Asleep);
        assert!(power.try_suspend(&queue, &client).unwrap());

        power.resume(&queue).unwrap();
        assert_eq!(queue.state(), QueueState::Active);
    }
}
