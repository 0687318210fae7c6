// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SeP driver data and probe (queue creation, ring init handshake)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 3 unit tests
//!
//! `DriverData` is the explicit replacement for per-device globals: it bundles
//! the configuration with every hardware and collaborator boundary, and each
//! queue and client context holds a reference to it.

use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::client::ClientContext;
use crate::config::{ConfigError, SepConfig};
use crate::ctx_cache::CtxCache;
use crate::hw::{ring_base_hi, ring_base_lo, ring_size, write_u64_pair, DmaAllocator, SepBus};
use crate::mlli::MlliBuilder;
use crate::queue::{DescQueue, QueueError};
use crate::QueueId;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("ring of {0} bytes does not fit the size register")]
    RingTooLarge(usize),
}

pub struct DriverData {
    config: SepConfig,
    bus: Arc<dyn SepBus>,
    dma: Arc<dyn DmaAllocator>,
    cache: Arc<dyn CtxCache>,
    mlli: Arc<dyn MlliBuilder>,
    /// Held from a context cache lookup until the descriptors built from it
    /// are admitted, so no other lookup can evict the slot in between.
    placement: Mutex<()>,
}

impl DriverData {
    pub fn new(
        config: SepConfig,
        bus: Arc<dyn SepBus>,
        dma: Arc<dyn DmaAllocator>,
        cache: Arc<dyn CtxCache>,
        mlli: Arc<dyn MlliBuilder>,
    ) -> Result<Arc<Self>, DriverError> {
        config.validate()?;
        Ok(Arc::new(Self { config, bus, dma, cache, mlli, placement: Mutex::new(()) }))
    }

    pub fn config(&self) -> &SepConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn SepBus> {
        &self.bus
    }

    pub fn dma(&self) -> &Arc<dyn DmaAllocator> {
        &self.dma
    }

    pub fn cache(&self) -> &Arc<dyn CtxCache> {
        &self.cache
    }

    pub fn mlli(&self) -> &Arc<dyn MlliBuilder> {
        &self.mlli
    }

    /// Lock order: placement, then queue, then op.
    pub(crate) fn lock_placement(&self) -> MutexGuard<'_, ()> {
        self.placement.lock()
    }
}

/// Ring location handed to the SeP during init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwInitInfo {
    pub queue: QueueId,
    pub base: u64,
    pub size: usize,
}

pub struct SepDriver {
    drv: Arc<DriverData>,
    queues: Vec<Arc<DescQueue>>,
}

impl SepDriver {
    /// Creates every configured queue and publishes its ring to the SeP.
    pub fn probe(drv: Arc<DriverData>) -> Result<Self, DriverError> {
        let mut queues = Vec::with_capacity(drv.config().num_queues);
        for index in 0..drv.config().num_queues {
            let queue = DescQueue::create(QueueId(index as u8), &drv)?;
            let (base, size) = queue.get_info_for_hw_init();
            let size_reg = u32::try_from(size).map_err(|_| DriverError::RingTooLarge(size))?;
            let bus = drv.bus().as_ref();
            write_u64_pair(bus, ring_base_lo(queue.id()), ring_base_hi(queue.id()), base);
            bus.write(ring_size(queue.id()), size_reg);
            queues.push(queue);
        }
        info!("sep: probed {} queue(s)", queues.len());
        Ok(Self { drv, queues })
    }

    pub fn driver_data(&self) -> &Arc<DriverData> {
        &self.drv
    }

    pub fn queue(&self, id: QueueId) -> Option<&Arc<DescQueue>> {
        self.queues.get(id.index())
    }

    pub fn queues(&self) -> &[Arc<DescQueue>] {
        &self.queues
    }

    pub fn hw_init_info(&self) -> Vec<HwInitInfo> {
        self.queues
            .iter()
            .map(|queue| {
                let (base, size) = queue.get_info_for_hw_init();
                HwInitInfo { queue: queue.id(), base, size }
            })
            .collect()
    }

    pub fn new_client(&self) -> Arc<ClientContext> {
        ClientContext::new(&self.drv)
    }

    /// Tears every queue down and releases its ring.
    pub fn shutdown(self) {
        for queue in &self.queues {
            queue.destroy();
        }
        info!("sep: shut down");
    }
}
