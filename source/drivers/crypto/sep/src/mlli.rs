// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boundary to the MLLI (scatter/gather link list) table builder
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 2 unit tests
//!
//! The builder turns a registered memref into a chain of hardware-walkable
//! tables and hands back the first table's DMA address and size. Tables live
//! until the owning op context releases them.

use thiserror::Error;

use crate::client::{MemRef, MemRefSource};
use crate::desc::TableRef;
use crate::hw::{DmaError, DmaRegion};

/// Bytes per MLLI entry (32-bit address + 32-bit length).
pub const MLLI_ENTRY_SIZE: usize = 8;
/// Entries per table; longer lists chain into additional tables.
pub const MLLI_MAX_ENTRIES_PER_TABLE: usize = 128;
/// Longest scatter list a single memref may describe.
pub const MLLI_MAX_SEGMENTS: usize = 1024;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MlliError {
    #[error("memref is empty")]
    Empty,
    #[error("scatter list has {count} segments (max {max})")]
    TooManySegments { count: usize, max: usize },
    #[error("bus address {0:#x} does not fit a 32-bit MLLI entry")]
    AddressRange(u64),
    #[error(transparent)]
    Dma(#[from] DmaError),
}

/// A built MLLI chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MlliTable {
    pub dma_addr: u32,
    /// Size in bytes of the first table.
    pub table_size: u16,
    pub num_tables: u16,
    /// Memory backing the chain, if the builder allocated any.
    pub backing: Option<DmaRegion>,
}

impl MlliTable {
    /// Pointer as carried in an IFT/OFT descriptor field.
    pub fn desc_ref(&self) -> TableRef {
        TableRef { addr: self.dma_addr, size: self.table_size, num: self.num_tables }
    }
}

/// Table geometry for `memref`: (entries in first table, number of tables).
pub fn table_geometry(memref: &MemRef) -> Result<(usize, usize), MlliError> {
    if memref.size == 0 {
        return Err(MlliError::Empty);
    }
    let segments = match &memref.source {
        MemRefSource::Buffer { bus_addr } => {
            check_addr(*bus_addr)?;
            1
        }
        MemRefSource::ScatterList(list) => {
            if list.is_empty() {
                return Err(MlliError::Empty);
            }
            if list.len() > MLLI_MAX_SEGMENTS {
                return Err(MlliError::TooManySegments { count: list.len(), max: MLLI_MAX_SEGMENTS });
            }
            for seg in list {
                check_addr(seg.bus_addr)?;
            }
            list.len()
        }
    };
    let first = segments.min(MLLI_MAX_ENTRIES_PER_TABLE);
    Ok((first, segments.div_ceil(MLLI_MAX_ENTRIES_PER_TABLE)))
}

fn check_addr(addr: u64) -> Result<(), MlliError> {
    if addr > u32::MAX as u64 {
        return Err(MlliError::AddressRange(addr));
    }
    Ok(())
}

pub trait MlliBuilder: Send + Sync {
    fn build(&self, memref: &MemRef) -> Result<MlliTable, MlliError>;
    fn release(&self, table: MlliTable);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DmaDirection, DmaSegment};

    #[test]
    fn geometry_chains_long_lists() {
        let list = (0..300).map(|i| DmaSegment { bus_addr: 0x1000 * i, len: 0x100 }).collect();
        let memref = MemRef { source: MemRefSource::ScatterList(list), size: 300 * 0x100, direction: DmaDirection::ToDevice };
        assert_eq!(table_geometry(&memref), Ok((128, 3)));

        let single = MemRef { source: MemRefSource::Buffer { bus_addr: 0x4000 }, size: 16, direction: DmaDirection::FromDevice };
        assert_eq!(table_geometry(&single), Ok((1, 1)));
    }

    #[test]
    fn geometry_rejects_unreachable_and_empty() {
        let high = MemRef {
            source: MemRefSource::Buffer { bus_addr: 0x1_0000_0000 },
            size: 16,
            direction: DmaDirection::ToDevice,
        };
        assert_eq!(table_geometry(&high), Err(MlliError::AddressRange(0x1_0000_0000)));

        let empty = MemRef { source: MemRefSource::ScatterList(Vec::new()), size: 16, direction: DmaDirection::ToDevice };
        assert_eq!(table_geometry(&empty), Err(MlliError::Empty));
    }
}
