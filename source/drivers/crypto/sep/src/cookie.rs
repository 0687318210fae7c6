// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Generation-counted cookie table correlating hardware completions to op contexts
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 8 unit tests
//!
//! A cookie is `generation << 16 | index`. The table only keeps weak references,
//! so a context that disappears while the SeP still holds its descriptor
//! resolves as `Tombstoned` instead of dangling. A slot is never reused while
//! a descriptor carrying its cookie is outstanding; after reuse the bumped
//! generation rejects stale cookies.
//!
//! A tombstone may retain the owner's resources (`R`). They are handed back
//! through `take_released` once the last outstanding descriptor is gone, so
//! the caller can release them outside its own lock.

use core::fmt;
use std::sync::{Arc, Weak};

use thiserror::Error;

/// Maximum number of slots addressable by the 16-bit cookie index.
pub const MAX_COOKIES: usize = 1 << 16;

/// Host-side handle stored in word 7 of a hardware descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cookie(u32);

impl Cookie {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    pub const fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    const fn new(generation: u16, index: usize) -> Self {
        Self(((generation as u32) << 16) | (index as u32 & 0xFFFF))
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("cookie table exhausted ({capacity} slots)")]
    Exhausted { capacity: usize },
    #[error("cookie {0} is not allocated")]
    Unknown(Cookie),
}

/// Result of resolving a cookie.
pub enum CookieLookup<T> {
    Live(Arc<T>),
    /// The owner is gone; completions must be discarded.
    Tombstoned,
    Invalid,
}

impl<T> fmt::Debug for CookieLookup<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live(_) => f.write_str("Live"),
            Self::Tombstoned => f.write_str("Tombstoned"),
            Self::Invalid => f.write_str("Invalid"),
        }
    }
}

enum Entry<T, R> {
    Vacant,
    Live { target: Weak<T>, outstanding: u32 },
    Tombstoned { outstanding: u32, retained: Option<R> },
}

struct Slot<T, R> {
    generation: u16,
    entry: Entry<T, R>,
}

pub struct CookieTable<T, R = ()> {
    slots: Vec<Slot<T, R>>,
    in_use: usize,
    next: usize,
    released: Vec<R>,
}

impl<T, R> CookieTable<T, R> {
    /// Creates a table with `capacity` slots (clamped to `1..=MAX_COOKIES`).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_COOKIES);
        // Generation 0 is never handed out so a zeroed descriptor never resolves.
        let slots = (0..capacity).map(|_| Slot { generation: 1, entry: Entry::Vacant }).collect();
        Self { slots, in_use: 0, next: 0, released: Vec::new() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots that are live or tombstoned.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn allocate(&mut self, target: &Arc<T>) -> Result<Cookie, CookieError> {
        let capacity = self.slots.len();
        for step in 0..capacity {
            let index = (self.next + step) % capacity;
            let slot = &mut self.slots[index];
            if matches!(slot.entry, Entry::Vacant) {
                slot.entry = Entry::Live { target: Arc::downgrade(target), outstanding: 0 };
                self.in_use += 1;
                self.next = (index + 1) % capacity;
                return Ok(Cookie::new(slot.generation, index));
            }
        }
        Err(CookieError::Exhausted { capacity })
    }

    fn slot(&self, cookie: Cookie) -> Option<&Slot<T, R>> {
        self.slots
            .get(cookie.index())
            .filter(|slot| slot.generation == cookie.generation() && !matches!(slot.entry, Entry::Vacant))
    }

    fn slot_mut(&mut self, cookie: Cookie) -> Result<&mut Slot<T, R>, CookieError> {
        self.slots
            .get_mut(cookie.index())
            .filter(|slot| slot.generation == cookie.generation() && !matches!(slot.entry, Entry::Vacant))
            .ok_or(CookieError::Unknown(cookie))
    }

    pub fn lookup(&self, cookie: Cookie) -> CookieLookup<T> {
        match self.slot(cookie).map(|slot| &slot.entry) {
            Some(Entry::Live { target, .. }) => match target.upgrade() {
                Some(arc) => CookieLookup::Live(arc),
                None => CookieLookup::Tombstoned,
            },
            Some(Entry::Tombstoned { .. }) => CookieLookup::Tombstoned,
            Some(Entry::Vacant) | None => CookieLookup::Invalid,
        }
    }

    pub fn outstanding(&self, cookie: Cookie) -> u32 {
        match self.slot(cookie).map(|slot| &slot.entry) {
            Some(Entry::Live { outstanding, .. }) | Some(Entry::Tombstoned { outstanding, .. }) => *outstanding,
            _ => 0,
        }
    }

    /// Records one more descriptor carrying `cookie`.
    pub fn add_outstanding(&mut self, cookie: Cookie) -> Result<(), CookieError> {
        match &mut self.slot_mut(cookie)?.entry {
            Entry::Live { outstanding, .. } | Entry::Tombstoned { outstanding, .. } => {
                *outstanding += 1;
                Ok(())
            }
            Entry::Vacant => Err(CookieError::Unknown(cookie)),
        }
    }

    /// Records that one descriptor carrying `cookie` left the queue and returns
    /// how many remain. A tombstoned (or orphaned) slot is freed once none
    /// remain and its retained resources move to the released list.
    pub fn complete_outstanding(&mut self, cookie: Cookie) -> Result<u32, CookieError> {
        let slot = self.slot_mut(cookie)?;
        let (remaining, orphaned) = match &mut slot.entry {
            Entry::Live { target, outstanding } => {
                *outstanding = outstanding.saturating_sub(1);
                (*outstanding, target.strong_count() == 0)
            }
            Entry::Tombstoned { outstanding, .. } => {
                *outstanding = outstanding.saturating_sub(1);
                (*outstanding, true)
            }
            Entry::Vacant => return Err(CookieError::Unknown(cookie)),
        };
        if remaining == 0 && orphaned {
            self.free(cookie)?;
        }
        Ok(remaining)
    }

    /// Releases `cookie`; its slot becomes reusable under a new generation.
    pub fn free(&mut self, cookie: Cookie) -> Result<(), CookieError> {
        let slot = self.slot_mut(cookie)?;
        let entry = core::mem::replace(&mut slot.entry, Entry::Vacant);
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.in_use -= 1;
        if let Entry::Tombstoned { retained: Some(retained), .. } = entry {
            self.released.push(retained);
        }
        Ok(())
    }

    /// Tombstones `cookie`. Returns the number of descriptors still carrying
    /// it; with none outstanding the slot is freed right away.
    ///
    /// `retained` stays with the tombstone until the last outstanding
    /// descriptor completes. It goes straight to the released list when
    /// nothing is outstanding or the cookie is unknown.
    pub fn mark_invalid(&mut self, cookie: Cookie, retained: Option<R>) -> Result<u32, CookieError> {
        if self.slot(cookie).is_none() {
            self.released.extend(retained);
            return Err(CookieError::Unknown(cookie));
        }
        let slot = self.slot_mut(cookie)?;
        let (outstanding, held) = match &mut slot.entry {
            Entry::Live { outstanding, .. } => (*outstanding, None),
            Entry::Tombstoned { outstanding, retained: earlier } => (*outstanding, earlier.take()),
            Entry::Vacant => return Err(CookieError::Unknown(cookie)),
        };
        // A second tombstoning keeps whichever payload arrived first.
        let retained = held.or(retained);
        slot.entry = Entry::Tombstoned { outstanding, retained };
        if outstanding == 0 {
            self.free(cookie)?;
        }
        Ok(outstanding)
    }

    /// Resources whose tombstone was freed since the last call.
    pub fn take_released(&mut self) -> Vec<R> {
        core::mem::take(&mut self.released)
    }
}
