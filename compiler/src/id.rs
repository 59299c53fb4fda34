// id.rs — Stable identifiers for layout-planner artifacts
//
// Indirect groups, map address slots, map tables and optional-argument bits
// are numbered in first-seen argument order, so every synthesizer derives
// the same generated names (`map<k>idx`, `opMap<k>`) from the same plan.

use std::fmt;

use serde::Serialize;

/// Distinct (dataset, map) pair used by indirect arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupId(pub u32);

/// Distinct (map, column) pair; one cached address per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(pub u32);

/// Distinct connectivity map passed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableId(pub u32);

/// Bit position in the optional-argument flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OptBit(pub u32);

macro_rules! ordinal {
    ($($t:ty),*) => {$(
        impl $t {
            /// 1-based number used in generated identifiers.
            pub fn ordinal(self) -> u32 {
                self.0 + 1
            }
        }
    )*};
}

ordinal!(GroupId, SlotId, TableId);

impl fmt::Display for OptBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation (argument) order, ensuring deterministic assignment.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_group: u32,
    next_slot: u32,
    next_table: u32,
    next_bit: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_group(&mut self) -> GroupId {
        let id = GroupId(self.next_group);
        self.next_group += 1;
        id
    }

    pub fn alloc_slot(&mut self) -> SlotId {
        let id = SlotId(self.next_slot);
        self.next_slot += 1;
        id
    }

    pub fn alloc_table(&mut self) -> TableId {
        let id = TableId(self.next_table);
        self.next_table += 1;
        id
    }

    pub fn alloc_bit(&mut self) -> OptBit {
        let id = OptBit(self.next_bit);
        self.next_bit += 1;
        id
    }

    /// Number of optional bits handed out so far.
    pub fn bits_used(&self) -> u32 {
        self.next_bit
    }
}
