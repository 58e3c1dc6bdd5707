#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// A virtual volume addresses 2^46 bytes.
pub const VV_BYTE_ADDR_BITS: u32 = 46;

/// Backing-store blocks are 512 bytes; a translation page is 8 KiB,
/// so 16 blocks share one page.
pub const BLOCK_SIZE: u64 = 512;
pub const PAGE_SIZE: u64 = 8192;
pub const BLOCKS_PER_PAGE_SHIFT: u32 = 4;

/// Width of the page-address space: 46 byte bits - 9 block bits - 4
/// block-in-page bits.
pub const PAGE_ADDR_BITS: u32 = 33;

/// Every page table holds 1024 entries (8 KiB of 8-byte slots).
pub const SLOTS_PER_PTBL: usize = 1024;
const SLOT_MASK: u64 = 0x3FF;

/// Number of L1 roots in a volume header, selected by the top 3 page bits.
pub const BANK_COUNT: usize = 8;
const BANK_MASK: u64 = 0x7;

/// A 512-byte block address within the volume's flat address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr(pub u64);

/// An 8 KiB page address, the unit of translation.
///
/// Valid page addresses occupy 33 bits, partitioned MSB to LSB as a
/// 3-bit bank index, a 10-bit L1 slot, a 10-bit L2 slot, and a 10-bit
/// L3 slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageAddr(pub u64);

impl PageAddr {
    /// Page containing the given block (16 blocks per page).
    #[must_use]
    pub fn from_block(block: BlockAddr) -> Self {
        Self(block.0 >> BLOCKS_PER_PAGE_SHIFT)
    }

    /// Whether this page address fits the 33-bit page space.
    #[must_use]
    pub fn in_range(self) -> bool {
        self.0 < (1_u64 << PAGE_ADDR_BITS)
    }

    /// Bank index, bits 32..30 (one of eight L1 roots).
    #[must_use]
    pub fn bank(self) -> usize {
        ((self.0 >> 30) & BANK_MASK) as usize
    }

    /// Slot within the selected L1 table, bits 29..20.
    #[must_use]
    pub fn l1_slot(self) -> usize {
        ((self.0 >> 20) & SLOT_MASK) as usize
    }

    /// Slot within the L2 table, bits 19..10.
    #[must_use]
    pub fn l2_slot(self) -> usize {
        ((self.0 >> 10) & SLOT_MASK) as usize
    }

    /// Slot within the L3 table, bits 9..0.
    #[must_use]
    pub fn l3_slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    /// Recompose a page address from its slot path.
    #[must_use]
    pub fn from_slots(bank: usize, l1: usize, l2: usize, l3: usize) -> Self {
        Self(
            ((bank as u64 & BANK_MASK) << 30)
                | ((l1 as u64 & SLOT_MASK) << 20)
                | ((l2 as u64 & SLOT_MASK) << 10)
                | (l3 as u64 & SLOT_MASK),
        )
    }
}

/// A translation-table entry: an opaque 64-bit backing-store address.
/// Zero means unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tte(pub u64);

impl Tte {
    pub const UNMAPPED: Self = Self(0);

    #[must_use]
    pub fn is_unmapped(self) -> bool {
        self.0 == 0
    }
}

/// Dense volume-header index. Id 0 is the bad-header sentinel; id 1 is
/// the root virtual volume; snapshots are assigned densely from 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VvId(pub u32);

impl VvId {
    pub const BAD: Self = Self(0);
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for VvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable opaque handle for one page table in the node arena.
///
/// Handles are assigned monotonically at allocation and are never
/// reused, so a handle identifies one node for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PtblId(pub u64);

/// Level of a page table in the translation tree. L1 and L2 tables hold
/// child handles; L3 tables hold TTEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PtblLevel {
    L1,
    L2,
    L3,
}

impl PtblLevel {
    /// The level referenced by this table's slots, `None` for the leaf.
    #[must_use]
    pub fn child(self) -> Option<Self> {
        match self {
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => None,
        }
    }
}

impl fmt::Display for PtblLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => f.write_str("L1"),
            Self::L2 => f.write_str("L2"),
            Self::L3 => f.write_str("L3"),
        }
    }
}
