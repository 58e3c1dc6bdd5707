#![forbid(unsafe_code)]
//! Virtual-volume address translation with snapshot copy-on-write.
//!
//! A volume presents a flat 64 TiB byte space; each 8 KiB page maps to
//! an on-media address through a three-level page-table tree rooted in
//! eight per-header banks. Snapshots alias the parent's bank roots and
//! diverge lazily: the write path splits any table whose share count
//! exceeds one before mutating it, so every other volume keeps its
//! point-in-time view.

pub mod ptbl;
pub mod volume;

pub use ptbl::{Ptbl, PtblStore, RefRegistry, ReleaseOutcome};
pub use volume::{VvHeader, VvState, VvTable};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace};
use vvs_error::{Result, VvsError};
use vvs_types::{BlockAddr, PAGE_ADDR_BITS, PageAddr, PtblId, PtblLevel, Tte, VvId};

/// One row of a volume listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub id: VvId,
    pub name: String,
    pub parent: VvId,
    pub child: VvId,
}

/// One non-zero TTE located by its full slot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TteMapping {
    pub vv: VvId,
    pub bank: usize,
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
    pub tte: Tte,
}

/// Process-wide simulator state: the node arena with its refcount
/// registry, and the volume header table.
#[derive(Debug)]
pub struct VvEngine {
    store: PtblStore,
    volumes: VvTable,
}

impl Default for VvEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl VvEngine {
    /// Engine with an empty registry and the sentinel + root headers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: PtblStore::new(),
            volumes: VvTable::bootstrap(),
        }
    }

    /// Read-only view of the node arena and registry.
    #[must_use]
    pub fn store(&self) -> &PtblStore {
        &self.store
    }

    /// Read-only view of the header table.
    #[must_use]
    pub fn volume_table(&self) -> &VvTable {
        &self.volumes
    }

    /// Bank root handle of a live volume, for inspection.
    pub fn bank_root(&self, vv: VvId, bank: usize) -> Result<Option<PtblId>> {
        let header = self.volumes.header(vv)?;
        header
            .banks
            .get(bank)
            .copied()
            .ok_or(VvsError::BrokenInvariant("bank index out of bounds"))
    }

    fn page_of(&self, addr: BlockAddr) -> Result<PageAddr> {
        let page = PageAddr::from_block(addr);
        if !page.in_range() {
            return Err(VvsError::AddressOutOfRange {
                addr: addr.0,
                bits: PAGE_ADDR_BITS,
            });
        }
        Ok(page)
    }

    // ── Translation: READ ───────────────────────────────────────────────

    /// Resolve the TTE for the page containing `addr` in volume `vv`.
    ///
    /// An empty slot at any level resolves to the unmapped TTE. The walk
    /// never allocates, never touches refcounts, never splits. `len` is
    /// advisory; a read resolves exactly one page.
    pub fn read(&self, vv: VvId, addr: BlockAddr, _len: u64) -> Result<Tte> {
        let page = self.page_of(addr)?;
        let header = self.volumes.header(vv)?;

        let Some(l1) = header.banks[page.bank()] else {
            return Ok(Tte::UNMAPPED);
        };
        let Some(l2) = self.store.child(l1, page.l1_slot())? else {
            return Ok(Tte::UNMAPPED);
        };
        let Some(l3) = self.store.child(l2, page.l2_slot())? else {
            return Ok(Tte::UNMAPPED);
        };
        self.store.tte(l3, page.l3_slot())
    }

    // ── Translation: WRITE ──────────────────────────────────────────────

    /// Store `value` as the TTE for the page containing `addr` in `vv`.
    ///
    /// Descending bank → L1 → L2 → L3, every empty slot gets a fresh
    /// table and every shared table is split before the walk enters it,
    /// so the whole path ends up exclusive to `vv` before the TTE is
    /// written. Overwriting a mapped slot is allowed.
    pub fn write(&mut self, vv: VvId, addr: BlockAddr, _len: u64, value: Tte) -> Result<()> {
        let page = self.page_of(addr)?;
        self.volumes.header(vv)?;

        let l1 = self.exclusive_bank_root(vv, page.bank())?;
        let l2 = self.exclusive_child(l1, page.l1_slot(), PtblLevel::L2)?;
        let l3 = self.exclusive_child(l2, page.l2_slot(), PtblLevel::L3)?;
        self.store.set_tte(l3, page.l3_slot(), value)?;

        trace!(
            vv = vv.0,
            addr = addr.0,
            page = page.0,
            tte = value.0,
            "tte_store"
        );
        Ok(())
    }

    /// Make the bank root of `vv` present and exclusive.
    fn exclusive_bank_root(&mut self, vv: VvId, bank: usize) -> Result<PtblId> {
        let id = match self.volumes.header(vv)?.banks[bank] {
            Some(id) => id,
            None => {
                let id = self.store.alloc(PtblLevel::L1);
                self.volumes.header_mut(vv)?.banks[bank] = Some(id);
                id
            }
        };
        if self.store.refcount(id)? > 1 {
            let copy = self.store.cow(id)?;
            self.volumes.header_mut(vv)?.banks[bank] = Some(copy);
            debug!(vv = vv.0, bank, node = id.0, copy = copy.0, "bank_root_split");
            return Ok(copy);
        }
        Ok(id)
    }

    /// Make the child at `slot` of an exclusive `parent` present and
    /// exclusive. A freshly allocated child cannot be shared, which
    /// short-circuits the split check.
    fn exclusive_child(&mut self, parent: PtblId, slot: usize, level: PtblLevel) -> Result<PtblId> {
        let id = match self.store.child(parent, slot)? {
            Some(id) => id,
            None => {
                let id = self.store.alloc(level);
                self.store.set_child(parent, slot, id)?;
                return Ok(id);
            }
        };
        if self.store.refcount(id)? > 1 {
            let copy = self.store.cow(id)?;
            self.store.set_child(parent, slot, copy)?;
            return Ok(copy);
        }
        Ok(id)
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Snapshot the root VV under `name`.
    ///
    /// The new header aliases the parent's eight bank roots, each alias
    /// adding one share; all deeper tables stay shared through them
    /// until a write diverges the two volumes.
    pub fn create_snapshot(&mut self, name: &str) -> Result<VvId> {
        let banks = self.volumes.header(VvId::ROOT)?.banks;
        let id = self.volumes.allocate(name, VvId::ROOT);
        for root in banks.iter().flatten() {
            self.store.incr(*root)?;
        }
        self.volumes.header_mut(id)?.banks = banks;
        self.volumes.header_mut(VvId::ROOT)?.child = id;

        info!(id = id.0, name, "snapshot_create");
        Ok(id)
    }

    /// Delete the snapshot named `name`, releasing its shares.
    ///
    /// Every bank subtree is walked top-down: a table whose count drops
    /// to zero is reclaimed and its children released in turn; a table
    /// that stays shared stops the walk, since its own references keep
    /// contributing through it. The header slot is retired in place so
    /// ids stay dense. The root VV is not a snapshot and cannot be
    /// deleted.
    pub fn delete_snapshot(&mut self, name: &str) -> Result<VvId> {
        let id = self
            .volumes
            .live()
            .find(|header| header.id != VvId::ROOT && header.name == name)
            .map(|header| header.id)
            .ok_or_else(|| VvsError::NoSuchSnapshot(name.to_owned()))?;

        let header = self.volumes.header_mut(id)?;
        let banks = std::mem::replace(&mut header.banks, [None; vvs_types::BANK_COUNT]);
        header.state = VvState::Retired;

        for root in banks.iter().flatten() {
            self.release_tree(*root)?;
        }

        if self.volumes.header(VvId::ROOT)?.child == id {
            self.volumes.header_mut(VvId::ROOT)?.child = VvId::BAD;
        }

        info!(id = id.0, name, "snapshot_delete");
        Ok(id)
    }

    fn release_tree(&mut self, id: PtblId) -> Result<()> {
        if let Some(Ptbl::Interior { slots, .. }) = self.store.release(id)? {
            for child in slots.into_iter().flatten() {
                self.release_tree(child)?;
            }
        }
        Ok(())
    }

    // ── Listing and dump ────────────────────────────────────────────────

    /// All live volumes in id order.
    #[must_use]
    pub fn list_volumes(&self) -> Vec<VolumeInfo> {
        self.volumes
            .live()
            .map(|header| VolumeInfo {
                id: header.id,
                name: header.name.clone(),
                parent: header.parent,
                child: header.child,
            })
            .collect()
    }

    /// Every non-zero TTE, per live volume, in ascending slot order.
    pub fn dump_mappings(&self) -> Result<Vec<TteMapping>> {
        let mut out = Vec::new();
        for header in self.volumes.live() {
            for (bank, root) in header.banks.iter().enumerate() {
                let Some(l1) = root else { continue };
                self.dump_bank(header.id, bank, *l1, &mut out)?;
            }
        }
        Ok(out)
    }

    fn dump_bank(
        &self,
        vv: VvId,
        bank: usize,
        l1: PtblId,
        out: &mut Vec<TteMapping>,
    ) -> Result<()> {
        for l1_slot in 0..vvs_types::SLOTS_PER_PTBL {
            let Some(l2) = self.store.child(l1, l1_slot)? else {
                continue;
            };
            for l2_slot in 0..vvs_types::SLOTS_PER_PTBL {
                let Some(l3) = self.store.child(l2, l2_slot)? else {
                    continue;
                };
                for l3_slot in 0..vvs_types::SLOTS_PER_PTBL {
                    let tte = self.store.tte(l3, l3_slot)?;
                    if !tte.is_unmapped() {
                        out.push(TteMapping {
                            vv,
                            bank,
                            l1: l1_slot,
                            l2: l2_slot,
                            l3: l3_slot,
                            tte,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ── Invariant audit ─────────────────────────────────────────────────

    /// Recompute every reachable table's share count by walking all live
    /// headers and compare against the registry.
    ///
    /// Checks, in order: level layering (banks refer to L1, L1 slots to
    /// L2, L2 slots to L3), exact agreement of observed reference counts
    /// with the registry, and absence of unreachable registrations or
    /// arena entries.
    pub fn check_invariants(&self) -> Result<()> {
        let mut observed: BTreeMap<PtblId, u64> = BTreeMap::new();
        let mut stack: Vec<PtblId> = Vec::new();

        for header in self.volumes.live() {
            for root in header.banks.iter().flatten() {
                if self.store.level(*root)? != PtblLevel::L1 {
                    return Err(VvsError::BrokenInvariant(
                        "bank slot must refer to an L1 table",
                    ));
                }
                *observed.entry(*root).or_default() += 1;
                stack.push(*root);
            }
        }

        // Each table's slots are enumerated exactly once: a child's
        // count is the number of referring slots, not referring paths.
        let mut visited: BTreeSet<PtblId> = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let level = self.store.level(id)?;
            let Some(child_level) = level.child() else {
                continue;
            };
            for slot in 0..vvs_types::SLOTS_PER_PTBL {
                let Some(child) = self.store.child(id, slot)? else {
                    continue;
                };
                if self.store.level(child)? != child_level {
                    return Err(VvsError::BrokenInvariant(
                        "interior slot refers to a table of the wrong level",
                    ));
                }
                *observed.entry(child).or_default() += 1;
                stack.push(child);
            }
        }

        for (id, count) in &observed {
            if self.store.refcount_opt(*id) != Some(*count) {
                return Err(VvsError::RefcountViolation {
                    node: id.0,
                    count: self.store.refcount_opt(*id).unwrap_or(0),
                });
            }
        }
        if self.store.registry().len() != observed.len() {
            return Err(VvsError::BrokenInvariant(
                "registry holds an unreachable table",
            ));
        }
        if self.store.node_count() != observed.len() {
            return Err(VvsError::BrokenInvariant(
                "arena holds an unreachable table",
            ));
        }
        Ok(())
    }
}
