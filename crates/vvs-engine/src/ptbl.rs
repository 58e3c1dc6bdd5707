//! Page-table nodes, the node arena, and the refcount registry.
//!
//! Nodes are owned by the arena and referred to everywhere else by
//! `PtblId` handles. Shared ownership across volume headers is tracked
//! explicitly in `RefRegistry`: one count per parent slot currently
//! referring to the node, never via aliasing references.

use std::collections::BTreeMap;
use tracing::{debug, trace};
use vvs_error::{Result, VvsError};
use vvs_types::{PtblId, PtblLevel, SLOTS_PER_PTBL, Tte};

/// One page table. Interior tables (L1, L2) hold child handles; the L3
/// leaf holds translation entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ptbl {
    Interior {
        level: PtblLevel,
        slots: Vec<Option<PtblId>>,
    },
    Leaf {
        ttes: Vec<Tte>,
    },
}

impl Ptbl {
    fn new(level: PtblLevel) -> Self {
        match level {
            PtblLevel::L1 | PtblLevel::L2 => Self::Interior {
                level,
                slots: vec![None; SLOTS_PER_PTBL],
            },
            PtblLevel::L3 => Self::Leaf {
                ttes: vec![Tte::UNMAPPED; SLOTS_PER_PTBL],
            },
        }
    }

    #[must_use]
    pub fn level(&self) -> PtblLevel {
        match self {
            Self::Interior { level, .. } => *level,
            Self::Leaf { .. } => PtblLevel::L3,
        }
    }
}

/// What happened to a node's registration on `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other parent slots still hold shares; the node stays live.
    Shared,
    /// The last share was dropped; the node is dead and must be
    /// reclaimed by the caller.
    Dead,
}

/// Maps each live node handle to its positive share count.
///
/// `incr` and `decr` carry the strict write-path contracts: a count can
/// never be created at 0 and `decr` can never drive one non-positive.
/// Snapshot deletion is the only path allowed to drop a count to zero,
/// through `release`.
#[derive(Debug, Default)]
pub struct RefRegistry {
    counts: BTreeMap<PtblId, u64>,
}

impl RefRegistry {
    fn register(&mut self, id: PtblId) {
        let prev = self.counts.insert(id, 1);
        debug_assert!(prev.is_none(), "handle {id:?} registered twice");
    }

    /// Current share count, `None` if the node is not registered.
    #[must_use]
    pub fn count(&self, id: PtblId) -> Option<u64> {
        self.counts.get(&id).copied()
    }

    /// Add one share. The node must already be registered.
    pub fn incr(&mut self, id: PtblId) -> Result<()> {
        match self.counts.get_mut(&id) {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(VvsError::RefcountViolation {
                node: id.0,
                count: 0,
            }),
        }
    }

    /// Drop one share, keeping the node live. The count must be at
    /// least 2: the write path only sheds a share when another slot
    /// still contributes one.
    pub fn decr(&mut self, id: PtblId) -> Result<()> {
        match self.counts.get_mut(&id) {
            Some(count) if *count >= 2 => {
                *count -= 1;
                Ok(())
            }
            other => Err(VvsError::RefcountViolation {
                node: id.0,
                count: other.map_or(0, |count| *count),
            }),
        }
    }

    /// Drop one share, allowing the count to reach zero. At zero the
    /// registration is removed and the caller must reclaim the node.
    pub fn release(&mut self, id: PtblId) -> Result<ReleaseOutcome> {
        match self.counts.get_mut(&id) {
            Some(count) if *count >= 2 => {
                *count -= 1;
                Ok(ReleaseOutcome::Shared)
            }
            Some(_) => {
                self.counts.remove(&id);
                Ok(ReleaseOutcome::Dead)
            }
            None => Err(VvsError::RefcountViolation {
                node: id.0,
                count: 0,
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PtblId, u64)> + '_ {
        self.counts.iter().map(|(id, count)| (*id, *count))
    }
}

/// Arena of page tables plus their refcount registry.
#[derive(Debug, Default)]
pub struct PtblStore {
    next: u64,
    nodes: BTreeMap<PtblId, Ptbl>,
    registry: RefRegistry,
}

impl PtblStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: PtblId) -> Result<&Ptbl> {
        self.nodes
            .get(&id)
            .ok_or(VvsError::BrokenInvariant("handle refers to no live table"))
    }

    fn insert(&mut self, node: Ptbl) -> PtblId {
        let id = PtblId(self.next);
        self.next += 1;
        self.nodes.insert(id, node);
        self.registry.register(id);
        id
    }

    /// Allocate a fresh all-empty table at `level`, registered with
    /// count 1.
    pub fn alloc(&mut self, level: PtblLevel) -> PtblId {
        let id = self.insert(Ptbl::new(level));
        trace!(node = id.0, %level, "ptbl_alloc");
        id
    }

    /// Share count of a registered node; an unregistered handle is a
    /// fatal invariant break.
    pub fn refcount(&self, id: PtblId) -> Result<u64> {
        self.registry
            .count(id)
            .ok_or(VvsError::RefcountViolation {
                node: id.0,
                count: 0,
            })
    }

    /// Registry count without the liveness requirement, for inspection.
    #[must_use]
    pub fn refcount_opt(&self, id: PtblId) -> Option<u64> {
        self.registry.count(id)
    }

    pub fn incr(&mut self, id: PtblId) -> Result<()> {
        self.registry.incr(id)
    }

    pub fn level(&self, id: PtblId) -> Result<PtblLevel> {
        Ok(self.node(id)?.level())
    }

    /// Child handle at `slot` of an interior table.
    pub fn child(&self, id: PtblId, slot: usize) -> Result<Option<PtblId>> {
        match self.node(id)? {
            Ptbl::Interior { slots, .. } => slots
                .get(slot)
                .copied()
                .ok_or(VvsError::BrokenInvariant("interior slot out of bounds")),
            Ptbl::Leaf { .. } => Err(VvsError::BrokenInvariant(
                "leaf table has no child slots",
            )),
        }
    }

    /// Install `child` in `slot` of an interior table, overwriting.
    pub fn set_child(&mut self, id: PtblId, slot: usize, child: PtblId) -> Result<()> {
        match self.nodes.get_mut(&id) {
            Some(Ptbl::Interior { slots, .. }) => {
                let entry = slots
                    .get_mut(slot)
                    .ok_or(VvsError::BrokenInvariant("interior slot out of bounds"))?;
                *entry = Some(child);
                Ok(())
            }
            Some(Ptbl::Leaf { .. }) => Err(VvsError::BrokenInvariant(
                "leaf table has no child slots",
            )),
            None => Err(VvsError::BrokenInvariant("handle refers to no live table")),
        }
    }

    /// TTE at `slot` of a leaf table.
    pub fn tte(&self, id: PtblId, slot: usize) -> Result<Tte> {
        match self.node(id)? {
            Ptbl::Leaf { ttes } => ttes
                .get(slot)
                .copied()
                .ok_or(VvsError::BrokenInvariant("leaf slot out of bounds")),
            Ptbl::Interior { .. } => Err(VvsError::BrokenInvariant("interior table holds no TTEs")),
        }
    }

    pub fn set_tte(&mut self, id: PtblId, slot: usize, value: Tte) -> Result<()> {
        match self.nodes.get_mut(&id) {
            Some(Ptbl::Leaf { ttes }) => {
                let entry = ttes
                    .get_mut(slot)
                    .ok_or(VvsError::BrokenInvariant("leaf slot out of bounds"))?;
                *entry = value;
                Ok(())
            }
            Some(Ptbl::Interior { .. }) => {
                Err(VvsError::BrokenInvariant("interior table holds no TTEs"))
            }
            None => Err(VvsError::BrokenInvariant("handle refers to no live table")),
        }
    }

    /// Copy-on-write split of a shared table.
    ///
    /// The fresh sibling carries identical slot contents and enters the
    /// registry at count 1. For an interior table every non-empty child
    /// gains one share (the copy now refers to it independently); TTEs
    /// are plain values and get no counts. The original sheds the share
    /// that is moving to the copy; the caller installs the copy in the
    /// parent slot that triggered the split.
    pub fn cow(&mut self, id: PtblId) -> Result<PtblId> {
        let original = self.node(id)?.clone();
        let level = original.level();
        let children: Vec<PtblId> = match &original {
            Ptbl::Interior { slots, .. } => slots.iter().flatten().copied().collect(),
            Ptbl::Leaf { .. } => Vec::new(),
        };

        let copy = self.insert(original);
        for child in children {
            self.registry.incr(child)?;
        }
        self.registry.decr(id)?;

        debug!(node = id.0, copy = copy.0, %level, "ptbl_cow_split");
        Ok(copy)
    }

    /// Drop one share; on `Dead` the table is removed from the arena
    /// and returned so the caller can release its children.
    pub fn release(&mut self, id: PtblId) -> Result<Option<Ptbl>> {
        match self.registry.release(id)? {
            ReleaseOutcome::Shared => Ok(None),
            ReleaseOutcome::Dead => {
                let node = self
                    .nodes
                    .remove(&id)
                    .ok_or(VvsError::BrokenInvariant("dead handle missing from arena"))?;
                trace!(node = id.0, level = %node.level(), "ptbl_release_dead");
                Ok(Some(node))
            }
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn registry(&self) -> &RefRegistry {
        &self.registry
    }
}
