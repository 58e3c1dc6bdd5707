//! Volume headers and the dense header table.

use vvs_error::{Result, VvsError};
use vvs_types::{BANK_COUNT, PtblId, VvId};

/// Lifecycle state of a header slot. Ids are dense and never reused, so
/// a deleted snapshot leaves a retired header behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VvState {
    Active,
    Retired,
}

/// One volume header: the root VV or a snapshot of it.
///
/// `child` tracks only the most recently created snapshot; `parent` of
/// the root VV is the root itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VvHeader {
    pub id: VvId,
    pub name: String,
    pub banks: [Option<PtblId>; BANK_COUNT],
    pub parent: VvId,
    pub child: VvId,
    pub state: VvState,
}

impl VvHeader {
    fn new(id: VvId, name: &str, parent: VvId) -> Self {
        Self {
            id,
            name: name.to_owned(),
            banks: [None; BANK_COUNT],
            parent,
            child: VvId::BAD,
            state: VvState::Active,
        }
    }
}

/// Dense sequence of headers indexed by volume id.
#[derive(Debug)]
pub struct VvTable {
    headers: Vec<VvHeader>,
}

impl VvTable {
    /// Table holding the id-0 sentinel and the id-1 root VV.
    #[must_use]
    pub fn bootstrap() -> Self {
        Self {
            headers: vec![
                VvHeader::new(VvId::BAD, "bad", VvId::BAD),
                VvHeader::new(VvId::ROOT, "root", VvId::ROOT),
            ],
        }
    }

    fn slot(&self, id: VvId) -> Result<&VvHeader> {
        self.headers
            .get(id.0 as usize)
            .ok_or(VvsError::NoSuchVolume(u64::from(id.0)))
    }

    /// Live header by id. The sentinel and retired snapshots are not
    /// addressable.
    pub fn header(&self, id: VvId) -> Result<&VvHeader> {
        let header = self.slot(id)?;
        if id == VvId::BAD || header.state == VvState::Retired {
            return Err(VvsError::NoSuchVolume(u64::from(id.0)));
        }
        Ok(header)
    }

    pub fn header_mut(&mut self, id: VvId) -> Result<&mut VvHeader> {
        self.header(id)?;
        Ok(&mut self.headers[id.0 as usize])
    }

    /// Append a header at the next dense id.
    pub fn allocate(&mut self, name: &str, parent: VvId) -> VvId {
        let id = VvId(self.headers.len() as u32);
        self.headers.push(VvHeader::new(id, name, parent));
        id
    }

    /// Live volume with the given name, the root VV included.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<VvId> {
        self.live().find(|header| header.name == name).map(|h| h.id)
    }

    /// All live headers in id order, sentinel excluded.
    pub fn live(&self) -> impl Iterator<Item = &VvHeader> {
        self.headers
            .iter()
            .skip(1)
            .filter(|header| header.state == VvState::Active)
    }
}
