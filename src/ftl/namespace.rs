//! Namespace table (spec §3, §6): the allocated/active namespace slots
//! an NVMe controller exposes as blockable storage.

use crate::error::{Error, Result};
use crate::persist::{KvStore, Manifest, NamespaceRecord, MANIFEST_KEY};

#[derive(Debug, Clone, Copy, Default)]
pub struct Namespace {
    pub nsid: u32,
    pub allocated: bool,
    pub active: bool,
    pub size_blocks: u64,
    pub capacity_blocks: u64,
    pub util_blocks: u64,
}

/// Fixed-size table of up to `namespace_max` namespaces (spec §4.2
/// `[SUPPLEMENT]`, spec §6's `MANIFEST`).
pub struct NamespaceTable {
    namespaces: Vec<Namespace>,
}

impl NamespaceTable {
    pub fn new(namespace_max: usize) -> Self {
        let namespaces = (0..namespace_max as u32)
            .map(|nsid| Namespace { nsid, ..Namespace::default() })
            .collect();
        NamespaceTable { namespaces }
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn get(&self, nsid: u32) -> Result<&Namespace> {
        self.namespaces.get(nsid as usize).ok_or(Error::NotFound)
    }

    /// Allocates a namespace-table slot (NVMe opcode 0x0d, NAMESPACE
    /// CREATE). A created namespace is not yet active — a separate
    /// ATTACH (opcode 0x15) must bring it into service before I/O, the
    /// same two-step lifecycle real NVMe draws between namespace
    /// management and namespace attachment.
    pub fn create(&mut self, nsid: u32, capacity_blocks: u64) -> Result<()> {
        let ns = self.namespaces.get_mut(nsid as usize).ok_or(Error::NotFound)?;
        if ns.allocated {
            return Err(Error::AlreadyExists);
        }
        ns.allocated = true;
        ns.active = false;
        ns.capacity_blocks = capacity_blocks;
        ns.size_blocks = capacity_blocks;
        ns.util_blocks = 0;
        Ok(())
    }

    /// NAMESPACE ATTACH (opcode 0x15): marks an already-allocated
    /// namespace active. Rejects a namespace that was never created and
    /// a namespace that is already attached.
    pub fn attach(&mut self, nsid: u32) -> Result<()> {
        let ns = self.namespaces.get_mut(nsid as usize).ok_or(Error::NotFound)?;
        if !ns.allocated {
            return Err(Error::NotFound);
        }
        if ns.active {
            return Err(Error::AlreadyExists);
        }
        ns.active = true;
        Ok(())
    }

    /// NAMESPACE DETACH: clears the active flag on an attached namespace.
    /// Rejects a namespace that was never created or that isn't
    /// currently attached.
    pub fn detach(&mut self, nsid: u32) -> Result<()> {
        let ns = self.namespaces.get_mut(nsid as usize).ok_or(Error::NotFound)?;
        if !ns.allocated {
            return Err(Error::NotFound);
        }
        if !ns.active {
            return Err(Error::NotPermitted);
        }
        ns.active = false;
        Ok(())
    }

    pub fn delete(&mut self, nsid: u32) -> Result<()> {
        let ns = self.namespaces.get_mut(nsid as usize).ok_or(Error::NotFound)?;
        if !ns.allocated {
            return Err(Error::NotFound);
        }
        *ns = Namespace { nsid, ..Namespace::default() };
        Ok(())
    }

    pub fn record_util(&mut self, nsid: u32, util_blocks: u64) -> Result<()> {
        let ns = self.namespaces.get_mut(nsid as usize).ok_or(Error::NotFound)?;
        ns.util_blocks = util_blocks;
        Ok(())
    }

    pub fn persist(&self, store: &dyn KvStore) -> Result<()> {
        let mut manifest = Manifest::new(self.namespaces.len());
        for (i, ns) in self.namespaces.iter().enumerate() {
            manifest.allocated[i] = ns.allocated;
            manifest.active[i] = ns.active;
            manifest.records[i] = NamespaceRecord {
                size_blocks: ns.size_blocks,
                capacity_blocks: ns.capacity_blocks,
                util_blocks: ns.util_blocks,
            };
        }
        store.put(MANIFEST_KEY, &manifest.encode())
    }

    pub fn restore(&mut self, store: &dyn KvStore) -> Result<()> {
        let Some(bytes) = store.get(MANIFEST_KEY)? else {
            return Ok(());
        };
        let manifest = Manifest::decode(&bytes)?;
        for (i, ns) in self.namespaces.iter_mut().enumerate() {
            if i >= manifest.namespace_max {
                break;
            }
            ns.allocated = manifest.allocated[i];
            ns.active = manifest.active[i];
            ns.size_blocks = manifest.records[i].size_blocks;
            ns.capacity_blocks = manifest.records[i].capacity_blocks;
            ns.util_blocks = manifest.records[i].util_blocks;
        }
        Ok(())
    }
}
