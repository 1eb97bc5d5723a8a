//! PRP-list DMA traversal (spec §4.8). A transfer of `N` bytes uses PRP1
//! (with arbitrary page offset) for the first span, then either PRP2 as a
//! second page directly, or as a pointer to a PRP list that may itself
//! chain to a further list. Grounded in the PRP-walking helpers found
//! across the `other_examples` NVMe drivers' `prp_to_sgl`/`resolve_prp`
//! style functions.

use crate::error::{Error, Result};

pub const MEM_PAGE_SIZE: u64 = 4096;

/// Stand-in for guest physical memory: the PCIe IP DMAs into and out of
/// this in this host-simulated crate, rather than a real bus-mastering
/// transfer.
pub struct HostMemory {
    bytes: Vec<u8>,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        HostMemory { bytes: vec![0u8; size] }
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let start = addr as usize;
        self.bytes.get(start..start + len).ok_or(Error::Invalid)
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let start = addr as usize;
        let dst = self.bytes.get_mut(start..start + data.len()).ok_or(Error::Invalid)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

/// One physically contiguous DMA span: `(physical address, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrpSegment {
    pub addr: u64,
    pub len: usize,
}

/// Resolves PRP1/PRP2 into the physical segments a transfer of `total_len`
/// bytes touches. Each segment spans at most one page; the caller
/// coalesces/DMAs them in order (spec §4.8: "coalesces physically
/// contiguous PRP segments and issues DMA operations in a single burst").
pub fn resolve(mem: &HostMemory, prp1: u64, prp2: u64, total_len: usize) -> Result<Vec<PrpSegment>> {
    if total_len == 0 {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let first_page_off = prp1 % MEM_PAGE_SIZE;
    let first_len = (MEM_PAGE_SIZE - first_page_off).min(total_len as u64) as usize;
    segments.push(PrpSegment { addr: prp1, len: first_len });

    let mut remaining = total_len - first_len;
    if remaining == 0 {
        return Ok(segments);
    }

    if remaining <= MEM_PAGE_SIZE as usize {
        segments.push(PrpSegment { addr: prp2, len: remaining });
        return Ok(segments);
    }

    // PRP2 points to a list of further entries; the list's last slot may
    // itself point to the next list if more pages remain, and that
    // pointer must be page-aligned.
    let mut list_addr = prp2;
    let entries_per_list = (MEM_PAGE_SIZE / 8) as usize;
    'lists: loop {
        for i in 0..entries_per_list {
            if remaining == 0 {
                break 'lists;
            }
            let entry_addr = list_addr + (i as u64) * 8;
            let entry = mem.read_u64(entry_addr)?;
            let last_slot = i == entries_per_list - 1;
            if last_slot && remaining > MEM_PAGE_SIZE as usize {
                if entry % MEM_PAGE_SIZE != 0 {
                    return Err(Error::Invalid);
                }
                list_addr = entry;
                continue 'lists;
            }
            let seg_len = (MEM_PAGE_SIZE as usize).min(remaining);
            segments.push(PrpSegment { addr: entry, len: seg_len });
            remaining -= seg_len;
        }
    }
    Ok(segments)
}

/// Copies `data` into host memory following `resolve`'s segmentation.
pub fn write_to_host(mem: &mut HostMemory, prp1: u64, prp2: u64, data: &[u8]) -> Result<()> {
    let segments = resolve(mem, prp1, prp2, data.len())?;
    let mut off = 0;
    for seg in segments {
        mem.write(seg.addr, &data[off..off + seg.len])?;
        off += seg.len;
    }
    Ok(())
}

/// Reads `len` bytes from host memory following `resolve`'s segmentation.
pub fn read_from_host(mem: &HostMemory, prp1: u64, prp2: u64, len: usize) -> Result<Vec<u8>> {
    let segments = resolve(mem, prp1, prp2, len)?;
    let mut out = Vec::with_capacity(len);
    for seg in segments {
        out.extend_from_slice(mem.read(seg.addr, seg.len)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_page_transfer_uses_only_prp1() {
        let mem = HostMemory::new(3 * MEM_PAGE_SIZE as usize);
        let segments = resolve(&mem, 0, 0, 100).unwrap();
        assert_eq!(segments, vec![PrpSegment { addr: 0, len: 100 }]);
    }

    #[test]
    fn two_page_transfer_uses_prp2_as_second_page() {
        let mem = HostMemory::new(3 * MEM_PAGE_SIZE as usize);
        let prp1 = MEM_PAGE_SIZE - 16;
        let total = 32;
        let segments = resolve(&mem, prp1, MEM_PAGE_SIZE * 2, total).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], PrpSegment { addr: prp1, len: 16 });
        assert_eq!(segments[1], PrpSegment { addr: MEM_PAGE_SIZE * 2, len: 16 });
    }

    #[test]
    fn round_trip_write_then_read_through_prp() {
        let mut mem = HostMemory::new(4 * MEM_PAGE_SIZE as usize);
        let data: Vec<u8> = (0..200u32).map(|v| v as u8).collect();
        write_to_host(&mut mem, 0, MEM_PAGE_SIZE, &data).unwrap();
        let back = read_from_host(&mem, 0, MEM_PAGE_SIZE, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn prp_list_chains_across_many_pages() {
        let mem_size = 10 * MEM_PAGE_SIZE as usize;
        let mut mem = HostMemory::new(mem_size);
        // PRP list lives at page 1; entries point at pages 2 and 3.
        let list_addr = MEM_PAGE_SIZE;
        mem.write(list_addr, &(2 * MEM_PAGE_SIZE).to_le_bytes()).unwrap();
        mem.write(list_addr + 8, &(3 * MEM_PAGE_SIZE).to_le_bytes()).unwrap();

        let prp1 = 0;
        let total_len = MEM_PAGE_SIZE as usize * 3; // page 0 full + two more full pages
        let segments = resolve(&mem, prp1, list_addr, total_len).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].addr, 0);
        assert_eq!(segments[1].addr, 2 * MEM_PAGE_SIZE);
        assert_eq!(segments[2].addr, 3 * MEM_PAGE_SIZE);
    }
}
