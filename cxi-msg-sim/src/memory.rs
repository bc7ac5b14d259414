// SPDX-License-Identifier: BSD-3-Clause

//! An in-process stand-in for registered memory (spec §1's "memory
//! registration" collaborator). Each endpoint owns one; cross-endpoint byte
//! movement is done directly by [`crate::network`] rather than through
//! [`MemoryRegion::copy_into`], which only ever moves bytes within a single
//! region the way a real host-memory-iface copy does (overflow buffer into a
//! posted receive, both local to one process).

use std::collections::HashMap;

use cxi_msg::nic::{MemoryRegion, MrHandle};

#[derive(Default)]
pub struct SimMemory {
    regions: HashMap<u64, Vec<u8>>,
    next: u64,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len_of(&self, mr: MrHandle) -> u64 {
        self.regions.get(&mr.0).map(|v| v.len() as u64).unwrap_or(0)
    }

    pub fn read(&self, mr: MrHandle, offset: u64, len: u64) -> Vec<u8> {
        let buf = self.regions.get(&mr.0).map(Vec::as_slice).unwrap_or(&[]);
        let start = (offset as usize).min(buf.len());
        let end = (start + len as usize).min(buf.len());
        buf[start..end].to_vec()
    }

    pub fn write(&mut self, mr: MrHandle, offset: u64, data: &[u8]) {
        if let Some(buf) = self.regions.get_mut(&mr.0) {
            let start = (offset as usize).min(buf.len());
            let end = (start + data.len()).min(buf.len());
            let n = end - start;
            buf[start..end].copy_from_slice(&data[..n]);
        }
    }
}

impl MemoryRegion for SimMemory {
    fn register(&mut self, len: u64) -> Option<MrHandle> {
        let id = self.next;
        self.next += 1;
        self.regions.insert(id, vec![0u8; len as usize]);
        Some(MrHandle(id))
    }

    fn deregister(&mut self, mr: MrHandle) {
        self.regions.remove(&mr.0);
    }

    fn copy_into(&mut self, dst: MrHandle, dst_offset: u64, src: MrHandle, src_offset: u64, len: u64) {
        let data = self.read(src, src_offset, len);
        self.write(dst, dst_offset, &data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let mut mem = SimMemory::new();
        let mr = mem.register(16).unwrap();
        mem.write(mr, 4, &[1, 2, 3]);
        assert_eq!(mem.read(mr, 4, 3), vec![1, 2, 3]);
        assert_eq!(mem.len_of(mr), 16);
    }

    #[test]
    fn copy_into_moves_bytes_within_one_region_set() {
        let mut mem = SimMemory::new();
        let src = mem.register(8).unwrap();
        let dst = mem.register(8).unwrap();
        mem.write(src, 0, &[9, 9, 9]);
        mem.copy_into(dst, 2, src, 0, 3);
        assert_eq!(mem.read(dst, 2, 3), vec![9, 9, 9]);
    }
}
