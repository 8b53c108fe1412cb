// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use zerocopy::FromBytes;

use crate::defs::{cell_offset, entry_offset, DirEntry, LfnEntry, SECTOR_SIZE};

/// Sector number that never matches a real sector, so a fresh context always
/// misses on its first read.
const RESERVED_SECTOR: u32 = u32::MAX;

/// One-sector staging buffer shared by the read-modify-write patterns of the
/// table and directory engines.
///
/// `sector` names the sector resident in the buffer after a successful read
/// or write. Contents survive release and reacquisition, but operations must
/// not depend on what a previous owner left behind.
pub(crate) struct CommandContext {
    pub sector: u32,
    pub buffer: [u8; SECTOR_SIZE],
}

impl CommandContext {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            sector: RESERVED_SECTOR,
            buffer: [0; SECTOR_SIZE],
        })
    }

    /// Forgets the cached sector, forcing the next read to hit the storage.
    pub fn invalidate(&mut self) {
        self.sector = RESERVED_SECTOR;
    }

    pub fn dir_entry(&self, index: u16) -> &DirEntry {
        let offset = entry_offset(index);
        DirEntry::ref_from_bytes(&self.buffer[offset..offset + size_of::<DirEntry>()]).unwrap()
    }

    pub fn dir_entry_mut(&mut self, index: u16) -> &mut DirEntry {
        let offset = entry_offset(index);
        DirEntry::mut_from_bytes(&mut self.buffer[offset..offset + size_of::<DirEntry>()]).unwrap()
    }

    pub fn lfn_entry(&self, index: u16) -> &LfnEntry {
        let offset = entry_offset(index);
        LfnEntry::ref_from_bytes(&self.buffer[offset..offset + size_of::<LfnEntry>()]).unwrap()
    }

    pub fn lfn_entry_mut(&mut self, index: u16) -> &mut LfnEntry {
        let offset = entry_offset(index);
        LfnEntry::mut_from_bytes(&mut self.buffer[offset..offset + size_of::<LfnEntry>()]).unwrap()
    }

    /// Allocation table cell of `cluster` within the buffered table sector.
    pub fn cell(&self, cluster: u32) -> u32 {
        let offset = cell_offset(cluster);
        u32::from_le_bytes(self.buffer[offset..offset + 4].try_into().unwrap())
    }

    pub fn set_cell(&mut self, cluster: u32, value: u32) {
        let offset = cell_offset(cluster);
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
