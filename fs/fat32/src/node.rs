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

//! Node state and the translation of `(node, position, length)` into
//! sector-level transfers.

use std::sync::{Arc, Mutex};

use keel_ds::Storage;
use keel_fs::{Access, Error, Result};
use log::error;

use crate::{
    context::CommandContext,
    defs::{entry_sector, FILE_SIZE_MAX, RESERVED_CLUSTER, SECTOR_EXP, SECTOR_SIZE},
    name::extract_short_name,
    time::{decode_timestamp, encode_timestamp},
    Fat32Fs,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        const DIR = 0x01;
        const FILE = 0x02;
        const RO = 0x04;
        /// The directory entry lags behind the in-memory state; the node is
        /// enlisted in the open-file list.
        const DIRTY = 0x08;
    }
}

/// In-memory image of a directory entry plus the seek cache of its payload.
#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    /// Directory cluster holding the short entry; [`RESERVED_CLUSTER`] for
    /// the virtual root.
    pub parent_cluster: u32,
    /// Short entry position inside the parent chain.
    pub parent_index: u16,
    /// Position of the first long name chunk; equals the short entry
    /// position when the node has no long name.
    pub name_cluster: u32,
    pub name_index: u16,
    /// First cluster of the payload chain, [`RESERVED_CLUSTER`] when empty.
    pub payload_cluster: u32,
    /// File size in bytes, zero for directories.
    pub payload_size: u32,
    /// Seek cache: cluster holding `payload_position`.
    pub current_cluster: u32,
    pub payload_position: u32,
    /// Name length in bytes, terminator excluded.
    pub name_length: u16,
    /// Long file name chunk count, zero without a long name.
    pub lfn_chunks: u8,
    pub flags: NodeFlags,
}

impl NodeState {
    pub fn blank() -> Self {
        Self {
            parent_cluster: RESERVED_CLUSTER,
            parent_index: 0,
            name_cluster: RESERVED_CLUSTER,
            name_index: 0,
            payload_cluster: RESERVED_CLUSTER,
            payload_size: 0,
            current_cluster: RESERVED_CLUSTER,
            payload_position: 0,
            name_length: 0,
            lfn_chunks: 0,
            flags: NodeFlags::empty(),
        }
    }

    /// Scan cursor over the directory chain starting at `cluster`.
    pub fn scan_at(cluster: u32, index: u16) -> Self {
        Self {
            parent_cluster: cluster,
            parent_index: index,
            ..Self::blank()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(NodeFlags::DIR)
    }

    pub fn is_file(&self) -> bool {
        self.flags.contains(NodeFlags::FILE)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(NodeFlags::RO)
    }

    pub fn has_long_name(&self) -> bool {
        self.parent_cluster != self.name_cluster || self.parent_index != self.name_index
    }
}

/// Handle of a directory or file, drawn from the node pool of its
/// filesystem and returned with [`crate::Fat32Fs`]s `free`.
#[derive(Debug)]
pub struct Node {
    pub(crate) shared: Arc<Mutex<NodeState>>,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        self.shared.lock().unwrap().is_directory()
    }
}

impl<S: Storage> Fat32Fs<S> {
    /// Walks the chain from the cheaper of the two anchors, the chain start
    /// or the cached cluster, to the cluster holding `position`.
    ///
    /// A position exactly on a cluster boundary is anchored to the cluster
    /// before it; the transfer loops advance across the boundary themselves,
    /// which is what lets a write extend the chain there.
    pub(crate) fn seek_chain(
        &self,
        context: &mut CommandContext,
        current_position: u32,
        position: u32,
        start_cluster: u32,
        current_cluster: u32,
    ) -> Result<u32> {
        let exp = self.geometry.cluster_exp + SECTOR_EXP;
        let boundary_mask = self.geometry.cluster_bytes() - 1;
        let cluster_index = |value: u32| {
            if value != 0 && value & boundary_mask == 0 {
                (value >> exp) - 1
            } else {
                value >> exp
            }
        };

        let target = cluster_index(position);
        let (mut cluster, mut count) = if current_position > position {
            (start_cluster, target)
        } else {
            (current_cluster, target - cluster_index(current_position))
        };

        while count != 0 {
            match self.next_cluster(context, cluster)? {
                Some(next) => cluster = next,
                None => {
                    error!("fat32: cluster chain ends before the payload size");
                    return Err(Error::Inconsistent);
                }
            }
            count -= 1;
        }

        Ok(cluster)
    }

    /// Reads payload bytes at `position` into `buffer`. Partial sectors go
    /// through the context, aligned runs straight into `buffer`.
    pub(crate) fn read_chain(
        &self,
        context: &mut CommandContext,
        node: &mut NodeState,
        position: u32,
        buffer: &mut [u8],
    ) -> Result<()> {
        let mut current_cluster = node.current_cluster;
        let mut current_position = node.payload_position;

        if current_position != position {
            current_cluster = self.seek_chain(
                context,
                current_position,
                position,
                node.payload_cluster,
                current_cluster,
            )?;
            current_position = position;
        }

        let mut current_sector = if current_position > 0 {
            let sector = self.geometry.sector_in_cluster(current_position);
            if sector == 0 && current_position & (SECTOR_SIZE as u32 - 1) == 0 {
                self.geometry.sectors_per_cluster()
            } else {
                sector
            }
        } else {
            0
        };

        let mut buffer = buffer;
        while !buffer.is_empty() {
            if current_sector >= self.geometry.sectors_per_cluster() {
                current_cluster = self
                    .next_cluster(context, current_cluster)?
                    .ok_or(Error::Inconsistent)?;
                current_sector = 0;
            }

            let sector = self.geometry.sector_of_cluster(current_cluster) + current_sector;
            let offset = (current_position as usize) & (SECTOR_SIZE - 1);
            let chunk;

            if offset != 0 || buffer.len() < SECTOR_SIZE {
                // Partial sector, stage it in the context.
                chunk = (SECTOR_SIZE - offset).min(buffer.len());

                self.read_sector(context, sector)?;
                buffer[..chunk].copy_from_slice(&context.buffer[offset..offset + chunk]);

                if chunk + offset >= SECTOR_SIZE {
                    current_sector += 1;
                }
            } else {
                // The longest sector-aligned run inside this cluster.
                let run = ((self.geometry.sectors_per_cluster() - current_sector)
                    << SECTOR_EXP) as usize;
                chunk = run.min(buffer.len()) & !(SECTOR_SIZE - 1);

                self.read_run(sector, &mut buffer[..chunk])?;
                current_sector += (chunk >> SECTOR_EXP) as u32;
            }

            buffer = &mut buffer[chunk..];
            current_position += chunk as u32;
        }

        node.payload_position = current_position;
        node.current_cluster = current_cluster;

        Ok(())
    }

    /// Writes payload bytes at `position`, allocating the first cluster and
    /// extending the chain as the write advances past its end.
    pub(crate) fn write_chain(
        &self,
        context: &mut CommandContext,
        node: &mut NodeState,
        position: u32,
        buffer: &[u8],
    ) -> Result<()> {
        let mut current_cluster;
        let mut current_position = node.payload_position;

        if node.payload_cluster == RESERVED_CLUSTER {
            let mut state = self.state.lock().unwrap();
            node.payload_cluster =
                self.allocate_cluster(context, &mut state, RESERVED_CLUSTER)?;
            drop(state);
            current_cluster = node.payload_cluster;
            node.current_cluster = current_cluster;
        } else {
            current_cluster = node.current_cluster;
        }

        if current_position != position {
            current_cluster = self.seek_chain(
                context,
                current_position,
                position,
                node.payload_cluster,
                current_cluster,
            )?;
            current_position = position;
        }

        let mut current_sector = if current_position > 0 {
            let sector = self.geometry.sector_in_cluster(current_position);
            if sector == 0 && current_position & (SECTOR_SIZE as u32 - 1) == 0 {
                self.geometry.sectors_per_cluster()
            } else {
                sector
            }
        } else {
            0
        };

        let mut buffer = buffer;
        while !buffer.is_empty() {
            if current_sector >= self.geometry.sectors_per_cluster() {
                current_cluster = match self.next_cluster(context, current_cluster)? {
                    Some(next) => next,
                    None => {
                        let mut state = self.state.lock().unwrap();
                        self.allocate_cluster(context, &mut state, current_cluster)?
                    }
                };
                current_sector = 0;
            }

            let sector = self.geometry.sector_of_cluster(current_cluster) + current_sector;
            let offset = (current_position as usize) & (SECTOR_SIZE - 1);
            let chunk;

            if offset != 0 || buffer.len() < SECTOR_SIZE {
                // Read-modify-write through the context.
                chunk = (SECTOR_SIZE - offset).min(buffer.len());

                self.read_sector(context, sector)?;
                context.buffer[offset..offset + chunk].copy_from_slice(&buffer[..chunk]);
                self.write_sector(context, sector)?;

                if chunk + offset >= SECTOR_SIZE {
                    current_sector += 1;
                }
            } else {
                let run = ((self.geometry.sectors_per_cluster() - current_sector)
                    << SECTOR_EXP) as usize;
                chunk = run.min(buffer.len()) & !(SECTOR_SIZE - 1);

                self.write_run(sector, &buffer[..chunk])?;
                current_sector += (chunk >> SECTOR_EXP) as u32;
            }

            buffer = &buffer[chunk..];
            current_position += chunk as u32;
        }

        if current_position > node.payload_size {
            node.payload_size = current_position;
        }
        node.payload_position = current_position;
        node.current_cluster = current_cluster;

        Ok(())
    }

    pub(crate) fn read_node_data(
        &self,
        context: &mut CommandContext,
        node: &mut NodeState,
        position: u64,
        buffer: &mut [u8],
    ) -> Result<usize> {
        if !node.is_file() {
            return Err(Error::Invalid);
        }
        if position > u64::from(node.payload_size) {
            return Err(Error::BadValue);
        }

        let length = buffer
            .len()
            .min((u64::from(node.payload_size) - position) as usize);
        if length == 0 {
            return Ok(0);
        }

        self.read_chain(context, node, position as u32, &mut buffer[..length])?;
        Ok(length)
    }

    pub(crate) fn write_node_data(
        &self,
        context: &mut CommandContext,
        shared: &Arc<Mutex<NodeState>>,
        node: &mut NodeState,
        position: u64,
        buffer: &[u8],
    ) -> Result<usize> {
        if !node.is_file() {
            return Err(Error::Invalid);
        }
        if node.is_read_only() {
            return Err(Error::AccessDenied);
        }
        if position > u64::from(node.payload_size) {
            return Err(Error::BadValue);
        }

        // Clamp against the per-file limit of 4 GiB - 1.
        let length = buffer
            .len()
            .min((u64::from(FILE_SIZE_MAX) - position) as usize);
        if length == 0 {
            return Ok(0);
        }

        self.enlist_dirty(shared, node);

        self.write_chain(context, node, position as u32, &buffer[..length])?;
        Ok(length)
    }

    /// Marks a node dirty and enters it into the open-file list, once.
    pub(crate) fn enlist_dirty(&self, shared: &Arc<Mutex<NodeState>>, node: &mut NodeState) {
        if node.flags.contains(NodeFlags::DIRTY) {
            return;
        }

        let mut state = self.state.lock().unwrap();
        if !state.opened.iter().any(|other| Arc::ptr_eq(other, shared)) {
            state.opened.push(shared.clone());
        }
        drop(state);

        node.flags |= NodeFlags::DIRTY;
    }

    /// Reads the node name, long form preferred, as UTF-8 with a
    /// terminating NUL.
    pub(crate) fn read_node_name(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
        buffer: &mut [u8],
    ) -> Result<usize> {
        if buffer.len() <= usize::from(node.name_length) {
            return Err(Error::BadValue);
        }

        // The virtual root has no entry and therefore no name.
        if node.parent_cluster == RESERVED_CLUSTER {
            buffer[0] = 0;
            return Ok(1);
        }

        let name = if node.has_long_name() {
            self.read_long_name(context, node)?
        } else {
            let sector = self.geometry.sector_of_cluster(node.parent_cluster)
                + entry_sector(node.parent_index);
            self.read_sector(context, sector)?;
            extract_short_name(context.dir_entry(node.parent_index))
        };

        buffer[..name.len()].copy_from_slice(name.as_bytes());
        buffer[name.len()] = 0;
        Ok(name.len() + 1)
    }

    pub(crate) fn read_node_time(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
    ) -> Result<i64> {
        if node.parent_cluster == RESERVED_CLUSTER {
            return Err(Error::Invalid);
        }

        let sector = self.geometry.sector_of_cluster(node.parent_cluster)
            + entry_sector(node.parent_index);
        self.read_sector(context, sector)?;

        let entry = context.dir_entry(node.parent_index);
        decode_timestamp(entry.date.get(), entry.time.get())
    }

    pub(crate) fn write_node_time(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
        timestamp: i64,
    ) -> Result<()> {
        if node.parent_cluster == RESERVED_CLUSTER {
            return Err(Error::Invalid);
        }

        let sector = self.geometry.sector_of_cluster(node.parent_cluster)
            + entry_sector(node.parent_index);
        let (date, time) = encode_timestamp(timestamp);

        // The entry sector is shared with the neighbours; serialize the
        // read-modify-write against other directory updates.
        let _guard = self.state.lock().unwrap();
        self.read_sector(context, sector)?;

        let entry = context.dir_entry_mut(node.parent_index);
        if (entry.date.get(), entry.time.get()) != (date, time) {
            entry.date.set(date);
            entry.time.set(time);
            self.write_sector(context, sector)?;
        }

        Ok(())
    }

    pub(crate) fn read_node_access(&self, node: &NodeState) -> Access {
        if node.is_read_only() {
            Access::READ
        } else {
            Access::all()
        }
    }

    pub(crate) fn write_node_access(
        &self,
        context: &mut CommandContext,
        node: &mut NodeState,
        access: Access,
    ) -> Result<()> {
        if !access.contains(Access::READ) {
            return Err(Error::BadValue);
        }
        if node.parent_cluster == RESERVED_CLUSTER {
            return Err(Error::Invalid);
        }

        let sector = self.geometry.sector_of_cluster(node.parent_cluster)
            + entry_sector(node.parent_index);

        let _guard = self.state.lock().unwrap();
        self.read_sector(context, sector)?;

        let entry = context.dir_entry_mut(node.parent_index);
        let old_flags = entry.flags;
        if access.contains(Access::WRITE) {
            entry.flags &= !crate::defs::flags::RO;
            node.flags -= NodeFlags::RO;
        } else {
            entry.flags |= crate::defs::flags::RO;
            node.flags |= NodeFlags::RO;
        }

        if entry.flags != old_flags {
            self.write_sector(context, sector)?;
        }

        Ok(())
    }

    pub(crate) fn read_node_id(&self, node: &NodeState) -> u64 {
        (u64::from(node.parent_cluster) << 16) | u64::from(node.parent_index)
    }

    /// Occupied space: files round their size up to the cluster boundary,
    /// directories walk their chain.
    pub(crate) fn read_node_capacity(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
    ) -> Result<u64> {
        if node.is_file() {
            let mask = u64::from(self.geometry.cluster_bytes()) - 1;
            Ok((u64::from(node.payload_size) + mask) & !mask)
        } else {
            let clusters = self.chain_length(context, node)?;
            Ok(u64::from(clusters) * u64::from(self.geometry.cluster_bytes()))
        }
    }

    /// Rewrites the directory entry of `node` from its in-memory state:
    /// first cluster and size.
    pub(crate) fn sync_dir_entry(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
    ) -> Result<()> {
        let sector = self.geometry.sector_of_cluster(node.parent_cluster)
            + entry_sector(node.parent_index);
        self.read_sector(context, sector)?;

        let entry = context.dir_entry_mut(node.parent_index);
        entry.set_cluster(node.payload_cluster);
        entry.size.set(node.payload_size);

        let result = self.write_sector(context, sector);
        if let Err(error) = result {
            error!("fat32: node sync failed, {error}");
        }
        result
    }

    /// Releases the payload chain of `node`. Directories must hold nothing
    /// besides their bootstrap entries.
    pub(crate) fn truncate_payload(
        &self,
        context: &mut CommandContext,
        node: &mut NodeState,
    ) -> Result<()> {
        if node.is_directory() && !self.directory_is_empty(context, node)? {
            return Err(Error::DirectoryNotEmpty);
        }

        let mut state = self.state.lock().unwrap();
        self.free_chain(context, &mut state, node.payload_cluster)?;
        drop(state);

        node.payload_cluster = RESERVED_CLUSTER;
        node.current_cluster = RESERVED_CLUSTER;
        node.payload_size = 0;
        node.payload_position = 0;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_state() {
        let state = NodeState::blank();
        assert_eq!(state.parent_cluster, RESERVED_CLUSTER);
        assert_eq!(state.payload_cluster, RESERVED_CLUSTER);
        assert!(!state.is_directory());
        assert!(!state.is_file());
        assert!(!state.has_long_name());
    }

    #[test]
    fn long_name_anchor() {
        let mut state = NodeState::scan_at(8, 4);
        state.name_cluster = 8;
        state.name_index = 4;
        assert!(!state.has_long_name());

        state.name_index = 2;
        assert!(state.has_long_name());
    }
}
