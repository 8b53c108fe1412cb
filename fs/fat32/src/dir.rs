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

//! Variable-length entries inside directory cluster chains: short entries,
//! long file name chunks, deletions and the `.`/`..` bootstrap.

use keel_ds::Storage;
use keel_fs::{unicode, Access, Error, Result};
use log::debug;

use crate::{
    context::CommandContext,
    defs::{
        entry_sector, flags, DirEntry, ENTRY_EXP, LFN_UNIT_COUNT, MAX_SIMILAR_NAMES, NAME_LENGTH,
        RESERVED_CLUSTER,
    },
    name::{
        build_unique_name, extract_basename, extract_lfn_units, fill_lfn_header, fill_lfn_units,
        short_name_checksum, short_name_length,
    },
    node::{NodeFlags, NodeState},
    time::encode_timestamp,
    Fat32Fs, VolumeState,
};

/// Outcome of a directory scan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirScan {
    /// The cursor rests on a non-empty entry, resident in the context.
    Entry,
    /// The cursor rests on the end-of-directory marker.
    EndOfDirectory,
    /// The cluster chain ended before any further entry.
    EndOfChain,
}

/// Fills the invariant fields of a short-name entry. The name itself is
/// written by the caller.
pub(crate) fn fill_dir_entry(
    entry: &mut DirEntry,
    directory: bool,
    access: Access,
    payload_cluster: u32,
    timestamp: i64,
) {
    entry.reserved_0 = 0;
    entry.reserved_1 = 0;
    entry.reserved_2 = [0; 6];

    entry.flags = 0;
    if directory {
        entry.flags |= flags::DIR;
    }
    if !access.contains(Access::WRITE) {
        entry.flags |= flags::RO;
    }

    entry.set_cluster(payload_cluster);
    entry.size.set(0);

    let (date, time) = encode_timestamp(timestamp);
    entry.date.set(date);
    entry.time.set(time);
}

impl<S: Storage> Fat32Fs<S> {
    /// Advances the cursor of `node` to the next entry that is neither a
    /// volume label nor past the end of the directory. `parent_cluster` and
    /// `parent_index` must be initialized; they, and the node kind flags,
    /// are updated.
    pub(crate) fn fetch_entry(
        &self,
        context: &mut CommandContext,
        node: &mut NodeState,
    ) -> Result<DirScan> {
        loop {
            if node.parent_index >= self.geometry.entries_per_cluster() {
                match self.next_cluster(context, node.parent_cluster)? {
                    Some(next) => {
                        node.parent_cluster = next;
                        node.parent_index = 0;
                    }
                    None => {
                        // Rest on the last entry of the last cluster.
                        node.parent_index = self.geometry.entries_per_cluster() - 1;
                        return Ok(DirScan::EndOfChain);
                    }
                }
            }

            let sector = self.geometry.sector_of_cluster(node.parent_cluster)
                + entry_sector(node.parent_index);
            self.read_sector(context, sector)?;

            let entry = context.dir_entry(node.parent_index);
            if entry.is_end() {
                return Ok(DirScan::EndOfDirectory);
            }

            if entry.flags & flags::VOLUME == 0 || entry.is_long_name() {
                node.flags = if !entry.is_deleted() && !entry.is_long_name() {
                    if entry.flags & flags::DIR != 0 {
                        NodeFlags::DIR
                    } else {
                        NodeFlags::FILE
                    }
                } else {
                    NodeFlags::empty()
                };
                return Ok(DirScan::Entry);
            }

            node.parent_index += 1;
        }
    }

    /// Advances the cursor of `node` to the next live node, accumulating
    /// long file name state on the way. On success every node field is
    /// filled; a broken long name (bad checksum, chunk count or ordinal
    /// order) silently degrades to the short name.
    pub(crate) fn fetch_node(
        &self,
        context: &mut CommandContext,
        node: &mut NodeState,
    ) -> Result<DirScan> {
        let mut checksum = 0u8;
        let mut found = 0u8;

        loop {
            match self.fetch_entry(context, node)? {
                DirScan::Entry => {}
                other => return Ok(other),
            }

            let entry = context.dir_entry(node.parent_index);
            if entry.is_long_name() && entry.name[0] & flags::LFN_DELETED == 0 {
                let lfn = context.lfn_entry(node.parent_index);
                let sequence = lfn.ordinal & !flags::LFN_LAST;

                if lfn.ordinal & flags::LFN_LAST != 0 {
                    checksum = lfn.checksum;
                    found = 0;
                    node.lfn_chunks = sequence;
                    node.name_cluster = node.parent_cluster;
                    node.name_index = node.parent_index;
                    node.name_length = 0;
                } else if sequence > node.lfn_chunks || sequence + found != node.lfn_chunks {
                    // Ordinals must decrease one by one towards the entry.
                    node.lfn_chunks = 0;
                }
                found += 1;

                let mut units = [0u16; LFN_UNIT_COUNT];
                extract_lfn_units(lfn, &mut units);
                let end = units
                    .iter()
                    .position(|&unit| unit == 0 || unit == 0xFFFF)
                    .unwrap_or(LFN_UNIT_COUNT);
                node.name_length += unicode::utf8_length(&units[..end]) as u16;
            }

            if node.flags.intersects(NodeFlags::DIR | NodeFlags::FILE) {
                break;
            }
            node.parent_index += 1;
        }

        let entry = context.dir_entry(node.parent_index);
        node.payload_cluster = entry.cluster();
        node.payload_size = entry.size.get();
        node.current_cluster = node.payload_cluster;
        node.payload_position = 0;
        if entry.flags & flags::RO != 0 {
            node.flags |= NodeFlags::RO;
        }

        if found == 0 || found != node.lfn_chunks || checksum != short_name_checksum(&entry.name) {
            // Chunk count or checksum mismatch, treat the name as short only.
            node.lfn_chunks = 0;
            node.name_cluster = node.parent_cluster;
            node.name_index = node.parent_index;
            node.name_length = short_name_length(entry) as u16;
        }

        Ok(DirScan::Entry)
    }

    /// Collects the long name chunks anchored at `name_cluster`/`name_index`
    /// into a string.
    pub(crate) fn read_long_name(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
    ) -> Result<String> {
        let total = usize::from(node.lfn_chunks);
        let mut units = vec![0xFFFFu16; total * LFN_UNIT_COUNT];
        let mut chunks = 0;

        let mut scratch = NodeState::scan_at(node.name_cluster, node.name_index);
        loop {
            match self.fetch_entry(context, &mut scratch)? {
                DirScan::Entry => {}
                _ => break,
            }

            let entry = context.dir_entry(scratch.parent_index);
            if !entry.is_long_name() {
                break;
            }

            let lfn = context.lfn_entry(scratch.parent_index);
            let sequence = usize::from(lfn.ordinal & !flags::LFN_LAST);
            if sequence == 0 || sequence > total {
                return Err(Error::Inconsistent);
            }

            let offset = (sequence - 1) * LFN_UNIT_COUNT;
            let mut chunk = [0u16; LFN_UNIT_COUNT];
            extract_lfn_units(lfn, &mut chunk);
            units[offset..offset + LFN_UNIT_COUNT].copy_from_slice(&chunk);

            chunks += 1;
            scratch.parent_index += 1;
        }

        if chunks != total {
            return Err(Error::Inconsistent);
        }

        // Truncate the 0xFFFF padding of the tail chunk.
        let end = units
            .iter()
            .position(|&unit| unit == 0 || unit == 0xFFFF)
            .unwrap_or(units.len());
        Ok(unicode::from_utf16(&units[..end]))
    }

    /// Finds `run` contiguous reusable slots in the directory of `parent`,
    /// extending the cluster chain with zeroed clusters when the existing
    /// entries run out. Returns the position of the first slot.
    ///
    /// Runs under the consistency lock, witnessed by `state`.
    pub(crate) fn find_gap(
        &self,
        context: &mut CommandContext,
        state: &mut VolumeState,
        parent: &NodeState,
        run: u16,
    ) -> Result<(u32, u16)> {
        let mut first_cluster = RESERVED_CLUSTER;
        let mut first_index = 0u16;
        let mut chunks = 0u16;

        let mut scratch = NodeState::scan_at(parent.payload_cluster, 0);
        while chunks != run {
            match self.fetch_entry(context, &mut scratch)? {
                DirScan::EndOfChain => {
                    // No reusable slots left, grow the directory.
                    let entries_per_cluster = self.geometry.entries_per_cluster();
                    let remaining = run - chunks;
                    let mut cluster = scratch.parent_cluster;
                    let mut available = 0u16;

                    while available < remaining {
                        cluster = self.allocate_cluster(context, state, cluster)?;
                        self.clear_cluster(context, cluster)?;
                        available += entries_per_cluster;
                    }
                }
                DirScan::Entry | DirScan::EndOfDirectory => {
                    let entry = context.dir_entry(scratch.parent_index);
                    let reusable = entry.is_end()
                        || entry.is_deleted()
                        || (entry.is_long_name() && entry.name[0] & flags::LFN_DELETED != 0);

                    if reusable {
                        if chunks == 0 {
                            first_cluster = scratch.parent_cluster;
                            first_index = scratch.parent_index;
                        }
                        chunks += 1;
                    } else {
                        first_cluster = RESERVED_CLUSTER;
                        first_index = 0;
                        chunks = 0;
                    }
                }
            }

            scratch.parent_index += 1;
        }

        Ok((first_cluster, first_index))
    }

    /// Creates the on-disk entries of a new node inside the directory of
    /// `parent`: the long name chain when the short form is lossy, then the
    /// short entry itself.
    ///
    /// Runs under the consistency lock, witnessed by `state`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_entry(
        &self,
        context: &mut CommandContext,
        state: &mut VolumeState,
        parent: &NodeState,
        directory: bool,
        name: &str,
        clean: bool,
        short_name: [u8; NAME_LENGTH],
        access: Access,
        payload_cluster: u32,
        timestamp: i64,
    ) -> Result<()> {
        let units = unicode::to_utf16(name);
        let total = if clean {
            0
        } else {
            units.len().div_ceil(LFN_UNIT_COUNT) as u16
        };

        let (mut cluster, mut index) = self.find_gap(context, state, parent, total + 1)?;

        if total != 0 {
            let checksum = short_name_checksum(&short_name);

            // Chunks are stored in reverse order, the last chunk first.
            for current in (1..=total).rev() {
                let sector =
                    self.geometry.sector_of_cluster(cluster) + entry_sector(index);
                self.read_sector(context, sector)?;

                let lfn = context.lfn_entry_mut(index);
                let offset = usize::from(current - 1) * LFN_UNIT_COUNT;
                let end = units.len().min(offset + LFN_UNIT_COUNT);
                fill_lfn_units(lfn, &units[offset..end]);
                fill_lfn_header(lfn, current as u8, total as u8, checksum);

                index += 1;

                if index & ((1u16 << ENTRY_EXP) - 1) == 0 {
                    // Flush when leaving the sector.
                    self.write_sector(context, sector)?;

                    if index >= self.geometry.entries_per_cluster() {
                        cluster = self
                            .next_cluster(context, cluster)?
                            .ok_or(Error::Inconsistent)?;
                        index = 0;
                    }
                }
            }
        }

        let sector = self.geometry.sector_of_cluster(cluster) + entry_sector(index);
        self.read_sector(context, sector)?;

        let entry = context.dir_entry_mut(index);
        entry.name = short_name;
        fill_dir_entry(entry, directory, access, payload_cluster, timestamp);

        self.write_sector(context, sector)
    }

    /// Resolves short-name collisions inside the directory of `parent` by
    /// rewriting the basename of `short_name` into its `BASE~N` form with
    /// the smallest unused N. Exhaustion of the two-digit space fails
    /// `EntryExists`.
    pub(crate) fn propose_unique_name(
        &self,
        context: &mut CommandContext,
        parent: &NodeState,
        short_name: &mut [u8; NAME_LENGTH],
    ) -> Result<()> {
        let basename_length = extract_basename(short_name).len();
        let basename = {
            let mut buffer = [0u8; NAME_LENGTH];
            buffer[..basename_length].copy_from_slice(&short_name[..basename_length]);
            buffer
        };
        let basename = &basename[..basename_length];

        let mut used = [false; MAX_SIMILAR_NAMES];
        let mut collides = false;

        let mut scratch = NodeState::scan_at(parent.payload_cluster, 0);
        loop {
            match self.fetch_entry(context, &mut scratch)? {
                DirScan::Entry => {}
                _ => break,
            }

            let entry = context.dir_entry(scratch.parent_index);
            if !entry.is_deleted() && !entry.is_long_name() {
                let candidate = extract_basename(&entry.name);

                match crate::name::unique_name_instance(candidate) {
                    Some((prefix, instance)) => {
                        // A suffixed entry blocks its instance for every name
                        // it may have been truncated from.
                        if instance < MAX_SIMILAR_NAMES
                            && basename.starts_with(&candidate[..prefix])
                        {
                            used[instance] = true;
                        }
                    }
                    None => {
                        if candidate == basename {
                            collides = true;
                        }
                    }
                }
            }

            scratch.parent_index += 1;
        }

        if !collides && !used.iter().any(|&instance| instance) {
            return Ok(());
        }

        let instance = (1..MAX_SIMILAR_NAMES)
            .find(|&instance| !used[instance])
            .ok_or(Error::EntryExists)?;
        build_unique_name(short_name, basename, instance);
        debug!(
            "fat32: proposed short name \"{}\"",
            String::from_utf8_lossy(&short_name[..crate::defs::BASENAME_LENGTH])
        );

        Ok(())
    }

    /// Marks every entry of a node, long name chunks included, as free.
    /// Writes are batched so each affected sector is written exactly once.
    ///
    /// Runs under the consistency lock, witnessed by `_state`.
    pub(crate) fn mark_free(
        &self,
        context: &mut CommandContext,
        _state: &mut VolumeState,
        node: &NodeState,
    ) -> Result<()> {
        let last_sector = self.geometry.sector_of_cluster(node.parent_cluster)
            + entry_sector(node.parent_index);

        let mut scratch = NodeState::scan_at(node.name_cluster, node.name_index);
        loop {
            match self.fetch_entry(context, &mut scratch)? {
                DirScan::Entry => {}
                _ => return Err(Error::Inconsistent),
            }

            let sector = self.geometry.sector_of_cluster(scratch.parent_cluster)
                + entry_sector(scratch.parent_index);
            let last = sector == last_sector && scratch.parent_index == node.parent_index;

            context.dir_entry_mut(scratch.parent_index).name[0] = crate::defs::ENTRY_FREE;
            scratch.parent_index += 1;

            if last || scratch.parent_index & ((1u16 << ENTRY_EXP) - 1) == 0 {
                self.write_sector(context, sector)?;
            }
            if last {
                return Ok(());
            }
        }
    }

    /// Bootstraps a fresh directory cluster: zeroes it and writes the `.`
    /// and `..` entries. `..` stores cluster zero when the parent is the
    /// root directory.
    pub(crate) fn setup_dir_cluster(
        &self,
        context: &mut CommandContext,
        parent_cluster: u32,
        payload_cluster: u32,
        timestamp: i64,
    ) -> Result<()> {
        self.clear_cluster(context, payload_cluster)?;

        let entry = context.dir_entry_mut(0);
        entry.name = [b' '; NAME_LENGTH];
        entry.name[0] = b'.';
        fill_dir_entry(entry, true, Access::all(), payload_cluster, timestamp);

        let dotdot = if parent_cluster == self.geometry.root_cluster {
            RESERVED_CLUSTER
        } else {
            parent_cluster
        };
        let entry = context.dir_entry_mut(1);
        entry.name = [b' '; NAME_LENGTH];
        entry.name[0] = b'.';
        entry.name[1] = b'.';
        fill_dir_entry(entry, true, Access::all(), dotdot, timestamp);

        self.write_sector(context, self.geometry.sector_of_cluster(payload_cluster))
    }

    /// Whether the payload chain of a directory holds nothing besides the
    /// `.` and `..` bootstrap entries.
    pub(crate) fn directory_is_empty(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
    ) -> Result<bool> {
        if node.payload_cluster == RESERVED_CLUSTER {
            return Ok(true);
        }

        let mut scratch = NodeState::scan_at(node.payload_cluster, 2);
        match self.fetch_node(context, &mut scratch)? {
            DirScan::Entry => Ok(false),
            _ => Ok(true),
        }
    }

    /// Number of clusters in the payload chain of `node`.
    pub(crate) fn chain_length(
        &self,
        context: &mut CommandContext,
        node: &NodeState,
    ) -> Result<u32> {
        let mut clusters = 0;
        let mut current = node.payload_cluster;

        if current != RESERVED_CLUSTER {
            loop {
                clusters += 1;
                match self.next_cluster(context, current)? {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }

        Ok(clusters)
    }
}
