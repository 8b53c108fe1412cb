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

//! FAT32 above any block-addressable storage.
//!
//! The engine serves the [`FileSystem`] node interface: a mounted volume
//! hands out [`Node`] handles from a bounded pool, node contents and
//! metadata are accessed as attribute streams, and written files keep their
//! directory entries lazily synced through the open-file list.

mod context;
mod defs;
mod dir;
mod format;
mod name;
mod node;
mod pool;
mod table;
mod time;

use std::sync::{Arc, Mutex};

use keel_ds::Storage;
use keel_fs::{unicode, Access, Attribute, Error, FileSystem, NodeConfig, Result};
use log::{debug, error, warn};
use zerocopy::FromBytes;

pub use crate::{
    format::{format, FormatConfig},
    node::Node,
};
use crate::{
    context::CommandContext,
    defs::{
        BootSector, Geometry, InfoSector, BOOT_SIGNATURE, CLUSTER_OFFSET, INFO_SIGNATURE,
        LEAD_SIGNATURE, LFN_UNIT_MAX, NAME_LENGTH, RESERVED_CLUSTER, SECTOR_EXP, SECTOR_SIZE,
    },
    dir::DirScan,
    name::fill_short_name,
    node::{NodeFlags, NodeState},
    pool::Pool,
};

/// Pool capacities, fixed at mount.
pub struct Fat32Config {
    /// Nodes that can be live at once.
    pub nodes: usize,
    /// Command contexts; one per thread of parallelism is enough.
    pub contexts: usize,
}

impl Default for Fat32Config {
    fn default() -> Self {
        Self {
            nodes: 16,
            contexts: 2,
        }
    }
}

/// Mutable volume state, guarded by the consistency lock: every allocation
/// table or FSInfo mutation and every open-file list change happens under
/// it.
pub(crate) struct VolumeState {
    /// Advisory scan hint, always inside `[2, cluster_count)`.
    pub last_allocated: u32,
    /// Nodes whose directory entry lags behind their in-memory state.
    pub opened: Vec<Arc<Mutex<NodeState>>>,
}

/// A mounted FAT32 volume.
pub struct Fat32Fs<S: Storage> {
    pub(crate) storage: S,
    pub(crate) geometry: Geometry,
    pub(crate) contexts: Pool<Box<CommandContext>>,
    pub(crate) nodes: Pool<Arc<Mutex<NodeState>>>,
    pub(crate) state: Mutex<VolumeState>,
}

impl<S: Storage> Fat32Fs<S> {
    /// Validates the boot and FSInfo sectors and brings up the pools.
    /// Geometry is immutable afterwards.
    pub fn mount(storage: S, config: &Fat32Config) -> Result<Self> {
        if config.nodes == 0 || config.contexts == 0 {
            return Err(Error::BadValue);
        }

        let mut context = CommandContext::new();
        let (geometry, last_allocated) = probe(&storage, &mut context)?;

        Ok(Self {
            storage,
            geometry,
            contexts: Pool::new((0..config.contexts).map(|_| CommandContext::new())),
            nodes: Pool::new(
                (0..config.nodes).map(|_| Arc::new(Mutex::new(NodeState::blank()))),
            ),
            state: Mutex::new(VolumeState {
                last_allocated,
                opened: Vec::new(),
            }),
        })
    }

    /// Flushes every written node and hands the storage back.
    pub fn unmount(self) -> (S, Result<()>) {
        let result = self.sync();
        (self.storage, result)
    }

    fn create_inner(
        &self,
        context: &mut CommandContext,
        parent: &NodeState,
        config: &NodeConfig<'_>,
        payload_cluster: &mut u32,
    ) -> Result<()> {
        let directory = config.payload.is_none();

        if directory {
            let mut state = self.state.lock().unwrap();
            *payload_cluster = self.allocate_cluster(context, &mut state, RESERVED_CLUSTER)?;
            drop(state);

            self.setup_dir_cluster(context, parent.payload_cluster, *payload_cluster, config.time)?;
        } else if let Some(data) = config.payload {
            if !data.is_empty() {
                // Fill the chain before the entry exists; the rollback path
                // then only has to release the chain, even when the fill
                // itself fails halfway.
                let mut scratch = NodeState::blank();
                scratch.flags = NodeFlags::FILE;
                let result = self.write_chain(context, &mut scratch, 0, data);
                *payload_cluster = scratch.payload_cluster;
                result?;
            }
        }

        let mut short_name = [b' '; NAME_LENGTH];
        let clean = fill_short_name(&mut short_name, config.name, !directory);

        let mut state = self.state.lock().unwrap();
        self.propose_unique_name(context, parent, &mut short_name)?;
        self.create_entry(
            context,
            &mut state,
            parent,
            directory,
            config.name,
            clean,
            short_name,
            config.access,
            *payload_cluster,
            config.time,
        )
    }
}

impl<S: Storage> FileSystem for Fat32Fs<S> {
    type Node = Node;

    fn root(&self) -> Result<Node> {
        let shared = self.nodes.acquire()?;

        let mut guard = shared.lock().unwrap();
        *guard = NodeState::blank();
        guard.payload_cluster = self.geometry.root_cluster;
        guard.current_cluster = self.geometry.root_cluster;
        guard.flags = NodeFlags::DIR;
        drop(guard);

        Ok(Node { shared })
    }

    fn sync(&self) -> Result<()> {
        let mut context = self.contexts.acquire()?;
        let opened = self.state.lock().unwrap().opened.clone();
        let mut result = Ok(());

        for shared in opened {
            let mut guard = shared.lock().unwrap();
            if !guard.flags.contains(NodeFlags::DIRTY) {
                continue;
            }

            match self.sync_dir_entry(&mut context, &guard) {
                Ok(()) => {
                    guard.flags -= NodeFlags::DIRTY;
                    self.state
                        .lock()
                        .unwrap()
                        .opened
                        .retain(|other| !Arc::ptr_eq(other, &shared));
                }
                Err(error) => {
                    if result.is_ok() {
                        result = Err(error);
                    }
                }
            }
        }

        self.contexts.release(context);
        result
    }

    fn create(&self, parent: &Node, config: &NodeConfig<'_>) -> Result<()> {
        let mut parent_state = parent.shared.lock().unwrap().clone();
        if !parent_state.is_directory() {
            return Err(Error::Invalid);
        }
        // A `..` entry names the root directory as cluster zero.
        if parent_state.payload_cluster == RESERVED_CLUSTER {
            parent_state.payload_cluster = self.geometry.root_cluster;
        }
        if parent_state.is_read_only() {
            return Err(Error::AccessDenied);
        }
        if config.name.is_empty() || !config.access.contains(Access::READ) {
            return Err(Error::BadValue);
        }
        if unicode::utf16_length(config.name) > LFN_UNIT_MAX {
            return Err(Error::BadValue);
        }

        let mut context = self.contexts.acquire()?;
        let mut payload_cluster = RESERVED_CLUSTER;
        let result = self.create_inner(&mut context, &parent_state, config, &mut payload_cluster);

        // No orphaned chains: release what a failed creation allocated.
        if result.is_err() && payload_cluster != RESERVED_CLUSTER {
            let mut state = self.state.lock().unwrap();
            let _ = self.free_chain(&mut context, &mut state, payload_cluster);
        }

        self.contexts.release(context);
        result
    }

    fn remove(&self, parent: &Node, node: &Node) -> Result<()> {
        if Arc::ptr_eq(&parent.shared, &node.shared) {
            return Err(Error::BadValue);
        }

        let parent_state = parent.shared.lock().unwrap().clone();
        if parent_state.is_read_only() {
            return Err(Error::AccessDenied);
        }

        let mut guard = node.shared.lock().unwrap();
        if guard.is_read_only() {
            return Err(Error::AccessDenied);
        }
        if guard.parent_cluster == RESERVED_CLUSTER {
            // The virtual root has no entry to remove.
            return Err(Error::Invalid);
        }

        let mut context = self.contexts.acquire()?;
        let result = self.truncate_payload(&mut context, &mut guard).and_then(|_| {
            let mut state = self.state.lock().unwrap();
            let result = self.mark_free(&mut context, &mut state, &guard);
            if result.is_ok() {
                // The entry is gone; a later sync must not resurrect it.
                state.opened.retain(|other| !Arc::ptr_eq(other, &node.shared));
            }
            result
        });

        if result.is_ok() {
            guard.flags -= NodeFlags::DIRTY;
        }
        self.contexts.release(context);
        result
    }

    fn head(&self, parent: &Node) -> Result<Option<Node>> {
        let mut parent_state = parent.shared.lock().unwrap().clone();
        if !parent_state.is_directory() {
            return Err(Error::Invalid);
        }
        // A `..` entry names the root directory as cluster zero.
        if parent_state.payload_cluster == RESERVED_CLUSTER {
            parent_state.payload_cluster = self.geometry.root_cluster;
        }

        let shared = self.nodes.acquire()?;
        let mut context = match self.contexts.acquire() {
            Ok(context) => context,
            Err(error) => {
                self.nodes.release(shared);
                return Err(error);
            }
        };

        let mut guard = shared.lock().unwrap();
        *guard = NodeState::scan_at(parent_state.payload_cluster, 0);
        let result = self.fetch_node(&mut context, &mut guard);
        drop(guard);

        self.contexts.release(context);
        match result {
            Ok(DirScan::Entry) => Ok(Some(Node { shared })),
            Ok(_) => {
                self.nodes.release(shared);
                Ok(None)
            }
            Err(error) => {
                self.nodes.release(shared);
                Err(error)
            }
        }
    }

    fn next(&self, node: &Node) -> Result<bool> {
        let mut guard = node.shared.lock().unwrap();
        if guard.parent_cluster == RESERVED_CLUSTER {
            return Ok(false);
        }

        let mut context = self.contexts.acquire()?;
        guard.parent_index += 1;
        let result = self.fetch_node(&mut context, &mut guard);
        self.contexts.release(context);

        match result {
            Ok(DirScan::Entry) => Ok(true),
            Ok(_) => {
                guard.parent_cluster = RESERVED_CLUSTER;
                guard.parent_index = 0;
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    fn read(
        &self,
        node: &Node,
        attribute: Attribute,
        position: u64,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let mut guard = node.shared.lock().unwrap();

        // Streams answered from the node state alone. Fixed-size streams
        // take exactly sized transfers at position zero, nothing else.
        match attribute {
            Attribute::Access => {
                return if position == 0 && buffer.len() == 1 {
                    buffer[0] = self.read_node_access(&guard).bits();
                    Ok(1)
                } else {
                    Err(Error::BadValue)
                };
            }
            Attribute::Id => {
                return if position == 0 && buffer.len() == 8 {
                    buffer.copy_from_slice(&self.read_node_id(&guard).to_le_bytes());
                    Ok(8)
                } else {
                    Err(Error::BadValue)
                };
            }
            Attribute::Capacity | Attribute::Data | Attribute::Name | Attribute::Time => {}
        }

        let mut context = self.contexts.acquire()?;
        let result = match attribute {
            Attribute::Capacity => {
                if position == 0 && buffer.len() == 8 {
                    self.read_node_capacity(&mut context, &guard).map(|value| {
                        buffer.copy_from_slice(&value.to_le_bytes());
                        8
                    })
                } else {
                    Err(Error::BadValue)
                }
            }
            Attribute::Data => self.read_node_data(&mut context, &mut guard, position, buffer),
            Attribute::Name => {
                if position == 0 {
                    self.read_node_name(&mut context, &guard, buffer)
                } else {
                    Err(Error::BadValue)
                }
            }
            Attribute::Time => {
                if position == 0 && buffer.len() == 8 {
                    self.read_node_time(&mut context, &guard).map(|value| {
                        buffer.copy_from_slice(&value.to_le_bytes());
                        8
                    })
                } else {
                    Err(Error::BadValue)
                }
            }
            Attribute::Access | Attribute::Id => Err(Error::Invalid),
        };

        self.contexts.release(context);
        result
    }

    fn write(
        &self,
        node: &Node,
        attribute: Attribute,
        position: u64,
        buffer: &[u8],
    ) -> Result<usize> {
        match attribute {
            Attribute::Access | Attribute::Data | Attribute::Time => {}
            _ => return Err(Error::Invalid),
        }

        let mut guard = node.shared.lock().unwrap();
        let mut context = self.contexts.acquire()?;

        let result = match attribute {
            Attribute::Access => {
                if position == 0 && !buffer.is_empty() {
                    Access::from_bits(buffer[0])
                        .ok_or(Error::BadValue)
                        .and_then(|access| self.write_node_access(&mut context, &mut guard, access))
                        .map(|_| 1)
                } else {
                    Err(Error::BadValue)
                }
            }
            Attribute::Data => {
                self.write_node_data(&mut context, &node.shared, &mut guard, position, buffer)
            }
            Attribute::Time => {
                if position == 0 && buffer.len() >= 8 {
                    let timestamp = i64::from_le_bytes(buffer[..8].try_into().unwrap());
                    self.write_node_time(&mut context, &guard, timestamp).map(|_| 8)
                } else {
                    Err(Error::BadValue)
                }
            }
            _ => Err(Error::Invalid),
        };

        self.contexts.release(context);
        result
    }

    fn length(&self, node: &Node, attribute: Attribute) -> Result<u64> {
        let guard = node.shared.lock().unwrap();

        match attribute {
            Attribute::Access => Ok(1),
            Attribute::Capacity | Attribute::Id | Attribute::Time => Ok(8),
            Attribute::Data => {
                if guard.is_file() {
                    Ok(u64::from(guard.payload_size))
                } else {
                    Err(Error::Invalid)
                }
            }
            Attribute::Name => Ok(u64::from(guard.name_length) + 1),
        }
    }

    fn truncate(&self, node: &Node) -> Result<()> {
        let mut guard = node.shared.lock().unwrap();
        if !guard.is_file() {
            return Err(Error::Invalid);
        }
        if guard.is_read_only() {
            return Err(Error::AccessDenied);
        }

        let mut context = self.contexts.acquire()?;
        let result = self.truncate_payload(&mut context, &mut guard);
        self.contexts.release(context);

        if result.is_ok() {
            // The entry still claims the old size until the next sync.
            self.enlist_dirty(&node.shared, &mut guard);
        }
        result
    }

    fn free(&self, node: Node) {
        let mut guard = node.shared.lock().unwrap();

        if guard.flags.contains(NodeFlags::DIRTY) {
            // Last chance to land the metadata on disk.
            match self.contexts.acquire() {
                Ok(mut context) => {
                    let _ = self.sync_dir_entry(&mut context, &guard);
                    self.contexts.release(context);
                }
                Err(_) => warn!("fat32: dirty node freed without a context"),
            }

            self.state
                .lock()
                .unwrap()
                .opened
                .retain(|other| !Arc::ptr_eq(other, &node.shared));
            guard.flags -= NodeFlags::DIRTY;
        }

        *guard = NodeState::blank();
        drop(guard);
        self.nodes.release(node.shared);
    }
}

fn probe<S: Storage>(storage: &S, context: &mut CommandContext) -> Result<(Geometry, u32)> {
    read_raw(storage, context, 0)?;
    let boot = BootSector::ref_from_bytes(&context.buffer).unwrap();

    if boot.signature != BOOT_SIGNATURE {
        error!("fat32: boot sector signature not found");
        return Err(Error::Device);
    }
    if usize::from(boot.bytes_per_sector.get()) != SECTOR_SIZE {
        error!(
            "fat32: sector size {} is not supported",
            boot.bytes_per_sector.get()
        );
        return Err(Error::Device);
    }
    let sectors_per_cluster = u32::from(boot.sectors_per_cluster);
    if !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > 128 {
        error!("fat32: {sectors_per_cluster} sectors per cluster is not supported");
        return Err(Error::Device);
    }
    if boot.table_count != 1 && boot.table_count != 2 {
        error!("fat32: table count {} is not supported", boot.table_count);
        return Err(Error::Device);
    }
    let table_size = boot.table_size.get();
    if table_size == 0 {
        error!("fat32: table size is zero");
        return Err(Error::Device);
    }

    let cluster_exp = sectors_per_cluster.ilog2();
    let table_sector = u32::from(boot.reserved_sectors.get());
    let data_sector = table_sector + u32::from(boot.table_count) * table_size;
    let total_sectors = boot.total_sectors.get();
    if total_sectors <= data_sector {
        error!("fat32: no space left for the data region");
        return Err(Error::Device);
    }

    let geometry = Geometry {
        cluster_exp,
        table_sector,
        data_sector,
        root_cluster: boot.root_cluster.get(),
        table_count: u32::from(boot.table_count),
        table_size,
        cluster_count: ((total_sectors - data_sector) >> cluster_exp) + CLUSTER_OFFSET,
        info_sector: u32::from(boot.info_sector.get()),
    };

    debug!("fat32: cluster size:  {}", geometry.cluster_bytes());
    debug!("fat32: table sector:  {}", geometry.table_sector);
    debug!("fat32: data sector:   {}", geometry.data_sector);
    debug!("fat32: table copies:  {}", geometry.table_count);
    debug!("fat32: table size:    {}", geometry.table_size);
    debug!("fat32: cluster count: {}", geometry.cluster_count);

    read_raw(storage, context, geometry.info_sector)?;
    let info = InfoSector::ref_from_bytes(&context.buffer).unwrap();

    if info.lead_signature.get() != LEAD_SIGNATURE || info.info_signature.get() != INFO_SIGNATURE {
        error!("fat32: info sector signatures not found");
        return Err(Error::Device);
    }

    debug!("fat32: free clusters: {}", info.free_clusters.get());

    let mut last_allocated = info.last_allocated.get();
    if !(CLUSTER_OFFSET..geometry.cluster_count).contains(&last_allocated) {
        warn!("fat32: allocation hint {last_allocated} is out of range");
        last_allocated = CLUSTER_OFFSET;
    }

    Ok((geometry, last_allocated))
}

fn read_raw<S: Storage>(storage: &S, context: &mut CommandContext, sector: u32) -> Result<()> {
    storage.acquire();
    let result = storage.read(u64::from(sector) << SECTOR_EXP, &mut context.buffer);
    storage.release();
    result
}
