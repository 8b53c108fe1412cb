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

//! The allocation table as a persistent linked list of 32-bit cells.

use keel_ds::Storage;
use keel_fs::{Error, Result};
use log::{trace, warn};
use zerocopy::FromBytes;

use crate::{
    context::CommandContext,
    defs::{
        cell_sector, is_cluster_free, is_cluster_used, InfoSector, CLUSTER_EOC, CLUSTER_OFFSET,
        RESERVED_CLUSTER, SECTOR_EXP,
    },
    Fat32Fs, VolumeState,
};

impl<S: Storage> Fat32Fs<S> {
    /// Reads `sector` into the context unless it is already resident.
    pub(crate) fn read_sector(&self, context: &mut CommandContext, sector: u32) -> Result<()> {
        if context.sector == sector {
            return Ok(());
        }

        let position = u64::from(sector) << SECTOR_EXP;

        self.storage.acquire();
        let result = self.storage.read(position, &mut context.buffer);
        self.storage.release();

        match result {
            Ok(()) => context.sector = sector,
            // The buffer may hold a torn transfer.
            Err(_) => context.invalidate(),
        }
        result
    }

    /// Writes the context buffer to `sector` unconditionally.
    pub(crate) fn write_sector(&self, context: &mut CommandContext, sector: u32) -> Result<()> {
        let position = u64::from(sector) << SECTOR_EXP;

        self.storage.acquire();
        let result = self.storage.write(position, &context.buffer);
        self.storage.release();

        match result {
            Ok(()) => context.sector = sector,
            Err(_) => context.invalidate(),
        }
        result
    }

    /// Bulk read of whole sectors, bypassing the context cache.
    pub(crate) fn read_run(&self, sector: u32, buffer: &mut [u8]) -> Result<()> {
        let position = u64::from(sector) << SECTOR_EXP;

        self.storage.acquire();
        let result = self.storage.read(position, buffer);
        self.storage.release();
        result
    }

    /// Bulk write of whole sectors, bypassing the context cache.
    pub(crate) fn write_run(&self, sector: u32, buffer: &[u8]) -> Result<()> {
        let position = u64::from(sector) << SECTOR_EXP;

        self.storage.acquire();
        let result = self.storage.write(position, buffer);
        self.storage.release();
        result
    }

    /// Successor of `cluster`, or `None` at the end of the chain.
    pub(crate) fn next_cluster(
        &self,
        context: &mut CommandContext,
        cluster: u32,
    ) -> Result<Option<u32>> {
        self.read_sector(context, self.geometry.table_sector + cell_sector(cluster))?;

        let next = context.cell(cluster) & 0x0FFF_FFFF;
        Ok(is_cluster_used(next).then_some(next))
    }

    /// Allocates one free cluster, linking it after `parent` unless `parent`
    /// is [`RESERVED_CLUSTER`]. The scan starts past the most recently
    /// allocated cluster and wraps once around the volume.
    ///
    /// Runs under the consistency lock, witnessed by `state`.
    pub(crate) fn allocate_cluster(
        &self,
        context: &mut CommandContext,
        state: &mut VolumeState,
        parent: u32,
    ) -> Result<u32> {
        let mut current = state.last_allocated + 1;

        while current != state.last_allocated {
            if current >= self.geometry.cluster_count {
                current = CLUSTER_OFFSET;
            }

            let current_offset = cell_sector(current);
            self.read_sector(context, self.geometry.table_sector + current_offset)?;

            if is_cluster_free(context.cell(current)) {
                context.set_cell(current, CLUSTER_EOC);

                // Mirror now unless the parent cell shares this sector, in
                // which case a single mirror after linking suffices.
                if parent == RESERVED_CLUSTER || cell_sector(parent) != current_offset {
                    self.update_table(context, current_offset)?;
                }

                if parent != RESERVED_CLUSTER {
                    let parent_offset = cell_sector(parent);
                    self.read_sector(context, self.geometry.table_sector + parent_offset)?;
                    context.set_cell(parent, current);
                    self.update_table(context, parent_offset)?;
                }

                trace!("fat32: allocated cluster {current}, parent {parent}");
                state.last_allocated = current;

                self.read_sector(context, self.geometry.info_sector)?;
                let info = InfoSector::mut_from_bytes(&mut context.buffer).unwrap();
                info.last_allocated.set(current);
                info.free_clusters
                    .set(info.free_clusters.get().wrapping_sub(1));
                self.write_sector(context, self.geometry.info_sector)?;

                return Ok(current);
            }

            current += 1;
        }

        warn!("fat32: cluster allocation failed, volume is full");
        Err(Error::VolumeFull)
    }

    /// Walks the chain starting at `first`, zeroing every visited cell.
    /// Mirroring is deferred until the walk leaves a table sector, so each
    /// affected sector is mirrored exactly once.
    ///
    /// Runs under the consistency lock; `_state` witnesses it.
    pub(crate) fn free_chain(
        &self,
        context: &mut CommandContext,
        _state: &mut VolumeState,
        first: u32,
    ) -> Result<()> {
        if first == RESERVED_CLUSTER {
            return Ok(());
        }

        let mut current = first;
        let mut released = 0u32;

        while is_cluster_used(current) {
            self.read_sector(context, self.geometry.table_sector + cell_sector(current))?;

            let next = context.cell(current);
            context.set_cell(current, 0);

            if cell_sector(current) != cell_sector(next) {
                self.update_table(context, cell_sector(current))?;
            }

            released += 1;
            trace!("fat32: released cluster {current}");
            current = next & 0x0FFF_FFFF;
        }

        self.read_sector(context, self.geometry.info_sector)?;
        let info = InfoSector::mut_from_bytes(&mut context.buffer).unwrap();
        info.free_clusters
            .set(info.free_clusters.get().wrapping_add(released));
        self.write_sector(context, self.geometry.info_sector)
    }

    /// Zeroes every sector of a data cluster.
    pub(crate) fn clear_cluster(&self, context: &mut CommandContext, cluster: u32) -> Result<()> {
        let first = self.geometry.sector_of_cluster(cluster);

        context.buffer.fill(0);
        for sector in (first..first + self.geometry.sectors_per_cluster()).rev() {
            self.write_sector(context, sector)?;
        }

        Ok(())
    }

    /// Copies the buffered table sector to the same offset in every table
    /// copy, leaving all copies byte-identical.
    pub(crate) fn update_table(&self, context: &mut CommandContext, offset: u32) -> Result<()> {
        for copy in 0..self.geometry.table_count {
            self.write_sector(
                context,
                self.geometry.table_sector + self.geometry.table_size * copy + offset,
            )?;
        }

        Ok(())
    }

    /// Counts free cells by walking every table copy. Fails `Inconsistent`
    /// when the copies disagree.
    pub fn count_free_clusters(&self) -> Result<u32> {
        let mut context = self.contexts.acquire()?;
        let result = self.count_free_inner(&mut context);
        self.contexts.release(context);
        result
    }

    fn count_free_inner(&self, context: &mut CommandContext) -> Result<u32> {
        let mut counts = [0u32; 2];

        for copy in 0..self.geometry.table_count {
            let base = self.geometry.table_sector + self.geometry.table_size * copy;

            for cluster in CLUSTER_OFFSET..self.geometry.cluster_count {
                self.read_sector(context, base + cell_sector(cluster))?;
                if is_cluster_free(context.cell(cluster)) {
                    counts[copy as usize] += 1;
                }
            }
        }

        if self.geometry.table_count > 1 && counts[0] != counts[1] {
            warn!(
                "fat32: table copies disagree, {} free against {}",
                counts[0], counts[1]
            );
            return Err(Error::Inconsistent);
        }

        Ok(counts[0])
    }
}
