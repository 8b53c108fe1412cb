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

//! Volume creation: boot sector, FSInfo, mirrored tables and the root
//! directory cluster.

use keel_ds::Storage;
use keel_fs::{Error, Result};
use log::{debug, error};
use zerocopy::{FromZeros, IntoBytes};

use crate::defs::{
    BootSector, InfoSector, BOOT_SIGNATURE, CLUSTER_EOC, CLUSTER_OFFSET, INFO_SIGNATURE,
    LEAD_SIGNATURE, SECTOR_EXP, SECTOR_SIZE,
};

/// Boot sector and FSInfo live in the reserved region.
const RESERVED_SECTORS: u32 = 2;
const INFO_SECTOR: u32 = 1;
/// Cells per table sector.
const CELLS: u32 = (SECTOR_SIZE / 4) as u32;

pub struct FormatConfig<'a> {
    /// Cluster size in bytes; a power of two between one sector and 128
    /// sectors.
    pub cluster_size: u32,
    /// Allocation table copies, 1 or 2.
    pub table_count: u8,
    pub label: &'a str,
}

impl Default for FormatConfig<'_> {
    fn default() -> Self {
        Self {
            cluster_size: 4096,
            table_count: 2,
            label: "NO NAME",
        }
    }
}

/// Writes an empty FAT32 volume covering the whole device: boot sector,
/// FSInfo, `table_count` identical zeroed tables with the root cluster
/// pre-linked to the end-of-chain marker, and a cleared root directory.
pub fn format<S: Storage>(storage: &S, config: &FormatConfig<'_>) -> Result<()> {
    if config.cluster_size < SECTOR_SIZE as u32
        || config.cluster_size > (SECTOR_SIZE as u32) << 7
        || !config.cluster_size.is_power_of_two()
    {
        error!("fat32: cluster size {} is not usable", config.cluster_size);
        return Err(Error::BadValue);
    }
    if config.table_count == 0 || config.table_count > 2 {
        error!("fat32: table count {} is not usable", config.table_count);
        return Err(Error::BadValue);
    }

    let capacity = storage.capacity()?;
    let total_sectors = u32::try_from(capacity >> SECTOR_EXP).map_err(|_| Error::BadValue)?;
    let cluster_exp = (config.cluster_size >> SECTOR_EXP).ilog2();
    let table_count = u32::from(config.table_count);

    // The table must cover every data cluster; grow it until it does.
    let mut table_size = 1u32;
    let clusters = loop {
        let data_sector = RESERVED_SECTORS + table_count * table_size;
        if total_sectors <= data_sector {
            error!("fat32: device of {total_sectors} sectors is too small");
            return Err(Error::BadValue);
        }

        let clusters = (total_sectors - data_sector) >> cluster_exp;
        let needed = (clusters + CLUSTER_OFFSET).div_ceil(CELLS);
        if needed <= table_size {
            break clusters;
        }
        table_size = needed;
    };
    if clusters == 0 {
        error!("fat32: device of {total_sectors} sectors holds no clusters");
        return Err(Error::BadValue);
    }

    debug!(
        "fat32: formatting {total_sectors} sectors, {clusters} clusters, \
         {table_count} tables of {table_size} sectors"
    );

    let mut boot = BootSector::new_zeroed();
    boot.jump = [0xEB, 0x3C, 0x90];
    boot.oem_name = *b"KEEL    ";
    boot.bytes_per_sector.set(SECTOR_SIZE as u16);
    boot.sectors_per_cluster = 1u8 << cluster_exp;
    boot.reserved_sectors.set(RESERVED_SECTORS as u16);
    boot.table_count = config.table_count;
    boot.media = 0xF8;
    boot.sectors_per_track.set(63);
    boot.head_count.set(255);
    boot.total_sectors.set(total_sectors);
    boot.table_size.set(table_size);
    boot.root_cluster.set(CLUSTER_OFFSET);
    boot.info_sector.set(INFO_SECTOR as u16);
    boot.drive_number = 0x80;
    boot.extended_signature = 0x29;
    boot.serial_number.set(total_sectors ^ 0x4B45_454C);
    fill_label(&mut boot.label, config.label);
    boot.filesystem_type = *b"FAT32   ";
    boot.signature = BOOT_SIGNATURE;

    let mut info = InfoSector::new_zeroed();
    info.lead_signature.set(LEAD_SIGNATURE);
    info.info_signature.set(INFO_SIGNATURE);
    // Every cluster is free except the root directory.
    info.free_clusters.set(clusters - 1);
    info.last_allocated.set(CLUSTER_OFFSET);
    info.signature = [0, 0, BOOT_SIGNATURE[0], BOOT_SIGNATURE[1]];

    storage.acquire();
    let result = write_image(storage, &boot, &info, table_count, table_size, cluster_exp);
    storage.release();
    result
}

fn write_image<S: Storage>(
    storage: &S,
    boot: &BootSector,
    info: &InfoSector,
    table_count: u32,
    table_size: u32,
    cluster_exp: u32,
) -> Result<()> {
    storage.write(0, boot.as_bytes())?;
    storage.write(u64::from(INFO_SECTOR) << SECTOR_EXP, info.as_bytes())?;

    // Cells 0 and 1 are reserved, the root cluster ends its chain.
    let mut head = [0u8; SECTOR_SIZE];
    head[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    head[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    head[8..12].copy_from_slice(&CLUSTER_EOC.to_le_bytes());

    let zero = [0u8; SECTOR_SIZE];
    for copy in 0..table_count {
        let base = RESERVED_SECTORS + copy * table_size;
        storage.write(u64::from(base) << SECTOR_EXP, &head)?;
        for sector in 1..table_size {
            storage.write(u64::from(base + sector) << SECTOR_EXP, &zero)?;
        }
    }

    let root_sector = RESERVED_SECTORS + table_count * table_size;
    for sector in 0..1u32 << cluster_exp {
        storage.write(u64::from(root_sector + sector) << SECTOR_EXP, &zero)?;
    }

    Ok(())
}

fn fill_label(label: &mut [u8; 11], value: &str) {
    label.fill(b' ');
    for (destination, byte) in label.iter_mut().zip(value.bytes()) {
        *destination = byte.to_ascii_uppercase();
    }
}
