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

mod common;

use keel_fs::{path, Attribute, Error, FileSystem};

use crate::common::{ALIG_FILE_SIZE, SECTOR_SIZE, UNALIG_FILE_SIZE};

#[test]
fn aligned_file_round_trips() {
    common::init_logging();
    let fs = common::make_default_fs();

    common::make_file(&fs, "/HOME/ROOT", "ALIG.TXT", &[]);
    common::write_pattern(&fs, "/HOME/ROOT/ALIG.TXT", ALIG_FILE_SIZE, SECTOR_SIZE);
    common::verify_pattern(&fs, "/HOME/ROOT/ALIG.TXT", ALIG_FILE_SIZE, SECTOR_SIZE);

    // The whole file in one aligned run.
    let node = path::open(&fs, "/HOME/ROOT/ALIG.TXT").unwrap();
    let mut buffer = vec![0; ALIG_FILE_SIZE];
    assert_eq!(
        fs.read(&node, Attribute::Data, 0, &mut buffer).unwrap(),
        ALIG_FILE_SIZE
    );
    for (index, chunk) in buffer.chunks(SECTOR_SIZE).enumerate() {
        assert_eq!(chunk, vec![index as u8; SECTOR_SIZE], "sector {index}");
    }
    fs.free(node);
}

#[test]
fn unaligned_file_round_trips() {
    let fs = common::make_default_fs();

    common::make_file(&fs, "/HOME/ROOT", "UNALIG.TXT", &[]);
    common::write_pattern(&fs, "/HOME/ROOT/UNALIG.TXT", UNALIG_FILE_SIZE, 384);
    common::verify_pattern(&fs, "/HOME/ROOT/UNALIG.TXT", UNALIG_FILE_SIZE, 384);
}

#[test]
fn reads_clamp_to_the_file_size() {
    let fs = common::make_default_fs();
    common::make_file(&fs, "/HOME/USER", "EDGE.TXT", &[0x5A; 100]);

    let node = path::open(&fs, "/HOME/USER/EDGE.TXT").unwrap();
    let mut buffer = [0u8; 64];

    // Reads stop at the end of the file.
    assert_eq!(fs.read(&node, Attribute::Data, 60, &mut buffer).unwrap(), 40);
    assert_eq!(&buffer[..40], &[0x5A; 40]);

    // At the end: zero bytes; past the end: a malformed position.
    assert_eq!(fs.read(&node, Attribute::Data, 100, &mut buffer).unwrap(), 0);
    assert_eq!(
        fs.read(&node, Attribute::Data, 101, &mut buffer),
        Err(Error::BadValue)
    );

    // Zero-length transfers succeed without touching the device.
    assert_eq!(fs.read(&node, Attribute::Data, 50, &mut []).unwrap(), 0);

    fs.free(node);
}

#[test]
fn sparse_reads_seek_both_ways() {
    let fs = common::make_default_fs();

    common::make_file(&fs, "/HOME/USER", "SEEK.BIN", &[]);
    common::write_pattern(&fs, "/HOME/USER/SEEK.BIN", ALIG_FILE_SIZE, SECTOR_SIZE);

    let node = path::open(&fs, "/HOME/USER/SEEK.BIN").unwrap();
    let mut byte = [0u8; 1];

    // Forward beyond the cached cluster, then back before it.
    fs.read(&node, Attribute::Data, (ALIG_FILE_SIZE - 1) as u64, &mut byte)
        .unwrap();
    assert_eq!(byte[0], (ALIG_FILE_SIZE / SECTOR_SIZE - 1) as u8);

    fs.read(&node, Attribute::Data, 0, &mut byte).unwrap();
    assert_eq!(byte[0], 0);

    // An unaligned straddling read.
    let mut buffer = [0u8; SECTOR_SIZE];
    fs.read(&node, Attribute::Data, (SECTOR_SIZE / 2) as u64, &mut buffer)
        .unwrap();
    assert_eq!(&buffer[..SECTOR_SIZE / 2], &[0; SECTOR_SIZE / 2]);
    assert_eq!(&buffer[SECTOR_SIZE / 2..], &[1; SECTOR_SIZE / 2]);

    fs.free(node);
}

#[test]
fn data_stream_of_a_directory_is_rejected() {
    let fs = common::make_default_fs();

    let node = path::open(&fs, "/HOME").unwrap();
    let mut buffer = [0u8; 16];
    assert_eq!(
        fs.read(&node, Attribute::Data, 0, &mut buffer),
        Err(Error::Invalid)
    );
    assert_eq!(fs.length(&node, Attribute::Data), Err(Error::Invalid));
    fs.free(node);
}
