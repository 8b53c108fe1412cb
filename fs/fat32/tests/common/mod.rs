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

#![allow(dead_code)]

use keel_ds_mem::MemStorage;
use keel_fs::{path, Attribute, FileSystem, NodeConfig, Result};
use keel_fs_fat32::{format, Fat32Config, Fat32Fs, FormatConfig};

pub const SECTOR_SIZE: usize = 512;
pub const CLUSTER_SIZE: usize = 2 * SECTOR_SIZE;
pub const TABLE_COUNT: u8 = 2;
pub const TOTAL_SIZE: usize = 16 * 1024 * 1024;

/// January 1, 2020, 12:00:00 UTC in microseconds.
pub const INITIAL_TIME: i64 = 1_577_880_000_000_000;

pub const ALIG_FILE_SIZE: usize = CLUSTER_SIZE * 4;
pub const UNALIG_FILE_SIZE: usize = CLUSTER_SIZE * 8 / 3;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Zero-filled volume of `size` bytes carrying an empty filesystem.
pub fn make_storage(size: usize) -> MemStorage {
    let storage = MemStorage::new(size);
    format(
        &storage,
        &FormatConfig {
            cluster_size: CLUSTER_SIZE as u32,
            table_count: TABLE_COUNT,
            label: "TEST",
        },
    )
    .unwrap();
    storage
}

pub fn mount(storage: MemStorage) -> Fat32Fs<MemStorage> {
    mount_sized(storage, 16, 4)
}

pub fn mount_sized(storage: MemStorage, nodes: usize, contexts: usize) -> Fat32Fs<MemStorage> {
    Fat32Fs::mount(storage, &Fat32Config { nodes, contexts }).unwrap()
}

/// The canonical test tree on a fresh 16 MiB volume:
/// `/BOOT /HOME /HOME/ROOT /HOME/USER /LIB /SYS`.
pub fn make_default_fs() -> Fat32Fs<MemStorage> {
    let fs = mount(make_storage(TOTAL_SIZE));

    for name in ["BOOT", "HOME", "LIB", "SYS"] {
        make_directory(&fs, "/", name);
    }
    make_directory(&fs, "/HOME", "ROOT");
    make_directory(&fs, "/HOME", "USER");

    fs
}

pub fn make_directory(fs: &Fat32Fs<MemStorage>, parent: &str, name: &str) {
    let parent = path::open(fs, parent).unwrap();
    let mut config = NodeConfig::directory(name);
    config.time = INITIAL_TIME;
    fs.create(&parent, &config).unwrap();
    fs.free(parent);
}

pub fn make_file(fs: &Fat32Fs<MemStorage>, parent: &str, name: &str, payload: &[u8]) {
    try_make_file(fs, parent, name, payload).unwrap();
}

pub fn try_make_file(
    fs: &Fat32Fs<MemStorage>,
    parent: &str,
    name: &str,
    payload: &[u8],
) -> Result<()> {
    let parent = path::open(fs, parent).unwrap();
    let mut config = NodeConfig::file(name, payload);
    config.time = INITIAL_TIME;
    let result = fs.create(&parent, &config);
    fs.free(parent);
    result
}

/// Fills a file with `length` bytes, written in `chunk`-sized pieces where
/// piece `i` carries the byte value `i`.
pub fn write_pattern(fs: &Fat32Fs<MemStorage>, file: &str, length: usize, chunk: usize) {
    let node = path::open(fs, file).unwrap();
    let mut position = 0;

    let mut iteration = 0u8;
    while position < length {
        let piece = chunk.min(length - position);
        let buffer = vec![iteration; piece];
        let written = fs
            .write(&node, Attribute::Data, position as u64, &buffer)
            .unwrap();
        assert_eq!(written, piece);

        position += piece;
        iteration = iteration.wrapping_add(1);
    }

    assert_eq!(
        fs.length(&node, Attribute::Data).unwrap(),
        length as u64
    );
    fs.free(node);
}

/// Reads a file back in `chunk`-sized pieces and checks the pattern written
/// by [`write_pattern`].
pub fn verify_pattern(fs: &Fat32Fs<MemStorage>, file: &str, length: usize, chunk: usize) {
    let node = path::open(fs, file).unwrap();
    assert_eq!(fs.length(&node, Attribute::Data).unwrap(), length as u64);

    let mut position = 0;
    let mut iteration = 0u8;
    while position < length {
        let piece = chunk.min(length - position);
        let mut buffer = vec![0; piece];
        let read = fs
            .read(&node, Attribute::Data, position as u64, &mut buffer)
            .unwrap();
        assert_eq!(read, piece);
        assert_eq!(buffer, vec![iteration; piece], "piece {iteration} differs");

        position += piece;
        iteration = iteration.wrapping_add(1);
    }

    fs.free(node);
}

/// Names of every entry of a directory, in on-disk order.
pub fn list_directory(fs: &Fat32Fs<MemStorage>, directory: &str) -> Vec<String> {
    let parent = path::open(fs, directory).unwrap();
    let mut names = Vec::new();

    if let Some(node) = fs.head(&parent).unwrap() {
        loop {
            names.push(path::node_name(fs, &node).unwrap());
            if !fs.next(&node).unwrap() {
                break;
            }
        }
        fs.free(node);
    }

    fs.free(parent);
    names
}

pub fn remove_node(fs: &Fat32Fs<MemStorage>, parent: &str, node_path: &str) -> Result<()> {
    let parent = path::open(fs, parent).unwrap();
    let node = match path::open(fs, node_path) {
        Ok(node) => node,
        Err(error) => {
            fs.free(parent);
            return Err(error);
        }
    };

    let result = fs.remove(&parent, &node);
    fs.free(node);
    fs.free(parent);
    result
}
