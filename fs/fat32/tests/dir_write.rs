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

use keel_fs::{path, Attribute, Error, FileSystem, NodeConfig};

use crate::common::CLUSTER_SIZE;

#[test]
fn created_and_removed_nodes_leak_no_clusters() {
    common::init_logging();
    let fs = common::make_default_fs();
    let free = fs.count_free_clusters().unwrap();

    common::make_file(
        &fs,
        "/HOME/USER",
        "LEAK.TXT",
        &vec![0xAB; 3 * CLUSTER_SIZE],
    );
    assert_eq!(fs.count_free_clusters().unwrap(), free - 3);

    common::remove_node(&fs, "/HOME/USER", "/HOME/USER/LEAK.TXT").unwrap();
    assert_eq!(fs.count_free_clusters().unwrap(), free);

    common::make_directory(&fs, "/HOME/USER", "SUB");
    assert_eq!(fs.count_free_clusters().unwrap(), free - 1);

    common::remove_node(&fs, "/HOME/USER", "/HOME/USER/SUB").unwrap();
    assert_eq!(fs.count_free_clusters().unwrap(), free);
}

#[test]
fn non_empty_directories_are_kept() {
    let fs = common::make_default_fs();
    common::make_file(&fs, "/HOME/ROOT", "KEEP.TXT", &[]);

    assert_eq!(
        common::remove_node(&fs, "/HOME", "/HOME/ROOT"),
        Err(Error::DirectoryNotEmpty)
    );

    common::remove_node(&fs, "/HOME/ROOT", "/HOME/ROOT/KEEP.TXT").unwrap();
    common::remove_node(&fs, "/HOME", "/HOME/ROOT").unwrap();
    assert_eq!(
        path::open(&fs, "/HOME/ROOT").unwrap_err(),
        Error::EntryMissing
    );
}

#[test]
fn freed_slots_are_reused_in_place() {
    let fs = common::make_default_fs();

    for name in ["A.TXT", "B.TXT", "C.TXT"] {
        common::make_file(&fs, "/HOME/USER", name, &[]);
    }
    common::remove_node(&fs, "/HOME/USER", "/HOME/USER/B.TXT").unwrap();
    common::make_file(&fs, "/HOME/USER", "D.TXT", &[]);

    // D took the slot B left behind.
    assert_eq!(
        common::list_directory(&fs, "/HOME/USER"),
        [".", "..", "A.TXT", "D.TXT", "C.TXT"]
    );
}

#[test]
fn directories_extend_across_cluster_boundaries() {
    let fs = common::make_default_fs();
    let free = fs.count_free_clusters().unwrap();

    // 32 entries fit into one 1 KiB cluster; `.` and `..` occupy two.
    let names: Vec<String> = (0..31).map(|index| format!("F_{index:05}.TXT")).collect();
    for name in &names {
        common::make_file(&fs, "/HOME/USER", name, &[]);
    }

    let listed = common::list_directory(&fs, "/HOME/USER");
    assert_eq!(listed.len(), 2 + 31);
    assert_eq!(listed[2..], names[..]);

    // 30 entries filled the first cluster, the 31 st grew the chain.
    assert_eq!(fs.count_free_clusters().unwrap(), free - 1);

    let parent = path::open(&fs, "/HOME/USER").unwrap();
    let mut capacity = [0u8; 8];
    fs.read(&parent, Attribute::Capacity, 0, &mut capacity)
        .unwrap();
    assert_eq!(u64::from_le_bytes(capacity), 2 * CLUSTER_SIZE as u64);
    fs.free(parent);

    // Entries at the sector and cluster boundaries go away cleanly.
    for name in &names {
        common::remove_node(&fs, "/HOME/USER", &format!("/HOME/USER/{name}")).unwrap();
    }
    assert_eq!(common::list_directory(&fs, "/HOME/USER"), [".", ".."]);
}

#[test]
fn colliding_short_names_get_unique_suffixes() {
    let fs = common::make_default_fs();

    common::make_file(&fs, "/HOME/USER", "REPORT.TXT", &[]);
    common::make_file(&fs, "/HOME/USER", "REPORT.TXT", &[]);
    common::make_file(&fs, "/HOME/USER", "REPORT.TXT", &[]);

    assert_eq!(
        common::list_directory(&fs, "/HOME/USER"),
        [".", "..", "REPORT.TXT", "REPORT~1.TXT", "REPORT~2.TXT"]
    );
}

#[test]
fn suffix_space_exhausts_at_one_hundred_names() {
    let fs = common::make_default_fs();

    for _ in 0..100 {
        common::make_file(&fs, "/HOME/ROOT", "CLASH.TXT", &[]);
    }
    assert_eq!(
        common::try_make_file(&fs, "/HOME/ROOT", "CLASH.TXT", &[]),
        Err(Error::EntryExists)
    );
}

#[test]
fn creation_in_a_file_is_rejected() {
    let fs = common::make_default_fs();
    common::make_file(&fs, "/HOME/USER", "PLAIN.TXT", &[]);

    let node = path::open(&fs, "/HOME/USER/PLAIN.TXT").unwrap();
    assert_eq!(
        fs.create(&node, &NodeConfig::file("CHILD.TXT", &[])),
        Err(Error::Invalid)
    );
    fs.free(node);
}

#[test]
fn malformed_names_are_rejected() {
    let fs = common::make_default_fs();

    let root = fs.root().unwrap();
    assert_eq!(
        fs.create(&root, &NodeConfig::file("", &[])),
        Err(Error::BadValue)
    );

    let overlong = "x".repeat(256);
    assert_eq!(
        fs.create(&root, &NodeConfig::file(&overlong, &[])),
        Err(Error::BadValue)
    );
    fs.free(root);
}

#[test]
fn created_files_carry_initial_payload() {
    let fs = common::make_default_fs();
    let payload: Vec<u8> = (0..CLUSTER_SIZE + 100).map(|value| value as u8).collect();

    common::make_file(&fs, "/HOME/ROOT", "SEED.BIN", &payload);

    let node = path::open(&fs, "/HOME/ROOT/SEED.BIN").unwrap();
    let mut buffer = vec![0; payload.len()];
    assert_eq!(
        fs.read(&node, Attribute::Data, 0, &mut buffer).unwrap(),
        payload.len()
    );
    assert_eq!(buffer, payload);
    fs.free(node);
}
