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

use std::{sync::Arc, thread};

use keel_fs::{path, Attribute, FileSystem, NodeConfig};

use crate::common::{SECTOR_SIZE, TOTAL_SIZE};

const THREADS: usize = 4;
const FILES_PER_THREAD: usize = 16;

#[test]
fn concurrent_creation_in_sibling_directories() {
    common::init_logging();
    let fs = Arc::new(common::mount_sized(
        common::make_storage(TOTAL_SIZE),
        4 * THREADS,
        THREADS,
    ));

    for index in 0..THREADS {
        common::make_directory(&fs, "/", &format!("T{index}"));
    }
    let free = fs.count_free_clusters().unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|index| {
            let fs = fs.clone();
            thread::spawn(move || {
                for file in 0..FILES_PER_THREAD {
                    let parent = path::open(fs.as_ref(), &format!("/T{index}")).unwrap();
                    let name = format!("F_{file:05}.TXT");
                    let payload = vec![file as u8; SECTOR_SIZE];
                    fs.create(&parent, &NodeConfig::file(&name, &payload)).unwrap();
                    fs.free(parent);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Every file landed, each in one cluster, and the table copies agree.
    assert_eq!(
        fs.count_free_clusters().unwrap(),
        free - (THREADS * FILES_PER_THREAD) as u32
    );
    for index in 0..THREADS {
        let listed = common::list_directory(&fs, &format!("/T{index}"));
        assert_eq!(listed.len(), 2 + FILES_PER_THREAD);

        for file in 0..FILES_PER_THREAD {
            let node =
                path::open(fs.as_ref(), &format!("/T{index}/F_{file:05}.TXT")).unwrap();
            assert_eq!(
                fs.length(&node, Attribute::Data).unwrap(),
                SECTOR_SIZE as u64
            );
            fs.free(node);
        }
    }
}

#[test]
fn concurrent_readers_of_one_file() {
    let fs = Arc::new(common::mount_sized(
        common::make_storage(TOTAL_SIZE),
        4 * THREADS,
        THREADS,
    ));

    let payload: Vec<u8> = (0..4096).map(|value| (value % 251) as u8).collect();
    {
        let root = fs.root().unwrap();
        fs.create(&root, &NodeConfig::file("SHARED.BIN", &payload))
            .unwrap();
        fs.free(root);
    }

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = fs.clone();
            let expected = payload.clone();
            thread::spawn(move || {
                for _ in 0..8 {
                    let node = path::open(fs.as_ref(), "/SHARED.BIN").unwrap();
                    let mut buffer = vec![0; expected.len()];
                    assert_eq!(
                        fs.read(&node, Attribute::Data, 0, &mut buffer).unwrap(),
                        expected.len()
                    );
                    assert_eq!(buffer, expected);
                    fs.free(node);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn sync_runs_beside_writers() {
    let fs = Arc::new(common::mount_sized(
        common::make_storage(TOTAL_SIZE),
        4 * THREADS,
        THREADS + 1,
    ));
    common::make_directory(&fs, "/", "LOGS");

    let writer = {
        let fs = fs.clone();
        thread::spawn(move || {
            for file in 0..8 {
                let parent = path::open(fs.as_ref(), "/LOGS").unwrap();
                fs.create(&parent, &NodeConfig::file(&format!("L{file}.LOG"), &[]))
                    .unwrap();
                fs.free(parent);

                let node = path::open(fs.as_ref(), &format!("/LOGS/L{file}.LOG")).unwrap();
                fs.write(&node, Attribute::Data, 0, &[file as u8; 64]).unwrap();
                fs.free(node);
            }
        })
    };
    let syncer = {
        let fs = fs.clone();
        thread::spawn(move || {
            for _ in 0..16 {
                fs.sync().unwrap();
                thread::yield_now();
            }
        })
    };

    writer.join().unwrap();
    syncer.join().unwrap();
    fs.sync().unwrap();

    assert_eq!(common::list_directory(&fs, "/LOGS").len(), 2 + 8);
}
