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

//! Path walking on top of the [`FileSystem`] node interface.

use crate::{Attribute, Error, FileSystem, Result};

/// Opens the node at a `/`-separated absolute path.
pub fn open<F: FileSystem>(fs: &F, path: &str) -> Result<F::Node> {
    follow(fs, fs.root()?, path)
}

/// Walks a `/`-separated path starting at `root`, consuming it. Empty
/// components are ignored. Intermediate nodes are freed; the final node is
/// returned, or `EntryMissing` when any component does not exist.
pub fn follow<F: FileSystem>(fs: &F, root: F::Node, path: &str) -> Result<F::Node> {
    let mut current = root;

    for component in path.split('/').filter(|component| !component.is_empty()) {
        match lookup(fs, &current, component) {
            Ok(child) => {
                fs.free(current);
                current = child;
            }
            Err(error) => {
                fs.free(current);
                return Err(error);
            }
        }
    }

    Ok(current)
}

/// Finds a child of `parent` by name.
pub fn lookup<F: FileSystem>(fs: &F, parent: &F::Node, name: &str) -> Result<F::Node> {
    let Some(node) = fs.head(parent)? else {
        return Err(Error::EntryMissing);
    };

    loop {
        match node_name(fs, &node) {
            Ok(candidate) if candidate == name => return Ok(node),
            Ok(_) => {}
            Err(error) => {
                fs.free(node);
                return Err(error);
            }
        }

        match fs.next(&node) {
            Ok(true) => {}
            Ok(false) => {
                fs.free(node);
                return Err(Error::EntryMissing);
            }
            Err(error) => {
                fs.free(node);
                return Err(error);
            }
        }
    }
}

/// Reads the `Name` stream of a node into an owned string.
pub fn node_name<F: FileSystem>(fs: &F, node: &F::Node) -> Result<String> {
    let length = fs.length(node, Attribute::Name)? as usize;
    let mut buffer = vec![0; length];
    fs.read(node, Attribute::Name, 0, &mut buffer)?;

    // Drop the terminating NUL.
    buffer.pop();
    String::from_utf8(buffer).map_err(|_| Error::BadValue)
}
