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

pub mod path;
pub mod unicode;

pub use keel_err::*;

bitflags::bitflags! {
    /// Access rights of a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 0x01;
        /// Write access also allows removing the node.
        const WRITE = 0x02;
    }
}

/// Attribute streams exposed by every node.
///
/// Each stream is read and written with `(stream, position, buffer)` calls.
/// `Name`, `Id` and `Capacity` are read-only; `Data` exists on files only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Symbolic name, UTF-8 with a terminating NUL.
    Name,
    /// Raw node contents with random access.
    Data,
    /// [`Access`] flag byte.
    Access,
    /// Modification time, microseconds since 1970-01-01.
    Time,
    /// Opaque 64-bit identifier, stable while the node exists on disk.
    Id,
    /// Occupied space in bytes, 64-bit.
    Capacity,
}

/// Field set consumed by [`FileSystem::create`].
pub struct NodeConfig<'a> {
    pub name: &'a str,
    pub access: Access,
    /// Microseconds since 1970-01-01.
    pub time: i64,
    /// `None` creates a directory, `Some` a file pre-filled with the given
    /// bytes.
    pub payload: Option<&'a [u8]>,
}

impl<'a> NodeConfig<'a> {
    pub fn directory(name: &'a str) -> Self {
        Self {
            name,
            access: Access::all(),
            time: 0,
            payload: None,
        }
    }

    pub fn file(name: &'a str, payload: &'a [u8]) -> Self {
        Self {
            name,
            access: Access::all(),
            time: 0,
            payload: Some(payload),
        }
    }
}

/// Hierarchical node interface served by filesystem engines.
///
/// Nodes are allocated by the engine (`root`, `head`) and returned with
/// `free`; a node that was written to is flushed by `free` when it was not
/// synced before.
pub trait FileSystem {
    type Node;

    /// The virtual root directory.
    fn root(&self) -> Result<Self::Node>;

    /// Flushes the metadata of every written but unsynced node.
    fn sync(&self) -> Result<()>;

    /// Creates a new entry inside the `parent` directory.
    fn create(&self, parent: &Self::Node, config: &NodeConfig<'_>) -> Result<()>;

    /// Removes an entry of the `parent` directory together with its payload.
    fn remove(&self, parent: &Self::Node, node: &Self::Node) -> Result<()>;

    /// First child of a directory, or `None` when the directory is empty.
    fn head(&self, parent: &Self::Node) -> Result<Option<Self::Node>>;

    /// Advances the node to its next sibling; `false` at the end of the
    /// directory.
    fn next(&self, node: &Self::Node) -> Result<bool>;

    fn read(
        &self,
        node: &Self::Node,
        attribute: Attribute,
        position: u64,
        buffer: &mut [u8],
    ) -> Result<usize>;

    fn write(
        &self,
        node: &Self::Node,
        attribute: Attribute,
        position: u64,
        buffer: &[u8],
    ) -> Result<usize>;

    /// Length of an attribute stream in bytes.
    fn length(&self, node: &Self::Node, attribute: Attribute) -> Result<u64>;

    /// Releases the node contents while keeping the entry itself.
    fn truncate(&self, node: &Self::Node) -> Result<()>;

    fn free(&self, node: Self::Node);
}
