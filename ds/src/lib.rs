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

pub use keel_err::*;

/// Block-addressable storage consumed by the filesystem engines.
///
/// Positions and lengths are in bytes. Filesystem engines only issue
/// transfers that are whole multiples of their sector size.
///
/// `acquire` and `release` bracket a group of transfers that must be atomic
/// with respect to other users of the same device. Devices sitting on a
/// shared bus override them; self-contained devices keep the no-op defaults.
/// A bracket is never held across unrelated operations.
pub trait Storage {
    fn read(&self, position: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, position: u64, buffer: &[u8]) -> Result<()>;

    /// Total device size in bytes.
    fn capacity(&self) -> Result<u64>;

    fn acquire(&self) {}

    fn release(&self) {}
}

impl<T: Storage + ?Sized> Storage for &T {
    fn read(&self, position: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read(position, buffer)
    }

    fn write(&self, position: u64, buffer: &[u8]) -> Result<()> {
        (**self).write(position, buffer)
    }

    fn capacity(&self) -> Result<u64> {
        (**self).capacity()
    }

    fn acquire(&self) {
        (**self).acquire()
    }

    fn release(&self) {
        (**self).release()
    }
}
