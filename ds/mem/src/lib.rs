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

use std::{
    ops::Range,
    sync::{Arc, Mutex},
};

use keel_ds::{Error, Result, Storage};
use log::warn;

/// RAM-backed storage with byte-range fault injection.
///
/// The handle is cheap to clone; every clone refers to the same volume, so a
/// test can keep one clone for fault injection and inspection while the
/// filesystem under test owns another.
#[derive(Clone)]
pub struct MemStorage {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    data: Vec<u8>,
    denied: Vec<Region>,
}

struct Region {
    range: Range<u64>,
    deny_read: bool,
    deny_write: bool,
}

impl MemStorage {
    /// Zero-filled volume of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: vec![0; size],
                denied: Vec::new(),
            })),
        }
    }

    /// Marks a byte range so that matching transfers fail. A read fails when
    /// `deny_read` is set, a write when `deny_write` is set; the failing
    /// transfer has no partial effect.
    pub fn deny(&self, range: Range<u64>, deny_read: bool, deny_write: bool) {
        self.inner.lock().unwrap().denied.push(Region {
            range,
            deny_read,
            deny_write,
        });
    }

    /// Removes every fault region overlapping `range`.
    pub fn allow(&self, range: Range<u64>) {
        self.inner
            .lock()
            .unwrap()
            .denied
            .retain(|region| region.range.end <= range.start || region.range.start >= range.end);
    }

    /// Copy of the raw volume contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn check(&self, position: u64, length: usize, write: bool) -> Result<()> {
        let end = position + length as u64;
        if end > self.data.len() as u64 {
            warn!("mem: transfer beyond device end, position {position}, length {length}");
            return Err(Error::Transport);
        }
        for region in &self.denied {
            let overlaps = position < region.range.end && end > region.range.start;
            if overlaps && (if write { region.deny_write } else { region.deny_read }) {
                return Err(Error::Transport);
            }
        }
        Ok(())
    }
}

impl Storage for MemStorage {
    fn read(&self, position: u64, buffer: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.check(position, buffer.len(), false)?;
        let offset = position as usize;
        buffer.copy_from_slice(&inner.data[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write(&self, position: u64, buffer: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(position, buffer.len(), true)?;
        let offset = position as usize;
        inner.data[offset..offset + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }

    fn capacity(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().data.len() as u64)
    }
}
