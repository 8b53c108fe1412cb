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

use std::{collections::VecDeque, sync::Mutex};

use keel_fs::{Error, Result};

/// Bounded FIFO of pre-built objects.
///
/// All members are created up front so acquisition cannot allocate at
/// runtime; an empty pool reports `AllocFailed` instead of blocking. The
/// internal lock is a leaf lock, held only for the push or pop itself.
pub(crate) struct Pool<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Pool<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    pub fn acquire(&self) -> Result<T> {
        self.items
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(Error::AllocFailed)
    }

    pub fn release(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
    }
}
