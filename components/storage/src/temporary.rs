// Copyright 2020 The Trilith Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use crate::{Change, Database, Patch, Result, Snapshot};

type MemoryDB = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory database for tests and experimentation. Not designed to operate
/// under production load.
#[derive(Debug, Clone, Default)]
pub struct TemporaryDB {
    inner: Arc<RwLock<MemoryDB>>,
}

#[derive(Debug)]
struct TemporarySnapshot {
    data: MemoryDB,
}

impl TemporaryDB {
    /// Creates a new, empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the contents of the database.
    pub fn clear(&self) {
        self.inner
            .write()
            .expect("TemporaryDB lock poisoned")
            .clear();
    }
}

impl Database for TemporaryDB {
    fn snapshot(&self) -> Box<dyn Snapshot> {
        let data = self
            .inner
            .read()
            .expect("TemporaryDB lock poisoned")
            .clone();
        Box::new(TemporarySnapshot { data })
    }

    fn merge(&self, patch: Patch) -> Result<()> {
        let mut guard = self.inner.write().expect("TemporaryDB lock poisoned");
        for (index, key, change) in patch.iter() {
            let map = guard.entry(index.to_owned()).or_insert_with(BTreeMap::new);
            match change {
                Change::Put(value) => {
                    map.insert(key.to_vec(), value.clone());
                }
                Change::Delete => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }
}

impl Snapshot for TemporarySnapshot {
    fn get(&self, index: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(index)?.get(key).cloned()
    }
}
