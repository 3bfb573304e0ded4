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

use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteBatch};

use std::{path::Path, sync::Arc};

use crate::{Change, Database, Error, Patch, Result, Snapshot};

type Db = DBWithThreadMode<MultiThreaded>;

/// Persistent RocksDB backend. Each named index maps to a column family;
/// missing families are created lazily when a patch first touches them.
#[derive(Debug, Clone)]
pub struct RocksDB {
    db: Arc<Db>,
}

#[derive(Debug)]
struct RocksSnapshot {
    db: Arc<Db>,
}

impl RocksDB {
    /// Opens (or creates) a database at the given path, together with every
    /// column family recorded in it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let names = Db::list_cf(&options, path.as_ref()).unwrap_or_default();
        let db = if names.is_empty() {
            Db::open(&options, path.as_ref())
        } else {
            Db::open_cf(&options, path.as_ref(), names)
        }
        .map_err(|e| Error::Backend(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn ensure_cf(&self, index: &str) -> Result<()> {
        if self.db.cf_handle(index).is_none() {
            self.db
                .create_cf(index, &Options::default())
                .map_err(|e| Error::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

impl Database for RocksDB {
    fn snapshot(&self) -> Box<dyn Snapshot> {
        Box::new(RocksSnapshot {
            db: Arc::clone(&self.db),
        })
    }

    fn merge(&self, patch: Patch) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (index, key, change) in patch.iter() {
            self.ensure_cf(index)?;
            let cf = self
                .db
                .cf_handle(index)
                .ok_or_else(|| Error::Backend(format!("missing column family {}", index)))?;
            match change {
                Change::Put(value) => batch.put_cf(&cf, key, value),
                Change::Delete => batch.delete_cf(&cf, key),
            }
        }
        self.db
            .write(batch)
            .map_err(|e| Error::Backend(e.to_string()))
    }
}

impl Snapshot for RocksSnapshot {
    fn get(&self, index: &str, key: &[u8]) -> Option<Vec<u8>> {
        let cf = self.db.cf_handle(index)?;
        self.db.get_cf(&cf, key).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn merge_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = RocksDB::open(dir.path()).unwrap();
            let mut fork = db.fork();
            fork.put("accounts", vec![1], vec![42]);
            fork.put("epoch_tip", vec![0], vec![7]);
            db.merge(fork.into_patch()).unwrap();
            assert_eq!(db.snapshot().get("accounts", &[1]), Some(vec![42]));
        }

        // Column families and values survive a reopen.
        let db = RocksDB::open(dir.path()).unwrap();
        let snapshot = db.snapshot();
        assert_eq!(snapshot.get("accounts", &[1]), Some(vec![42]));
        assert_eq!(snapshot.get("epoch_tip", &[0]), Some(vec![7]));
        assert_eq!(snapshot.get("accounts", &[2]), None);
    }
}
