//! A pure in-memory engine, storing each table as a `BTreeMap` guarded by a
//! `std::sync::Mutex`. Used by the test suite and by any caller that does
//! not need durability across restarts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::engine::{BatchOp, KeyRange, KvEngine, Status, Table};
use crate::error::CResult;

#[derive(Default)]
pub struct MemoryKv {
    tables: Mutex<BTreeMap<String, Arc<MemoryTable>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvEngine for MemoryKv {
    async fn open(&self, name: &str) -> CResult<Arc<dyn Table>> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(name.to_string()).or_insert_with(|| Arc::new(MemoryTable::new(name))).clone();
        Ok(table)
    }
}

pub struct MemoryTable {
    name: String,
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryTable {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), data: Mutex::new(BTreeMap::new()) }
    }
}

#[async_trait]
impl Table for MemoryTable {
    async fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> CResult<()> {
        let mut data = self.data.lock().unwrap();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn iterate(&self, range: KeyRange) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.lock().unwrap();
        Ok(data.range(range).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn clear(&self) -> CResult<()> {
        self.data.lock().unwrap().clear();
        Ok(())
    }

    async fn wait_for_all_writes(&self) -> CResult<()> {
        Ok(())
    }

    async fn status(&self) -> CResult<Status> {
        let data = self.data.lock().unwrap();
        let size = data.iter().fold(0u64, |n, (k, v)| n + k.len() as u64 + v.len() as u64);
        Ok(Status { name: self.name.clone(), keys: data.len() as u64, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Bound;

    #[tokio::test]
    async fn point_ops_and_scan() {
        let engine = MemoryKv::new();
        let table = engine.open("widgets").await.unwrap();
        table.put(b"b", vec![2]).await.unwrap();
        table.put(b"a", vec![1]).await.unwrap();
        assert_eq!(table.get(b"a").await.unwrap(), Some(vec![1]));
        table.remove(b"a").await.unwrap();
        assert_eq!(table.get(b"a").await.unwrap(), None);

        let all = table.iterate((Bound::Unbounded, Bound::Unbounded)).await.unwrap();
        assert_eq!(all, vec![(b"b".to_vec(), vec![2])]);
    }

    #[tokio::test]
    async fn open_is_idempotent_per_name() {
        let engine = MemoryKv::new();
        let a = engine.open("same").await.unwrap();
        a.put(b"k", vec![1]).await.unwrap();
        let b = engine.open("same").await.unwrap();
        assert_eq!(b.get(b"k").await.unwrap(), Some(vec![1]));
    }
}
