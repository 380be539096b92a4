//! The ordered KV engine (§6) is an external collaborator: it opens named
//! tables and supports point get, range iterate, atomic batch write and
//! clear. Everything above this module only ever talks to the [`Table`]
//! and [`KvEngine`] traits, never to a concrete engine, so the rest of the
//! store is engine-agnostic.
//!
//! Two implementations are provided: [`memory::MemoryKv`], a pure in-memory
//! engine used by the test suite, and [`disk::DiskKv`], which persists each
//! table to its own append-only log file.

pub mod disk;
pub mod log;
pub mod log_cask;
pub mod memory;

use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// The first byte reserved entity keys must meet or exceed; `[0x01, ..]` is
/// reserved for table metadata (the dbVersion record and the watermark).
pub const ENTITY_KEY_MIN: u8 = 0x02;

pub const META_KEY: [u8; 2] = [0x01, 0x01];
pub const WATERMARK_KEY: [u8; 2] = [0x01, 0x02];

/// An inclusive/exclusive byte-string range, passed to [`Table::iterate`].
pub type KeyRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// The range covering every entity row (excludes the two reserved keys).
pub fn entity_range() -> KeyRange {
    (Bound::Included(vec![ENTITY_KEY_MIN]), Bound::Unbounded)
}

#[derive(Clone, Debug)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } => key,
            BatchOp::Delete { key } => key,
        }
    }

    pub fn value_len(&self) -> usize {
        match self {
            BatchOp::Put { value, .. } => value.len(),
            BatchOp::Delete { .. } => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub keys: u64,
    pub size: u64,
}

/// A single opened table: a logically independent keyspace with its own
/// ordered key range.
#[async_trait]
pub trait Table: Send + Sync {
    async fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.batch(vec![BatchOp::Put { key: key.to_vec(), value }]).await
    }

    async fn remove(&self, key: &[u8]) -> CResult<()> {
        self.batch(vec![BatchOp::Delete { key: key.to_vec() }]).await
    }

    /// Applies every operation atomically: either all of them are durable
    /// or none are observable after a restart.
    async fn batch(&self, ops: Vec<BatchOp>) -> CResult<()>;

    /// Iterates a key range in ascending key order.
    async fn iterate(&self, range: KeyRange) -> CResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Drops every row in the table.
    async fn clear(&self) -> CResult<()>;

    /// Resolves once every write submitted so far is durable and visible
    /// to subsequent reads, including this caller's own.
    async fn wait_for_all_writes(&self) -> CResult<()>;

    async fn status(&self) -> CResult<Status>;
}

/// Opens named tables. A single engine instance backs every class in a
/// process.
#[async_trait]
pub trait KvEngine: Send + Sync {
    async fn open(&self, name: &str) -> CResult<Arc<dyn Table>>;
}
