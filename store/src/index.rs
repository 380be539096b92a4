//! Incremental indexer (component H, §4.H): for one `(source, indexBy)`
//! pair, consumes source update events, diffs old-vs-new key sets, emits
//! put/delete operations on the index table, persists indexing progress,
//! and republishes updates to downstream consumers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::class::EntityClass;
use crate::codec::{composite_prefix_lower_bound, composite_prefix_upper_bound, decode_composite, decode_ordered, encode_composite, encode_ordered, OrderedValue};
use crate::context::Context;
use crate::engine::{entity_range, BatchOp, KvEngine, KeyRange, Table, WATERMARK_KEY};
use crate::entity::{EntityId, Version};
use crate::error::{CResult, Error};
use crate::event::{Event, EventBus, EventKind, Listener};

pub type IndexByFn = dyn Fn(&Value) -> Vec<(OrderedValue, Value)> + Send + Sync;

const MAX_CONCURRENCY: usize = 15;
const NICE_MS: u64 = 150;

fn ordered_to_entity_id(value: &OrderedValue) -> EntityId {
    match value {
        OrderedValue::Int(n) => EntityId::Num(*n as u64),
        OrderedValue::Str(s) => EntityId::Str(s.clone()),
    }
}

struct IndexRequest {
    previous_state: Option<Value>,
    deleted: bool,
    sources: HashSet<EntityId>,
    version: Version,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<EntityId>,
    requests: HashMap<EntityId, IndexRequest>,
    pending_ops: Vec<BatchOp>,
    updated_index_entries: HashMap<OrderedValue, HashSet<EntityId>>,
    queued_indexed_progress: Option<Version>,
}

/// One index: a derived class whose rows are `(index_key, source_id) ->
/// value`, kept incrementally consistent with `source` via `index_by`.
pub struct Index {
    name: String,
    table: Arc<dyn Table>,
    source: Arc<dyn EntityClass>,
    index_by: Arc<IndexByFn>,
    events: EventBus,
    state: Mutex<QueueState>,
    last_indexed_version: AtomicU64,
    cancel_indexing: AtomicBool,
    processing: tokio::sync::Mutex<()>,
    self_ref: OnceLock<Weak<Index>>,
}

impl Index {
    /// Builds a fresh index bound to `source`, then resumes from whatever
    /// progress was last persisted (a full build, if none was).
    pub async fn build(
        engine: &dyn KvEngine,
        name: impl Into<String>,
        source: Arc<dyn EntityClass>,
        index_by: Arc<IndexByFn>,
    ) -> CResult<Arc<Index>> {
        let name = name.into();
        let table = engine.open(&name).await?;
        let index = Arc::new(Index {
            name,
            table,
            source: source.clone(),
            index_by,
            events: EventBus::new(),
            state: Mutex::new(QueueState::default()),
            last_indexed_version: AtomicU64::new(0),
            cancel_indexing: AtomicBool::new(false),
            processing: tokio::sync::Mutex::new(()),
            self_ref: OnceLock::new(),
        });
        let _ = index.self_ref.set(Arc::downgrade(&index));

        source.events().notifies(index.clone() as Arc<dyn Listener>).await;
        index.resume().await?;
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn last_indexed_version(&self) -> Version {
        self.last_indexed_version.load(Ordering::SeqCst)
    }

    fn enqueue(&self, id: EntityId, version: Version, previous_state: Option<Value>, deleted: bool, contributor: EntityId) -> bool {
        let mut state = self.state.lock().unwrap();
        let is_new = !state.requests.contains_key(&id);
        let request = state.requests.entry(id.clone()).or_insert_with(|| IndexRequest {
            previous_state: None,
            deleted: false,
            sources: HashSet::new(),
            version,
        });
        request.version = version;
        request.deleted = request.deleted || deleted;
        request.sources.insert(contributor);
        if is_new {
            request.previous_state = previous_state;
            state.queue.push_back(id);
        }
        is_new
    }

    fn spawn_processing_after_niceness(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(NICE_MS)).await;
            this.process_queue().await;
        });
    }

    /// Drains the queue, indexing up to [`MAX_CONCURRENCY`] entries at a
    /// time and committing after every `2 * MAX_CONCURRENCY` entries, until
    /// empty or cancelled. Waits for any already-running pass rather than
    /// skipping when one is in flight, so a caller with its own freshly
    /// enqueued ids (e.g. `resume`) is guaranteed a drain that sees them,
    /// even if the previous pass was mid-exit when this one was enqueued.
    pub async fn process_queue(self: &Arc<Self>) {
        let _guard = self.processing.lock().await;
        loop {
            let ids = self.drain_up_to(2 * MAX_CONCURRENCY);
            if ids.is_empty() {
                break;
            }

            let this = self.clone();
            stream::iter(ids.into_iter().map(move |id| {
                let this = this.clone();
                async move {
                    if let Err(error) = this.index_one(&id).await {
                        log::error!("index {} failed on {id}, skipping: {error}", this.name);
                    }
                }
            }))
            .buffer_unordered(MAX_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;

            self.commit_operations().await;

            if self.cancel_indexing.swap(false, Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(NICE_MS)).await;
        }
        self.commit_operations().await;
        self.write_last_indexed_version().await;
    }

    fn drain_up_to(&self, n: usize) -> Vec<EntityId> {
        let mut state = self.state.lock().unwrap();
        let take = n.min(state.queue.len());
        state.queue.drain(..take).collect()
    }

    async fn index_one(&self, id: &EntityId) -> CResult<()> {
        let request = {
            let mut state = self.state.lock().unwrap();
            state.requests.remove(id)
        };
        let Some(request) = request else { return Ok(()) };

        let mut to_remove: HashMap<Vec<u8>, String> = match &request.previous_state {
            Some(previous) => (self.index_by)(previous)
                .into_iter()
                .map(|(key, value)| (encode_ordered(&key), serde_json::to_string(&value).unwrap_or_default()))
                .collect(),
            None => HashMap::new(),
        };

        let mut ops = Vec::new();
        let mut touched = Vec::new();

        if !request.deleted {
            let ctx = Context::new();
            let current = match self.source.value_of(id, &ctx).await {
                Ok(v) => v,
                Err(first_error) => {
                    log::warn!("index {} retrying source load for {id} after error: {first_error}", self.name);
                    self.source.value_of(id, &ctx).await.map_err(|e| Error::IndexOfOne(e.to_string()))?
                }
            };

            if let Some(value) = current {
                for (key, entry_value) in (self.index_by)(&value) {
                    let encoded_key = encode_ordered(&key);
                    let value_json = serde_json::to_string(&entry_value)?;
                    if to_remove.get(&encoded_key) == Some(&value_json) {
                        to_remove.remove(&encoded_key);
                        continue;
                    }
                    to_remove.remove(&encoded_key);
                    ops.push(BatchOp::Put { key: encode_composite(&key, &id.to_ordered()), value: value_json.into_bytes() });
                    touched.push(key);
                }
            }
        }

        for encoded_key in to_remove.into_keys() {
            let key = decode_ordered(&encoded_key)?;
            ops.push(BatchOp::Delete { key: encode_composite(&key, &id.to_ordered()) });
            touched.push(key);
        }

        let mut state = self.state.lock().unwrap();
        state.pending_ops.append(&mut ops);
        for key in touched {
            state.updated_index_entries.entry(key).or_default().extend(request.sources.iter().cloned());
        }
        drop(state);
        self.last_indexed_version.fetch_max(request.version, Ordering::SeqCst);
        Ok(())
    }

    /// Flushes whatever puts/deletes accumulated from the last pass of
    /// `index_one` calls, then republishes *replaced* events for every
    /// index key they touched.
    async fn commit_operations(&self) {
        let next_progress = {
            let state = self.state.lock().unwrap();
            state.queue.front().and_then(|next_id| state.requests.get(next_id)).map(|r| r.version.saturating_sub(1))
        };
        let progress_candidate = next_progress.map(|p| p.min(self.last_indexed_version())).unwrap_or_else(|| self.last_indexed_version());

        let (ops, updated, previous_progress) = {
            let mut state = self.state.lock().unwrap();
            if state.pending_ops.is_empty() {
                state.queued_indexed_progress = Some(progress_candidate);
                return;
            }
            (std::mem::take(&mut state.pending_ops), std::mem::take(&mut state.updated_index_entries), state.queued_indexed_progress.take())
        };

        let mut batch_ops = ops;
        if let Some(progress) = previous_progress {
            batch_ops.push(BatchOp::Put { key: WATERMARK_KEY.to_vec(), value: progress.to_string().into_bytes() });
        }

        if let Err(error) = self.table.batch(batch_ops).await {
            log::error!("index {} commit failed: {error}", self.name);
            return;
        }

        let version = self.last_indexed_version();
        for (key, sources) in updated {
            let id = ordered_to_entity_id(&key);
            let event = Event::new(EventKind::Replaced, self.name.clone(), id, version);
            let event = Event { sources, ..event };
            self.events.publish(event).await;
        }

        self.state.lock().unwrap().queued_indexed_progress = Some(progress_candidate);
    }

    async fn write_last_indexed_version(&self) {
        let version = self.last_indexed_version();
        if let Err(error) = self.table.put(&WATERMARK_KEY, version.to_string().into_bytes()).await {
            log::error!("index {} failed to persist watermark: {error}", self.name);
        }
    }

    /// Reads the persisted watermark and either starts a full build (if
    /// none was recorded) or requests every source id updated since, after
    /// first dropping any stale rows for those ids.
    pub async fn resume(self: &Arc<Self>) -> CResult<()> {
        let watermark = match self.table.get(&WATERMARK_KEY).await? {
            Some(bytes) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse::<Version>().ok()).unwrap_or(0),
            None => 0,
        };

        if watermark == 0 {
            self.table.clear().await?;
        } else {
            self.last_indexed_version.store(watermark, Ordering::SeqCst);
            let catch_up = self.source.get_instance_ids_and_versions_since(watermark).await?;
            for (id, _) in &catch_up {
                self.delete_rows_for_source_id(id).await?;
            }
            for (id, version) in catch_up {
                self.enqueue(id.clone(), version, None, false, id);
            }
        }

        self.process_queue().await;
        Ok(())
    }

    /// Clears the index table and rebuilds it from scratch.
    pub async fn rebuild(self: &Arc<Self>) -> CResult<()> {
        self.cancel_indexing.store(true, Ordering::SeqCst);
        self.table.clear().await?;
        self.last_indexed_version.store(0, Ordering::SeqCst);
        self.cancel_indexing.store(false, Ordering::SeqCst);
        self.resume().await
    }

    async fn delete_rows_for_source_id(&self, id: &EntityId) -> CResult<()> {
        let rows = self.table.iterate(entity_range()).await?;
        let target = id.to_ordered();
        let dels: Vec<BatchOp> = rows
            .into_iter()
            .filter_map(|(key, _)| match decode_composite(&key) {
                Ok((_, source_id)) if source_id == target => Some(BatchOp::Delete { key }),
                _ => None,
            })
            .collect();
        if !dels.is_empty() {
            self.table.batch(dels).await?;
        }
        Ok(())
    }

    /// All `{id, value}` entries stored under `key`, in source-id order.
    pub async fn values_for_key(&self, key: OrderedValue) -> CResult<Vec<(EntityId, Value)>> {
        self.table.wait_for_all_writes().await?;
        let range: KeyRange = (Bound::Included(composite_prefix_lower_bound(&key)), Bound::Excluded(composite_prefix_upper_bound(&key)));
        let rows = self.table.iterate(range).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (raw_key, raw_value) in rows {
            let (_, source_id) = decode_composite(&raw_key)?;
            let value: Value = serde_json::from_slice(&raw_value)?;
            out.push((ordered_to_entity_id(&source_id), value));
        }
        Ok(out)
    }

    /// Every distinct index key currently present, in order.
    pub async fn instance_ids(&self) -> CResult<Vec<OrderedValue>> {
        self.table.wait_for_all_writes().await?;
        let rows = self.table.iterate(entity_range()).await?;
        let mut out: Vec<OrderedValue> = Vec::new();
        for (raw_key, _) in rows {
            let (key, _) = decode_composite(&raw_key)?;
            if out.last() != Some(&key) {
                out.push(key);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Listener for Index {
    async fn on_event(&self, event: Event) {
        // A `no_reset` event is a resetCache bookkeeping notification, not a
        // real value change (§4.D update protocol step 4) — indexing off it
        // would derive entries from a transiently-invalidated, not actually
        // changed, source value.
        if event.no_reset {
            return;
        }
        let is_new = self.enqueue(
            event.id.clone(),
            event.version,
            event.previous_value.clone(),
            matches!(event.kind, EventKind::Deleted),
            event.id.clone(),
        );
        if is_new {
            if let Some(this) = self.self_ref.get().and_then(Weak::upgrade) {
                this.spawn_processing_after_niceness();
            }
        }
    }
}

#[async_trait]
impl EntityClass for Index {
    fn name(&self) -> &str {
        &self.name
    }

    fn last_version(&self) -> Version {
        self.last_indexed_version()
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    /// Each index key is treated as an id by downstream consumers; the
    /// "value" is the list of `{id, value}` pairs currently stored under it.
    async fn value_of(&self, id: &EntityId, _ctx: &Context) -> CResult<Option<Value>> {
        let key = id.to_ordered();
        let entries = self.values_for_key(key).await?;
        Ok(Some(serde_json::to_value(
            entries.into_iter().map(|(id, value)| serde_json::json!({"id": id.to_string(), "value": value})).collect::<Vec<_>>(),
        )?))
    }

    /// Conservative: since index rows don't carry a per-row version, every
    /// key is reported as changed once the index has moved past `since`.
    async fn get_instance_ids_and_versions_since(&self, since: Version) -> CResult<Vec<(EntityId, Version)>> {
        if self.last_indexed_version() <= since {
            return Ok(vec![]);
        }
        let version = self.last_indexed_version();
        Ok(self.instance_ids().await?.into_iter().map(|key| (ordered_to_entity_id(&key), version)).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::class::Class;
    use crate::engine::memory::MemoryKv;
    use crate::registry::{self, SourceInfo};

    fn index_by_field(value: &Value) -> Vec<(OrderedValue, Value)> {
        match value.get("a") {
            Some(Value::String(s)) => vec![(OrderedValue::Str(s.clone()), Value::Null)],
            _ => vec![],
        }
    }

    #[tokio::test]
    async fn indexes_and_reindexes_on_updates() {
        registry::release_class_name("idx-foo");
        let engine = MemoryKv::new();
        let foo = Class::register(&engine, "idx-foo", SourceInfo::Explicit("1".into()), vec![], true, false).await.unwrap();

        let h1 = foo.get_by_id(EntityId::num(1));
        foo.set_value(&h1, serde_json::json!({"a": "x"})).await.unwrap().wait().await;
        let h2 = foo.get_by_id(EntityId::num(2));
        foo.set_value(&h2, serde_json::json!({"a": "x"})).await.unwrap().wait().await;
        let h3 = foo.get_by_id(EntityId::num(3));
        foo.set_value(&h3, serde_json::json!({"a": "y"})).await.unwrap().wait().await;

        let index = Index::build(&engine, "idx-foo-by-a", foo.clone(), Arc::new(index_by_field)).await.unwrap();
        index.process_queue().await;

        let x = index.values_for_key(OrderedValue::Str("x".into())).await.unwrap();
        let mut x_ids: Vec<_> = x.into_iter().map(|(id, _)| id).collect();
        x_ids.sort();
        assert_eq!(x_ids, vec![EntityId::num(1), EntityId::num(2)]);

        let y = index.values_for_key(OrderedValue::Str("y".into())).await.unwrap();
        assert_eq!(y.into_iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![EntityId::num(3)]);

        foo.set_value(&h1, serde_json::json!({"a": "y"})).await.unwrap().wait().await;
        index.process_queue().await;

        let x = index.values_for_key(OrderedValue::Str("x".into())).await.unwrap();
        assert_eq!(x.into_iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![EntityId::num(2)]);

        let mut y = index.values_for_key(OrderedValue::Str("y".into())).await.unwrap();
        y.sort_by_key(|(id, _)| id.clone());
        assert_eq!(y.into_iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![EntityId::num(1), EntityId::num(3)]);
    }

    #[tokio::test]
    async fn process_queue_waits_for_an_in_flight_pass_instead_of_skipping() {
        registry::release_class_name("idx-wait");
        let engine = MemoryKv::new();
        let foo = Class::register(&engine, "idx-wait", SourceInfo::Explicit("1".into()), vec![], true, false).await.unwrap();
        let h1 = foo.get_by_id(EntityId::num(1));
        foo.set_value(&h1, serde_json::json!({"a": "x"})).await.unwrap().wait().await;

        let index = Index::build(&engine, "idx-wait-by-a", foo.clone(), Arc::new(index_by_field)).await.unwrap();

        // Simulate a pass already in flight by holding the reentrancy lock
        // directly, the way a real call already inside `process_queue`'s
        // loop would.
        let guard = index.processing.lock().await;

        let h2 = foo.get_by_id(EntityId::num(2));
        foo.set_value(&h2, serde_json::json!({"a": "x"})).await.unwrap().wait().await;

        let index_for_task = index.clone();
        let handle = tokio::spawn(async move { index_for_task.process_queue().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "process_queue must wait for the lock, not skip its own work");

        drop(guard);
        handle.await.unwrap();

        let x = index.values_for_key(OrderedValue::Str("x".into())).await.unwrap();
        let mut x_ids: Vec<_> = x.into_iter().map(|(id, _)| id).collect();
        x_ids.sort();
        assert_eq!(x_ids, vec![EntityId::num(1), EntityId::num(2)]);
    }
}
