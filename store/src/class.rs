//! Entity store (component D, §4.D) and class registration/versioning
//! (component F, §4.F). A [`Class`] binds a name to a backing [`Table`],
//! owns that class's identity map, write batcher and event bus, and
//! implements the load/store/version lifecycle every entity goes through.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::clock;
use crate::codec::{decode_ordered, OrderedValue};
use crate::context::Context;
use crate::engine::{entity_range, KvEngine, Table, META_KEY, WATERMARK_KEY};
use crate::entity::{decode_row, encode_row_invalidated, encode_row_value, EntityId, EntityState, ReadyState, RowContents, Version};
use crate::error::{CResult, Error};
use crate::event::{Event, EventBus, EventKind};
use crate::expiration::{self, CacheKey, Cacheable};
use crate::identity::{IdentityMap, Retention};
use crate::registry::{self, claim_class_name, compute_db_version, MetaRecord, SourceInfo};

/// The canonical, identity-mapped handle for one `(class, id)` pair.
pub struct EntityHandle {
    pub id: EntityId,
    class_name: String,
    state: Mutex<EntityState>,
}

impl EntityHandle {
    fn new(class_name: String, id: EntityId) -> Self {
        let state = EntityState::unloaded(id.clone(), 0);
        Self { id, class_name, state: Mutex::new(state) }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.lock().unwrap().ready_state
    }

    pub fn version(&self) -> Version {
        self.state.lock().unwrap().version
    }
}

impl Cacheable for EntityHandle {
    fn clear_cache(&self) {
        self.state.lock().unwrap().clear_cache();
    }
}

/// What [`Class::value_of`] returns: either a value (possibly absent) or a
/// sentinel meaning "unchanged since the context's `ifModifiedSince` hint".
pub enum ValueResult {
    Value(Option<Value>),
    NotModified,
}

/// Any class the store knows how to read from as an upstream source,
/// whether it is a plain [`Class`], a `Cached` transform or an `Index`.
#[async_trait]
pub trait EntityClass: Send + Sync {
    fn name(&self) -> &str;
    fn last_version(&self) -> Version;
    fn events(&self) -> &EventBus;
    async fn value_of(&self, id: &EntityId, ctx: &Context) -> CResult<Option<Value>>;
    async fn get_instance_ids_and_versions_since(&self, since: Version) -> CResult<Vec<(EntityId, Version)>>;
}

/// A named group of entities sharing a table, an identity map, a write
/// batcher and an event bus.
pub struct Class {
    name: String,
    table: Arc<dyn Table>,
    identity: IdentityMap<EntityHandle>,
    batcher: Arc<crate::batch::WriteBatcher>,
    events: EventBus,
    db_version: String,
    start_version: Version,
    track_previous_values: bool,
    sources: Vec<Arc<dyn EntityClass>>,
}

impl Class {
    /// Registers a class against `table`: claims its name, computes its
    /// `dbVersion`, compares it with what was last persisted, and clears
    /// and reseeds the table on a mismatch (§4.F). `seed_from_sources`
    /// selects the cached-transform variant of `resetAll`, which reseeds
    /// from upstream sources instead of being a no-op.
    pub async fn register(
        engine: &dyn KvEngine,
        name: impl Into<String>,
        source_info: SourceInfo,
        sources: Vec<Arc<dyn EntityClass>>,
        track_previous_values: bool,
        seed_from_sources: bool,
    ) -> CResult<Arc<Class>> {
        let name = name.into();
        claim_class_name(&name)?;
        let table = engine.open(&name).await?;
        let class_version = compute_db_version(&source_info)?;

        let stored_meta: Option<MetaRecord> = match table.get(&META_KEY).await? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };

        let needs_reset = stored_meta.as_ref().map_or(true, |meta| meta.db_version != class_version.db_version);
        let start_version = if needs_reset { clock::next_global_version() } else { stored_meta.as_ref().unwrap().start_version };
        clock::global_version_sequence().observe(start_version);

        let watermark = match table.get(&WATERMARK_KEY).await? {
            Some(bytes) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse::<Version>().ok()).unwrap_or(start_version),
            None => start_version,
        };

        let batcher = crate::batch::WriteBatcher::new(table.clone(), watermark.max(start_version));
        let class = Arc::new(Class {
            name,
            table,
            identity: IdentityMap::new(Retention::Weak),
            batcher,
            events: EventBus::new(),
            db_version: class_version.db_version,
            start_version,
            track_previous_values,
            sources: sources.clone(),
        });

        if needs_reset {
            class.reset_all(stored_meta.is_some(), seed_from_sources).await?;
            let record = MetaRecord { start_version, db_version: class.db_version.clone() };
            let bytes = serde_json::to_vec(&record)?;
            let (_, completion) = class.batcher.enqueue(META_KEY.to_vec(), Some(bytes), Some(start_version)).await;
            completion.wait().await;
        }

        // Subscribing to `sources` is the derived class's job (`Cached`,
        // `Index`): a plain `Class` never implements `Listener` itself.

        Ok(class)
    }

    async fn reset_all(self: &Arc<Self>, clear_db: bool, seed_from_sources: bool) -> CResult<()> {
        if clear_db {
            self.table.clear().await?;
        }
        if seed_from_sources {
            for source in &self.sources {
                let ids = source.get_instance_ids_and_versions_since(0).await?;
                for (id, version) in ids {
                    self.invalidate(&id, version).await?;
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_version(&self) -> &str {
        &self.db_version
    }

    pub fn start_version(&self) -> Version {
        self.start_version
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn last_version(&self) -> Version {
        self.batcher.last_version()
    }

    /// Returns the canonical live instance for `id`. Rejects ids whose
    /// string form parses as a positive integer at the call site by going
    /// through [`EntityId::parse`] before this is ever reached.
    pub fn get_by_id(self: &Arc<Self>, id: EntityId) -> Arc<EntityHandle> {
        let class_name = self.name.clone();
        self.identity.get_or_insert_with(id.clone(), move || Arc::new(EntityHandle::new(class_name, id)))
    }

    /// Bounded-concurrency batched fetch: loads each id's latest local data,
    /// at most 100 in flight, returning results in input order.
    pub async fn get_by_ids(self: &Arc<Self>, ids: Vec<EntityId>) -> Vec<CResult<Arc<EntityHandle>>> {
        use futures::stream::{self, StreamExt};
        const MAX_IN_FLIGHT: usize = 100;
        stream::iter(ids.into_iter().map(|id| {
            let this = self.clone();
            async move {
                let handle = this.get_by_id(id);
                this.load_latest_local_data(&handle).await?;
                Ok(handle)
            }
        }))
        .buffered(MAX_IN_FLIGHT)
        .collect()
        .await
    }

    /// Reads the row for `handle.id`, with one retry on a transient engine
    /// error (§7: load-failure gets one retry then log-and-continue).
    async fn read_row(&self, id: &EntityId) -> CResult<Option<Vec<u8>>> {
        let key = id.encode_key();
        if let Some(pending) = self.batcher.pending_value(&key) {
            return Ok(pending);
        }
        match self.table.get(&key).await {
            Ok(row) => Ok(row),
            Err(first_error) => {
                log::warn!("retrying load for {}/{id} after error: {first_error}", self.name);
                self.table.get(&key).await
            }
        }
    }

    pub async fn load_latest_local_data(&self, handle: &Arc<EntityHandle>) -> CResult<()> {
        {
            handle.state.lock().unwrap().ready_state = ReadyState::LoadingLocalData;
        }
        let row = self.read_row(&handle.id).await;
        let (weight, key) = {
            let mut state = handle.state.lock().unwrap();
            match row {
                Ok(Some(bytes)) => match decode_row(&bytes) {
                    Ok(RowContents::Value { version, json }) => {
                        state.version = version;
                        state.as_json = Some(json);
                        state.cached_value = None;
                        state.ready_state = ReadyState::UpToDate;
                    }
                    Ok(RowContents::Invalidated { version }) => {
                        state.version = version;
                        state.as_json = None;
                        state.cached_value = None;
                        state.ready_state = ReadyState::Invalidated;
                    }
                    Err(error) => {
                        log::error!("load failure for {}/{}: {error}", self.name, handle.id);
                        state.ready_state = ReadyState::Invalidated;
                        return Err(Error::LoadFailure(error.to_string()));
                    }
                },
                Ok(None) => {
                    state.version = clock::next_global_version();
                    state.as_json = None;
                    state.cached_value = None;
                    state.ready_state = ReadyState::NoLocalData;
                }
                Err(error) => {
                    log::error!("load failure for {}/{}: {error}", self.name, handle.id);
                    state.ready_state = ReadyState::Invalidated;
                    return Err(Error::LoadFailure(error.to_string()));
                }
            }
            (state.weight(), handle.id.clone())
        };
        expiration::global_expiration().use_entry(
            CacheKey::new(self.name.clone(), key),
            Arc::downgrade(handle) as Weak<dyn Cacheable>,
            weight,
        );
        Ok(())
    }

    fn ensure_canonical(&self, handle: &Arc<EntityHandle>) -> bool {
        match self.identity.peek(&handle.id) {
            Some(canonical) => Arc::ptr_eq(&canonical, handle),
            // Nothing live under this id right now (e.g. it was just
            // constructed and never looked up) — treat the caller's handle
            // as canonical going forward.
            None => {
                self.identity.get_or_insert_with(handle.id.clone(), || handle.clone());
                true
            }
        }
    }

    /// Writes `value` through to the backing table. Dropped with a warning
    /// if `handle` is no longer the canonical instance for its id.
    pub async fn set_value(self: &Arc<Self>, handle: &Arc<EntityHandle>, value: Value) -> CResult<crate::event::Completion> {
        if !self.ensure_canonical(handle) {
            log::warn!("dropped write to stale instance of {}/{}", self.name, handle.id);
            return Ok(crate::event::Completion::ready());
        }

        let json = serde_json::to_string(&value)?;
        let version = clock::next_global_version();
        let (was_absent, previous_json) = {
            let mut state = handle.state.lock().unwrap();
            let was_absent = matches!(state.ready_state, ReadyState::NoLocalData | ReadyState::Unloaded);
            let previous = state.as_json.clone();
            state.version = version;
            state.as_json = Some(json.clone());
            state.cached_value = Some(value);
            state.ready_state = ReadyState::UpToDate;
            (was_absent, previous)
        };

        let (recorded_version, completion) =
            self.batcher.enqueue(handle.id.encode_key(), Some(encode_row_value(version, &json)), Some(version)).await;

        let previous_value =
            if self.track_previous_values { previous_json.and_then(|j| serde_json::from_str(&j).ok()) } else { None };
        let kind = if was_absent { EventKind::Added } else { EventKind::Replaced };
        let event = Event::new(kind, self.name.clone(), handle.id.clone(), recorded_version)
            .with_previous_value(previous_value)
            .with_when_written(completion.clone());
        self.events.publish(event).await;

        Ok(completion)
    }

    pub async fn remove(self: &Arc<Self>, handle: &Arc<EntityHandle>) -> CResult<crate::event::Completion> {
        let version = clock::next_global_version();
        let previous_json = {
            let mut state = handle.state.lock().unwrap();
            let previous = state.as_json.clone();
            state.version = version;
            state.as_json = None;
            state.cached_value = None;
            state.ready_state = ReadyState::NoLocalData;
            previous
        };

        let (recorded_version, completion) = self.batcher.enqueue(handle.id.encode_key(), None, Some(version)).await;
        self.identity.delete(&handle.id);
        expiration::global_expiration().delete(&CacheKey::new(self.name.clone(), handle.id.clone()));

        let previous_value =
            if self.track_previous_values { previous_json.and_then(|j| serde_json::from_str(&j).ok()) } else { None };
        let event = Event::new(EventKind::Deleted, self.name.clone(), handle.id.clone(), recorded_version)
            .with_previous_value(previous_value)
            .with_when_written(completion.clone());
        self.events.publish(event).await;

        Ok(completion)
    }

    /// Writes a version-only invalidation row for `id`: the persisted
    /// marker a cached-transform class uses to record "this is stale"
    /// across restarts, and the seeding mechanism used by `resetAll`. This
    /// is `resetCache` for a cached-transform class (§4.G); the published
    /// `Reset` event is marked `no_reset` so a listener reacting to it
    /// doesn't cascade into resetting its own downstream state a second
    /// time over the same row.
    pub async fn invalidate(self: &Arc<Self>, id: &EntityId, version: Version) -> CResult<crate::event::Completion> {
        if let Some(handle) = self.identity.peek(id) {
            let mut state = handle.state.lock().unwrap();
            state.version = version;
            state.as_json = None;
            state.cached_value = None;
            state.ready_state = ReadyState::Invalidated;
        }
        let (recorded_version, completion) =
            self.batcher.enqueue(id.encode_key(), Some(encode_row_invalidated(version)), Some(version)).await;

        let event = Event::new(EventKind::Reset, self.name.clone(), id.clone(), recorded_version)
            .with_when_written(completion.clone())
            .no_reset();
        self.events.publish(event).await;

        Ok(completion)
    }

    pub async fn value_of(&self, handle: &Arc<EntityHandle>, ctx: &Context) -> CResult<ValueResult> {
        if matches!(handle.ready_state(), ReadyState::Unloaded) {
            self.load_latest_local_data(handle).await?;
        }

        let mut state = handle.state.lock().unwrap();
        if let Some(since) = ctx.if_modified_since() {
            if since == state.version {
                return Ok(ValueResult::NotModified);
            }
        }

        if let Some(cached) = &state.cached_value {
            return Ok(ValueResult::Value(Some(cached.clone())));
        }
        let Some(json) = &state.as_json else { return Ok(ValueResult::Value(None)) };
        let value: Value = serde_json::from_str(json)?;
        state.cached_value = Some(value.clone());
        Ok(ValueResult::Value(Some(value)))
    }

    pub fn clear_cache(&self, handle: &EntityHandle) {
        handle.state.lock().unwrap().clear_cache();
    }
}

#[async_trait]
impl EntityClass for Class {
    fn name(&self) -> &str {
        &self.name
    }

    fn last_version(&self) -> Version {
        self.last_version()
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn value_of(&self, id: &EntityId, ctx: &Context) -> CResult<Option<Value>> {
        let handle = self.identity.get_or_insert_with(id.clone(), {
            let class_name = self.name.clone();
            let id = id.clone();
            move || Arc::new(EntityHandle::new(class_name, id))
        });
        match Class::value_of(self, &handle, ctx).await? {
            ValueResult::Value(v) => Ok(v),
            ValueResult::NotModified => Ok(None),
        }
    }

    async fn get_instance_ids_and_versions_since(&self, since: Version) -> CResult<Vec<(EntityId, Version)>> {
        let rows = self.table.iterate(entity_range()).await?;
        let mut out = Vec::new();
        for (key, value) in rows {
            let id = match decode_ordered(&key)? {
                OrderedValue::Int(n) => EntityId::Num(n as u64),
                OrderedValue::Str(s) => EntityId::Str(s),
            };
            if let Ok(row) = decode_row(&value) {
                if row.version() > since {
                    out.push((id, row.version()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::memory::MemoryKv;

    fn sample_source_info() -> SourceInfo {
        SourceInfo::Explicit("1".into())
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_the_table() {
        let engine = MemoryKv::new();
        let class = Class::register(&engine, "widgets-a", sample_source_info(), vec![], false, false).await.unwrap();

        let handle = class.get_by_id(EntityId::num(1));
        class.set_value(&handle, serde_json::json!({"a": 1})).await.unwrap().wait().await;

        let ctx = Context::new();
        match class.value_of(&handle, &ctx).await.unwrap() {
            ValueResult::Value(Some(v)) => assert_eq!(v, serde_json::json!({"a": 1})),
            other => panic!("expected a value, got a different result: {}", matches!(other, ValueResult::NotModified)),
        }
    }

    #[tokio::test]
    async fn remove_clears_local_data() {
        let engine = MemoryKv::new();
        let class = Class::register(&engine, "widgets-b", sample_source_info(), vec![], false, false).await.unwrap();

        let handle = class.get_by_id(EntityId::num(1));
        class.set_value(&handle, serde_json::json!(1)).await.unwrap().wait().await;
        class.remove(&handle).await.unwrap().wait().await;

        let reloaded = class.get_by_id(EntityId::num(1));
        class.load_latest_local_data(&reloaded).await.unwrap();
        assert_eq!(reloaded.ready_state(), ReadyState::NoLocalData);
    }

    #[tokio::test]
    async fn reregistering_with_the_same_db_version_does_not_reset() {
        let engine = MemoryKv::new();
        {
            let class = Class::register(&engine, "widgets-c", SourceInfo::Explicit("v1".into()), vec![], false, false)
                .await
                .unwrap();
            let handle = class.get_by_id(EntityId::num(1));
            class.set_value(&handle, serde_json::json!("hello")).await.unwrap().wait().await;
        }
        registry::release_class_name("widgets-c");

        let class = Class::register(&engine, "widgets-c", SourceInfo::Explicit("v1".into()), vec![], false, false).await.unwrap();
        let handle = class.get_by_id(EntityId::num(1));
        class.load_latest_local_data(&handle).await.unwrap();
        assert_eq!(handle.ready_state(), ReadyState::UpToDate);
    }

    #[tokio::test]
    async fn version_mismatch_clears_the_table() {
        let engine = MemoryKv::new();
        {
            let class = Class::register(&engine, "widgets-d", SourceInfo::Explicit("v1".into()), vec![], false, false)
                .await
                .unwrap();
            let handle = class.get_by_id(EntityId::num(1));
            class.set_value(&handle, serde_json::json!("hello")).await.unwrap().wait().await;
        }
        registry::release_class_name("widgets-d");

        let class = Class::register(&engine, "widgets-d", SourceInfo::Explicit("v2".into()), vec![], false, false).await.unwrap();
        let handle = class.get_by_id(EntityId::num(1));
        class.load_latest_local_data(&handle).await.unwrap();
        assert_eq!(handle.ready_state(), ReadyState::NoLocalData);
    }
}
