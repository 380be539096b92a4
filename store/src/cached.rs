//! Cached transform (component G, §4.G): an entity class whose values are
//! derived from one or more upstream [`EntityClass`] sources via a
//! user-supplied transform, kept in sync through the event bus rather than
//! recomputed on every read.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::class::{Class, EntityClass};
use crate::context::Context;
use crate::engine::KvEngine;
use crate::entity::{EntityId, Version};
use crate::error::CResult;
use crate::event::{Event, EventBus, EventKind, Listener, Origin};
use crate::registry::SourceInfo;

pub type Transform = dyn Fn(&[Option<Value>]) -> Option<Value> + Send + Sync;

/// A class whose rows are produced by applying `transform` to the current
/// values of `sources`, for the same id across every source.
pub struct Cached {
    class: Arc<Class>,
    sources: Vec<Arc<dyn EntityClass>>,
    transform: Arc<Transform>,
}

impl Cached {
    /// Registers a cached-transform class against `table`. On return, the
    /// class has already reseeded from its sources (on a `dbVersion`
    /// mismatch) and has replayed every source update it missed since its
    /// last run as synthetic, initialization-tagged events on its own bus,
    /// so its own downstream consumers can catch up without a full scan.
    pub async fn derive(
        engine: &dyn KvEngine,
        name: impl Into<String>,
        source_info: SourceInfo,
        sources: Vec<Arc<dyn EntityClass>>,
        transform: Arc<Transform>,
    ) -> CResult<Arc<Cached>> {
        let class = Class::register(engine, name, source_info, sources.clone(), true, true).await?;
        let last_version = class.last_version();
        let cached = Arc::new(Cached { class: class.clone(), sources: sources.clone(), transform });

        for source in &cached.sources {
            let catch_up = source.get_instance_ids_and_versions_since(last_version).await?;
            for (id, version) in catch_up {
                let event = Event::new(EventKind::Replaced, class.name(), id, version).with_origin(Origin::Initialization);
                class.events().publish(event).await;
            }
        }

        for source in &cached.sources {
            source.events().notifies(cached.clone() as Arc<dyn Listener>).await;
        }

        Ok(cached)
    }

    pub fn name(&self) -> &str {
        self.class.name()
    }

    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    async fn recompute(&self, id: &EntityId) {
        let ctx = Context::new();
        let mut values = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.value_of(id, &ctx).await {
                Ok(value) => values.push(value),
                Err(error) => {
                    log::error!("cached transform {} could not read source {} for {id}: {error}", self.class.name(), source.name());
                    return;
                }
            }
        }

        let handle = self.class.get_by_id(id.clone());
        match (self.transform)(&values) {
            Some(output) => {
                if let Err(error) = self.class.set_value(&handle, output).await {
                    log::error!("cached transform {} failed to write {id}: {error}", self.class.name());
                }
            }
            None => {
                if let Err(error) = self.class.remove(&handle).await {
                    log::error!("cached transform {} failed to clear {id}: {error}", self.class.name());
                }
            }
        }
    }
}

#[async_trait]
impl Listener for Cached {
    async fn on_event(&self, event: Event) {
        // A source event marked `no_reset` is itself a resetCache bookkeeping
        // notification (§4.D update protocol step 4), not a real value
        // change — reacting to it would recompute off the same stale input
        // the source already flagged, for no benefit.
        if event.no_reset {
            return;
        }
        self.recompute(&event.id).await;
    }
}

#[async_trait]
impl EntityClass for Cached {
    fn name(&self) -> &str {
        self.class.name()
    }

    fn last_version(&self) -> Version {
        self.class.last_version()
    }

    fn events(&self) -> &EventBus {
        self.class.events()
    }

    async fn value_of(&self, id: &EntityId, ctx: &Context) -> CResult<Option<Value>> {
        EntityClass::value_of(self.class.as_ref(), id, ctx).await
    }

    async fn get_instance_ids_and_versions_since(&self, since: Version) -> CResult<Vec<(EntityId, Version)>> {
        self.class.get_instance_ids_and_versions_since(since).await
    }
}
