//! `reactive-store` is a persistent, reactive, incrementally-indexed object
//! store built on top of an ordered key-value engine. Application-defined
//! entity classes bind to backing tables; each entity has an id, a
//! JSON-serializable value and a monotonic version. Derived indexes and
//! cached transforms stay consistent with their sources through an event
//! bus, a per-index work queue, and batched atomic commits. A process-wide
//! expiration strategy bounds in-memory cache size without ever touching
//! persisted data.
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//! use reactive_store::class::{Class, EntityClass};
//! use reactive_store::engine::memory::MemoryKv;
//! use reactive_store::entity::EntityId;
//! use reactive_store::registry::SourceInfo;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = MemoryKv::new();
//!     let widgets = Class::register(&engine, "widgets", SourceInfo::Explicit("1".into()), vec![], false, false)
//!         .await
//!         .unwrap();
//!
//!     let handle = widgets.get_by_id(EntityId::num(1));
//!     widgets.set_value(&handle, serde_json::json!({"name": "gear"})).await.unwrap().wait().await;
//!
//!     let ctx = reactive_store::context::Context::new();
//!     let value = EntityClass::value_of(widgets.as_ref(), &EntityId::num(1), &ctx).await.unwrap();
//!     assert_eq!(value, Some(serde_json::json!({"name": "gear"})));
//! }
//! ```

pub mod batch;
pub mod cached;
pub mod class;
pub mod clock;
pub mod codec;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod expiration;
pub mod identity;
pub mod index;
pub mod permission;
pub mod registry;
