//! Permission proxy (component I, §4.I): wraps any [`EntityClass`] so that
//! every read runs a set of permission callbacks first, in a derivative
//! context that carries the caller's session and version hints through
//! unmutated.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::class::EntityClass;
use crate::context::Context;
use crate::entity::{EntityId, Version};
use crate::error::{CResult, Error};
use crate::event::{EventBus, Listener};

pub enum Permission {
    Allow,
    Deny(String),
}

pub type PermissionCallback = dyn Fn(&EntityId, &Context) -> Permission + Send + Sync;

/// A class wrapped with a set of permission checks, each run in turn before
/// the call is allowed through to the wrapped class.
pub struct Permissioned {
    inner: Arc<dyn EntityClass>,
    checks: Vec<Arc<PermissionCallback>>,
}

impl Permissioned {
    pub fn new(inner: Arc<dyn EntityClass>, checks: Vec<Arc<PermissionCallback>>) -> Arc<Self> {
        Arc::new(Self { inner, checks })
    }

    /// Runs every check against a derivative context (session and version
    /// hints carried through unmutated), failing on the first denial.
    fn authorize(&self, id: &EntityId, ctx: &Context) -> CResult<Context> {
        let derived = ctx.new_context();
        for check in &self.checks {
            if let Permission::Deny(reason) = (check)(id, &derived) {
                return Err(Error::AccessDenied(reason));
            }
        }
        Ok(derived)
    }

    /// Subscribes `listener` on the wrapped class's own event bus, so
    /// downstream consumers attach to the real variable rather than this
    /// proxy.
    pub async fn notifies(&self, listener: Arc<dyn Listener>) {
        self.inner.events().notifies(listener).await;
    }

    /// Delegates to the wrapped class. The proxied class must not recurse on
    /// itself here (that would never reach the inner bus and unsubscribe
    /// nothing).
    pub async fn stop_notifies(&self, listener: &Arc<dyn Listener>) {
        self.inner.events().stop_notifies(listener).await;
    }
}

#[async_trait]
impl EntityClass for Permissioned {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn last_version(&self) -> Version {
        self.inner.last_version()
    }

    fn events(&self) -> &EventBus {
        self.inner.events()
    }

    async fn value_of(&self, id: &EntityId, ctx: &Context) -> CResult<Option<Value>> {
        let derived = self.authorize(id, ctx)?;
        self.inner.value_of(id, &derived).await
    }

    async fn get_instance_ids_and_versions_since(&self, since: Version) -> CResult<Vec<(EntityId, Version)>> {
        self.inner.get_instance_ids_and_versions_since(since).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::class::Class;
    use crate::engine::memory::MemoryKv;
    use crate::registry::{self, SourceInfo};

    #[tokio::test]
    async fn allows_reads_when_every_check_passes() {
        registry::release_class_name("perm-ok");
        let engine = MemoryKv::new();
        let class = Class::register(&engine, "perm-ok", SourceInfo::Explicit("1".into()), vec![], false, false).await.unwrap();
        let handle = class.get_by_id(EntityId::num(1));
        class.set_value(&handle, serde_json::json!("secret")).await.unwrap().wait().await;

        let allow_all: Arc<PermissionCallback> = Arc::new(|_id, _ctx| Permission::Allow);
        let proxy = Permissioned::new(class.clone() as Arc<dyn EntityClass>, vec![allow_all]);

        let value = proxy.value_of(&EntityId::num(1), &Context::new()).await.unwrap();
        assert_eq!(value, Some(serde_json::json!("secret")));
    }

    #[tokio::test]
    async fn denies_with_the_failing_checks_diagnostic() {
        registry::release_class_name("perm-deny");
        let engine = MemoryKv::new();
        let class = Class::register(&engine, "perm-deny", SourceInfo::Explicit("1".into()), vec![], false, false).await.unwrap();

        let deny_all: Arc<PermissionCallback> = Arc::new(|_id, _ctx| Permission::Deny("no access for you".into()));
        let proxy = Permissioned::new(class.clone() as Arc<dyn EntityClass>, vec![deny_all]);

        let error = proxy.value_of(&EntityId::num(1), &Context::new()).await.unwrap_err();
        assert!(matches!(error, Error::AccessDenied(msg) if msg == "no access for you"));
    }

    #[tokio::test]
    async fn checks_and_the_underlying_read_see_the_callers_version_hints() {
        registry::release_class_name("perm-ctx");
        let engine = MemoryKv::new();
        let class = Class::register(&engine, "perm-ctx", SourceInfo::Explicit("1".into()), vec![], false, false).await.unwrap();
        let handle = class.get_by_id(EntityId::num(1));
        let completion = class.set_value(&handle, serde_json::json!("hello")).await.unwrap();
        completion.wait().await;
        let written_version = handle.version();

        let assert_hints_present: Arc<PermissionCallback> = Arc::new(|_id, ctx| {
            if ctx.preferred_version() == Some(5) && ctx.if_modified_since() == Some(3) {
                Permission::Allow
            } else {
                Permission::Deny("context dropped caller hints".into())
            }
        });
        let proxy = Permissioned::new(class.clone() as Arc<dyn EntityClass>, vec![assert_hints_present]);

        let mut ctx = Context::new();
        ctx.set_version(5);
        ctx.set_if_modified_since(3);
        proxy.value_of(&EntityId::num(1), &ctx).await.unwrap();

        // The ifModifiedSince hint must still reach the wrapped class's own
        // NOT-MODIFIED short-circuit through the proxy.
        let mut not_modified_ctx = Context::new();
        not_modified_ctx.set_if_modified_since(written_version);
        let proxy_no_checks = Permissioned::new(class.clone() as Arc<dyn EntityClass>, vec![]);
        let value = proxy_no_checks.value_of(&EntityId::num(1), &not_modified_ctx).await.unwrap();
        assert_eq!(value, None);
    }
}
