//! Per-call ambient context (§6 external collaborator): carries a preferred
//! version, an `ifModifiedSince` hint and a session reference through (4.D)
//! and (4.I) without threading them as explicit parameters everywhere.

use std::sync::Arc;

use crate::entity::Version;

/// An opaque caller identity, propagated by the permission proxy (4.I) but
/// never interpreted by the store itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    preferred_version: Option<Version>,
    if_modified_since: Option<Version>,
    session: Option<Arc<Session>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Arc<Session>) -> Self {
        Self { session: Some(session), ..Self::default() }
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn preferred_version(&self) -> Option<Version> {
        self.preferred_version
    }

    pub fn if_modified_since(&self) -> Option<Version> {
        self.if_modified_since
    }

    pub fn set_version(&mut self, version: Version) {
        self.preferred_version = Some(version);
    }

    pub fn set_if_modified_since(&mut self, version: Version) {
        self.if_modified_since = Some(version);
    }

    /// A derivative context carrying the current session and version hints
    /// through unmutated, used by the permission proxy so a check runs
    /// against its own `Context` value without handing out the caller's
    /// original (and without the check being able to mutate it).
    pub fn new_context(&self) -> Context {
        Context { preferred_version: self.preferred_version, if_modified_since: self.if_modified_since, session: self.session.clone() }
    }
}
