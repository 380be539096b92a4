//! Entity identity, versions and on-disk row encoding (component D's data
//! model, §3). The store and the indexer both build on these primitives.

use serde_json::Value;

use crate::codec::OrderedValue;
use crate::error::{CResult, Error};

pub type Version = u64;

/// An entity identifier: a positive integer, or a string that does not
/// itself parse as one. Rejecting numeric-looking strings keeps the two
/// forms from colliding once they're both ordered-key encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Num(u64),
    Str(String),
}

impl EntityId {
    pub fn num(id: u64) -> Self {
        EntityId::Num(id)
    }

    /// Parses a caller-supplied id, rejecting strings that parse as
    /// positive integers (they must be passed as `EntityId::Num` instead).
    pub fn parse(raw: impl Into<String>) -> CResult<Self> {
        let raw = raw.into();
        if let Ok(n) = raw.parse::<i64>() {
            if n > 0 {
                return Err(Error::BadId(raw));
            }
        }
        if raw.is_empty() {
            return Err(Error::BadId(raw));
        }
        Ok(EntityId::Str(raw))
    }

    pub fn to_ordered(&self) -> OrderedValue {
        match self {
            EntityId::Num(n) => OrderedValue::Int(*n as i64),
            EntityId::Str(s) => OrderedValue::Str(s.clone()),
        }
    }

    pub fn encode_key(&self) -> Vec<u8> {
        crate::codec::encode_ordered(&self.to_ordered())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Num(n) => write!(f, "{n}"),
            EntityId::Str(s) => write!(f, "{s}"),
        }
    }
}

/// The coarse lifecycle of an entity's in-memory cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Unloaded,
    LoadingLocalData,
    UpToDate,
    Invalidated,
    NoLocalData,
}

/// The decoded contents of an entity row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowContents {
    /// `"<version>,<json>"`: a live value.
    Value { version: Version, json: String },
    /// `"<version>"`: a version-only invalidation marker, payload dropped.
    Invalidated { version: Version },
}

impl RowContents {
    pub fn version(&self) -> Version {
        match self {
            RowContents::Value { version, .. } => *version,
            RowContents::Invalidated { version } => *version,
        }
    }
}

/// Encodes a live row as `"<version>,<json>"`.
pub fn encode_row_value(version: Version, json: &str) -> Vec<u8> {
    format!("{version},{json}").into_bytes()
}

/// Encodes a version-only invalidation marker as `"<version>"`.
pub fn encode_row_invalidated(version: Version) -> Vec<u8> {
    version.to_string().into_bytes()
}

/// Parses `"<version>,<json>"` or `"<version>"` back into [`RowContents`].
pub fn decode_row(bytes: &[u8]) -> CResult<RowContents> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::Parse(e.to_string()))?;
    match text.split_once(',') {
        Some((version_str, json)) => {
            let version = version_str.parse::<Version>().map_err(|e| Error::Parse(e.to_string()))?;
            Ok(RowContents::Value { version, json: json.to_string() })
        }
        None => {
            let version = text.parse::<Version>().map_err(|e| Error::Parse(e.to_string()))?;
            Ok(RowContents::Invalidated { version })
        }
    }
}

/// The in-memory state held for one live `(class, id)` pair.
#[derive(Debug, Clone)]
pub struct EntityState {
    pub id: EntityId,
    pub version: Version,
    pub as_json: Option<String>,
    pub cached_value: Option<Value>,
    pub ready_state: ReadyState,
}

impl EntityState {
    pub fn unloaded(id: EntityId, version: Version) -> Self {
        Self { id, version, as_json: None, cached_value: None, ready_state: ReadyState::Unloaded }
    }

    /// Approximate heap weight, used by the expiration strategy.
    pub fn weight(&self) -> u64 {
        64 + self.as_json.as_ref().map_or(0, |s| s.len() as u64)
    }

    pub fn clear_cache(&mut self) {
        self.as_json = None;
        self.cached_value = None;
        if matches!(self.ready_state, ReadyState::UpToDate | ReadyState::Invalidated) {
            self.ready_state = ReadyState::Unloaded;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_numeric_strings() {
        assert!(EntityId::parse("42").is_err());
        assert!(EntityId::parse("007").is_err());
        assert!(EntityId::parse("-5").is_ok());
        assert!(EntityId::parse("abc").is_ok());
    }

    #[test]
    fn row_round_trips() {
        let bytes = encode_row_value(7, r#"{"a":1}"#);
        assert_eq!(decode_row(&bytes).unwrap(), RowContents::Value { version: 7, json: r#"{"a":1}"#.into() });

        let bytes = encode_row_invalidated(9);
        assert_eq!(decode_row(&bytes).unwrap(), RowContents::Invalidated { version: 9 });
    }

    #[test]
    fn clear_cache_resets_ready_state_only_from_loaded_states() {
        let mut state = EntityState::unloaded(EntityId::num(1), 1);
        state.ready_state = ReadyState::LoadingLocalData;
        state.clear_cache();
        assert_eq!(state.ready_state, ReadyState::LoadingLocalData);

        state.ready_state = ReadyState::Invalidated;
        state.clear_cache();
        assert_eq!(state.ready_state, ReadyState::Unloaded);
    }
}
