//! Class registry & versioning (component F, §4.F): computing a class's
//! `dbVersion`, detecting schema drift against what was last persisted, and
//! enforcing that no two live classes share a name.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::UNIX_EPOCH;

use hmac::{Hmac, Mac};
use serde_derive::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CResult, Error};

type HmacSha256 = Hmac<Sha256>;

/// How a class identifies its own schema version.
pub enum SourceInfo {
    /// An explicit, caller-chosen version string.
    Explicit(String),
    /// The class's version is derived from the contents of a transform
    /// source file: `dbVersion = hex(HMAC-SHA256(key="portal", msg=file))`.
    SourceFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassVersion {
    pub db_version: String,
    /// The source file's mtime in epoch milliseconds, when derived from one.
    pub transform_version: Option<u64>,
}

pub fn compute_db_version(info: &SourceInfo) -> CResult<ClassVersion> {
    match info {
        SourceInfo::Explicit(version) => Ok(ClassVersion { db_version: version.clone(), transform_version: None }),
        SourceInfo::SourceFile(path) => {
            let db_version = hash_source_file(path)?;
            let mtime = std::fs::metadata(path)?
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map_err(|e| Error::Internal(e.to_string()))?
                .as_millis() as u64;
            Ok(ClassVersion { db_version, transform_version: Some(mtime) })
        }
    }
}

fn hash_source_file(path: &Path) -> CResult<String> {
    let contents = std::fs::read(path)?;
    let mut mac = HmacSha256::new_from_slice(b"portal").expect("HMAC accepts keys of any length");
    mac.update(&contents);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// The `[0x01,0x01]` record persisted per table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRecord {
    pub start_version: u64,
    pub db_version: String,
}

static REGISTERED_NAMES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn registered_names() -> &'static Mutex<HashSet<String>> {
    REGISTERED_NAMES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Claims a class name, failing if it is already registered in this process.
pub fn claim_class_name(name: &str) -> CResult<()> {
    let mut names = registered_names().lock().unwrap();
    if !names.insert(name.to_string()) {
        return Err(Error::AlreadyRegistered(name.to_string()));
    }
    Ok(())
}

/// Releases a previously claimed name. Only meant for tests, which register
/// and drop classes with the same name many times over in one process.
#[cfg(test)]
pub fn release_class_name(name: &str) {
    registered_names().lock().unwrap().remove(name);
}
