use std::ops::Bound;
use std::path::PathBuf;

use crate::error::CResult;
use crate::engine::log::Log;
use crate::engine::Status;

/// Maps a key to the position and length of its latest value in the log
/// file. Using a `BTreeMap` keeps it sorted for ordered range scans.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// A very simple log-structured key-value engine: writes are appended to a
/// single log file, and an in-memory keydir maps each live key to its most
/// recent position. Deletes append a tombstone. All live keys must fit in
/// memory; values are read back from disk on demand.
///
/// This backs one table of the store. It has no notion of compaction —
/// the log grows monotonically, since the store's own write batcher already
/// bounds how often a table is appended to.
pub struct LogCask {
    log: Log,
    keydir: KeyDir,
}

impl LogCask {
    pub fn open(path: PathBuf) -> CResult<Self> {
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    pub fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        match self.keydir.get(key) {
            Some((value_pos, value_len)) => Ok(Some(self.log.read_value(*value_pos, *value_len)?)),
            None => Ok(None),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some(value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.log.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    pub fn flush(&mut self) -> CResult<()> {
        Ok(self.log.file.sync_all()?)
    }

    pub fn clear(&mut self) -> CResult<()> {
        for key in self.keydir.keys().cloned().collect::<Vec<_>>() {
            self.log.write_entry(&key, None)?;
        }
        self.keydir.clear();
        Ok(())
    }

    pub fn scan(&mut self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let keys: Vec<Vec<u8>> = self.keydir.range(range).map(|(k, _)| k.clone()).collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let (value_pos, value_len) = self.keydir[&key];
            out.push((key, self.log.read_value(value_pos, value_len)?));
        }
        Ok(out)
    }

    pub fn status(&self) -> Status {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0u64, |size, (key, (_, value_len))| size + key.len() as u64 + *value_len as u64);
        Status { name: "log cask".to_string(), keys, size }
    }
}

impl Drop for LogCask {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush log cask: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, LogCask) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let cask = LogCask::open(path).unwrap();
        (dir, cask)
    }

    #[test]
    fn point_ops() {
        let (_dir, mut s) = setup();
        assert_eq!(s.get(b"a").unwrap(), None);
        s.set(b"a", &[1]).unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(vec![1]));
        s.set(b"a", &[2]).unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(vec![2]));
        s.delete(b"a").unwrap();
        assert_eq!(s.get(b"a").unwrap(), None);
    }

    #[test]
    fn scan_is_key_ordered() {
        let (_dir, mut s) = setup();
        s.set(b"b", &[2]).unwrap();
        s.set(b"a", &[1]).unwrap();
        s.set(b"c", &[3]).unwrap();
        let all = s.scan((Bound::Unbounded, Bound::Unbounded)).unwrap();
        assert_eq!(all, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2]), (b"c".to_vec(), vec![3])]);
    }

    #[test]
    fn reopen_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let mut s = LogCask::open(path.clone()).unwrap();
            s.set(b"a", &[1]).unwrap();
            s.set(b"b", &[2]).unwrap();
            s.delete(b"a").unwrap();
            s.flush().unwrap();
        }
        let mut s = LogCask::open(path).unwrap();
        assert_eq!(s.get(b"a").unwrap(), None);
        assert_eq!(s.get(b"b").unwrap(), Some(vec![2]));
    }

    #[test]
    fn clear_removes_every_row() {
        let (_dir, mut s) = setup();
        s.set(b"a", &[1]).unwrap();
        s.set(b"b", &[2]).unwrap();
        s.clear().unwrap();
        assert_eq!(s.scan((Bound::Unbounded, Bound::Unbounded)).unwrap(), vec![]);
    }
}
