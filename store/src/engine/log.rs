//! Append-only log file backing one [`super::log_cask::LogCask`] table: a
//! flat sequence of length-prefixed records, replayed front to back to
//! rebuild the in-memory keydir whenever the table is opened.
//!
//! Record layout: key length (`u32`, big-endian), value length or `-1` for
//! a tombstone (`i32`, big-endian), the key, then the value if present.

use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::engine::log_cask::KeyDir;
use crate::error::{CResult, Error};

/// The key and value location of one record read off disk. `value_len` is
/// `None` for a tombstone.
struct RawEntry {
    key: Vec<u8>,
    value_pos: u64,
    value_len: Option<u32>,
}

pub struct Log {
    pub(crate) path: PathBuf,
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens the log file at `path`, creating it (and any missing parent
    /// directories) on first use, and takes an exclusive lock on it for the
    /// lifetime of the returned handle so two engines can't share a table.
    pub fn new(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Internal(format!("creating {}: {}", dir.display(), err)))?;
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()
            .map_err(|err| Error::Internal(format!("locking {}: {}", path.display(), err)))?;

        Ok(Self { path, file })
    }

    /// Replays every record to rebuild the keydir: a later record for a key
    /// overwrites or tombstones an earlier one. A truncated trailing record
    /// (a crash mid-write) is treated as the true end of the log and
    /// trimmed off rather than surfaced as an error.
    pub fn build_keydir(&mut self) -> CResult<KeyDir> {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&mut self.file);
        let mut pos = reader.seek(SeekFrom::Start(0))?;
        let mut keydir = KeyDir::new();

        loop {
            if pos >= file_len {
                break;
            }
            match read_entry_at(&mut reader, pos, file_len) {
                Ok(entry) => {
                    pos = entry.value_pos + entry.value_len.unwrap_or(0) as u64;
                    match entry.value_len {
                        Some(value_len) => {
                            keydir.insert(entry.key, (entry.value_pos, value_len));
                        }
                        None => {
                            keydir.remove(&entry.key);
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("incomplete record at offset {} in {}, truncating", pos, self.path.display());
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(keydir)
    }

    pub fn read_value(&mut self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends one record to the end of the file — a tombstone when `value`
    /// is `None` — and flushes it before returning the position and byte
    /// length of the record just written.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let record_len = 4 + 4 + key_len + value_len;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::with_capacity(record_len as usize, &mut self.file);
        writer.write_all(&key_len.to_be_bytes())?;
        writer.write_all(&value.map_or(-1i32, |v| v.len() as i32).to_be_bytes())?;
        writer.write_all(key)?;
        if let Some(value) = value {
            writer.write_all(value)?;
        }
        writer.flush()?;

        Ok((pos, record_len))
    }
}

/// Reads one record starting at `pos` without consuming past its end.
fn read_entry_at(
    reader: &mut BufReader<&mut std::fs::File>,
    pos: u64,
    file_len: u64,
) -> std::io::Result<RawEntry> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let key_len = u32::from_be_bytes(len_buf);
    reader.read_exact(&mut len_buf)?;
    let value_len = match i32::from_be_bytes(len_buf) {
        l if l >= 0 => Some(l as u32),
        _ => None,
    };

    let value_pos = pos + 8 + key_len as u64;
    let mut key = vec![0; key_len as usize];
    reader.read_exact(&mut key)?;

    if let Some(len) = value_len {
        if value_pos + len as u64 > file_len {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "value extends past end of file"));
        }
        reader.seek_relative(len as i64)?;
    }

    Ok(RawEntry { key, value_pos, value_len })
}

#[cfg(test)]
mod test {
    use crate::engine::log::Log;

    #[test]
    fn opens_and_builds_an_empty_keydir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mydb");

        let mut log = Log::new(path.clone()).unwrap();
        let keydir = log.build_keydir().unwrap();
        assert!(keydir.is_empty());

        let file = std::fs::OpenOptions::new().read(true).open(&path).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 0);
    }

    #[test]
    fn truncates_a_torn_trailing_write() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mydb");
        {
            let mut log = Log::new(path.clone()).unwrap();
            log.write_entry(b"a", Some(b"1")).unwrap();
        }

        // Simulate a crash mid-write: a well-formed record followed by a
        // key/value-length header with no body behind it.
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&9u32.to_be_bytes()).unwrap();
            file.write_all(&1i32.to_be_bytes()).unwrap();
        }

        let mut log = Log::new(path.clone()).unwrap();
        let keydir = log.build_keydir().unwrap();
        assert_eq!(keydir.len(), 1);
        assert!(keydir.contains_key(b"a".as_slice()));

        // The first well-formed record is 4 (key len) + 4 (value len) +
        // 1 (key) + 1 (value) = 10 bytes; the torn header is dropped.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }
}
