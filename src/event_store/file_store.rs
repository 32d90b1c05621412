//! File-based storage backend.
//!
//! Each stream is a JSONL file (one record per line) with:
//! - Optimistic concurrency via an exclusive file lock around the head check
//! - A snapshot file per stream, written atomically via temp file + rename

use crate::domain::errors::StorageError;
use crate::event_store::backend::StorageBackend;
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOG_EXTENSION: &str = "jsonl";
const SNAPSHOT_SUFFIX: &str = ".snapshot";

/// Stores streams as `<dir>/<stream>.jsonl` and `<dir>/<stream>.snapshot`.
///
/// Records must be single-line (compact JSON satisfies this).
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, stream: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{LOG_EXTENSION}", encode_stream(stream)))
    }

    fn snapshot_path(&self, stream: &str) -> PathBuf {
        self.dir
            .join(format!("{}{SNAPSHOT_SUFFIX}", encode_stream(stream)))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn append(
        &self,
        stream: &str,
        expected_head: u64,
        records: Vec<Vec<u8>>,
    ) -> Result<u64, StorageError> {
        if let Some(bad) = records.iter().find(|record| record.contains(&b'\n')) {
            return Err(StorageError::Corrupt {
                stream: stream.to_string(),
                message: format!("record of {} bytes spans multiple lines", bad.len()),
            });
        }

        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.log_path(stream))?;

        // Held until `file` drops at the end of this call.
        file.lock_exclusive()?;

        let actual = count_lines(&file)?;
        if actual != expected_head {
            return Err(StorageError::SequenceMismatch {
                stream: stream.to_string(),
                expected: expected_head,
                actual,
            });
        }

        let appended = records.len() as u64;
        for record in records {
            file.write_all(&record)?;
            file.write_all(b"\n")?;
        }

        file.flush()?;
        file.sync_all()?;

        Ok(actual + appended)
    }

    async fn read_range(&self, stream: &str, from: u64) -> Result<Vec<Vec<u8>>, StorageError> {
        let file = match File::open(self.log_path(stream)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;

        let skip = usize::try_from(from.saturating_sub(1)).unwrap_or(usize::MAX);
        let mut records = Vec::new();
        for line in BufReader::new(&file).lines().skip(skip) {
            records.push(line?.into_bytes());
        }
        Ok(records)
    }

    async fn head(&self, stream: &str) -> Result<u64, StorageError> {
        match File::open(self.log_path(stream)) {
            Ok(file) => {
                file.lock_shared()?;
                count_lines(&file)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_snapshot(
        &self,
        stream: &str,
        sequence: u64,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.snapshot_path(stream);

        let mut content = format!("{sequence}\n").into_bytes();
        content.extend(bytes);

        // Write to temp file, then rename for atomicity
        let tmp_path = path.with_extension("snapshot.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    async fn read_latest(&self, stream: &str) -> Result<Option<(u64, Vec<u8>)>, StorageError> {
        let content = match std::fs::read(self.snapshot_path(stream)) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let corrupt = |message: &str| StorageError::Corrupt {
            stream: stream.to_string(),
            message: message.to_string(),
        };
        let split = content
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or_else(|| corrupt("snapshot header missing"))?;
        let (header, body) = content.split_at(split);
        let sequence = std::str::from_utf8(header)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .ok_or_else(|| corrupt("snapshot header is not a sequence number"))?;
        Ok(Some((sequence, body.iter().skip(1).copied().collect())))
    }

    async fn streams(&self) -> Result<Vec<String>, StorageError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Some(name) = decode_stream(stem) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Counts newline-terminated records from the start of the file.
fn count_lines(file: &File) -> Result<u64, StorageError> {
    let mut reader = BufReader::new(file.try_clone()?);
    reader.seek(SeekFrom::Start(0))?;

    let mut count = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        count += 1;
    }
    Ok(count)
}

/// Escapes a stream name into a portable file stem (`%XX` for anything
/// outside `[A-Za-z0-9_-]`).
fn encode_stream(stream: &str) -> String {
    let mut out = String::with_capacity(stream.len());
    for byte in stream.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_stream(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
#[path = "tests/file_store_tests.rs"]
mod tests;
