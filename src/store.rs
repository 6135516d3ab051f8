//! Durable building blocks for the index: append-only record journals and
//! snapshot files replaced atomically.

use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Upper bound for a single serialized record; anything larger is treated as garbage.
const MAX_RECORD_BYTES: u64 = 64 * 1024 * 1024;

const WRITE_BUFFER: usize = 128 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_RECORD_BYTES)
}

/// Reader wrapper that remembers how many bytes were consumed.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Writer wrapper that tracks the logical end of the file.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn is_eof(err: &bincode::Error) -> bool {
    matches!(err.as_ref(), bincode::ErrorKind::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

/// Append-only log of bincode records.
///
/// Writes are buffered; nothing is guaranteed on disk until [`Journal::commit`].
pub struct Journal<T> {
    path: PathBuf,
    writer: CountingWriter<BufWriter<File>>,
    records: u64,
    _record: PhantomData<fn(T)>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// Creates an empty journal, replacing any file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create journal: {:?}", path))?;
        Ok(Self::from_file(path, file, 0, 0))
    }

    /// Reopens a journal at its last commit: the first `committed` records are
    /// replayed through `visit` and anything written after them is cut off.
    pub fn recover(path: &Path, committed: u64, mut visit: impl FnMut(T)) -> Result<Self> {
        let mut records = RecordReader::open_at(path, 0, Some(committed))?;
        let mut found = 0;
        for record in records.by_ref() {
            visit(record?);
            found += 1;
        }
        if found < committed {
            bail!(
                "Journal {:?} holds {} records, but {} were committed",
                path,
                found,
                committed
            );
        }
        let valid = records.position();

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open journal: {:?}", path))?;
        let len = file.metadata()?.len();
        if len > valid {
            warn!(path = ?path, dropped = len - valid, "Discarding uncommitted journal tail");
            file.set_len(valid)
                .with_context(|| format!("Failed to truncate journal: {:?}", path))?;
        }
        drop(file);

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open journal: {:?}", path))?;
        Ok(Self::from_file(path, file, found, valid))
    }

    fn from_file(path: &Path, file: File, records: u64, bytes: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: CountingWriter {
                inner: BufWriter::with_capacity(WRITE_BUFFER, file),
                count: bytes,
            },
            records,
            _record: PhantomData,
        }
    }

    pub fn append(&mut self, record: &T) -> Result<()> {
        options()
            .serialize_into(&mut self.writer, record)
            .with_context(|| format!("Failed to append to journal: {:?}", self.path))?;
        self.records += 1;
        Ok(())
    }

    /// Flushes buffered records and syncs them to disk.
    pub fn commit(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush journal: {:?}", self.path))?;
        self.writer
            .inner
            .get_ref()
            .sync_data()
            .with_context(|| format!("Failed to sync journal: {:?}", self.path))?;
        debug!(path = ?self.path, records = self.records, "Journal committed");
        Ok(())
    }

    /// Records in the journal, including those recovered from an earlier run.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Offset at which the next appended record starts.
    pub fn bytes(&self) -> u64 {
        self.writer.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Streams complete records to `visit` and returns the byte length they cover.
    /// A torn tail ends the replay; anything else unreadable is an error.
    pub fn replay(path: &Path, mut visit: impl FnMut(T)) -> Result<u64> {
        let mut records = RecordReader::open(path)?;
        for record in records.by_ref() {
            visit(record?);
        }
        Ok(records.position())
    }

    pub fn read_all(path: &Path) -> Result<Vec<T>> {
        RecordReader::open(path)?.collect()
    }
}

/// Forward reader over the records of a journal, starting at any record boundary.
pub struct RecordReader<T> {
    path: PathBuf,
    reader: CountingReader<BufReader<File>>,
    remaining: Option<u64>,
    valid: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RecordReader<T> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_at(path, 0, None)
    }

    /// Reads at most `limit` records from byte `offset`, which must be a record boundary.
    pub fn open_at(path: &Path, offset: u64, limit: Option<u64>) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open journal: {:?}", path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .with_context(|| format!("Failed to seek journal: {:?}", path))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader: CountingReader {
                inner: BufReader::new(file),
                count: offset,
            },
            remaining: limit,
            valid: offset,
            _record: PhantomData,
        })
    }

    /// End of the last complete record read.
    pub fn position(&self) -> u64 {
        self.valid
    }
}

impl<T: DeserializeOwned> Iterator for RecordReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.remaining == Some(0) {
            return None;
        }
        match options().deserialize_from::<_, T>(&mut self.reader) {
            Ok(record) => {
                self.valid = self.reader.count;
                if let Some(n) = self.remaining.as_mut() {
                    *n -= 1;
                }
                Some(Ok(record))
            }
            Err(e) if is_eof(&e) => {
                self.remaining = Some(0);
                None
            }
            Err(e) => {
                self.remaining = Some(0);
                Some(Err(e).with_context(|| format!("Corrupt journal: {:?}", self.path)))
            }
        }
    }
}

/// Writes `value` to a temp file next to `path` and renames it into place.
pub fn save_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let tmp_path = path.with_extension("tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", tmp_path))?;
    let mut writer = BufWriter::new(file);
    bincode::DefaultOptions::new()
        .serialize_into(&mut writer, value)
        .context("Failed to serialize snapshot")?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Failed to write snapshot: {:?}", tmp_path))?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename temp file: {:?}", path))?;
    Ok(())
}

/// Loads a snapshot written by [`save_atomic`]. `None` when the file is absent.
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let file = File::open(path).with_context(|| format!("Failed to open snapshot: {:?}", path))?;
    let value = bincode::DefaultOptions::new()
        .with_limit(file_size.saturating_add(1024))
        .deserialize_from(BufReader::new(file))
        .with_context(|| format!("Corrupt snapshot: {:?}", path))?;
    Ok(Some(value))
}
