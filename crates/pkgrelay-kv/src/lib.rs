//! Ordered key/value store for pkgrelay mirrors.
//!
//! Each mirror owns one bucket inside a single on-disk file
//! (`<dir>/<bucket>.db`). The file is a log of put/delete records replayed
//! into an in-memory ordered map at open; transactions append their records
//! and flush on commit. The file is guarded by an exclusive advisory lock so
//! two processes cannot open the same store; acquisition waits up to one
//! second before failing with `LockTimeout`.
//!
//! Writers are serialized: an `update` excludes other writers and readers
//! for its duration, and a `view` observes a consistent snapshot. Ordered
//! iteration (cursor and prefix scans) follows the lexicographic key order
//! the composer cleanup pass relies on.
//!
//! # Example
//!
//! ```
//! use pkgrelay_kv::Store;
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let store = Store::open(dir.path(), "packagist").expect("open");
//!
//! store
//!     .update(|tx| {
//!         tx.put("vendor/pkg", b"payload".to_vec());
//!         Ok(())
//!     })
//!     .expect("update");
//!
//! let value = store
//!     .view(|tx| Ok(tx.get("vendor/pkg").map(<[u8]>::to_vec)))
//!     .expect("view");
//! assert_eq!(value.as_deref(), Some(&b"payload"[..]));
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use pkgrelay_types::MirrorError;

mod compact;

pub use compact::{CompactStats, Compactor};

/// How long `open` waits for the exclusive file lock.
pub const LOCK_WAIT: Duration = Duration::from_secs(1);

const RECORD_PUT: u8 = 1;
const RECORD_DELETE: u8 = 2;
const RECORD_BUCKET: u8 = 3;

type Buckets = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// A single-file key/value store scoped to one primary bucket.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    bucket: String,
    inner: RwLock<Inner>,
    // The advisory lock stays held until this handle closes; dropping the
    // store releases it.
    _lock: fd_lock::RwLock<File>,
}

#[derive(Debug)]
struct Inner {
    buckets: Buckets,
    file: File,
}

impl Store {
    /// Open (or create) `<dir>/<bucket>.db` and ensure the bucket exists.
    pub fn open(dir: &Path, bucket: &str) -> Result<Store> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;

        let path = dir.join(format!("{bucket}.db"));
        let lock = acquire_exclusive(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open store file {}", path.display()))?;

        let (mut buckets, valid_len) = replay(&mut file)
            .with_context(|| format!("failed to replay store file {}", path.display()))?;

        let actual_len = file
            .metadata()
            .context("failed to stat store file")?
            .len();
        if valid_len < actual_len {
            tracing::warn!(
                path = %path.display(),
                valid = valid_len,
                total = actual_len,
                "truncating torn tail of store file"
            );
            file.set_len(valid_len).context("failed to truncate store file")?;
        }
        file.seek(SeekFrom::End(0)).context("failed to seek store file")?;

        let mut pending = Vec::new();
        if !buckets.contains_key(bucket) {
            buckets.insert(bucket.to_string(), BTreeMap::new());
            encode_bucket(&mut pending, bucket);
        }
        if !pending.is_empty() {
            file.write_all(&pending).context("failed to record bucket")?;
            file.flush().context("failed to flush store file")?;
        }

        Ok(Store {
            path,
            bucket: bucket.to_string(),
            inner: RwLock::new(Inner { buckets, file }),
            _lock: lock,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the primary bucket.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Run a read-only transaction over a consistent snapshot.
    pub fn view<T>(&self, f: impl FnOnce(&ReadTx<'_>) -> Result<T>) -> Result<T> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let map = inner
            .buckets
            .get(&self.bucket)
            .with_context(|| format!("bucket {} missing", self.bucket))?;
        f(&ReadTx { map })
    }

    /// Run a writer-exclusive transaction. Staged writes are applied and
    /// persisted only when the closure returns `Ok`.
    pub fn update<T>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let Inner { buckets, file } = &mut *inner;
        let map = buckets
            .get(&self.bucket)
            .with_context(|| format!("bucket {} missing", self.bucket))?;

        let mut tx = WriteTx {
            map,
            staged: Vec::new(),
        };
        let out = f(&mut tx)?;
        let staged = tx.staged;

        let mut encoded = Vec::new();
        for op in &staged {
            match op {
                Op::Put { key, value } => encode_put(&mut encoded, &self.bucket, key, value),
                Op::Delete { key } => encode_delete(&mut encoded, &self.bucket, key),
            }
        }
        file.write_all(&encoded).context("failed to append transaction")?;
        file.flush().context("failed to flush transaction")?;

        let map = buckets
            .get_mut(&self.bucket)
            .with_context(|| format!("bucket {} missing", self.bucket))?;
        for op in staged {
            match op {
                Op::Put { key, value } => {
                    map.insert(key, value);
                }
                Op::Delete { key } => {
                    map.remove(&key);
                }
            }
        }

        Ok(out)
    }

    /// Flush and close the store, releasing the on-disk lock.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.file.flush().context("failed to flush store file")?;
        Ok(())
    }
}

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("store lock poisoned")
}

/// Read-only view over the primary bucket.
pub struct ReadTx<'a> {
    map: &'a BTreeMap<String, Vec<u8>>,
}

impl ReadTx<'_> {
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.map.get(key).map(Vec::as_slice)
    }

    /// Visit every entry in lexicographic key order.
    pub fn for_each(&self, mut f: impl FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        for (k, v) in self.map {
            f(k, v)?;
        }
        Ok(())
    }

    /// Ordered iterator over all entries.
    pub fn cursor(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Ordered iterator over keys starting with `prefix`.
    pub fn scan_prefix<'p>(
        &'p self,
        prefix: &'p str,
    ) -> impl Iterator<Item = (&'p str, &'p [u8])> {
        self.map
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

enum Op {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Staged writer over the primary bucket.
pub struct WriteTx<'a> {
    map: &'a BTreeMap<String, Vec<u8>>,
    staged: Vec<Op>,
}

impl WriteTx<'_> {
    /// Read a key, observing this transaction's own staged writes.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        for op in self.staged.iter().rev() {
            match op {
                Op::Put { key: k, value } if k == key => return Some(value.clone()),
                Op::Delete { key: k } if k == key => return None,
                _ => {}
            }
        }
        self.map.get(key).cloned()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.staged.push(Op::Put {
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.staged.push(Op::Delete { key: key.into() });
    }

    /// Visit the pre-transaction snapshot in lexicographic key order.
    pub fn for_each(&self, mut f: impl FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        for (k, v) in self.map {
            f(k, v)?;
        }
        Ok(())
    }
}

fn acquire_exclusive(path: &Path) -> Result<fd_lock::RwLock<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open store file {}", path.display()))?;

    let mut lock = fd_lock::RwLock::new(file);
    let deadline = Instant::now() + LOCK_WAIT;

    loop {
        match lock.try_write() {
            Ok(guard) => {
                // Keep the lock for the lifetime of the file handle; it is
                // released when the descriptor closes.
                std::mem::forget(guard);
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(anyhow::Error::from(MirrorError::LockTimeout))
                        .with_context(|| format!("store file {} is locked", path.display()));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to lock store file {}", path.display()));
            }
        }
    }

    Ok(lock)
}

fn encode_bucket(out: &mut Vec<u8>, bucket: &str) {
    out.push(RECORD_BUCKET);
    out.extend_from_slice(&(bucket.len() as u32).to_le_bytes());
    out.extend_from_slice(bucket.as_bytes());
}

fn encode_put(out: &mut Vec<u8>, bucket: &str, key: &str, value: &[u8]) {
    out.push(RECORD_PUT);
    out.extend_from_slice(&(bucket.len() as u32).to_le_bytes());
    out.extend_from_slice(bucket.as_bytes());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value);
}

fn encode_delete(out: &mut Vec<u8>, bucket: &str, key: &str) {
    out.push(RECORD_DELETE);
    out.extend_from_slice(&(bucket.len() as u32).to_le_bytes());
    out.extend_from_slice(bucket.as_bytes());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
}

fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        filled += n;
    }
    Ok(true)
}

fn read_len(r: &mut impl Read) -> io::Result<usize> {
    let mut buf = [0u8; 4];
    if !read_exact_or_eof(r, &mut buf)? {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(u32::from_le_bytes(buf) as usize)
}

fn read_string(r: &mut impl Read) -> io::Result<String> {
    let len = read_len(r)?;
    let mut buf = vec![0u8; len];
    if !read_exact_or_eof(r, &mut buf)? && len > 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    String::from_utf8(buf).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
}

/// Replay the record log. Returns the bucket maps and the byte length of the
/// valid prefix; anything past a torn record is discarded by the caller.
pub(crate) fn replay(file: &mut File) -> Result<(Buckets, u64)> {
    file.seek(SeekFrom::Start(0)).context("failed to rewind store file")?;

    let mut reader = CountingReader {
        inner: BufReader::new(file),
        read: 0,
    };
    let mut buckets: Buckets = BTreeMap::new();
    let mut valid = 0u64;

    loop {
        let mut tag = [0u8; 1];
        match read_exact_or_eof(&mut reader, &mut tag) {
            Ok(false) => break,
            Ok(true) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("failed to read store record"),
        }

        let record = (|| -> io::Result<()> {
            match tag[0] {
                RECORD_BUCKET => {
                    let bucket = read_string(&mut reader)?;
                    buckets.entry(bucket).or_default();
                }
                RECORD_PUT => {
                    let bucket = read_string(&mut reader)?;
                    let key = read_string(&mut reader)?;
                    let len = read_len(&mut reader)?;
                    let mut value = vec![0u8; len];
                    if !read_exact_or_eof(&mut reader, &mut value)? && len > 0 {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
                    }
                    buckets.entry(bucket).or_default().insert(key, value);
                }
                RECORD_DELETE => {
                    let bucket = read_string(&mut reader)?;
                    let key = read_string(&mut reader)?;
                    buckets.entry(bucket).or_default().remove(&key);
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown record tag {other}"),
                    ));
                }
            }
            Ok(())
        })();

        match record {
            Ok(()) => valid = reader.read,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("failed to decode store record"),
        }
    }

    Ok((buckets, valid))
}

struct CountingReader<R> {
    inner: R,
    read: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

/// Open a database under `base` with a bucket named `bucket`, failing if the
/// data directory cannot be created or the file lock is held elsewhere.
pub fn open_database_with_bucket(base: &Path, bucket: &str) -> Result<Store> {
    if bucket.is_empty() {
        bail!("bucket name must not be empty");
    }
    Store::open(base, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path(), "data").expect("open");

        store
            .update(|tx| {
                tx.put("a", b"1".to_vec());
                tx.put("b", b"2".to_vec());
                Ok(())
            })
            .expect("update");

        store
            .view(|tx| {
                assert_eq!(tx.get("a"), Some(&b"1"[..]));
                assert_eq!(tx.get("b"), Some(&b"2"[..]));
                assert_eq!(tx.get("c"), None);
                Ok(())
            })
            .expect("view");
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = Store::open(dir.path(), "data").expect("open");
            store
                .update(|tx| {
                    tx.put("key", b"value".to_vec());
                    Ok(())
                })
                .expect("update");
            store.close().expect("close");
        }

        let store = Store::open(dir.path(), "data").expect("reopen");
        let value = store
            .view(|tx| Ok(tx.get("key").map(<[u8]>::to_vec)))
            .expect("view");
        assert_eq!(value.as_deref(), Some(&b"value"[..]));
    }

    #[test]
    fn delete_removes_entry_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = Store::open(dir.path(), "data").expect("open");
            store
                .update(|tx| {
                    tx.put("key", b"value".to_vec());
                    Ok(())
                })
                .expect("put");
            store
                .update(|tx| {
                    tx.delete("key");
                    Ok(())
                })
                .expect("delete");
        }

        let store = Store::open(dir.path(), "data").expect("reopen");
        store
            .view(|tx| {
                assert_eq!(tx.get("key"), None);
                Ok(())
            })
            .expect("view");
    }

    #[test]
    fn cursor_iterates_in_lexicographic_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path(), "data").expect("open");

        store
            .update(|tx| {
                tx.put("vendor/pkg$aaa", vec![1]);
                tx.put("vendor/pkg", vec![2]);
                tx.put("vendor/other", vec![3]);
                Ok(())
            })
            .expect("update");

        let keys = store
            .view(|tx| Ok(tx.cursor().map(|(k, _)| k.to_string()).collect::<Vec<_>>()))
            .expect("view");
        // a package index key always sorts before its shard keys
        assert_eq!(keys, vec!["vendor/other", "vendor/pkg", "vendor/pkg$aaa"]);
    }

    #[test]
    fn scan_prefix_filters_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path(), "data").expect("open");

        store
            .update(|tx| {
                tx.put("p/provider-a$x.json", vec![1]);
                tx.put("p/provider-b$y.json", vec![2]);
                tx.put("vendor/pkg", vec![3]);
                Ok(())
            })
            .expect("update");

        let count = store
            .view(|tx| Ok(tx.scan_prefix("p/").count()))
            .expect("view");
        assert_eq!(count, 2);
    }

    #[test]
    fn failed_transaction_stages_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path(), "data").expect("open");

        let result: Result<()> = store.update(|tx| {
            tx.put("key", b"value".to_vec());
            bail!("abort")
        });
        assert!(result.is_err());

        store
            .view(|tx| {
                assert!(tx.is_empty());
                Ok(())
            })
            .expect("view");
    }

    #[test]
    fn write_tx_sees_own_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path(), "data").expect("open");

        store
            .update(|tx| {
                assert_eq!(tx.get("key"), None);
                tx.put("key", b"one".to_vec());
                assert_eq!(tx.get("key"), Some(b"one".to_vec()));
                tx.delete("key");
                assert_eq!(tx.get("key"), None);
                tx.put("key", b"two".to_vec());
                Ok(())
            })
            .expect("update");

        let value = store
            .view(|tx| Ok(tx.get("key").map(<[u8]>::to_vec)))
            .expect("view");
        assert_eq!(value.as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn second_open_times_out_on_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _store = Store::open(dir.path(), "data").expect("open");

        let started = Instant::now();
        let err = Store::open(dir.path(), "data").expect_err("lock held");
        assert!(MirrorError::matches(&err, MirrorError::LockTimeout));
        assert!(started.elapsed() >= LOCK_WAIT);
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let _store = Store::open(dir.path(), "data").expect("open");
        }
        let _store = Store::open(dir.path(), "data").expect("reopen after drop");
    }

    #[test]
    fn open_database_rejects_empty_bucket() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(open_database_with_bucket(dir.path(), "").is_err());
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path;
        {
            let store = Store::open(dir.path(), "data").expect("open");
            path = store.path().to_path_buf();
            store
                .update(|tx| {
                    tx.put("key", b"value".to_vec());
                    Ok(())
                })
                .expect("update");
        }

        // simulate a crash mid-append
        let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
        file.write_all(&[RECORD_PUT, 4, 0, 0]).expect("append garbage");
        drop(file);

        let store = Store::open(dir.path(), "data").expect("reopen");
        store
            .view(|tx| {
                assert_eq!(tx.get("key"), Some(&b"value"[..]));
                assert_eq!(tx.len(), 1);
                Ok(())
            })
            .expect("view");

        // the torn bytes are gone; further writes land cleanly
        store
            .update(|tx| {
                tx.put("key2", b"value2".to_vec());
                Ok(())
            })
            .expect("update");
        drop(store);

        let store = Store::open(dir.path(), "data").expect("reopen again");
        store
            .view(|tx| {
                assert_eq!(tx.len(), 2);
                Ok(())
            })
            .expect("view");
    }
}
