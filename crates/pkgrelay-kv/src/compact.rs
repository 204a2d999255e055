//! Offline compaction for store files.
//!
//! Copies live entries into a fresh file, then swaps it in place of the
//! original through a rename pair (`old -> .backup`, `new -> canonical`)
//! before deleting the backup. A failure before the first rename leaves the
//! source untouched.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use crate::{encode_bucket, encode_put, replay};

/// Result of a compaction run.
#[derive(Debug, Clone, Copy)]
pub struct CompactStats {
    /// Source file size in bytes.
    pub before: u64,
    /// Compacted file size in bytes.
    pub after: u64,
}

impl CompactStats {
    pub fn gain(&self) -> f64 {
        if self.after == 0 {
            return 0.0;
        }
        self.before as f64 / self.after as f64
    }
}

/// Rewrites a store file, dropping overwritten and deleted records.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compactor {
    /// Commit the destination in batches once this many bytes accumulate.
    /// Zero means a single batch.
    pub tx_max_size: u64,
}

impl Compactor {
    pub fn new(tx_max_size: u64) -> Self {
        Self { tx_max_size }
    }

    /// Compact the store file at `src_path` in place. The store must be
    /// closed; the file lock is re-acquired for the duration of the run.
    pub fn compact(&self, src_path: &Path) -> Result<CompactStats> {
        let before = match fs::metadata(src_path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("store file {} not found", src_path.display()));
            }
        };

        let now = Utc::now();
        let stamp = format!("{}-{}", now.format("%Y-%m-%d"), now.timestamp());
        let bck_path = sibling(src_path, &format!("{stamp}.backup"));
        let dst_path = sibling(src_path, &format!("{stamp}.compacted"));

        // Hold the lock while reading so a live store cannot race us.
        let lock = crate::acquire_exclusive(src_path)?;
        let mut src = OpenOptions::new()
            .read(true)
            .write(true)
            .open(src_path)
            .with_context(|| format!("failed to open {}", src_path.display()))?;
        let (buckets, _valid) = replay(&mut src)
            .with_context(|| format!("failed to replay {}", src_path.display()))?;

        let write_result = self.write_compacted(&dst_path, &buckets);
        if let Err(err) = write_result {
            let _ = fs::remove_file(&dst_path);
            return Err(err);
        }

        let after = fs::metadata(&dst_path)
            .with_context(|| format!("failed to stat {}", dst_path.display()))?
            .len();
        if after == 0 {
            let _ = fs::remove_file(&dst_path);
            bail!("compaction produced a zero-size file");
        }

        drop(src);
        drop(lock);

        fs::rename(src_path, &bck_path)
            .with_context(|| format!("failed to move {} aside", src_path.display()))?;
        fs::rename(&dst_path, src_path)
            .with_context(|| format!("failed to install {}", dst_path.display()))?;
        let _ = fs::remove_file(&bck_path);

        tracing::info!(
            path = %src_path.display(),
            before,
            after,
            gain = %format!("{:.2}x", before as f64 / after.max(1) as f64),
            "compacted store file"
        );

        Ok(CompactStats { before, after })
    }

    fn write_compacted(
        &self,
        dst_path: &Path,
        buckets: &std::collections::BTreeMap<String, std::collections::BTreeMap<String, Vec<u8>>>,
    ) -> Result<()> {
        let mut dst = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dst_path)
            .with_context(|| format!("failed to create {}", dst_path.display()))?;

        let mut batch: Vec<u8> = Vec::new();
        let mut batch_size: u64 = 0;

        for (bucket, entries) in buckets {
            encode_bucket(&mut batch, bucket);
            for (key, value) in entries {
                let record_size = (key.len() + value.len()) as u64;
                if self.tx_max_size != 0 && batch_size + record_size > self.tx_max_size {
                    dst.write_all(&batch).context("failed to write batch")?;
                    dst.sync_all().context("failed to sync batch")?;
                    batch.clear();
                    batch_size = 0;
                }
                batch_size += record_size;
                encode_put(&mut batch, bucket, key, value);
            }
        }

        dst.write_all(&batch).context("failed to write final batch")?;
        dst.sync_all().context("failed to sync compacted file")?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{suffix}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn fill(dir: &Path) -> PathBuf {
        let store = Store::open(dir, "data").expect("open");
        let path = store.path().to_path_buf();
        // overwrite the same key repeatedly so the log accumulates garbage
        for i in 0..50 {
            store
                .update(|tx| {
                    tx.put("churn", vec![i; 512]);
                    Ok(())
                })
                .expect("update");
        }
        store
            .update(|tx| {
                tx.put("keep", b"kept".to_vec());
                tx.put("gone", b"deleted".to_vec());
                Ok(())
            })
            .expect("update");
        store
            .update(|tx| {
                tx.delete("gone");
                Ok(())
            })
            .expect("update");
        store.close().expect("close");
        path
    }

    #[test]
    fn compaction_shrinks_and_preserves_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = fill(dir.path());

        let stats = Compactor::default().compact(&path).expect("compact");
        assert!(stats.after < stats.before);
        assert!(stats.gain() > 1.0);

        let store = Store::open(dir.path(), "data").expect("reopen");
        store
            .view(|tx| {
                assert_eq!(tx.get("keep"), Some(&b"kept"[..]));
                assert_eq!(tx.get("churn").map(<[u8]>::len), Some(512));
                assert_eq!(tx.get("gone"), None);
                assert_eq!(tx.len(), 2);
                Ok(())
            })
            .expect("view");
    }

    #[test]
    fn compaction_with_batch_splits_keeps_every_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path(), "data").expect("open");
        let path = store.path().to_path_buf();
        store
            .update(|tx| {
                for i in 0..20 {
                    tx.put(format!("key{i:02}"), vec![0u8; 100]);
                }
                Ok(())
            })
            .expect("update");
        store.close().expect("close");

        // tiny batch ceiling forces many intermediate commits
        Compactor::new(64).compact(&path).expect("compact");

        let store = Store::open(dir.path(), "data").expect("reopen");
        store
            .view(|tx| {
                assert_eq!(tx.len(), 20);
                Ok(())
            })
            .expect("view");
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.db");
        assert!(Compactor::default().compact(&missing).is_err());
    }

    #[test]
    fn backup_is_removed_after_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = fill(dir.path());

        Compactor::default().compact(&path).expect("compact");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("backup") || n.contains("compacted"))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }
}
