//! Content-addressed artifact store for pkgrelay.
//!
//! The vault keeps large blobs (tarballs, git archives, static files) out of
//! the key/value store. Entries are addressed by an opaque string key and
//! stored together with a metadata sidecar. Blobs are streamed to disk, never
//! buffered whole; a failed `put` removes the partial entry before returning.
//!
//! The store applies no transform to the payload (the passthrough driver);
//! the [`Driver`] trait is the seam where an encrypting or compressing
//! backend would plug in.
//!
//! # Example
//!
//! ```
//! use pkgrelay_vault::{Metadata, Vault};
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let vault = Vault::filesystem(dir.path());
//!
//! let mut meta = Metadata::new();
//! meta.insert("path".into(), "vendor/pkg".into());
//!
//! vault.put("npm:left-pad/1.0.0", meta, &mut &b"tarball"[..]).expect("put");
//! assert!(vault.has("npm:left-pad/1.0.0"));
//!
//! let mut out = Vec::new();
//! vault.get("npm:left-pad/1.0.0", &mut out).expect("get");
//! assert_eq!(out, b"tarball");
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pkgrelay_types::MirrorError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Caller-supplied metadata stored alongside a blob.
pub type Metadata = BTreeMap<String, String>;

/// Storage backend seam. Only the filesystem passthrough driver ships.
pub trait Driver: Send + Sync {
    fn has(&self, key: &str) -> bool;
    fn put(&self, key: &str, meta: Metadata, reader: &mut dyn Read) -> Result<u64>;
    fn get(&self, key: &str, writer: &mut dyn Write) -> Result<u64>;
    fn metadata(&self, key: &str) -> Result<Metadata>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// The artifact store handed to mirrors.
pub struct Vault {
    driver: Box<dyn Driver>,
}

impl Vault {
    /// A vault backed by the filesystem under `root`.
    pub fn filesystem(root: impl Into<PathBuf>) -> Vault {
        Vault {
            driver: Box::new(FsDriver::new(root)),
        }
    }

    pub fn with_driver(driver: Box<dyn Driver>) -> Vault {
        Vault { driver }
    }

    pub fn has(&self, key: &str) -> bool {
        self.driver.has(key)
    }

    /// Stream `reader` into the entry for `key`. Returns bytes written.
    /// On failure the partial entry is removed before the error surfaces.
    pub fn put(&self, key: &str, meta: Metadata, reader: &mut dyn Read) -> Result<u64> {
        match self.driver.put(key, meta, reader) {
            Ok(written) => Ok(written),
            Err(err) => {
                let _ = self.driver.remove(key);
                Err(err)
            }
        }
    }

    /// Stream the entry for `key` into `writer`. Returns bytes copied;
    /// `ResourceNotFound` when the key is absent.
    pub fn get(&self, key: &str, writer: &mut dyn Write) -> Result<u64> {
        self.driver.get(key, writer)
    }

    /// Read back the metadata sidecar for `key`.
    pub fn metadata(&self, key: &str) -> Result<Metadata> {
        self.driver.metadata(key)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.driver.remove(key)
    }
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    key: String,
    meta: Metadata,
}

/// Filesystem driver: blob and sidecar named by the sha256 of the key under
/// a two-level fan-out, so arbitrary key strings (slashes, colons, encoded
/// scopes) never leak into path components.
pub struct FsDriver {
    root: PathBuf,
}

impl FsDriver {
    pub fn new(root: impl Into<PathBuf>) -> FsDriver {
        FsDriver { root: root.into() }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(&digest[..2]).join(format!("{digest}.blob"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(&digest[..2]).join(format!("{digest}.meta"))
    }
}

impl Driver for FsDriver {
    fn has(&self, key: &str) -> bool {
        self.blob_path(key).exists()
    }

    fn put(&self, key: &str, meta: Metadata, reader: &mut dyn Read) -> Result<u64> {
        let blob_path = self.blob_path(key);
        let parent = blob_path
            .parent()
            .context("blob path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create vault directory {}", parent.display()))?;

        let tmp_path = blob_path.with_extension("tmp");
        let written = (|| -> Result<u64> {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            let written = io::copy(reader, &mut tmp).context("failed to stream blob")?;
            tmp.sync_all().context("failed to sync blob")?;
            Ok(written)
        })();

        let written = match written {
            Ok(w) => w,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        };

        let sidecar = Sidecar {
            key: key.to_string(),
            meta,
        };
        let encoded = serde_json::to_vec(&sidecar).context("failed to encode metadata")?;
        fs::write(self.meta_path(key), encoded)
            .with_context(|| format!("failed to write metadata for {key}"))?;

        fs::rename(&tmp_path, &blob_path)
            .with_context(|| format!("failed to install {}", blob_path.display()))?;

        Ok(written)
    }

    fn get(&self, key: &str, writer: &mut dyn Write) -> Result<u64> {
        let blob_path = self.blob_path(key);
        let mut file = match File::open(&blob_path) {
            Ok(f) => f,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(anyhow::Error::from(MirrorError::ResourceNotFound))
                    .with_context(|| format!("no vault entry for {key}"));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open {}", blob_path.display()));
            }
        };
        io::copy(&mut file, writer).with_context(|| format!("failed to stream {key}"))
    }

    fn metadata(&self, key: &str) -> Result<Metadata> {
        let data = match fs::read(self.meta_path(key)) {
            Ok(d) => d,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(anyhow::Error::from(MirrorError::ResourceNotFound))
                    .with_context(|| format!("no vault metadata for {key}"));
            }
            Err(err) => return Err(err).context("failed to read vault metadata"),
        };
        let sidecar: Sidecar =
            serde_json::from_slice(&data).context("failed to decode vault metadata")?;
        Ok(sidecar.meta)
    }

    fn remove(&self, key: &str) -> Result<()> {
        for path in [self.blob_path(key), self.meta_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }
}
