//! Static file mirror: lazy GET, store, replay.
//!
//! No sync loop. The first request for a path downloads the upstream file
//! into the vault and records the upstream headers in the bucket; every
//! later request replays the stored blob with the captured headers.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::Receiver;
use pkgrelay_fetch::Fetcher;
use pkgrelay_kv::Store;
use pkgrelay_state::StateSender;
use pkgrelay_types::MirrorError;
use pkgrelay_vault::{Metadata, Vault};
use serde::{Deserialize, Serialize};

use crate::service::MirrorService;

/// Sidecar record for one proxied file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRecord {
    pub url: String,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct StaticMirrorConfig {
    pub code: String,
    pub source_server: String,
    /// Directory holding `<code>.db`.
    pub data_dir: PathBuf,
}

pub struct StaticService {
    config: StaticMirrorConfig,
    db: RwLock<Option<Store>>,
    state: StateSender,
    fetcher: Fetcher,
    vault: Vault,
}

impl StaticService {
    pub fn new(config: StaticMirrorConfig, state: StateSender, vault: Vault) -> Self {
        Self {
            config,
            db: RwLock::new(None),
            state,
            fetcher: Fetcher::new(),
            vault,
        }
    }

    pub fn code(&self) -> &str {
        &self.config.code
    }

    fn with_db<T>(&self, f: impl FnOnce(&Store) -> Result<T>) -> Result<T> {
        let guard = self.db.read().unwrap();
        let store = guard
            .as_ref()
            .ok_or(MirrorError::DatabaseLocked)
            .context("store is closed")?;
        f(store)
    }

    /// Stream the file at `path`, downloading and recording it on first
    /// request. Returns the stored record so the caller can replay the
    /// upstream headers (minus `Content-Length`).
    pub fn write_archive(&self, w: &mut dyn Write, path: &str) -> Result<FileRecord> {
        let key = path.to_string();

        let mut record = FileRecord::default();
        let found = self.with_db(|db| {
            db.view(|tx| {
                let Some(data) = tx.get(&key) else {
                    return Err(anyhow::Error::from(MirrorError::EmptyData));
                };
                serde_json::from_slice::<FileRecord>(data).context("unable to decode file record")
            })
        });
        match found {
            Ok(stored) => record = stored,
            Err(err) if MirrorError::matches(&err, MirrorError::EmptyData) => {
                record.url = format!("{}/{}", self.config.source_server, path);
            }
            Err(err) => return Err(err),
        }

        if !self.vault.has(&key) {
            tracing::info!(path, url = %record.url, "create vault entry");
            self.state.running(format!("Download {path}"));

            self.download_static(&key, &mut record)?;

            let encoded = serde_json::to_vec(&record).context("unable to encode file record")?;
            self.with_db(|db| {
                db.update(|tx| {
                    tx.put(key.clone(), encoded);
                    Ok(())
                })
            })?;
        }

        tracing::info!(path, "read vault entry");
        self.vault.get(&key, w)?;
        Ok(record)
    }

    fn download_static(&self, key: &str, record: &mut FileRecord) -> Result<()> {
        tracing::info!(url = %record.url, "start downloading the remote static file");

        // 404 surfaces as ResourceNotFound, any other non-200 as HttpError
        let response = self.fetcher.get(&record.url)?;

        record.header = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (canonical_header(name.as_str()), v.to_string()))
            })
            .collect();

        let mut meta = Metadata::new();
        meta.insert("path".to_string(), key.to_string());

        let mut body = response;
        let written = self.vault.put(key, meta, &mut body)?;

        record.size = written;
        record.downloaded_at = Some(Utc::now());

        tracing::info!(url = %record.url, size = written, "completed downloading the remote static file");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(store) = self.db.write().unwrap().take() {
            store.close()?;
        }
        Ok(())
    }
}

/// `content-type` → `Content-Type`, the form clients expect replayed.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

impl MirrorService for StaticService {
    fn init(&self) -> Result<()> {
        tracing::info!(code = %self.config.code, "init static service");
        let store = Store::open(&self.config.data_dir, &self.config.code)
            .context("unable to open the internal database")?;
        *self.db.write().unwrap() = Some(store);
        Ok(())
    }

    fn serve(self: Arc<Self>, shutdown: Receiver<()>) -> Result<()> {
        // no sync feature: files are fetched on demand
        let _ = shutdown.recv();
        self.close()
    }
}
