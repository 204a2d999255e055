//! Bower mirror: a flat name→repository-URL map.
//!
//! The upstream list is re-fetched every pass; a package is rewritten and
//! stored only when its upstream URL changed. The original URL is kept in
//! `source_url` so unchanged packages can be skipped without re-rewriting.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::Receiver;
use pkgrelay_fetch::Fetcher;
use pkgrelay_kv::Store;
use pkgrelay_rewrite::rewrite_repository;
use pkgrelay_state::StateSender;
use pkgrelay_types::MirrorError;
use serde::{Deserialize, Serialize};

use crate::service::{LoopStep, MirrorService, hold_between_runs};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct BowerConfig {
    pub code: String,
    pub source_server: String,
    pub public_server: String,
    /// Directory holding `<code>.db`.
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
}

pub struct BowerService {
    config: BowerConfig,
    db: RwLock<Option<Store>>,
    state: StateSender,
    fetcher: Fetcher,
}

impl BowerService {
    pub fn new(config: BowerConfig, state: StateSender) -> Self {
        Self {
            config,
            db: RwLock::new(None),
            state,
            fetcher: Fetcher::new(),
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

    /// Refresh the package map from upstream, rewriting repository URLs to
    /// the mirror-local form.
    pub fn sync_packages(&self) -> Result<()> {
        tracing::info!(code = %self.config.code, "starting SyncPackages");
        self.state.running("Syncing packages");

        self.state.running("Loading packages list");
        let url = format!("{}/packages", self.config.source_server);
        let packages: Vec<Package> = self
            .fetcher
            .load_remote_struct(&url)
            .context("error loading bower packages list")?;

        tracing::info!(count = packages.len(), "end loading packages information");

        for mut pkg in packages {
            let result = self.with_db(|db| {
                db.update(|tx| {
                    if let Some(data) = tx.get(&pkg.name) {
                        match serde_json::from_slice::<Package>(&data) {
                            Ok(saved) if saved.source_url == pkg.url => {
                                tracing::debug!(package = %pkg.name, "skip package");
                                return Ok(());
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::info!(
                                    package = %pkg.name,
                                    error = %err,
                                    "error while decoding current package"
                                );
                            }
                        }
                    }

                    self.state
                        .running(format!("Save package information: {}", pkg.name));

                    pkg.source_url = pkg.url.clone();
                    pkg.url = rewrite_repository(&self.config.public_server, &pkg.source_url);

                    let data = serde_json::to_vec(&pkg).context("unable to encode package")?;
                    tx.put(pkg.name.clone(), data);
                    tracing::info!(package = %pkg.name, "package saved");
                    Ok(())
                })
            });
            if let Err(err) = result {
                tracing::error!(error = %err, "error updating package record");
            }
        }

        self.state.hold("End package synchronisation");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.with_db(|db| {
            db.view(|tx| {
                tx.get(name)
                    .map(<[u8]>::to_vec)
                    .ok_or(MirrorError::EmptyKey)
                    .with_context(|| format!("no package named {name}"))
            })
        })
    }

    /// Stream the whole map as one JSON array. An empty bucket yields `[]`.
    pub fn write_list(&self, w: &mut dyn Write) -> Result<()> {
        self.with_db(|db| {
            db.view(|tx| {
                w.write_all(b"[")?;
                let mut first = true;
                tx.for_each(|_key, value| {
                    if !first {
                        w.write_all(b",")?;
                    }
                    first = false;
                    w.write_all(value)?;
                    Ok(())
                })?;
                w.write_all(b"]")?;
                Ok(())
            })
        })
    }

    fn close(&self) -> Result<()> {
        if let Some(store) = self.db.write().unwrap().take() {
            store.close()?;
        }
        Ok(())
    }
}

impl MirrorService for BowerService {
    fn init(&self) -> Result<()> {
        tracing::info!(code = %self.config.code, "init bower service");
        let store = Store::open(&self.config.data_dir, &self.config.code)
            .context("unable to open the internal database")?;
        *self.db.write().unwrap() = Some(store);
        Ok(())
    }

    fn serve(self: Arc<Self>, shutdown: Receiver<()>) -> Result<()> {
        tracing::info!(code = %self.config.code, "starting bower service");

        loop {
            tracing::info!("starting a new sync...");
            if let Err(err) = self.sync_packages() {
                tracing::error!(error = %err, "SyncPackages failed");
                self.state.error(format!("Sync failed: {err}"));
            }

            match hold_between_runs(&self.state, &shutdown, self.config.sync_interval) {
                LoopStep::Continue => continue,
                LoopStep::Cancelled => {
                    self.close()?;
                    return Ok(());
                }
            }
        }
    }
}
