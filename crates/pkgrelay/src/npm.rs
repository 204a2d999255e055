//! NPM mirror.
//!
//! Per-package JSON documents are cached in the bucket, tarballs in the
//! vault. The sync pass walks the short-meta records already present and
//! refreshes any package whose upstream revision or release count moved;
//! new packages enter the bucket through `get` misses. Scoped names travel
//! encoded (`@scope%2fname`) — every lookup and storage key uses the
//! encoded form, decoding only to compose upstream URLs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::Receiver;
use pkgrelay_fetch::{self as fetch, Fetcher};
use pkgrelay_kv::{Compactor, Store};
use pkgrelay_pool::WorkerManager;
use pkgrelay_rewrite::rewrite_npm_tarball;
use pkgrelay_state::StateSender;
use pkgrelay_types::MirrorError;
use pkgrelay_vault::{Metadata, Vault};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::service::{LoopStep, MirrorService, hold_between_runs};

const WORKER_COUNT: usize = 10;
const COMPACT_EVERY: u32 = 10;

/// Suffix of the lightweight per-package records the sync loop scans.
pub const META_SUFFIX: &str = ".meta";

/// The record the sync loop uses to decide whether a re-fetch is needed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortPackageDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub rev: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub releases_available: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistDefinition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shasum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tarball: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageVersionDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<DistDefinition>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A whole registry document for one package. Fields the mirror does not
/// touch are preserved verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullPackageDefinition {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
    pub rev: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub versions: BTreeMap<String, PackageVersionDefinition>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Scoped names are stored and looked up with the encoded separator.
pub fn encoded_name(name: &str) -> String {
    name.replace('/', "%2f")
}

#[derive(Debug, Clone)]
pub struct NpmConfig {
    pub code: String,
    pub source_server: String,
    pub public_server: String,
    pub fallback_servers: Vec<String>,
    /// Directory holding `<code>.db`.
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
}

pub struct NpmService {
    config: NpmConfig,
    db: RwLock<Option<Store>>,
    locked: AtomicBool,
    state: StateSender,
    fetcher: Fetcher,
    vault: Vault,
    compactor: Compactor,
}

impl NpmService {
    pub fn new(config: NpmConfig, state: StateSender, vault: Vault) -> Self {
        Self {
            config,
            db: RwLock::new(None),
            locked: AtomicBool::new(false),
            state,
            fetcher: Fetcher::new(),
            vault,
            compactor: Compactor::default(),
        }
    }

    pub fn code(&self) -> &str {
        &self.config.code
    }

    fn open_database(&self) -> Result<()> {
        let store = Store::open(&self.config.data_dir, &self.config.code)
            .context("unable to open the internal database")?;
        *self.db.write().unwrap() = Some(store);
        Ok(())
    }

    fn with_db<T>(&self, f: impl FnOnce(&Store) -> Result<T>) -> Result<T> {
        let guard = self.db.read().unwrap();
        let store = guard
            .as_ref()
            .ok_or(MirrorError::DatabaseLocked)
            .context("store is closed for compaction")?;
        f(store)
    }

    fn optimize(&self) -> Result<()> {
        self.locked.store(true, Ordering::SeqCst);
        scopeguard::defer! {
            self.locked.store(false, Ordering::SeqCst);
        }

        let path = {
            let mut guard = self.db.write().unwrap();
            let store = guard
                .take()
                .ok_or(MirrorError::DatabaseLocked)
                .context("store already closed")?;
            let path = store.path().to_path_buf();
            store.close()?;
            path
        };

        let compacted = self.compactor.compact(&path);
        self.open_database()?;
        compacted.map(|_| ())
    }

    /// Walk existing short-meta records and refresh every package whose
    /// upstream revision or release count changed.
    pub fn sync_packages(self: &Arc<Self>) -> Result<()> {
        tracing::info!(code = %self.config.code, "starting SyncPackages");
        self.state.running("Fetching packages metadatas");

        let svc = Arc::clone(self);
        let mut pool: WorkerManager<ShortPackageDefinition, FullPackageDefinition> =
            WorkerManager::new(WORKER_COUNT, move |id, input: Receiver<ShortPackageDefinition>, output| {
                for current in input {
                    let remote = match svc.load_package(&current.name) {
                        Ok(remote) => remote,
                        Err(err) => {
                            tracing::error!(
                                package = %current.name,
                                error = %err,
                                "error loading package information"
                            );
                            continue;
                        }
                    };

                    if current.rev != remote.rev
                        || current.releases_available != remote.versions.len()
                    {
                        tracing::debug!(
                            package = %current.name,
                            current_rev = %current.rev,
                            remote_rev = %remote.rev,
                            worker = id,
                            "updating package information"
                        );
                        let _ = output.send(remote);
                    } else {
                        tracing::debug!(
                            package = %current.name,
                            rev = %current.rev,
                            worker = id,
                            "revisions are equal, nothing to update"
                        );
                    }
                }
            });

        let svc = Arc::clone(self);
        pool.result_callback(move |mut pkg| {
            if let Err(err) = svc.save_package(&mut pkg) {
                tracing::error!(package = %pkg.name, error = %err, "error while saving the package");
            }
        });
        pool.start();

        let metas: Vec<ShortPackageDefinition> = self.with_db(|db| {
            db.view(|tx| {
                let mut metas = Vec::new();
                tx.for_each(|key, value| {
                    if !key.ends_with(META_SUFFIX) {
                        return Ok(());
                    }
                    match serde_json::from_slice::<ShortPackageDefinition>(value) {
                        Ok(meta) => metas.push(meta),
                        Err(err) => {
                            tracing::error!(package = key, error = %err, "unable to decode meta entry");
                        }
                    }
                    Ok(())
                })?;
                Ok(metas)
            })
        })?;

        for meta in metas {
            let _ = pool.add(meta);
        }

        tracing::info!("wait for workers to complete");
        pool.wait();

        Ok(())
    }

    /// Fetch the full document from the primary upstream, falling back to
    /// the configured alternates. A document without an id is an upstream
    /// defect (`InvalidPackage`).
    fn load_package(&self, name: &str) -> Result<FullPackageDefinition> {
        let name = encoded_name(name);

        let mut servers = vec![self.config.source_server.as_str()];
        servers.extend(self.config.fallback_servers.iter().map(String::as_str));

        let mut last_err = None;
        for server in servers {
            let url = format!("{server}/{name}");
            match self.fetcher.load_remote_struct::<FullPackageDefinition>(&url) {
                Ok(pkg) => {
                    if pkg.id.is_empty() {
                        return Err(MirrorError::InvalidPackage.into());
                    }
                    return Ok(pkg);
                }
                Err(err) => {
                    tracing::error!(url = %url, error = %err, "error loading package definition");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no upstream server configured")))
    }

    /// Rewrite tarball URLs, then persist the short meta (uncompressed)
    /// and the gzip-encoded full document.
    fn save_package(&self, pkg: &mut FullPackageDefinition) -> Result<Vec<u8>> {
        tracing::info!(package = %pkg.name, "save package information");
        self.state
            .running(format!("Save package information: {}", pkg.name));

        for version in pkg.versions.values_mut() {
            let Some(dist) = version.dist.as_mut() else {
                continue;
            };
            if dist.tarball.is_empty() {
                continue;
            }
            match rewrite_npm_tarball(
                &self.config.public_server,
                &self.config.code,
                &dist.tarball,
            ) {
                Some(rewritten) => dist.tarball = rewritten,
                None => {
                    tracing::error!(tarball = %dist.tarball, "unable to find host in tarball url");
                }
            }
        }

        let key = encoded_name(&pkg.name);
        let short = ShortPackageDefinition {
            id: pkg.id.clone(),
            rev: pkg.rev.clone(),
            name: pkg.name.clone(),
            releases_available: pkg.versions.len(),
        };
        let meta = serde_json::to_vec(&short).context("unable to encode package meta")?;
        let document = fetch::marshal(pkg).context("unable to encode package document")?;

        let stored = document.clone();
        self.with_db(|db| {
            db.update(|tx| {
                tx.put(format!("{key}{META_SUFFIX}"), meta);
                tx.put(key.clone(), document);
                Ok(())
            })
        })?;

        Ok(stored)
    }

    fn update_package(&self, key: &str, rev: &str) -> Result<Vec<u8>> {
        let mut pkg = self.load_package(key)?;
        if pkg.rev == rev {
            return Ok(Vec::new());
        }
        self.save_package(&mut pkg)
    }

    /// Raw document lookup; a miss fetches the package from upstream
    /// synchronously and stores it. The returned bytes stay gzip-encoded.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(MirrorError::DatabaseLocked.into());
        }

        let found = self.with_db(|db| db.view(|tx| Ok(tx.get(key).map(<[u8]>::to_vec))))?;

        match found {
            Some(data) => Ok(data),
            None => {
                tracing::info!(package = key, "package does not exist in local db");
                self.update_package(key, "")
            }
        }
    }

    /// Stream a tarball, caching it in the vault on first request.
    pub fn write_archive(&self, w: &mut dyn Write, pkg: &str, version: &str) -> Result<()> {
        let vault_key = format!("{pkg}/{version}");

        if !self.vault.has(&vault_key) {
            let url = if pkg.starts_with('@') {
                // encoded scope separator splits the scope from the name
                let mut parts = pkg.splitn(2, "%2f");
                let scope = parts.next().unwrap_or(pkg);
                let name = parts.next().unwrap_or(pkg);
                format!(
                    "{}/{}/{}/-/{}-{}.tgz",
                    self.config.source_server, scope, name, name, version
                )
            } else {
                format!(
                    "{}/{}/-/{}-{}.tgz",
                    self.config.source_server, pkg, pkg, version
                )
            };

            tracing::info!(url = %url, "create vault entry");

            // any non-200 upstream answer means the tarball is unavailable
            let response = match self.fetcher.get(&url) {
                Ok(response) => response,
                Err(err) => {
                    if err.downcast_ref::<MirrorError>().is_some() {
                        return Err(anyhow::Error::from(MirrorError::ResourceNotFound))
                            .with_context(|| format!("{url} is unavailable"));
                    }
                    return Err(err);
                }
            };

            let mut meta = Metadata::new();
            meta.insert("package".to_string(), pkg.to_string());
            meta.insert("version".to_string(), version.to_string());

            let mut body = response;
            if let Err(err) = self.vault.put(&vault_key, meta, &mut body) {
                tracing::info!(error = %err, "error while writing into vault");
                self.vault.remove(&vault_key)?;
                return Err(err);
            }
        }

        tracing::info!(package = pkg, version = version, "read vault entry");
        self.vault.get(&vault_key, w)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(store) = self.db.write().unwrap().take() {
            store.close()?;
        }
        Ok(())
    }
}

impl MirrorService for NpmService {
    fn init(&self) -> Result<()> {
        tracing::info!(code = %self.config.code, "init npm service");
        self.open_database()?;
        self.optimize()
    }

    fn serve(self: Arc<Self>, shutdown: Receiver<()>) -> Result<()> {
        tracing::info!(code = %self.config.code, "starting npm service");
        let mut iteration: u32 = 0;

        loop {
            tracing::info!("starting a new sync...");

            if let Err(err) = self.sync_packages() {
                tracing::error!(error = %err, "SyncPackages failed");
                self.state.error(format!("Sync failed: {err}"));
            }

            iteration += 1;
            if iteration >= COMPACT_EVERY {
                tracing::info!("starting database optimization");
                if let Err(err) = self.optimize() {
                    tracing::error!(error = %err, "database optimization failed");
                }
                iteration = 0;
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
