//! Composer (packagist-compatible) mirror.
//!
//! The upstream registry publishes a root manifest (`packages.json`)
//! pointing at provider blobs, which in turn map package names to
//! per-package shards addressed by content hash. The mirror re-downloads
//! shards whose upstream hash changed, rewrites every archive and
//! repository URL inside to the mirror-local form, recomputes the shard
//! hash over the rewritten document, and regenerates the provider blobs and
//! root manifest so the hash chain stays protocol-valid. A cleanup pass
//! walks the bucket in key order and drops shards and provider blobs that
//! no longer match their index.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::Receiver;
use pkgrelay_fetch::{self as fetch, Fetcher};
use pkgrelay_kv::{Compactor, Store};
use pkgrelay_pool::WorkerManager;
use pkgrelay_rewrite::{rewrite_archive, rewrite_repository};
use pkgrelay_state::StateSender;
use pkgrelay_types::MirrorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::service::{LoopStep, MirrorService, hold_between_runs};

/// Parallel shard downloads per sync pass.
const WORKER_COUNT: usize = 10;

/// Compact the bucket every this many sync iterations.
const COMPACT_EVERY: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sha256Ref {
    pub sha256: String,
}

pub type ProviderIncludes = BTreeMap<String, Sha256Ref>;

/// The root manifest (`packages.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagesResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notify: String,
    #[serde(rename = "notify-batch", default, skip_serializing_if = "String::is_empty")]
    pub notify_batch: String,
    #[serde(rename = "providers-url", default, skip_serializing_if = "String::is_empty")]
    pub providers_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub search: String,
    #[serde(rename = "provider-includes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_includes: ProviderIncludes,
}

/// A provider blob: package name to shard hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersResult {
    #[serde(default)]
    pub providers: BTreeMap<String, Sha256Ref>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistRef {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shasum: String,
}

/// One version entry inside a shard. Upstream documents carry heterogeneous
/// fields (`abandoned`, `extra`, `require`, ...); everything besides the
/// rewritten references is preserved verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<DistRef>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A full shard: versions keyed by package then version string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageResult {
    #[serde(default)]
    pub packages: BTreeMap<String, BTreeMap<String, PackageVersion>>,
}

/// The per-package index record.
///
/// `hash_source` is the upstream shard hash from the provider blob;
/// `hash_target` is the mirror-recomputed hash of the rewritten shard.
/// When the source hash changes, the shard at `<package>$<hash_target>`
/// must be rebuilt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageInformation {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub hash_source: String,
    #[serde(default)]
    pub hash_target: String,
    #[serde(skip)]
    pub url: String,
    #[serde(skip)]
    pub exist: bool,
    #[serde(skip)]
    pub result: PackageResult,
}

impl PackageInformation {
    pub fn target_key(&self) -> String {
        format!("{}${}", self.package, self.hash_target)
    }
}

#[derive(Debug, Clone)]
pub struct ComposerConfig {
    pub code: String,
    pub source_server: String,
    pub public_server: String,
    /// Directory holding `<code>.db`.
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
}

pub struct ComposerService {
    config: ComposerConfig,
    db: RwLock<Option<Store>>,
    locked: AtomicBool,
    state: StateSender,
    fetcher: Fetcher,
    providers_url: RwLock<String>,
    compactor: Compactor,
}

impl ComposerService {
    pub fn new(config: ComposerConfig, state: StateSender) -> Self {
        Self {
            config,
            db: RwLock::new(None),
            locked: AtomicBool::new(false),
            state,
            fetcher: Fetcher::new(),
            providers_url: RwLock::new("/p/%package%$%hash%.json".to_string()),
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

    /// Close, compact and reopen the bucket. Readers observe
    /// `DatabaseLocked` for the duration.
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

    fn package_key(&self, pkg: &PackageInformation) -> String {
        self.providers_url
            .read()
            .unwrap()
            .replace("%package%", &pkg.package)
            .replace("%hash%", &pkg.hash_source)
    }

    /// Upstream fetch location for one package shard.
    fn package_url(&self, pkg: &PackageInformation) -> String {
        format!("{}{}", self.config.source_server, self.package_key(pkg))
    }

    /// Refresh every package whose upstream shard hash changed.
    pub fn sync_packages(self: &Arc<Self>) -> Result<()> {
        tracing::info!(code = %self.config.code, "starting SyncPackages");
        self.state.running("Syncing packages");

        let fetcher = self.fetcher.clone();
        let mut pool: WorkerManager<PackageInformation, PackageInformation> =
            WorkerManager::new(WORKER_COUNT, move |id, input: Receiver<PackageInformation>, output| {
                for mut pkg in input {
                    tracing::debug!(
                        package = %pkg.package,
                        source_hash = %pkg.hash_source,
                        worker = id,
                        url = %pkg.url,
                        "loading package information"
                    );
                    match fetcher.load_remote_struct::<PackageResult>(&pkg.url) {
                        Ok(result) => {
                            pkg.result = result;
                            let _ = output.send(pkg);
                        }
                        Err(err) => {
                            tracing::error!(
                                package = %pkg.package,
                                url = %pkg.url,
                                error = %err,
                                "error loading package information"
                            );
                        }
                    }
                }
            });

        let svc = Arc::clone(self);
        pool.result_callback(move |mut pkg| {
            if let Err(err) = svc.save_package(&mut pkg) {
                tracing::error!(package = %pkg.package, error = %err, "unable to save package");
            }
        });
        pool.start();

        self.state.running("Loading packages.json");
        let url = format!("{}/packages.json", self.config.source_server);
        let root: PackagesResult = match self.fetcher.load_remote_struct(&url) {
            Ok(root) => root,
            Err(err) => {
                // abort the pass; never overwrite local entry points
                pool.wait();
                return Err(err).context("error loading packages.json");
            }
        };

        *self.providers_url.write().unwrap() = root.providers_url.clone();

        for (template, include) in &root.provider_includes {
            let path = template.replace("%hash%", &include.sha256);
            tracing::info!(
                provider = %template,
                provider_hash = %include.sha256,
                "loading provider information"
            );

            let url = format!("{}/{}", self.config.source_server, path);
            let providers: ProvidersResult = match self.fetcher.load_remote_struct(&url) {
                Ok(providers) => providers,
                Err(err) => {
                    tracing::error!(provider = %template, error = %err, "error loading provider information");
                    continue;
                }
            };

            for (name, sha) in providers.providers {
                let mut pkg = PackageInformation {
                    server: self.config.code.clone(),
                    package: name,
                    ..Default::default()
                };

                let lookup = self.with_db(|db| {
                    db.view(|tx| {
                        if let Some(data) = tx.get(&pkg.package) {
                            match fetch::unmarshal::<PackageInformation>(data) {
                                Ok(current) => pkg.exist = current.hash_source == sha.sha256,
                                Err(err) => tracing::error!(
                                    package = %pkg.package,
                                    error = %err,
                                    "unable to decode package information"
                                ),
                            }
                        }
                        Ok(())
                    })
                });
                if let Err(err) = lookup {
                    tracing::error!(package = %pkg.package, error = %err, "unable to read package index");
                }

                pkg.hash_source = sha.sha256;
                pkg.url = self.package_url(&pkg);

                if pkg.exist {
                    tracing::debug!(package = %pkg.package, "skipping package");
                } else {
                    tracing::info!(package = %pkg.package, "add/update package");
                    let _ = pool.add(pkg);
                }
            }
        }

        self.state.running("Wait for download to complete");
        pool.wait();

        Ok(())
    }

    /// Rewrite references, recompute the target hash and persist the shard
    /// plus its index record.
    fn save_package(&self, pkg: &mut PackageInformation) -> Result<()> {
        self.state
            .running(format!("Save package information: {}", pkg.package));

        let mut result = std::mem::take(&mut pkg.result);
        for versions in result.packages.values_mut() {
            for version in versions.values_mut() {
                if let Some(dist) = version.dist.as_mut()
                    && !dist.url.is_empty()
                {
                    dist.url = rewrite_archive(&self.config.public_server, &dist.url);
                }
                if let Some(source) = version.source.as_mut()
                    && !source.url.is_empty()
                {
                    source.url = rewrite_repository(&self.config.public_server, &source.url);
                }
            }
        }

        let data = serde_json::to_vec(&result).context("unable to encode shard")?;
        pkg.hash_target = hex::encode(Sha256::digest(&data));

        let shard = fetch::compress(&data).context("unable to compress shard")?;
        let target_key = pkg.target_key();
        let index = fetch::marshal(pkg).context("unable to encode package index")?;
        let package_key = pkg.package.clone();

        self.with_db(|db| {
            db.update(|tx| {
                tx.put(target_key, shard);
                tx.put(package_key, index);
                Ok(())
            })
        })
    }

    /// Regenerate provider blobs and the root manifest from the local
    /// target hashes, substituting mirror-local template strings.
    pub fn update_entry_points(&self) -> Result<()> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(MirrorError::SyncInProgress.into());
        }
        scopeguard::defer! {
            self.locked.store(false, Ordering::SeqCst);
        }

        tracing::info!(code = %self.config.code, "start UpdateEntryPoints");
        self.state.running("Update entry points");

        let url = format!("{}/packages.json", self.config.source_server);
        let mut root: PackagesResult = self
            .fetcher
            .load_remote_struct(&url)
            .context("error loading packages.json")?;

        let includes: Vec<(String, String)> = root
            .provider_includes
            .iter()
            .map(|(template, sha)| (template.clone(), sha.sha256.clone()))
            .collect();

        for (template, upstream_sha) in includes {
            let url = format!(
                "{}/{}",
                self.config.source_server,
                template.replace("%hash%", &upstream_sha)
            );
            // abort on failure: a partial manifest must not be published
            let mut providers: ProvidersResult = self
                .fetcher
                .load_remote_struct(&url)
                .with_context(|| format!("error loading provider {template}"))?;

            let names: Vec<String> = providers.providers.keys().cloned().collect();
            self.with_db(|db| {
                db.view(|tx| {
                    for name in &names {
                        let Some(data) = tx.get(name) else {
                            tracing::debug!(package = %name, "no local index for provider entry");
                            continue;
                        };
                        match fetch::unmarshal::<PackageInformation>(data) {
                            Ok(index) => {
                                if let Some(entry) = providers.providers.get_mut(name) {
                                    entry.sha256 = index.hash_target;
                                }
                            }
                            Err(err) => tracing::error!(
                                package = %name,
                                error = %err,
                                "error decoding package index"
                            ),
                        }
                    }
                    Ok(())
                })
            })?;

            // the blob hash is computed over the uncompressed document
            let encoded = serde_json::to_vec(&providers).context("unable to encode provider")?;
            let new_sha = hex::encode(Sha256::digest(&encoded));
            let path = template.replace("%hash%", &new_sha);

            if let Some(entry) = root.provider_includes.get_mut(&template) {
                entry.sha256 = new_sha;
            }

            self.with_db(|db| {
                db.update(|tx| {
                    tx.put(path.clone(), encoded);
                    Ok(())
                })
            })?;
            tracing::debug!(provider = %template, "saved provider");
        }

        let code = &self.config.code;
        root.providers_url = format!("/composer/{code}/p/%package%$%hash%.json");
        root.notify = format!("/composer/{code}/downloads/%package%");
        root.notify_batch = format!("/composer/{code}/downloads");
        root.search = format!("/composer/{code}/search.json?q=%query%&type=%type%");

        let encoded = serde_json::to_vec(&root).context("unable to encode packages.json")?;
        self.with_db(|db| {
            db.update(|tx| {
                tx.put("packages.json", encoded);
                Ok(())
            })
        })?;
        tracing::info!("end UpdateEntryPoints");

        self.state.running("End update entry points");
        Ok(())
    }

    /// Walk the bucket in key order and drop shards and provider blobs
    /// whose hash no longer matches the current index. Keys that cannot be
    /// attributed are logged as orphans and kept.
    pub fn clean_packages(&self) -> Result<()> {
        tracing::info!(code = %self.config.code, "start cleaning");
        self.state.running("Start cleaning packages");

        let data = self
            .get("packages.json")
            .context("error loading packages.json")?;
        let root: PackagesResult =
            serde_json::from_slice(&data).context("error decoding packages.json")?;

        let mut deletions: Vec<String> = Vec::new();

        self.with_db(|db| {
            db.view(|tx| {
                // lexicographic iteration: a package index key is always
                // visited before its shard keys
                let mut current: Option<PackageInformation> = None;

                tx.for_each(|key, value| {
                    let Some(pos) = key.find('$') else {
                        current = match fetch::unmarshal::<PackageInformation>(value) {
                            Ok(index) if !index.package.is_empty() => Some(index),
                            // plain-JSON records (root manifest, provider
                            // blobs) fail the gzip decode; they carry no
                            // shard of their own
                            _ => None,
                        };
                        return Ok(());
                    };

                    if key.starts_with("p/") {
                        for (template, include) in &root.provider_includes {
                            let Some(hash_at) = template.find("%hash%") else {
                                continue;
                            };
                            if template[..hash_at] == key[..=pos] && key.ends_with(".json") {
                                let stored = &key[pos + 1..key.len() - 5];
                                if stored != include.sha256 {
                                    tracing::info!(
                                        provider = %key,
                                        hash_target = %include.sha256,
                                        hash_current = %stored,
                                        "delete provider definition"
                                    );
                                    deletions.push(key.to_string());
                                }
                            }
                        }
                    } else if let Some(index) = &current {
                        if key[..pos] == *index.package {
                            if index.hash_target != key[pos + 1..] {
                                tracing::info!(
                                    package = %index.package,
                                    hash_target = %index.hash_target,
                                    hash_current = %&key[pos + 1..],
                                    "delete package definition"
                                );
                                deletions.push(key.to_string());
                            }
                        } else {
                            tracing::warn!(key, "orphan reference");
                        }
                    } else {
                        tracing::warn!(key, "orphan reference");
                    }
                    Ok(())
                })
            })
        })?;

        if !deletions.is_empty() {
            self.with_db(|db| {
                db.update(|tx| {
                    for key in &deletions {
                        tx.delete(key.clone());
                    }
                    Ok(())
                })
            })?;
        }

        self.state.running("End cleaning packages");
        Ok(())
    }

    /// Re-fetch one package on demand, then refresh the entry points.
    pub fn update_package(&self, name: &str) -> Result<()> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(MirrorError::SyncInProgress.into());
        }

        let name = name.split('$').next().unwrap_or(name);
        tracing::info!(package = %name, "explicit reload of package information");

        let stored = self.with_db(|db| {
            db.view(|tx| Ok(tx.get(name).map(<[u8]>::to_vec)))
        })?;
        let Some(data) = stored else {
            return Err(anyhow::Error::from(MirrorError::EmptyKey))
                .with_context(|| format!("unknown package {name}"));
        };

        let mut pkg = PackageInformation {
            package: name.to_string(),
            server: self.config.source_server.clone(),
            ..Default::default()
        };
        match fetch::unmarshal::<PackageInformation>(&data) {
            Ok(index) => {
                pkg.hash_source = index.hash_source;
                pkg.hash_target = index.hash_target;
            }
            Err(err) => {
                tracing::error!(package = %name, error = %err, "unable to decode package index");
            }
        }

        pkg.url = self.package_url(&pkg);
        pkg.result = self
            .fetcher
            .load_remote_struct(&pkg.url)
            .with_context(|| format!("error loading package information from {}", pkg.url))?;

        self.save_package(&mut pkg)?;
        self.update_entry_points()
    }

    /// Raw bucket read; shards come back still gzip-encoded.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(MirrorError::DatabaseLocked.into());
        }
        self.with_db(|db| {
            db.view(|tx| {
                tx.get(key)
                    .map(<[u8]>::to_vec)
                    .ok_or(MirrorError::EmptyKey)
                    .with_context(|| format!("no entry for {key}"))
            })
        })
    }

    /// Load the index record for a package.
    pub fn get_package(&self, key: &str) -> Result<PackageInformation> {
        let data = self.get(key)?;
        fetch::unmarshal(&data).with_context(|| format!("error decoding package index {key}"))
    }

    fn close(&self) -> Result<()> {
        if let Some(store) = self.db.write().unwrap().take() {
            store.close()?;
        }
        Ok(())
    }
}

impl MirrorService for ComposerService {
    fn init(&self) -> Result<()> {
        tracing::info!(code = %self.config.code, "init composer service");
        self.open_database()?;
        self.optimize()
    }

    fn serve(self: Arc<Self>, shutdown: Receiver<()>) -> Result<()> {
        tracing::info!(code = %self.config.code, "starting composer service");
        let mut iteration: u32 = 0;

        loop {
            tracing::info!("starting a new sync...");

            if let Err(err) = self.sync_packages() {
                tracing::error!(error = %err, "SyncPackages failed");
                self.state.error(format!("Sync failed: {err}"));
            }
            if let Err(err) = self.update_entry_points() {
                tracing::error!(error = %err, "UpdateEntryPoints failed");
                self.state.error(format!("Entry point update failed: {err}"));
            }
            if let Err(err) = self.clean_packages() {
                tracing::error!(error = %err, "CleanPackages failed");
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
