//! Git mirror.
//!
//! Keeps a fleet of bare clones under `<data_dir>/<code>/` (repository
//! paths include the upstream host, e.g. `github.com/owner/repo.git`),
//! fetches them periodically, clones missing repositories on demand from a
//! configured template, and streams `git archive` zips. Archives of
//! immutable refs (commit ids and release tags) are cached in the vault;
//! mutable refs are always re-archived.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam::channel::Receiver;
use pkgrelay_rewrite::is_cacheable_ref;
use pkgrelay_state::StateSender;
use pkgrelay_types::MirrorError;
use pkgrelay_vault::{Metadata, Vault};

use crate::service::{LoopStep, MirrorService, hold_between_runs};

#[derive(Debug, Clone)]
pub struct GitConfig {
    pub code: String,
    /// Upstream host as it appears in mirrored paths (`github.com`).
    pub server: String,
    pub public_server: String,
    /// Root of the bare-clone fleet (`<DataDir>/git`).
    pub data_dir: PathBuf,
    /// Git binary to invoke.
    pub binary: String,
    /// Clone template; `{path}` is replaced by the repository path.
    pub clone_template: Option<String>,
    pub sync_interval: Duration,
}

pub struct GitService {
    config: GitConfig,
    vault: Vault,
    state: StateSender,
}

impl GitService {
    pub fn new(config: GitConfig, state: StateSender, vault: Vault) -> Self {
        Self {
            config,
            vault,
            state,
        }
    }

    pub fn code(&self) -> &str {
        &self.config.code
    }

    pub fn server(&self) -> &str {
        &self.config.server
    }

    pub fn clone_configured(&self) -> bool {
        self.config.clone_template.is_some()
    }

    pub fn binary(&self) -> &str {
        &self.config.binary
    }

    fn mirror_root(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.code)
    }

    /// On-disk location of a mirrored repository.
    pub fn repository_path(&self, path: &str) -> PathBuf {
        self.mirror_root().join(path)
    }

    /// Fetch every bare clone under the mirror root, sequentially. A
    /// failing repository is logged and skipped; the sweep continues.
    pub fn sync_repositories(&self) {
        let root = self.mirror_root();
        tracing::info!(code = %self.config.code, datadir = %root.display(), "sync repositories");

        let mut paths: Vec<PathBuf> = Vec::new();
        for depth in ["*.git", "*/*.git", "*/*/*.git"] {
            let pattern = format!("{}/{}", root.display(), depth);
            match glob::glob(&pattern) {
                Ok(matches) => paths.extend(matches.flatten()),
                Err(err) => {
                    tracing::error!(pattern = %pattern, error = %err, "invalid glob pattern");
                }
            }
        }

        for path in paths {
            let rel = path
                .strip_prefix(&root)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| path.display().to_string());

            self.state.running(format!("Fetch {rel}"));
            tracing::info!(path = %rel, "sync repository");

            if let Err(err) = self.run_git(&path, &["fetch"]) {
                tracing::error!(path = %rel, error = %err, "error while running the fetch command");
                continue;
            }
            // keep dumb-protocol metadata current for plain-http clients
            if let Err(err) = self.run_git(&path, &["update-server-info"]) {
                tracing::error!(path = %rel, error = %err, "error while running the update-server-info command");
                continue;
            }

            tracing::debug!(path = %rel, "completed the fetch command");
        }
    }

    fn run_git(&self, cwd: &std::path::Path, args: &[&str]) -> Result<()> {
        let status = Command::new(&self.config.binary)
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to run git {args:?} in {}", cwd.display()))?;
        if !status.success() {
            bail!("git {:?} exited with {}", args, status);
        }
        Ok(())
    }

    /// Stream a zip archive of `ref` in the repository at `path`.
    /// Immutable refs are served through the vault cache.
    pub fn write_archive(&self, w: &mut dyn Write, path: &str, reference: &str) -> Result<()> {
        if is_cacheable_ref(reference) {
            self.cache_archive(w, path, reference)
        } else {
            self.archive_to(w, path, reference)
        }
    }

    fn cache_archive(&self, w: &mut dyn Write, path: &str, reference: &str) -> Result<()> {
        let vault_key = format!("{}:{}/{}", self.config.code, path, reference);

        if !self.vault.has(&vault_key) {
            tracing::info!(path, reference, "create vault entry");

            let mut child = Command::new(&self.config.binary)
                .args(["archive", "--format=zip", reference])
                .current_dir(self.repository_path(path))
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .context("failed to start the archive command")?;

            let mut stdout = child
                .stdout
                .take()
                .context("archive command has no stdout")?;

            let mut meta = Metadata::new();
            meta.insert("path".to_string(), path.to_string());
            meta.insert("ref".to_string(), reference.to_string());

            let put = self.vault.put(&vault_key, meta, &mut stdout);
            let status = child.wait().context("failed to wait for the archive command")?;

            if let Err(err) = put {
                tracing::info!(error = %err, "error while writing into vault");
                self.vault.remove(&vault_key)?;
                return Err(err);
            }
            if !status.success() {
                self.vault.remove(&vault_key)?;
                bail!("git archive exited with {status}");
            }
        }

        tracing::info!(path, reference, "read vault entry");
        self.vault.get(&vault_key, w)?;
        Ok(())
    }

    fn archive_to(&self, w: &mut dyn Write, path: &str, reference: &str) -> Result<()> {
        let mut child = Command::new(&self.config.binary)
            .args(["archive", "--format=zip", reference])
            .current_dir(self.repository_path(path))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to start the archive command")?;

        let mut stdout = child
            .stdout
            .take()
            .context("archive command has no stdout")?;
        if let Err(err) = std::io::copy(&mut stdout, w) {
            tracing::error!(error = %err, "error while reading stdout from the archive command");
        }

        let status = child.wait().context("failed to wait for the archive command")?;
        if !status.success() {
            bail!("git archive exited with {status}");
        }

        tracing::info!(path, reference, "completed the archive command");
        Ok(())
    }

    /// Is the repository already mirrored locally?
    pub fn has(&self, path: &str) -> bool {
        let repo = self.repository_path(path);
        let has = repo.exists();
        tracing::debug!(path = %repo.display(), has, "has repository?");
        has
    }

    /// Clone a missing repository from the configured template. Refused
    /// when the template has no `{path}` placeholder.
    pub fn clone_repository(&self, path: &str) -> Result<()> {
        let template = self
            .config
            .clone_template
            .as_deref()
            .ok_or(MirrorError::SameKey)
            .context("no clone template configured")?;

        let remote = template.replace("{path}", path);
        if remote == template {
            return Err(anyhow::Error::from(MirrorError::SameKey))
                .context("clone template is missing the {path} placeholder");
        }

        let local = self.repository_path(path);
        tracing::info!(path, remote = %remote, "cloning remote repository");

        let status = Command::new(&self.config.binary)
            .args(["clone", "--mirror", &remote])
            .arg(&local)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("failed to start the clone command")?;
        if !status.success() {
            bail!("git clone of {remote} exited with {status}");
        }

        Ok(())
    }
}

impl MirrorService for GitService {
    fn init(&self) -> Result<()> {
        let root = self.mirror_root();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(())
    }

    fn serve(self: Arc<Self>, shutdown: Receiver<()>) -> Result<()> {
        tracing::info!(code = %self.config.code, "starting git service");

        loop {
            tracing::info!("starting a new sync...");
            self.sync_repositories();

            match hold_between_runs(&self.state, &shutdown, self.config.sync_interval) {
                LoopStep::Continue => continue,
                LoopStep::Cancelled => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::process::Command;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn init_origin(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .expect("run git");
            assert!(status.success(), "git {args:?}");
        };
        run(&["init", "--quiet"]);
        run(&["config", "user.email", "mirror@example.net"]);
        run(&["config", "user.name", "Mirror"]);
        std::fs::write(dir.join("README"), "hello\n").expect("write file");
        run(&["add", "README"]);
        run(&["commit", "--quiet", "-m", "initial"]);
        run(&["tag", "1.0.0"]);
    }

    fn head_commit(dir: &std::path::Path) -> String {
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .expect("rev-parse");
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn service(dir: &std::path::Path, clone_template: Option<String>) -> GitService {
        let (state_tx, _state_rx) = unbounded();
        GitService::new(
            GitConfig {
                code: "local".to_string(),
                server: "local".to_string(),
                public_server: "http://localhost:8000".to_string(),
                data_dir: dir.join("data/git"),
                binary: "git".to_string(),
                clone_template,
                sync_interval: Duration::from_secs(60),
            },
            StateSender::new("git.local", state_tx),
            Vault::filesystem(dir.join("cache/git")),
        )
    }

    #[test]
    fn archive_of_mutable_ref_is_not_cached() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(dir.path(), None);
        svc.init().expect("init");

        let repo = svc.repository_path("local/foo.git");
        std::fs::create_dir_all(&repo).expect("mkdir");
        init_origin(&repo);

        let mut out = Vec::new();
        svc.write_archive(&mut out, "local/foo.git", "master")
            .or_else(|_| {
                out.clear();
                svc.write_archive(&mut out, "local/foo.git", "main")
            })
            .expect("archive");

        // zip local file header signature
        assert_eq!(&out[..2], b"PK");
        assert!(!svc.vault.has("local:local/foo.git/master"));
        assert!(!svc.vault.has("local:local/foo.git/main"));
    }

    #[test]
    fn archive_of_commit_id_is_cached_and_stable() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(dir.path(), None);
        svc.init().expect("init");

        let repo = svc.repository_path("local/foo.git");
        std::fs::create_dir_all(&repo).expect("mkdir");
        init_origin(&repo);
        let commit = head_commit(&repo);

        let mut first = Vec::new();
        svc.write_archive(&mut first, "local/foo.git", &commit)
            .expect("first archive");
        assert!(svc.vault.has(&format!("local:local/foo.git/{commit}")));

        let mut second = Vec::new();
        svc.write_archive(&mut second, "local/foo.git", &commit)
            .expect("second archive");
        assert_eq!(first, second, "cached archive bytes are identical");
        assert_eq!(&first[..2], b"PK");
    }

    #[test]
    fn archive_of_release_tag_is_cached() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(dir.path(), None);
        svc.init().expect("init");

        let repo = svc.repository_path("local/foo.git");
        std::fs::create_dir_all(&repo).expect("mkdir");
        init_origin(&repo);

        let mut out = Vec::new();
        svc.write_archive(&mut out, "local/foo.git", "1.0.0")
            .expect("archive");
        assert!(svc.vault.has("local:local/foo.git/1.0.0"));
    }

    #[test]
    fn archive_of_unknown_ref_fails_and_caches_nothing() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(dir.path(), None);
        svc.init().expect("init");

        let repo = svc.repository_path("local/foo.git");
        std::fs::create_dir_all(&repo).expect("mkdir");
        init_origin(&repo);

        let bogus = "0000000000000000000000000000000000000000";
        let mut out = Vec::new();
        assert!(svc.write_archive(&mut out, "local/foo.git", bogus).is_err());
        assert!(!svc.vault.has(&format!("local:local/foo.git/{bogus}")));
    }

    #[test]
    fn clone_from_template_makes_repository_available() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");

        let origin = dir.path().join("origin/foo.git");
        std::fs::create_dir_all(&origin).expect("mkdir");
        init_origin(&origin);

        let template = format!("{}/origin/{{path}}", dir.path().display());
        let svc = service(dir.path(), Some(template));
        svc.init().expect("init");

        assert!(!svc.has("foo.git"));
        svc.clone_repository("foo.git").expect("clone");
        assert!(svc.has("foo.git"));

        // the clone is bare and archivable
        let commit = head_commit(&origin);
        let mut out = Vec::new();
        svc.write_archive(&mut out, "foo.git", &commit).expect("archive");
        assert_eq!(&out[..2], b"PK");
    }

    #[test]
    fn clone_without_placeholder_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(dir.path(), Some("https://example.net/fixed.git".to_string()));

        let err = svc.clone_repository("foo.git").expect_err("no placeholder");
        assert!(MirrorError::matches(&err, MirrorError::SameKey));
    }

    #[test]
    fn clone_without_template_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(dir.path(), None);

        let err = svc.clone_repository("foo.git").expect_err("no template");
        assert!(MirrorError::matches(&err, MirrorError::SameKey));
    }

    #[test]
    fn sync_sweep_survives_a_broken_repository() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(dir.path(), None);
        svc.init().expect("init");

        // a directory that is not a git repository
        let broken = svc.repository_path("local/broken.git");
        std::fs::create_dir_all(&broken).expect("mkdir");

        let healthy = svc.repository_path("local/foo.git");
        std::fs::create_dir_all(&healthy).expect("mkdir");
        init_origin(&healthy);

        // must not panic or abort on the broken entry
        svc.sync_repositories();
    }
}
