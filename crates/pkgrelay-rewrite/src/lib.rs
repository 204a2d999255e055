//! Pattern-driven URL rewriting for the mirrors.
//!
//! Upstream package documents reference archives and repositories on their
//! original hosts. During persistence those references are rewritten to the
//! mirror-local form so downstream clients fetch everything through the
//! mirror. Rewrites never happen at read time.
//!
//! A URL that already points at the public server is returned unchanged, so
//! applying a rewriter to its own output is the identity.
//!
//! # Example
//!
//! ```
//! use pkgrelay_rewrite::{rewrite_archive, rewrite_repository};
//!
//! let public = "https://mirrors.localhost";
//!
//! let dist = rewrite_archive(
//!     public,
//!     "https://api.github.com/repos/sonata-project/exporter/zipball/b9098b5007c525a238ddf44d578b8efae7bccc72",
//! );
//! assert_eq!(
//!     dist,
//!     "https://mirrors.localhost/git/github.com/sonata-project/exporter/b9098b5007c525a238ddf44d578b8efae7bccc72.zip"
//! );
//!
//! let source = rewrite_repository(public, "git@github.com:DavidForest/ImgBundle.git");
//! assert_eq!(source, "https://mirrors.localhost/git/github.com/DavidForest/ImgBundle.git");
//! ```

use std::sync::LazyLock;

use regex::Regex;

static GITHUB_ARCHIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"http(s|)://api\.([\w.-]+)/repos/([\w.-]+)/([\w.-]+)/zipball/(\w+)")
        .expect("valid pattern")
});

static BITBUCKET_ARCHIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"http(s|)://([\w.-]+)/([\w.-]+)/([\w.-]+)/get/(\w+)\.zip").expect("valid pattern")
});

static GITLAB_ARCHIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"http(s|)://([\w.-]+)/([\w.-]+)/([\w.-]+)/repository/archive\.zip\?ref=(\w+)")
        .expect("valid pattern")
});

static GIT_REPOSITORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(((git|http(s|)|ssh)://|git@))([\w.-]+@|)([\w.-]+)(/|:)([\w./-]+?)(\.git|)$")
        .expect("valid pattern")
});

static SVN_REPOSITORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(svn://(.*)|(.*)\.svn\.(.*))").expect("valid pattern"));

static NPM_ARCHIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"http(s|)://([\w.]+)/(.*)").expect("valid pattern"));

static CACHEABLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{40}|\w+\.\w+\.\w+(-\w+)?)$").expect("valid pattern"));

/// Rewrite a dist archive URL (github zipball, bitbucket get, gitlab
/// archive) to the mirror-local `<public>/git/<host>/<owner>/<repo>/<ref>.zip`
/// form. Anything unrecognised collapses to the public server itself.
pub fn rewrite_archive(public_server: &str, url: &str) -> String {
    if url.starts_with(public_server) {
        return url.to_string();
    }

    for pattern in [&*GITHUB_ARCHIVE, &*BITBUCKET_ARCHIVE, &*GITLAB_ARCHIVE] {
        if let Some(caps) = pattern.captures(url) {
            return format!(
                "{}/git/{}/{}/{}/{}.zip",
                public_server,
                &caps[2],
                &caps[3],
                &caps[4],
                &caps[5]
            );
        }
    }

    public_server.to_string()
}

/// Rewrite a source repository URL to `<public>/git/<host>/<path>.git`.
/// Subversion-looking URLs pass through unchanged (svn is not mirrored);
/// anything unrecognised collapses to the public server itself.
pub fn rewrite_repository(public_server: &str, url: &str) -> String {
    if url.starts_with(public_server) {
        return url.to_string();
    }

    if SVN_REPOSITORY.is_match(url) {
        return url.to_string();
    }

    if let Some(caps) = GIT_REPOSITORY.captures(url) {
        return format!("{}/git/{}/{}.git", public_server, &caps[6], &caps[8]);
    }

    public_server.to_string()
}

/// Rewrite an npm tarball URL to `<public>/npm/<code>/<rest>`. `None` when
/// the URL does not look like an http(s) archive location.
pub fn rewrite_npm_tarball(public_server: &str, code: &str, url: &str) -> Option<String> {
    if url.starts_with(public_server) {
        return Some(url.to_string());
    }

    NPM_ARCHIVE
        .captures(url)
        .map(|caps| format!("{}/npm/{}/{}", public_server, code, &caps[3]))
}

/// A ref is immutable — and its archive cacheable — when it is a 40-hex
/// commit id or a dotted `X.Y.Z[-PRE]` tag.
pub fn is_cacheable_ref(reference: &str) -> bool {
    CACHEABLE_REF.is_match(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC: &str = "https://mirrors.localhost";

    #[test]
    fn github_zipball_is_rewritten() {
        let rewritten = rewrite_archive(
            PUBLIC,
            "https://api.github.com/repos/sonata-project/exporter/zipball/b9098b5007c525a238ddf44d578b8efae7bccc72",
        );
        assert_eq!(
            rewritten,
            "https://mirrors.localhost/git/github.com/sonata-project/exporter/b9098b5007c525a238ddf44d578b8efae7bccc72.zip"
        );
    }

    #[test]
    fn bitbucket_archive_is_rewritten() {
        let rewritten = rewrite_archive(PUBLIC, "https://bitbucket.org/owner/repo/get/abcdef.zip");
        assert_eq!(
            rewritten,
            "https://mirrors.localhost/git/bitbucket.org/owner/repo/abcdef.zip"
        );
    }

    #[test]
    fn gitlab_archive_is_rewritten() {
        let rewritten = rewrite_archive(
            PUBLIC,
            "https://gitlab.com/owner/repo/repository/archive.zip?ref=master",
        );
        assert_eq!(
            rewritten,
            "https://mirrors.localhost/git/gitlab.com/owner/repo/master.zip"
        );
    }

    #[test]
    fn unknown_archive_collapses_to_public_server() {
        assert_eq!(
            rewrite_archive(PUBLIC, "https://example.org/some/file.tar.gz"),
            PUBLIC
        );
    }

    #[test]
    fn archive_rewrite_is_idempotent() {
        let once = rewrite_archive(
            PUBLIC,
            "https://api.github.com/repos/o/r/zipball/b9098b5007c525a238ddf44d578b8efae7bccc72",
        );
        assert_eq!(rewrite_archive(PUBLIC, &once), once);
    }

    #[test]
    fn ssh_style_repository_is_rewritten() {
        assert_eq!(
            rewrite_repository(PUBLIC, "git@github.com:DavidForest/ImgBundle.git"),
            "https://mirrors.localhost/git/github.com/DavidForest/ImgBundle.git"
        );
    }

    #[test]
    fn https_repository_is_rewritten() {
        assert_eq!(
            rewrite_repository(PUBLIC, "https://github.com/owner/repo.git"),
            "https://mirrors.localhost/git/github.com/owner/repo.git"
        );
    }

    #[test]
    fn repository_without_git_suffix_is_rewritten() {
        assert_eq!(
            rewrite_repository(PUBLIC, "https://github.com/owner/repo"),
            "https://mirrors.localhost/git/github.com/owner/repo.git"
        );
    }

    #[test]
    fn ssh_scheme_repository_is_rewritten() {
        assert_eq!(
            rewrite_repository(PUBLIC, "ssh://git@github.com/owner/repo.git"),
            "https://mirrors.localhost/git/github.com/owner/repo.git"
        );
    }

    #[test]
    fn svn_urls_pass_through() {
        let url = "https://m10s.svn.beanstalkapp.com/m10s-common";
        assert_eq!(rewrite_repository(PUBLIC, url), url);
        assert_eq!(
            rewrite_repository(PUBLIC, "svn://svn.example.org/trunk"),
            "svn://svn.example.org/trunk"
        );
    }

    #[test]
    fn repository_rewrite_is_idempotent() {
        let once = rewrite_repository(PUBLIC, "git@github.com:owner/repo.git");
        assert_eq!(rewrite_repository(PUBLIC, &once), once);
    }

    #[test]
    fn npm_tarball_is_rewritten() {
        let rewritten = rewrite_npm_tarball(
            "http://localhost:8000",
            "npm",
            "https://registry.npmjs.org/angular-nvd3-nb/-/angular-nvd3-nb-1.0.5-nb.tgz",
        );
        assert_eq!(
            rewritten.as_deref(),
            Some("http://localhost:8000/npm/npm/angular-nvd3-nb/-/angular-nvd3-nb-1.0.5-nb.tgz")
        );
    }

    #[test]
    fn npm_tarball_rewrite_rejects_non_http() {
        assert_eq!(rewrite_npm_tarball(PUBLIC, "npm", "file:///tmp/x.tgz"), None);
    }

    #[test]
    fn cacheable_refs() {
        assert!(is_cacheable_ref("9b9cc9573693611badb397b5d01a1e6645704da7"));
        assert!(is_cacheable_ref("1.2.3"));
        assert!(is_cacheable_ref("1.2.3-rc1"));
        assert!(is_cacheable_ref("v1.2.3"));
        assert!(!is_cacheable_ref("master"));
        assert!(!is_cacheable_ref("feature/new-layout"));
        assert!(!is_cacheable_ref("1.2"));
    }
}
