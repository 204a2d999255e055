//! Read-only git smart-http plumbing.
//!
//! Serving shells out to `git upload-pack --stateless-rpc`, the same
//! transport `git http-backend` drives: ref advertisement for
//! `GET info/refs?service=git-upload-pack`, pack streaming for
//! `POST git-upload-pack`. Receive-pack is refused by the router, which
//! keeps the mirror strictly read-only.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

pub const UPLOAD_PACK: &str = "git-upload-pack";
pub const RECEIVE_PACK: &str = "git-receive-pack";

/// Content type of the `info/refs` advertisement.
pub const ADVERTISEMENT_TYPE: &str = "application/x-git-upload-pack-advertisement";

/// Content type of the pack result stream.
pub const RESULT_TYPE: &str = "application/x-git-upload-pack-result";

/// pkt-line service banner followed by a flush packet.
fn advertisement_banner(service: &str) -> Vec<u8> {
    let line = format!("# service={service}\n");
    let mut banner = format!("{:04x}{line}", line.len() + 4).into_bytes();
    banner.extend_from_slice(b"0000");
    banner
}

/// Write the upload-pack ref advertisement for `repo`.
pub fn advertise_refs(binary: &str, repo: &Path, w: &mut dyn Write) -> Result<()> {
    let output = Command::new(binary)
        .args(["upload-pack", "--stateless-rpc", "--advertise-refs", "."])
        .current_dir(repo)
        .stderr(Stdio::null())
        .output()
        .context("failed to run upload-pack advertisement")?;
    if !output.status.success() {
        bail!("upload-pack advertisement exited with {}", output.status);
    }

    w.write_all(&advertisement_banner(UPLOAD_PACK))?;
    w.write_all(&output.stdout)?;
    Ok(())
}

/// Run one stateless upload-pack exchange: feed the client request into
/// git, stream the pack back out.
pub fn upload_pack(
    binary: &str,
    repo: &Path,
    input: &mut dyn Read,
    w: &mut dyn Write,
) -> Result<()> {
    let mut child = Command::new(binary)
        .args(["upload-pack", "--stateless-rpc", "."])
        .current_dir(repo)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to start upload-pack")?;

    {
        let mut stdin = child.stdin.take().context("upload-pack has no stdin")?;
        std::io::copy(input, &mut stdin).context("failed to feed upload-pack")?;
    }

    let mut stdout = child.stdout.take().context("upload-pack has no stdout")?;
    std::io::copy(&mut stdout, w).context("failed to stream pack")?;

    let status = child.wait().context("failed to wait for upload-pack")?;
    if !status.success() {
        bail!("upload-pack exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn init_bare_with_commit(dir: &Path) {
        let work = dir.join("work");
        std::fs::create_dir_all(&work).expect("mkdir");
        let run = |cwd: &Path, args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(cwd)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?}");
        };
        run(&work, &["init", "--quiet"]);
        run(&work, &["config", "user.email", "mirror@example.net"]);
        run(&work, &["config", "user.name", "Mirror"]);
        std::fs::write(work.join("file"), "data\n").expect("write");
        run(&work, &["add", "file"]);
        run(&work, &["commit", "--quiet", "-m", "one"]);
        run(
            dir,
            &["clone", "--quiet", "--mirror", work.to_str().expect("utf8"), "repo.git"],
        );
    }

    #[test]
    fn banner_has_pkt_line_length() {
        let banner = advertisement_banner(UPLOAD_PACK);
        // "# service=git-upload-pack\n" is 26 bytes, +4 for the length
        assert!(banner.starts_with(b"001e# service=git-upload-pack\n"));
        assert!(banner.ends_with(b"0000"));
    }

    #[test]
    fn advertisement_lists_refs() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        init_bare_with_commit(dir.path());

        let mut out = Vec::new();
        advertise_refs("git", &dir.path().join("repo.git"), &mut out).expect("advertise");

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("001e# service=git-upload-pack\n0000"));
        assert!(text.contains("refs/heads/"), "{text}");
    }
}
