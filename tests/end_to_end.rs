//! Launches real sandboxes through the namespace backend
//!
//! Every test returns early when `bwrap` is missing or cannot create
//! namespaces on this host (common inside containers).

#![cfg(target_os = "linux")]

use std::path::Path;
use std::process::Command;

use kennel::{BackendKind, Sandbox, SandboxRequest, SandboxRequestBuilder};

/// System directories a dynamically linked shell needs
const SYSTEM_DIRS: [&str; 4] = ["/usr", "/bin", "/lib", "/lib64"];

fn bwrap_works() -> bool {
    let Ok(bwrap) = which::which("bwrap") else {
        eprintln!("skipping: bwrap not installed");
        return false;
    };
    let ok = Command::new(bwrap)
        .args(["--ro-bind", "/", "/", "--unshare-all", "true"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if !ok {
        eprintln!("skipping: bwrap cannot create namespaces here");
    }
    ok
}

fn shell(script: &str, id: &str) -> SandboxRequestBuilder {
    SandboxRequest::builder(["/bin/sh", "-c", script], id).readable_paths(SYSTEM_DIRS)
}

#[tokio::test]
async fn test_selects_namespace_backend() {
    if !bwrap_works() {
        return;
    }
    let request = shell("true", "e2e-select").build().unwrap();
    assert_eq!(
        Sandbox::new().select_backend(&request).unwrap(),
        BackendKind::Namespace
    );
}

#[tokio::test]
async fn test_stdout_and_exit_code() {
    if !bwrap_works() {
        return;
    }
    let request = shell("echo hello; exit 7", "e2e-echo").build().unwrap();
    let mut child = kennel::launch(&request).await.unwrap();
    let output = child.communicate(None).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    assert_eq!(output.status.code(), Some(7));
}

#[tokio::test]
async fn test_stdin_reaches_child() {
    if !bwrap_works() {
        return;
    }
    let request = shell("cat", "e2e-stdin").build().unwrap();
    let mut child = kennel::launch(&request).await.unwrap();
    let output = child.communicate(Some(b"piped input".to_vec())).await.unwrap();
    assert_eq!(output.stdout, b"piped input");
    assert!(output.status.success());
}

#[tokio::test]
async fn test_writable_path_persists_on_host() {
    if !bwrap_works() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out.txt");
    let script = format!("echo written > {}", target.display());
    let request = shell(&script, "e2e-write")
        .writable(dir.path())
        .build()
        .unwrap();

    let mut child = kennel::launch(&request).await.unwrap();
    let output = child.communicate(None).await.unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(std::fs::read_to_string(&target).unwrap().trim(), "written");
}

#[tokio::test]
async fn test_readable_path_rejects_writes() {
    if !bwrap_works() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let script = format!("echo nope > {}/blocked.txt", dir.path().display());
    let request = shell(&script, "e2e-readonly")
        .readable(dir.path())
        .build()
        .unwrap();

    let mut child = kennel::launch(&request).await.unwrap();
    let output = child.communicate(None).await.unwrap();
    assert!(!output.status.success());
    assert!(!dir.path().join("blocked.txt").exists());
}

#[tokio::test]
async fn test_ungranted_path_is_invisible() {
    if !bwrap_works() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("secret"), "hidden").unwrap();
    let script = format!("test -e {}/secret", dir.path().display());
    let request = shell(&script, "e2e-hidden").build().unwrap();

    let mut child = kennel::launch(&request).await.unwrap();
    let status = child.wait(None).await.unwrap();
    assert_eq!(status.code(), Some(1));
}

#[tokio::test]
async fn test_ensure_exists_creates_directory() {
    if !bwrap_works() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("nested").join("cache");
    let script = format!("touch {}/entry", cache.display());
    let request = shell(&script, "e2e-ensure")
        .writable_ensure_exists(&cache)
        .build()
        .unwrap();

    let mut child = kennel::launch(&request).await.unwrap();
    assert_eq!(child.keep_alive_count(), 1);
    let status = child.wait(None).await.unwrap();
    assert!(status.success());
    assert!(Path::new(&cache).join("entry").exists());
}
