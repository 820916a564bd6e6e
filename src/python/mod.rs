//! Readable paths a Python interpreter needs inside a sandbox
//!
//! Discovery asks a fresh interpreter what it loads, so nothing imported by
//! the calling process leaks into the grant list. Results are cached per
//! interpreter until [`invalidate_runtime_paths`] is called.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;

use crate::config::{SandboxRequest, SandboxRequestBuilder};
use crate::error::{Error, Result};
use crate::policy::PathSet;

static CACHE: Mutex<BTreeMap<PathBuf, Vec<PathBuf>>> = Mutex::new(BTreeMap::new());

/// Imports that pull in dynamically loaded extension modules
const QUERY: &str = r#"
import json, os, sys
for name in ("socket", "sqlite3", "threading", "ssl"):
    try:
        __import__(name)
    except ImportError:
        pass
print(json.dumps({
    "modules": [getattr(m, "__file__", None) for m in list(sys.modules.values())],
    "path": sys.path,
    "stdlib": os.path.dirname(os.__file__),
}))
"#;

#[derive(Debug, Deserialize)]
#[cfg_attr(windows, allow(dead_code))]
struct Report {
    modules: Vec<Option<String>>,
    path: Vec<String>,
    stdlib: String,
}

/// Readable grants for running `interpreter` in a sandbox
pub fn runtime_paths(interpreter: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let interpreter = resolve(interpreter.as_ref())?;
    let mut cache = CACHE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(paths) = cache.get(&interpreter) {
        return Ok(paths.clone());
    }
    let paths = discover(&interpreter)?.into_vec();
    tracing::debug!(interpreter = %interpreter.display(), count = paths.len(), "python: runtime paths discovered");
    cache.insert(interpreter, paths.clone());
    Ok(paths)
}

/// Forget every cached discovery result
pub fn invalidate_runtime_paths() {
    CACHE.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

/// A request running `interpreter args...` with its runtime paths readable
pub fn python_request(
    interpreter: impl AsRef<Path>,
    args: impl IntoIterator<Item = impl Into<String>>,
    id: impl Into<String>,
) -> Result<SandboxRequestBuilder> {
    let interpreter = resolve(interpreter.as_ref())?;
    let paths = runtime_paths(&interpreter)?;
    let command = std::iter::once(interpreter.to_string_lossy().into_owned())
        .chain(args.into_iter().map(Into::into));
    Ok(SandboxRequest::builder(command, id).readable_paths(paths))
}

fn resolve(interpreter: &Path) -> Result<PathBuf> {
    if interpreter.is_absolute() {
        return Ok(interpreter.to_path_buf());
    }
    which::which(interpreter).map_err(|_| Error::ToolNotFound("python"))
}

#[cfg_attr(windows, allow(dead_code))]
fn query(interpreter: &Path) -> Result<Report> {
    let output = Command::new(interpreter)
        .args(["-c", QUERY])
        .output()
        .map_err(|e| Error::os_path("run interpreter", interpreter, e))?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            code: output.status.code().unwrap_or(-1),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn parent_of(path: &Path) -> Option<PathBuf> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

#[cfg(target_os = "linux")]
fn discover(interpreter: &Path) -> Result<PathSet> {
    let mut paths = PathSet::new();
    paths.insert("/bin/sh");
    paths.insert(interpreter);

    let ldd = which::which("ldd").ok();
    let add_libraries = |paths: &mut PathSet, binary: &Path| {
        if let Some(ldd) = &ldd {
            shared_objects(ldd, binary, paths);
        }
    };
    add_libraries(&mut paths, interpreter);

    let report = query(interpreter)?;
    for file in report.modules.iter().flatten().map(PathBuf::from) {
        if let Some(dir) = parent_of(&file) {
            paths.insert(dir);
        }
        if is_executable(&file) {
            add_libraries(&mut paths, &file);
        }
    }
    paths.insert(report.stdlib);
    for entry in report.path.iter().filter(|p| !p.is_empty()) {
        let entry = Path::new(entry);
        if entry.exists() {
            paths.insert(entry);
        }
    }

    for ldconfig in expand_glob("/sbin/ldconfig*") {
        paths.insert(ldconfig);
    }
    for tool in ["gcc", "cc", "ldconfig", "objdump"] {
        if let Ok(binary) = which::which(tool) {
            paths.insert(&binary);
            add_libraries(&mut paths, &binary);
        }
    }

    // glibc loads libgcc_s lazily on thread cancellation, so ldd misses it.
    for pattern in [
        "/lib/libgcc_s.so*",
        "/lib64/libgcc_s.so*",
        "/usr/lib/libgcc_s.so*",
        "/usr/lib64/libgcc_s.so*",
    ] {
        for path in expand_glob(pattern) {
            paths.insert(path);
        }
    }

    parse_so_conf(Path::new("/etc/ld.so.conf"), &mut paths);
    let cache = Path::new("/etc/ld.so.cache");
    if cache.exists() {
        paths.insert(cache);
    }
    Ok(paths)
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn discover(interpreter: &Path) -> Result<PathSet> {
    let mut paths = PathSet::new();
    #[cfg(target_os = "freebsd")]
    {
        for dir in ["/libexec", "/usr/lib", "/usr/local/bin", "/usr/local/lib", "/lib"] {
            paths.insert(dir);
        }
        for hints in expand_glob("/var/run/ld-elf*.hints") {
            paths.insert(hints);
        }
    }
    if let Some(dir) = parent_of(interpreter) {
        paths.insert(dir);
    }
    paths.insert(query(interpreter)?.stdlib);
    Ok(paths)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn discover(interpreter: &Path) -> Result<PathSet> {
    let mut paths = PathSet::new();
    if let Some(dir) = parent_of(interpreter) {
        paths.insert(dir);
    }
    Ok(paths)
}

/// Add the shared objects `ldd` reports for `binary`
#[cfg(target_os = "linux")]
fn shared_objects(ldd: &Path, binary: &Path, paths: &mut PathSet) {
    match Command::new(ldd).arg(binary).output() {
        Ok(output) => {
            for path in parse_ldd(&String::from_utf8_lossy(&output.stdout)) {
                paths.insert(path);
            }
        }
        Err(e) => {
            tracing::warn!(binary = %binary.display(), error = %e, "python: ldd failed");
        }
    }
}

/// Absolute library paths from `ldd` output
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ldd(output: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let Some(first) = fields.first().filter(|f| f.starts_with('/')) {
            found.push(PathBuf::from(first));
        }
        if let Some(target) = fields.get(2).filter(|f| f.starts_with('/')) {
            found.push(PathBuf::from(target));
        }
    }
    found
}

#[cfg(target_os = "linux")]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o001 != 0)
        .unwrap_or(false)
}

/// Library directories listed by an `ld.so.conf` file and its includes
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_so_conf(path: &Path, paths: &mut PathSet) {
    let Ok(text) = fs::read_to_string(path) else {
        return;
    };
    for line in text.lines().map(str::trim) {
        if let Some(pattern) = line.strip_prefix("include ") {
            for included in expand_glob(pattern.trim()) {
                if let Some(dir) = parent_of(&included) {
                    paths.insert(dir);
                }
                parse_so_conf(&included, paths);
            }
        } else if !line.is_empty() && !line.starts_with('#') {
            paths.insert(line);
        }
    }
}

/// Paths matching a shell pattern, in sorted order
#[cfg_attr(not(any(target_os = "linux", target_os = "freebsd")), allow(dead_code))]
fn expand_glob(pattern: &str) -> Vec<PathBuf> {
    match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(|entry| entry.ok()).collect(),
        Err(err) => {
            tracing::debug!(pattern, error = %err, "python: skipping invalid pattern");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ldd_output() {
        let output = "\tlinux-vdso.so.1 (0x00007ffd)\n\
                      \tlibm.so.6 => /lib/x86_64-linux-gnu/libm.so.6 (0x00007f)\n\
                      \t/lib64/ld-linux-x86-64.so.2 (0x00007f)\n";
        assert_eq!(
            parse_ldd(output),
            [
                PathBuf::from("/lib/x86_64-linux-gnu/libm.so.6"),
                PathBuf::from("/lib64/ld-linux-x86-64.so.2"),
            ]
        );
    }

    #[test]
    fn test_expand_glob_matches_classes() {
        let temp = tempfile::tempdir().unwrap();
        for name in ["libgcc_s.so.1", "ld-elf32.hints", "ld-elfx.hints", "libc.conf.bak"] {
            fs::write(temp.path().join(name), "").unwrap();
        }
        let dir = temp.path().display();

        assert_eq!(
            expand_glob(&format!("{dir}/libgcc_s.so*")),
            [temp.path().join("libgcc_s.so.1")]
        );
        assert_eq!(
            expand_glob(&format!("{dir}/ld-elf[0-9][0-9].hints")),
            [temp.path().join("ld-elf32.hints")]
        );
        assert_eq!(
            expand_glob(&format!("{dir}/ld-elf?.hints")),
            [temp.path().join("ld-elfx.hints")]
        );
        assert!(expand_glob(&format!("{dir}/*.conf")).is_empty());
        assert!(expand_glob(&format!("{dir}/[")).is_empty());
    }

    #[test]
    fn test_so_conf_follows_includes() {
        let temp = tempfile::tempdir().unwrap();
        let conf_d = temp.path().join("ld.so.conf.d");
        fs::create_dir(&conf_d).unwrap();
        fs::write(conf_d.join("a.conf"), "# comment\n/opt/a/lib\n").unwrap();
        fs::write(conf_d.join("b.txt"), "/opt/ignored\n").unwrap();
        let main = temp.path().join("ld.so.conf");
        fs::write(
            &main,
            format!("include {}/*.conf\n/usr/local/lib\n", conf_d.display()),
        )
        .unwrap();

        let mut paths = PathSet::new();
        parse_so_conf(&main, &mut paths);
        let found = paths.sorted();
        assert!(found.contains(&PathBuf::from("/opt/a/lib")));
        assert!(found.contains(&PathBuf::from("/usr/local/lib")));
        assert!(found.contains(&conf_d));
        assert!(!found.contains(&PathBuf::from("/opt/ignored")));
    }

    #[test]
    fn test_python_request_includes_runtime_paths() {
        let Ok(python) = which::which("python3") else {
            return;
        };
        let request = python_request(&python, ["-c", "print(1)"], "py")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.program(), python.to_string_lossy());
        assert!(!request.readable_paths().is_empty());

        invalidate_runtime_paths();
        let again = runtime_paths(&python).unwrap();
        assert_eq!(again.len(), request.readable_paths().len());
    }
}
