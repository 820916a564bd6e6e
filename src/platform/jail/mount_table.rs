//! Parsing of the `mount` listing
//!
//! Lines look like `SOURCE on TARGET (fstype, options)`. Either path may
//! itself contain ` on `, so the target starts after the middle occurrence
//! and ends before the last ` (`.

use std::path::{Path, PathBuf};

/// Mount point named by one line of `mount` output
pub fn mount_point(line: &str) -> Option<&str> {
    let starts: Vec<usize> = line.match_indices(" on ").map(|(i, _)| i + 4).collect();
    let start = *starts.get(starts.len() / 2)?;
    let end = line.rfind(" (")?;
    (end >= start).then(|| line[start..end].trim())
}

/// Every mount point strictly below `root`
pub fn mounts_under(table: &str, root: &Path) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(mount_point)
        .map(PathBuf::from)
        .filter(|target| target != root && target.starts_with(root))
        .collect()
}
