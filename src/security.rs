#![forbid(unsafe_code)]

//! Process and path safety helpers shared by the storage and media layers.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the backend is started as root. Uploads are written to
/// disk on behalf of remote users, so the process must run unprivileged.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Returns true when `value` is exactly one plain path component.
pub fn is_plain_segment(value: &str) -> bool {
    if value.is_empty() || value.contains('/') || value.contains('\\') {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Joins caller-supplied segments under `root`. Every segment must be a plain
/// name; `None` is returned as soon as one is empty, `.`, `..` or absolute.
pub fn join_segments<'a, I>(root: &Path, segments: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut path = root.to_path_buf();
    let mut pushed = false;
    for segment in segments {
        if !is_plain_segment(segment) {
            return None;
        }
        path.push(segment);
        pushed = true;
    }
    pushed.then_some(path)
}
