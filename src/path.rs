//! Path and filesystem utilities used by the storage layer.
//!
//! Two families of helpers live here: pure lexical operations on paths
//! (these never touch the disk) and thin wrappers around filesystem
//! primitives that add the fallback behavior the storage layer relies on,
//! such as hard-linking degrading to a copy across filesystem boundaries.
//!
//! Torrent-internal paths (the ones that appear in metainfo files) always
//! use `/` as their separator regardless of host, so the lexical helpers
//! that operate on those come in `&str` flavors.

use std::{
    cmp::Ordering,
    fs,
    io,
    iter,
    path::{Component, Path, PathBuf},
};

/// Combines two paths. If `b` is absolute, it replaces `a` entirely, which
/// matches the platform convention for joining.
pub fn combine(a: impl AsRef<Path>, b: impl AsRef<Path>) -> PathBuf {
    a.as_ref().join(b)
}

/// Appends `b` to `a` as a relative path, even if `b` is absolute.
pub fn append(a: impl AsRef<Path>, b: impl AsRef<Path>) -> PathBuf {
    let b = b.as_ref();
    let rel: PathBuf = b
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    a.as_ref().join(rel)
}

/// Returns the parent of the path, if any.
pub fn parent(p: &Path) -> Option<&Path> {
    p.parent().filter(|p| !p.as_os_str().is_empty())
}

/// Returns the final component of the path, if any.
pub fn filename(p: &Path) -> Option<&str> {
    p.file_name().and_then(|f| f.to_str())
}

/// Returns the extension of the path's final component, without the dot.
pub fn extension(p: &Path) -> Option<&str> {
    p.extension().and_then(|e| e.to_str())
}

/// Returns the path with the final component's extension removed.
pub fn remove_extension(p: &Path) -> PathBuf {
    p.with_extension("")
}

/// Returns true if the path is absolute.
pub fn is_complete(p: &Path) -> bool {
    p.is_absolute()
}

/// Returns true if the path is a filesystem root.
pub fn is_root(p: &Path) -> bool {
    p.is_absolute() && p.parent().is_none()
}

/// Returns true if the path has a non-empty parent.
pub fn has_parent(p: &Path) -> bool {
    parent(p).is_some()
}

/// Returns the process's current working directory.
pub fn current_dir() -> io::Result<PathBuf> {
    std::env::current_dir()
}

/// Splits a torrent-internal path into its first component and the rest.
///
/// `"a/b/c"` becomes `("a", "b/c")` and a path without a separator becomes
/// `(path, "")`.
pub fn split_first(p: &str) -> (&str, &str) {
    match p.find('/') {
        Some(at) => (&p[..at], p[at + 1..].trim_start_matches('/')),
        None => (p, ""),
    }
}

/// Splits a torrent-internal path into its branch path and leaf filename.
///
/// `"a/b/c"` becomes `("a/b", "c")` and a path without a separator becomes
/// `("", path)`.
pub fn split_last(p: &str) -> (&str, &str) {
    match p.rfind('/') {
        Some(at) => (p[..at].trim_end_matches('/'), &p[at + 1..]),
        None => ("", p),
    }
}

/// Compares two `(directory, filename)` pairs lexicographically per path
/// element. Directories are compared component by component before the
/// filenames are considered.
pub fn path_compare(
    a_dir: &str,
    a_file: &str,
    b_dir: &str,
    b_file: &str,
) -> Ordering {
    let a = components(a_dir).chain(iter::once(a_file));
    let b = components(b_dir).chain(iter::once(b_file));
    a.cmp(b)
}

fn components(p: &str) -> impl Iterator<Item = &str> {
    p.split('/').filter(|c| !c.is_empty())
}

/// Computes the lexical relative path from `base` to `target` without
/// touching the filesystem.
///
/// Both paths are interpreted as-is: no symlinks are resolved and no
/// component is checked for existence. Returns `None` when one path is
/// absolute and the other is not, as no lexical answer exists then.
pub fn lexically_relative(base: &Path, target: &Path) -> Option<PathBuf> {
    if base.is_absolute() != target.is_absolute() {
        return None;
    }

    let mut base_it = base.components().peekable();
    let mut target_it = target.components().peekable();

    // skip the common prefix
    while let (Some(b), Some(t)) = (base_it.peek(), target_it.peek()) {
        if b != t {
            break;
        }
        base_it.next();
        target_it.next();
    }

    let mut rel = PathBuf::new();
    for c in base_it {
        match c {
            Component::Normal(_) => rel.push(".."),
            Component::CurDir => {}
            // a ".." in the remaining base would require resolving it,
            // which a lexical operation cannot do
            _ => return None,
        }
    }
    for c in target_it {
        rel.push(c.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    Some(rel)
}

/// Returns true if the path exists (without following a trailing symlink).
pub fn exists(p: &Path) -> bool {
    p.symlink_metadata().is_ok()
}

/// Removes a file or an empty directory.
pub fn remove(p: &Path) -> io::Result<()> {
    let meta = p.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir(p)
    } else {
        fs::remove_file(p)
    }
}

/// Removes a file or a directory tree.
pub fn remove_all(p: &Path) -> io::Result<()> {
    let meta = p.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir_all(p)
    } else {
        fs::remove_file(p)
    }
}

/// Creates a single directory.
pub fn create_directory(p: &Path) -> io::Result<()> {
    fs::create_dir(p)
}

/// Creates a directory and all its missing parents.
pub fn create_directories(p: &Path) -> io::Result<()> {
    fs::create_dir_all(p)
}

/// Renames a file or directory. This only succeeds within one filesystem;
/// use [`move_file`] when the destination may be on another device.
pub fn rename(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)
}

/// Copies a regular file, returning the number of bytes copied.
pub fn copy_file(from: &Path, to: &Path) -> io::Result<u64> {
    fs::copy(from, to)
}

/// Moves a file, falling back to copy-and-delete when the rename fails
/// because source and destination are on different filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            log::debug!(
                "Cross-device rename {:?} -> {:?}, copying instead",
                from,
                to
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

/// Recursively copies a directory tree (or a single file).
pub fn recursive_copy(from: &Path, to: &Path) -> io::Result<()> {
    let meta = from.symlink_metadata()?;
    if !meta.is_dir() {
        fs::copy(from, to)?;
        return Ok(());
    }
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        recursive_copy(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

/// Hard-links `from` at `to`, falling back to a plain copy when the
/// filesystem rejects the link as unsupported or cross-device.
pub fn hard_link(from: &Path, to: &Path) -> io::Result<()> {
    match fs::hard_link(from, to) {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.raw_os_error(),
                Some(libc::EXDEV)
                    | Some(libc::EPERM)
                    | Some(libc::EOPNOTSUPP)
                    | Some(libc::EMLINK)
            ) =>
        {
            log::debug!(
                "Hard link {:?} -> {:?} rejected ({}), copying instead",
                from,
                to,
                e
            );
            fs::copy(from, to).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Stats a path, optionally following a trailing symlink.
pub fn stat(p: &Path, follow_links: bool) -> io::Result<fs::Metadata> {
    if follow_links {
        fs::metadata(p)
    } else {
        fs::symlink_metadata(p)
    }
}

/// Resolves the path to an absolute path with all symlinks followed.
pub fn canonicalize(p: &Path) -> io::Result<PathBuf> {
    fs::canonicalize(p)
}
