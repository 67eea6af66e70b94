//! The filesystem sink (§6, C10): the thin POSIX-writing surface the extractor driver calls into.
//!
//! Kept behind a trait so the driver's correctness (path safety, statistics, the block/fragment
//! reassembly it composes) never depends on how output actually lands on disk. [`PosixSink`] is
//! the one real implementation this crate ships, grounded on `src/bin/unsquashfs.rs`'s
//! `set_attributes`/`extract_all` (lchown via `libc`, `utimes` via `nix`, mode bits via
//! `std::fs::Permissions`) plus `os.setxattr` from `original_source/squashFS_parser.py`.

use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::warn;

/// Everything the extractor driver needs from the output side. `chmod`/`chown`/`setxattr` are
/// best-effort: a host that lacks support, privilege, or the named namespace should swallow the
/// failure rather than abort the whole extraction (§7).
pub trait Sink {
    /// Create `path` as a directory, idempotently (already existing is not an error).
    fn mkdir(&mut self, path: &Path) -> std::io::Result<()>;
    /// Open `path` for writing a regular file's content, creating parent directories as needed.
    /// Returned as a `Write` rather than a byte buffer so the driver can stream data-block output
    /// straight through without holding a whole file's reassembled content in memory (§5).
    fn create_file(&mut self, path: &Path) -> std::io::Result<Box<dyn Write>>;
    /// Create a symlink at `path` pointing at `target`. Returning `Err` signals "unsupported",
    /// which the driver degrades into a text placeholder rather than aborting.
    fn symlink(&mut self, target: &[u8], path: &Path) -> std::io::Result<()>;
    /// Write an opaque placeholder for a node type this sink does not materialize (devices,
    /// fifos, sockets).
    fn write_placeholder(&mut self, path: &Path, contents: &str) -> std::io::Result<()>;
    /// Best-effort: set `path`'s permission bits to the low 12 bits of `mode`.
    fn chmod(&mut self, path: &Path, mode: u32);
    /// Best-effort: change `path`'s owning uid/gid. `-1` (as `u32::MAX`-cast) means "leave as is".
    fn chown(&mut self, path: &Path, uid: u32, gid: u32);
    /// Best-effort: set one extended attribute.
    fn setxattr(&mut self, path: &Path, key: &str, value: &[u8]);
}

/// Writes directly to the host's real filesystem.
#[derive(Default)]
pub struct PosixSink;

impl Sink for PosixSink {
    fn mkdir(&mut self, path: &Path) -> std::io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create_file(&mut self, path: &Path) -> std::io::Result<Box<dyn Write>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(path)?))
    }

    fn symlink(&mut self, target: &[u8], path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.symlink_metadata().is_ok() {
            fs::remove_file(path)?;
        }
        let target = std::ffi::OsStr::from_bytes(target);
        std::os::unix::fs::symlink(target, path)
    }

    fn write_placeholder(&mut self, path: &Path, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    }

    fn chmod(&mut self, path: &Path, mode: u32) {
        if let Err(e) = fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)) {
            warn!(path = %path.display(), error = %e, "chmod failed");
        }
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) {
        let c_path = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
            Ok(c) => c,
            Err(_) => return,
        };
        // SAFETY: `c_path` is a valid NUL-terminated byte string for the lifetime of this call;
        // -1 for either id tells lchown to leave that id unchanged.
        let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if rc != 0 {
            warn!(
                path = %path.display(),
                error = %std::io::Error::last_os_error(),
                "chown failed"
            );
        }
    }

    fn setxattr(&mut self, path: &Path, key: &str, value: &[u8]) {
        let c_path = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
            Ok(c) => c,
            Err(_) => return,
        };
        let c_key = match std::ffi::CString::new(key) {
            Ok(c) => c,
            Err(_) => return,
        };
        // SAFETY: both C strings are valid and NUL-terminated; `value`'s pointer/len describe an
        // initialized byte slice for the duration of the call. `lsetxattr` does not follow
        // symlinks, matching the teacher CLI's lchown-not-chown convention for node metadata.
        let rc = unsafe {
            libc::lsetxattr(
                c_path.as_ptr(),
                c_key.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if rc != 0 {
            warn!(
                path = %path.display(),
                key,
                error = %std::io::Error::last_os_error(),
                "setxattr failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mkdir_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        let mut sink = PosixSink;
        sink.mkdir(&target).unwrap();
        sink.mkdir(&target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn create_file_creates_parents_and_streams() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/dir/hello.txt");
        let mut sink = PosixSink;
        let mut w = sink.create_file(&target).unwrap();
        w.write_all(b"hello\n").unwrap();
        drop(w);
        assert_eq!(fs::read(&target).unwrap(), b"hello\n");
    }

    #[test]
    fn symlink_round_trips_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("link");
        let mut sink = PosixSink;
        sink.symlink(b"../elsewhere", &target).unwrap();
        assert_eq!(fs::read_link(&target).unwrap().as_os_str().as_bytes(), b"../elsewhere");
    }

    #[test]
    fn chmod_sets_low_bits() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, b"x").unwrap();
        let mut sink = PosixSink;
        sink.chmod(&target, 0o644);
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
