//! The extractor driver (§4.9, C9): recursively walks from the root inode, invoking a [`Sink`]
//! for each node and accumulating statistics. Grounded directly on
//! `original_source/squashFS_parser.py`'s `_extract_node`/`_apply_mode_uidgid_xattr`/
//! `print_summary`, translated into the teacher crate's recursive `extract_dir` idiom.

use std::collections::HashSet;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::error::SquashfsError;
use crate::inode::{Inode, InodeHeader, NO_XATTR};
use crate::sink::Sink;
use crate::squashfs::{Node, Squashfs};

/// Counters gathered during a single [`extract`] call, carried over field-for-field from the
/// reference implementation's `stats` dictionary.
#[derive(Debug, Default, Clone)]
pub struct ExtractStats {
    pub dirs: u64,
    pub files: u64,
    pub symlinks: u64,
    pub other: u64,
    pub total_bytes: u64,
    pub files_nonempty: u64,
    pub fragments_used: HashSet<u32>,
    pub max_depth: u64,
}

impl ExtractStats {
    /// `dirs + files + symlinks + other`, the reachable-subtree analogue of `inode_count` (§8).
    pub fn total_entries(&self) -> u64 {
        self.dirs + self.files + self.symlinks + self.other
    }

    /// Mean size of non-empty files, or 0 when none were written.
    pub fn avg_nonempty_file_size(&self) -> f64 {
        if self.files_nonempty == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.files_nonempty as f64
        }
    }
}

/// Recursively extracts every reachable node starting at `squashfs`'s root inode into `out_root`,
/// applying ownership/permission/xattr metadata unless `apply_meta` is false (the CLI's
/// `--no-meta`).
#[instrument(skip(squashfs, sink))]
pub fn extract<R: Read + Seek, S: Sink>(
    squashfs: &Squashfs<R>,
    out_root: &Path,
    sink: &mut S,
    apply_meta: bool,
) -> Result<ExtractStats, SquashfsError> {
    sink.mkdir(out_root)?;
    let mut stats = ExtractStats::default();
    let root = squashfs.root_inode()?;
    walk(squashfs, sink, &root, out_root, 0, apply_meta, &mut stats)?;
    info!(
        dirs = stats.dirs,
        files = stats.files,
        symlinks = stats.symlinks,
        other = stats.other,
        total_bytes = stats.total_bytes,
        "extraction complete"
    );
    Ok(stats)
}

fn walk<R: Read + Seek, S: Sink>(
    squashfs: &Squashfs<R>,
    sink: &mut S,
    inode: &Inode,
    path: &Path,
    depth: u64,
    apply_meta: bool,
    stats: &mut ExtractStats,
) -> Result<(), SquashfsError> {
    stats.max_depth = stats.max_depth.max(depth);

    match inode.node() {
        Node::Directory {
            block_index,
            block_offset,
            total_size,
            xattr_idx,
        } => {
            stats.dirs += 1;
            sink.mkdir(path)?;
            if apply_meta {
                apply_metadata(squashfs, sink, path, &inode.header, xattr_idx);
            }

            let entries = squashfs.read_dir(block_index, block_offset, total_size)?;
            for entry in entries {
                let name = sanitize_name(&entry.name).ok_or(SquashfsError::IllegalEntryName)?;
                let child_path = path.join(&name);
                let child_inode = squashfs.read_inode(entry.inode_ref)?;
                walk(squashfs, sink, &child_inode, &child_path, depth + 1, apply_meta, stats)?;
            }
        },

        Node::File {
            blocks_start,
            file_size,
            block_sizes,
            frag_index,
            frag_offset,
            xattr_idx,
        } => {
            stats.files += 1;
            {
                let mut out = sink.create_file(path)?;
                squashfs.write_file_data(
                    blocks_start,
                    file_size,
                    &block_sizes,
                    frag_index,
                    frag_offset,
                    &mut out as &mut dyn Write,
                )?;
            }

            stats.total_bytes += file_size;
            if file_size > 0 {
                stats.files_nonempty += 1;
            }
            if frag_index != crate::inode::NO_FRAGMENT {
                stats.fragments_used.insert(frag_index);
            }

            if apply_meta {
                apply_metadata(squashfs, sink, path, &inode.header, xattr_idx);
            }
        },

        Node::Symlink { target, xattr_idx } => {
            stats.symlinks += 1;
            if sink.symlink(&target, path).is_err() {
                let text = format!("SYMLINK -> {}\n", String::from_utf8_lossy(&target));
                sink.write_placeholder(path, &text)?;
            } else if apply_meta {
                apply_metadata(squashfs, sink, path, &inode.header, xattr_idx);
            }
        },

        Node::Other { inode_type } => {
            stats.other += 1;
            let placeholder = path_with_suffix(path, ".unsupported");
            sink.write_placeholder(&placeholder, &format!("Unsupported inode type {inode_type}\n"))?;
        },
    }
    Ok(())
}

fn apply_metadata<R: Read + Seek, S: Sink>(
    squashfs: &Squashfs<R>,
    sink: &mut S,
    path: &Path,
    header: &InodeHeader,
    xattr_idx: u32,
) {
    sink.chmod(path, u32::from(header.mode) & 0o7777);

    match (
        squashfs.resolve_id(header.uid_idx),
        squashfs.resolve_id(header.gid_idx),
    ) {
        (Ok(uid), Ok(gid)) => sink.chown(path, uid, gid),
        (uid, gid) => warn!(?uid, ?gid, "could not resolve uid/gid for metadata application"),
    }

    if xattr_idx != NO_XATTR {
        match squashfs.resolve_xattr(xattr_idx) {
            Ok(xattrs) => {
                for x in xattrs {
                    sink.setxattr(path, &x.key, &x.value);
                }
            },
            Err(e) => warn!(error = %e, "failed to resolve xattrs"),
        }
    }
}

/// Normalizes `\` to `/` and keeps only the final path component, matching
/// `original_source/squashFS_parser.py`'s `_safe_join`: neutralizes both `../` traversal and
/// absolute-looking names without ever consulting the host filesystem.
fn sanitize_name(name: &std::ffi::OsStr) -> Option<PathBuf> {
    let bytes = {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            name.as_bytes().to_vec()
        }
        #[cfg(not(unix))]
        {
            name.to_string_lossy().into_owned().into_bytes()
        }
    };
    let normalized: Vec<u8> = bytes.iter().map(|&b| if b == b'\\' { b'/' } else { b }).collect();
    let last = normalized.rsplit(|&b| b == b'/').next().unwrap_or(&[]);
    if last.is_empty() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Some(PathBuf::from(std::ffi::OsStr::from_bytes(last)))
    }
    #[cfg(not(unix))]
    {
        Some(PathBuf::from(String::from_utf8_lossy(last).into_owned()))
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
