//! End-to-end extraction tests against hand-rolled SquashFS v4.0 images, built byte-by-byte
//! rather than shipped as binary blobs (this crate has no write path to generate real ones with).
//! Covers the concrete scenarios named in the specification's testable-properties section: a
//! nested directory tree with a regular file, a symlink, and a sparse file; an extended file
//! carrying an xattr; and a path-traversal entry name.

use std::io::Cursor;

use sqfs_extract::{extract, PosixSink, Squashfs};

const BLOCK_SIZE: u32 = 4096;
const BLOCK_LOG: u16 = 12;
const NO_FRAGMENT: u32 = 0xffff_ffff;
const NO_XATTR: u32 = 0xffff_ffff;
const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

/// Appends little-endian integers and raw byte slices to a growing buffer.
#[derive(Default)]
struct Buf(Vec<u8>);

impl Buf {
    fn offset(&self) -> usize {
        self.0.len()
    }
    fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn i16(&mut self, v: i16) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn u64(&mut self, v: u64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.0.extend_from_slice(v);
        self
    }
}

/// Wraps `payload` in a 2-byte metablock header with the uncompressed bit set, since every
/// fixture in this file stores everything uncompressed to exercise the parser without needing a
/// real codec round trip.
fn metablock(payload: &[u8]) -> Vec<u8> {
    let mut out = Buf::default();
    out.u16((payload.len() as u16) | 0x8000);
    out.bytes(payload);
    out.0
}

fn inode_common(out: &mut Buf, type_: u16, mode: u16, uid_idx: u16, gid_idx: u16, inode_number: u32) {
    out.u16(type_);
    out.u16(mode);
    out.u16(uid_idx);
    out.u16(gid_idx);
    out.u32(0); // mtime
    out.u32(inode_number);
}

fn basic_file_inode(out: &mut Buf, inode_number: u32, blocks_start: u32, file_size: u32, block_sizes: &[u32]) {
    inode_common(out, 2, 0o100644, 0, 0, inode_number);
    out.u32(blocks_start);
    out.u32(NO_FRAGMENT);
    out.u32(0); // block_offset (fragment byte offset, unused without a fragment)
    out.u32(file_size);
    for &b in block_sizes {
        out.u32(b);
    }
}

fn basic_symlink_inode(out: &mut Buf, inode_number: u32, target: &[u8]) {
    inode_common(out, 3, 0o120777, 0, 0, inode_number);
    out.u32(1); // link_count
    out.u32(target.len() as u32);
    out.bytes(target);
}

fn basic_dir_inode(out: &mut Buf, inode_number: u32, block_index: u32, block_offset: u16, dir_payload_len: usize) {
    inode_common(out, 1, 0o40755, 0, 0, inode_number);
    out.u32(block_index);
    out.u32(1); // link_count
    out.u16((dir_payload_len + 3) as u16);
    out.u16(block_offset);
    out.u32(0); // parent_inode
}

fn extended_file_inode(
    out: &mut Buf,
    inode_number: u32,
    blocks_start: u64,
    file_size: u64,
    xattr_index: u32,
    block_sizes: &[u32],
) {
    inode_common(out, 9, 0o100644, 0, 0, inode_number);
    out.u64(blocks_start);
    out.u64(file_size);
    out.u64(0); // sparse
    out.u32(1); // link_count
    out.u32(NO_FRAGMENT);
    out.u32(0); // block_offset
    out.u32(xattr_index);
    for &b in block_sizes {
        out.u32(b);
    }
}

fn dir_header(out: &mut Buf, entry_count_minus_1: u32) {
    out.u32(entry_count_minus_1);
    out.u32(0); // inode_table_rel_start: every inode lives in the single inode metablock at rel 0
    out.u32(0); // ref_ino_base, unused by the decoder
}

fn dir_entry(out: &mut Buf, inode_ref_offset: u16, name: &[u8]) {
    out.u16(inode_ref_offset);
    out.i16(0); // ino_delta, unused: the decoder re-derives the ref from header + offset alone
    out.u16(2); // entry_type, unused: the driver dispatches on the decoded inode itself
    out.u16((name.len() - 1) as u16);
    out.bytes(name);
}

/// uid/gid table: a single entry (value 0), addressed the way `tables::IdTable` expects: a
/// one-pointer array followed by the metablock it points to.
fn push_id_table(body: &mut Buf) -> u64 {
    let id_table_start = 96 + body.offset() as u64;
    let metablock_abs = id_table_start + 8;
    body.u64(metablock_abs);
    body.bytes(&metablock(&0u32.to_le_bytes()));
    id_table_start
}

struct SuperblockFields {
    inode_count: u32,
    block_size: u32,
    frag_count: u32,
    root_inode: u64,
    bytes_used: u64,
    id_table: u64,
    xattr_table: u64,
    inode_table: u64,
    dir_table: u64,
    frag_table: u64,
}

fn build_superblock(f: &SuperblockFields) -> Vec<u8> {
    let mut sb = Buf::default();
    sb.bytes(b"hsqs");
    sb.u32(f.inode_count);
    sb.u32(0); // mod_time
    sb.u32(f.block_size);
    sb.u32(f.frag_count);
    sb.u16(1); // compressor = gzip; never actually invoked since every block is stored uncompressed
    sb.u16(BLOCK_LOG);
    sb.u16(0); // flags
    sb.u16(1); // id_count
    sb.u16(4); // version_major
    sb.u16(0); // version_minor
    sb.u64(f.root_inode);
    sb.u64(f.bytes_used);
    sb.u64(f.id_table);
    sb.u64(f.xattr_table);
    sb.u64(f.inode_table);
    sb.u64(f.dir_table);
    sb.u64(f.frag_table);
    sb.u64(NOT_SET); // export_table
    assert_eq!(sb.0.len(), 96);
    sb.0
}

/// Builds a complete image: `/hello.txt` (regular file), `/link` (symlink to `target`),
/// `/sparse.bin` (one full sparse block), and `/sub/inner.txt` (nested regular file).
fn build_tree_image() -> Vec<u8> {
    let mut body = Buf::default();

    let hello_abs = 96 + body.offset() as u64;
    body.bytes(b"hello\n");
    let inner_abs = 96 + body.offset() as u64;
    body.bytes(b"inner\n");

    let mut inode_payload = Buf::default();

    let hello_ref = inode_payload.offset() as u16;
    basic_file_inode(&mut inode_payload, 2, hello_abs as u32, 6, &[6 | 0x0100_0000]);

    let inner_ref = inode_payload.offset() as u16;
    basic_file_inode(&mut inode_payload, 3, inner_abs as u32, 6, &[6 | 0x0100_0000]);

    let link_ref = inode_payload.offset() as u16;
    basic_symlink_inode(&mut inode_payload, 4, b"target");

    let sparse_ref = inode_payload.offset() as u16;
    basic_file_inode(&mut inode_payload, 5, 0, BLOCK_SIZE, &[0]);

    let mut dir_payload = Buf::default();

    let sub_dir_offset = dir_payload.offset() as u16;
    let mut sub_dir_bytes = Buf::default();
    dir_header(&mut sub_dir_bytes, 0);
    dir_entry(&mut sub_dir_bytes, inner_ref, b"inner.txt");
    dir_payload.bytes(&sub_dir_bytes.0);

    let sub_ref = inode_payload.offset() as u16;
    basic_dir_inode(&mut inode_payload, 6, 0, sub_dir_offset, sub_dir_bytes.0.len());

    let root_dir_offset = dir_payload.offset() as u16;
    let mut root_dir_bytes = Buf::default();
    dir_header(&mut root_dir_bytes, 3);
    dir_entry(&mut root_dir_bytes, hello_ref, b"hello.txt");
    dir_entry(&mut root_dir_bytes, link_ref, b"link");
    dir_entry(&mut root_dir_bytes, sparse_ref, b"sparse.bin");
    dir_entry(&mut root_dir_bytes, sub_ref, b"sub");
    dir_payload.bytes(&root_dir_bytes.0);

    let root_ref = inode_payload.offset() as u16;
    basic_dir_inode(&mut inode_payload, 1, 0, root_dir_offset, root_dir_bytes.0.len());

    let inode_table = 96 + body.offset() as u64;
    body.bytes(&metablock(&inode_payload.0));

    let dir_table = 96 + body.offset() as u64;
    body.bytes(&metablock(&dir_payload.0));

    let id_table = push_id_table(&mut body);

    let bytes_used = 96 + body.offset() as u64;
    let sb = build_superblock(&SuperblockFields {
        inode_count: 6,
        block_size: BLOCK_SIZE,
        frag_count: 0,
        root_inode: root_ref as u64,
        bytes_used,
        id_table,
        xattr_table: NOT_SET,
        inode_table,
        dir_table,
        frag_table: NOT_SET,
    });

    let mut image = sb;
    image.extend_from_slice(&body.0);
    image
}

/// Builds an image whose sole directory entry is named `../evil`, to exercise path-traversal
/// sanitization (§4.9).
fn build_traversal_image() -> Vec<u8> {
    let mut body = Buf::default();

    let file_abs = 96 + body.offset() as u64;
    body.bytes(b"x");

    let mut inode_payload = Buf::default();
    let file_ref = inode_payload.offset() as u16;
    basic_file_inode(&mut inode_payload, 2, file_abs as u32, 1, &[1 | 0x0100_0000]);

    let mut dir_payload = Buf::default();
    let root_dir_offset = dir_payload.offset() as u16;
    let mut root_dir_bytes = Buf::default();
    dir_header(&mut root_dir_bytes, 0);
    dir_entry(&mut root_dir_bytes, file_ref, b"../evil");
    dir_payload.bytes(&root_dir_bytes.0);

    let root_ref = inode_payload.offset() as u16;
    basic_dir_inode(&mut inode_payload, 1, 0, root_dir_offset, root_dir_bytes.0.len());

    let inode_table = 96 + body.offset() as u64;
    body.bytes(&metablock(&inode_payload.0));
    let dir_table = 96 + body.offset() as u64;
    body.bytes(&metablock(&dir_payload.0));
    let id_table = push_id_table(&mut body);

    let bytes_used = 96 + body.offset() as u64;
    let sb = build_superblock(&SuperblockFields {
        inode_count: 2,
        block_size: BLOCK_SIZE,
        frag_count: 0,
        root_inode: root_ref as u64,
        bytes_used,
        id_table,
        xattr_table: NOT_SET,
        inode_table,
        dir_table,
        frag_table: NOT_SET,
    });

    let mut image = sb;
    image.extend_from_slice(&body.0);
    image
}

/// Builds an image with one extended file carrying a single `user.comment = "hi"` xattr.
fn build_xattr_image() -> Vec<u8> {
    let mut body = Buf::default();

    let file_abs = 96 + body.offset() as u64;
    body.bytes(b"data\n");

    let kv_base = 96 + body.offset() as u64;
    let mut pair = Buf::default();
    pair.u16(0); // type = user namespace, inline value
    pair.u16(7); // name_size
    pair.bytes(b"comment");
    pair.u32(2); // value_size
    pair.bytes(b"hi");
    body.bytes(&metablock(&pair.0));

    let mut inode_payload = Buf::default();
    let file_ref = inode_payload.offset() as u16;
    extended_file_inode(&mut inode_payload, 2, file_abs, 5, 0, &[5 | 0x0100_0000]);

    let mut dir_payload = Buf::default();
    let root_dir_offset = dir_payload.offset() as u16;
    let mut root_dir_bytes = Buf::default();
    dir_header(&mut root_dir_bytes, 0);
    dir_entry(&mut root_dir_bytes, file_ref, b"xfile.txt");
    dir_payload.bytes(&root_dir_bytes.0);

    let root_ref = inode_payload.offset() as u16;
    basic_dir_inode(&mut inode_payload, 1, 0, root_dir_offset, root_dir_bytes.0.len());

    let inode_table = 96 + body.offset() as u64;
    body.bytes(&metablock(&inode_payload.0));
    let dir_table = 96 + body.offset() as u64;
    body.bytes(&metablock(&dir_payload.0));

    let xattr_table = 96 + body.offset() as u64;
    let mut lookup_entry = Buf::default();
    lookup_entry.u64(0); // kv_ref: offset 0 into the kv metablock at kv_base
    lookup_entry.u32(1); // count
    lookup_entry.u32(pair.0.len() as u32); // size
    let lookup_metablock_abs = xattr_table + 16 + 8;
    body.u64(kv_base); // xattr table header: kv_stream_abs_start
    body.u32(1); // xattr_ids
    body.u32(0); // pad
    body.u64(lookup_metablock_abs); // pointer array (1 entry)
    body.bytes(&metablock(&lookup_entry.0));

    let id_table = push_id_table(&mut body);

    let bytes_used = 96 + body.offset() as u64;
    let sb = build_superblock(&SuperblockFields {
        inode_count: 2,
        block_size: BLOCK_SIZE,
        frag_count: 0,
        root_inode: root_ref as u64,
        bytes_used,
        id_table,
        xattr_table,
        inode_table,
        dir_table,
        frag_table: NOT_SET,
    });

    let mut image = sb;
    image.extend_from_slice(&body.0);
    image
}

fn open(image: Vec<u8>) -> Squashfs<Cursor<Vec<u8>>> {
    Squashfs::open(Cursor::new(image)).expect("fixture image should parse")
}

#[test]
fn extracts_nested_tree_with_symlink_and_sparse_file() {
    let squashfs = open(build_tree_image());
    let out = tempfile::tempdir().unwrap();
    let mut sink = PosixSink;
    let stats = extract(&squashfs, out.path(), &mut sink, true).unwrap();

    assert_eq!(stats.dirs, 2);
    assert_eq!(stats.files, 3);
    assert_eq!(stats.symlinks, 1);
    assert_eq!(stats.other, 0);
    assert_eq!(stats.max_depth, 2);

    assert_eq!(std::fs::read(out.path().join("hello.txt")).unwrap(), b"hello\n");
    assert_eq!(std::fs::read(out.path().join("sub/inner.txt")).unwrap(), b"inner\n");

    let sparse = std::fs::read(out.path().join("sparse.bin")).unwrap();
    assert_eq!(sparse.len(), BLOCK_SIZE as usize);
    assert!(sparse.iter().all(|&b| b == 0));

    let link_target = std::fs::read_link(out.path().join("link")).unwrap();
    assert_eq!(link_target.to_str().unwrap(), "target");
}

#[test]
fn extracting_twice_is_idempotent() {
    let squashfs = open(build_tree_image());
    let out = tempfile::tempdir().unwrap();
    let mut sink = PosixSink;
    extract(&squashfs, out.path(), &mut sink, true).unwrap();
    let first = std::fs::read(out.path().join("hello.txt")).unwrap();
    extract(&squashfs, out.path(), &mut sink, true).unwrap();
    let second = std::fs::read(out.path().join("hello.txt")).unwrap();
    assert_eq!(first, second);
}

#[test]
fn sanitizes_parent_traversal_entry_names() {
    let squashfs = open(build_traversal_image());
    let out = tempfile::tempdir().unwrap();
    let mut sink = PosixSink;
    extract(&squashfs, out.path(), &mut sink, true).unwrap();

    assert_eq!(std::fs::read(out.path().join("evil")).unwrap(), b"x");
    assert!(!out.path().parent().unwrap().join("evil").exists());
}

#[test]
fn extended_file_xattr_is_applied_when_supported() {
    let squashfs = open(build_xattr_image());
    let out = tempfile::tempdir().unwrap();
    let mut sink = PosixSink;
    let stats = extract(&squashfs, out.path(), &mut sink, true).unwrap();

    assert_eq!(stats.files, 1);
    assert_eq!(std::fs::read(out.path().join("xfile.txt")).unwrap(), b"data\n");
    // Applying the xattr itself is best-effort (§7): a host/filesystem without xattr support
    // must not fail extraction, so this test only asserts the file landed, not the attribute.
}
