// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Delete/rename semantics on hosts that refuse to touch open files
//!
//! Most tests run on [`ExclusiveHostFs`], which fails `remove_file` and
//! `rename` for paths with live file objects. Guest-visible behavior must
//! still match POSIX: unlinked-but-open files stay readable and writable,
//! and renames never disturb open handles.

use std::io::{self, Cursor, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::archive::fixtures::zip_bytes;
use crate::host::{HostMetadata, MockHostFs, StdHostFs};
use crate::testing::exclusive_host::ExclusiveHostFs;
use crate::types::{K_O_APPEND, K_O_CREAT, K_O_RDONLY, K_O_RDWR, K_O_WRONLY};
use crate::{
    Errno, FaultErrno, FaultOp, FaultPolicy, FaultRule, FaultyHostFs, HandleId, KernelConfig, KernelFs,
};

const CONTENT: &[u8] = b"0123456789abcdefghij";

fn setup() -> (TempDir, Arc<ExclusiveHostFs>, KernelFs) {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("tmp")).unwrap();
    let host = Arc::new(ExclusiveHostFs::new());
    let fs = KernelFs::new(KernelConfig::with_root(tmp.path()), host.clone());
    (tmp, host, fs)
}

fn write_native(root: &Path, guest: &str, data: &[u8]) {
    let path = root.join(guest.trim_start_matches('/'));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

fn read_n(fs: &KernelFs, handle: HandleId, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    let count = fs.read(handle, &mut buf).unwrap();
    buf.truncate(count);
    buf
}

fn open_at(fs: &KernelFs, path: &str, offset: u64) -> HandleId {
    let handle = fs.open(path, K_O_RDWR).unwrap();
    fs.seek(handle, SeekFrom::Start(offset)).unwrap();
    handle
}

#[test]
fn test_delete_preserves_open_handles_for_any_count() {
    for n in 0..4u64 {
        let (tmp, _host, fs) = setup();
        write_native(tmp.path(), "/tmp/data.bin", CONTENT);

        let handles: Vec<_> = (0..n).map(|i| open_at(&fs, "/tmp/data.bin", i * 3)).collect();
        fs.remove("/tmp/data.bin").unwrap();

        assert!(!tmp.path().join("tmp/data.bin").exists(), "n = {}", n);
        assert_eq!(fs.stat("/tmp/data.bin", 0).unwrap_err(), Errno::NotFound);
        for (i, handle) in handles.iter().enumerate() {
            let offset = i * 3;
            assert_eq!(fs.file_pointer(*handle).unwrap(), offset as u64);
            assert_eq!(read_n(&fs, *handle, 3), &CONTENT[offset..offset + 3], "n = {}, handle {}", n, i);
        }

        if n == 0 {
            assert!(!tmp.path().join("tmp/del").exists());
        }
    }
}

#[test]
fn test_deleted_file_remains_writable_through_all_handles() {
    let (tmp, _host, fs) = setup();
    write_native(tmp.path(), "/tmp/shared", CONTENT);
    let writer = open_at(&fs, "/tmp/shared", 4);
    let reader = open_at(&fs, "/tmp/shared", 0);

    fs.remove("/tmp/shared").unwrap();

    assert_eq!(fs.write(writer, b"XY").unwrap(), 2);
    fs.seek(reader, SeekFrom::Start(2)).unwrap();
    assert_eq!(read_n(&fs, reader, 6), b"23XY67");
    assert_eq!(
        std::fs::read(tmp.path().join("tmp/del/del0.tmp")).unwrap(),
        b"0123XY6789abcdefghij"
    );
}

#[test]
fn test_relocated_file_is_cleaned_up_after_last_close() {
    let (tmp, host, fs) = setup();
    write_native(tmp.path(), "/tmp/f", CONTENT);
    let a = fs.open("/tmp/f", K_O_RDONLY).unwrap();
    let b = fs.open("/tmp/f", K_O_RDONLY).unwrap();

    fs.remove("/tmp/f").unwrap();
    let relocated = tmp.path().join("tmp/del/del0.tmp");
    assert_eq!(host.open_count(&relocated), 2);

    fs.close(a).unwrap();
    assert!(relocated.exists());
    fs.close(b).unwrap();
    assert!(!relocated.exists());
}

#[test]
fn test_relocation_picks_lowest_free_slot() {
    let (tmp, _host, fs) = setup();
    for i in 0..5 {
        write_native(tmp.path(), &format!("/tmp/del/del{}.tmp", i), b"taken");
    }
    write_native(tmp.path(), "/tmp/victim", CONTENT);
    let handle = open_at(&fs, "/tmp/victim", 10);

    fs.remove("/tmp/victim").unwrap();

    assert_eq!(std::fs::read(tmp.path().join("tmp/del/del5.tmp")).unwrap(), CONTENT);
    assert_eq!(std::fs::read(tmp.path().join("tmp/del/del4.tmp")).unwrap(), b"taken");
    assert_eq!(read_n(&fs, handle, 5), b"abcde");
}

#[test]
fn test_failed_relocation_still_reports_success() {
    let (tmp, host, fs) = setup();
    write_native(tmp.path(), "/tmp/stuck", CONTENT);
    let handle = open_at(&fs, "/tmp/stuck", 7);
    host.refuse_all_renames(true);

    fs.remove("/tmp/stuck").unwrap();

    // The bytes never moved, and the handle still reads them at its offset
    assert!(tmp.path().join("tmp/stuck").exists());
    assert_eq!(read_n(&fs, handle, 3), b"789");
}

#[test]
fn test_remove_rejects_directories() {
    let (tmp, _host, fs) = setup();
    std::fs::create_dir(tmp.path().join("tmp/dir")).unwrap();

    assert_eq!(fs.remove("/tmp/dir").unwrap_err(), Errno::IsADirectory);
    assert!(tmp.path().join("tmp/dir").is_dir());
}

#[test]
fn test_rename_preserves_handles_on_success() {
    let (tmp, _host, fs) = setup();
    write_native(tmp.path(), "/tmp/a", CONTENT);
    let first = open_at(&fs, "/tmp/a", 2);
    let second = open_at(&fs, "/tmp/a", 12);

    fs.rename("/tmp/a", "/tmp/b").unwrap();

    assert_eq!(fs.stat("/tmp/a", 0).unwrap_err(), Errno::NotFound);
    assert_eq!(fs.open_handle_count("/tmp/b").unwrap(), 2);
    assert_eq!(fs.native_path_of("/tmp/b").unwrap(), tmp.path().join("tmp/b"));
    assert_eq!(read_n(&fs, first, 4), b"2345");
    assert_eq!(read_n(&fs, second, 4), b"cdef");
    assert!(!tmp.path().join("tmp/a").exists());
}

#[test]
fn test_rename_restores_handles_on_failure() {
    let (tmp, host, fs) = setup();
    write_native(tmp.path(), "/tmp/a", CONTENT);
    let handle = open_at(&fs, "/tmp/a", 5);
    host.refuse_all_renames(true);

    assert_eq!(fs.rename("/tmp/a", "/tmp/b").unwrap_err(), Errno::AccessDenied);

    assert_eq!(fs.file_pointer(handle).unwrap(), 5);
    assert_eq!(read_n(&fs, handle, 3), b"567");
    assert_eq!(fs.open_handle_count("/tmp/a").unwrap(), 1);
    assert_eq!(fs.stat("/tmp/b", 0).unwrap_err(), Errno::NotFound);
    assert_eq!(std::fs::read(tmp.path().join("tmp/a")).unwrap(), CONTENT);
}

#[test]
fn test_rename_type_mismatch_changes_nothing() {
    let (tmp, _host, fs) = setup();
    write_native(tmp.path(), "/tmp/file", b"file");
    write_native(tmp.path(), "/tmp/dir/inside", b"inside");

    assert_eq!(fs.rename("/tmp/file", "/tmp/dir").unwrap_err(), Errno::IsADirectory);
    assert_eq!(fs.rename("/tmp/dir", "/tmp/file").unwrap_err(), Errno::NotADirectory);

    assert_eq!(std::fs::read(tmp.path().join("tmp/file")).unwrap(), b"file");
    assert_eq!(std::fs::read(tmp.path().join("tmp/dir/inside")).unwrap(), b"inside");
    assert!(!fs.stat("/tmp/file", 0).unwrap().is_dir);
    assert!(fs.stat("/tmp/dir", 0).unwrap().is_dir);
}

#[test]
fn test_rename_onto_directories() {
    let (tmp, _host, fs) = setup();
    write_native(tmp.path(), "/tmp/src/payload", b"p");
    write_native(tmp.path(), "/tmp/full/occupant", b"o");
    std::fs::create_dir(tmp.path().join("tmp/empty")).unwrap();

    assert_eq!(fs.rename("/tmp/src", "/tmp/full").unwrap_err(), Errno::DirectoryNotEmpty);
    assert!(tmp.path().join("tmp/src/payload").exists());

    fs.rename("/tmp/src", "/tmp/empty").unwrap();
    assert_eq!(std::fs::read(tmp.path().join("tmp/empty/payload")).unwrap(), b"p");
    assert!(!tmp.path().join("tmp/src").exists());
    let names: Vec<_> = fs.list_dir("/tmp/empty").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["payload"]);
}

#[test]
fn test_rename_over_open_file_keeps_its_handle() {
    let (tmp, _host, fs) = setup();
    write_native(tmp.path(), "/tmp/new", b"new contents");
    write_native(tmp.path(), "/tmp/old", b"old contents");
    let old_handle = open_at(&fs, "/tmp/old", 4);

    fs.rename("/tmp/new", "/tmp/old").unwrap();

    assert_eq!(std::fs::read(tmp.path().join("tmp/old")).unwrap(), b"new contents");
    assert_eq!(read_n(&fs, old_handle, 8), b"contents");
    fs.seek(old_handle, SeekFrom::Start(0)).unwrap();
    assert_eq!(read_n(&fs, old_handle, 3), b"old");
}

#[test]
fn test_rename_into_missing_parent() {
    let (tmp, _host, fs) = setup();
    write_native(tmp.path(), "/tmp/a", b"a");
    assert_eq!(fs.rename("/tmp/a", "/tmp/none/a").unwrap_err(), Errno::NotFound);
    assert!(tmp.path().join("tmp/a").exists());
}

#[test]
fn test_rename_directory_beneath_itself_changes_nothing() {
    let (tmp, _host, fs) = setup();
    write_native(tmp.path(), "/tmp/a/keep", b"k");
    std::fs::create_dir(tmp.path().join("tmp/a/b")).unwrap();

    assert_eq!(fs.rename("/tmp/a", "/tmp/a/b").unwrap_err(), Errno::Io);
    assert_eq!(fs.rename("/tmp/a", "/tmp/a/c").unwrap_err(), Errno::Io);
    assert!(tmp.path().join("tmp/a/b").is_dir());
    assert!(fs.stat("/tmp/a/b", 0).unwrap().is_dir);
    assert!(tmp.path().join("tmp/a/keep").exists());

    // A sibling sharing the name prefix is a different directory
    fs.rename("/tmp/a", "/tmp/ab").unwrap();
    assert!(tmp.path().join("tmp/ab/b").is_dir());
}

#[test]
fn test_closing_unlinked_handle_spares_recreated_file() {
    let tmp = TempDir::new().unwrap();
    let fs = KernelFs::new(KernelConfig::with_root(tmp.path()), Arc::new(StdHostFs));
    write_native(tmp.path(), "/tmp/del/notes", b"old data");

    let stale = fs.open("/tmp/del/notes", K_O_RDONLY).unwrap();
    fs.remove("/tmp/del/notes").unwrap();
    assert!(!tmp.path().join("tmp/del/notes").exists());

    let fresh = fs.open("/tmp/del/notes", K_O_WRONLY | K_O_CREAT).unwrap();
    assert_eq!(fs.write(fresh, b"new data").unwrap(), 8);
    fs.close(fresh).unwrap();
    fs.close(stale).unwrap();

    assert_eq!(std::fs::read(tmp.path().join("tmp/del/notes")).unwrap(), b"new data");
}

fn with_archive(fs: &KernelFs) {
    let members: [(&str, &[u8]); 4] = [
        ("usr/share/doc.txt", b"archived doc"),
        ("usr/share/other.txt", b"other"),
        ("etc/conf", b"key=value"),
        ("opt/pkg/bin/tool", b"tool binary"),
    ];
    fs.add_archive("/", Box::new(Cursor::new(zip_bytes(&members)))).unwrap();
}

#[test]
fn test_archive_reads_do_not_materialize() {
    let (tmp, _host, fs) = setup();
    with_archive(&fs);

    let handle = fs.open("/usr/share/doc.txt", K_O_RDONLY).unwrap();
    assert_eq!(read_n(&fs, handle, 64), b"archived doc");
    assert!(!tmp.path().join("usr").exists());

    assert_eq!(fs.length("/usr/share/doc.txt").unwrap(), 12);
    assert!(fs.last_modified("/usr/share/doc.txt").unwrap() > 0);
    assert_eq!(fs.write(handle, b"x").unwrap_err(), Errno::BadDescriptor);
}

#[test]
fn test_archive_write_open_materializes_first() {
    let (tmp, _host, fs) = setup();
    with_archive(&fs);

    let handle = fs.open("/usr/share/doc.txt", K_O_WRONLY | K_O_APPEND).unwrap();
    fs.write(handle, b"!").unwrap();
    fs.close(handle).unwrap();

    assert_eq!(
        std::fs::read(tmp.path().join("usr/share/doc.txt")).unwrap(),
        b"archived doc!"
    );
    assert_eq!(fs.length("/usr/share/doc.txt").unwrap(), 13);
}

#[test]
fn test_archive_remove_and_rename_do_not_resurrect() {
    let (tmp, _host, fs) = setup();
    with_archive(&fs);
    write_native(tmp.path(), "/usr/share/native.txt", b"n");

    fs.remove("/usr/share/other.txt").unwrap();
    assert_eq!(fs.stat("/usr/share/other.txt", 0).unwrap_err(), Errno::NotFound);
    assert!(!tmp.path().join("usr/share/other.txt").exists());

    fs.rename("/etc/conf", "/etc/conf.bak").unwrap();
    assert_eq!(fs.stat("/etc/conf", 0).unwrap_err(), Errno::NotFound);
    assert_eq!(std::fs::read(tmp.path().join("etc/conf.bak")).unwrap(), b"key=value");

    let names: Vec<_> = fs.list_dir("/usr/share").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["doc.txt", "native.txt"]);
}

#[test]
fn test_archive_directory_rename_moves_contents() {
    let (tmp, _host, fs) = setup();
    with_archive(&fs);

    fs.rename("/opt/pkg", "/opt/pkg2").unwrap();

    assert_eq!(std::fs::read(tmp.path().join("opt/pkg2/bin/tool")).unwrap(), b"tool binary");
    assert_eq!(fs.stat("/opt/pkg/bin/tool", 0).unwrap_err(), Errno::NotFound);
    let handle = fs.open("/opt/pkg2/bin/tool", K_O_RDONLY).unwrap();
    assert_eq!(read_n(&fs, handle, 4), b"tool");
}

#[test]
fn test_archive_directory_removal_needs_empty() {
    let (_tmp, _host, fs) = setup();
    with_archive(&fs);

    assert_eq!(fs.remove_dir("/etc").unwrap_err(), Errno::DirectoryNotEmpty);
    fs.remove("/etc/conf").unwrap();
    fs.remove_dir("/etc").unwrap();
    assert_eq!(fs.stat("/etc", 0).unwrap_err(), Errno::NotFound);
}

#[test]
fn test_busy_delete_without_handles_is_not_relocated() {
    let mut host = MockHostFs::new();
    host.expect_metadata().returning(|_| Ok(HostMetadata::file(3)));
    host.expect_exists().return_const(true);
    host.expect_remove_file()
        .times(1)
        .returning(|_| Err(io::Error::from_raw_os_error(libc::EBUSY)));
    host.expect_rename().times(0);
    host.expect_create_dir_all().times(0);

    let fs = KernelFs::new(KernelConfig::with_root("/guest"), Arc::new(host));
    assert_eq!(fs.remove("/f").unwrap_err(), Errno::Busy);
    assert_eq!(fs.stat("/f", 0).unwrap().len, 3);
}

#[test]
fn test_injected_rename_fault_restores_handles() {
    let tmp = TempDir::new().unwrap();
    let host = Arc::new(FaultyHostFs::new(
        StdHostFs,
        FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                op: FaultOp::Rename,
                errno: FaultErrno::Exdev,
                start_after: 0,
                max_faults: Some(1),
            }],
        },
    ));
    let fs = KernelFs::new(KernelConfig::with_root(tmp.path()), host);
    write_native(tmp.path(), "/data", CONTENT);
    let handle = open_at(&fs, "/data", 8);

    assert_eq!(fs.rename("/data", "/moved").unwrap_err(), Errno::CrossDevice);
    assert_eq!(read_n(&fs, handle, 2), b"89");

    fs.rename("/data", "/moved").unwrap();
    assert_eq!(read_n(&fs, handle, 2), b"ab");
}

#[test]
fn test_create_on_open_makes_missing_native_parents() {
    let (tmp, _host, fs) = setup();
    with_archive(&fs);

    // /opt/pkg/bin exists only in the archive
    let handle = fs.open("/opt/pkg/bin/new", K_O_WRONLY | K_O_CREAT).unwrap();
    fs.write(handle, b"fresh").unwrap();
    fs.close(handle).unwrap();
    assert_eq!(std::fs::read(tmp.path().join("opt/pkg/bin/new")).unwrap(), b"fresh");
}
