use std::path::Path;
use std::process::Command;

use tracery_snapshot::{
    write_range_contents, AddressSpaceRecord, PageRange, PageRangeKind, ProgramSnapshot,
    TaskRecord,
};

fn write_workspace(dir: &Path) {
    // mov rax, 5; add rax, 7; hlt
    let mut code = vec![0u8; 0x1000];
    code[..12].copy_from_slice(&[
        0x48, 0xC7, 0xC0, 0x05, 0x00, 0x00, 0x00, // mov rax, 5
        0x48, 0x83, 0xC0, 0x07, // add rax, 7
        0xF4, // hlt
    ]);
    write_range_contents(&dir.join("memory"), "code", &code).unwrap();

    let snapshot = ProgramSnapshot {
        address_spaces: vec![AddressSpaceRecord {
            id: 1,
            parent_id: None,
            page_ranges: vec![PageRange {
                base: 0x40_0000,
                limit: 0x40_1000,
                kind: PageRangeKind::Anonymous,
                can_read: true,
                can_write: false,
                can_exec: true,
                name: "code".to_owned(),
                file_path: None,
                file_offset: 0,
            }],
        }],
        tasks: vec![TaskRecord {
            address_space_id: 1,
            pc: 0x40_0000,
            state: Vec::new(),
        }],
    };
    snapshot.save(&dir.join("snapshot")).unwrap();
}

#[test]
fn executes_a_snapshot_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    write_workspace(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_execute"))
        .args([
            "--workspace",
            dir.path().to_str().expect("workspace path should be UTF-8"),
            "--arch",
            "amd64",
            "--version_code",
        ])
        .output()
        .expect("failed to run execute");

    assert!(
        output.status.success(),
        "execute exited with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    // The run populated the workspace's code cache.
    assert!(dir.path().join("index").is_file());
    assert!(dir.path().join("bitcode").is_dir());
}

#[test]
fn missing_snapshot_is_exit_code_two() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_execute"))
        .args([
            "--workspace",
            dir.path().to_str().expect("workspace path should be UTF-8"),
        ])
        .output()
        .expect("failed to run execute");

    assert_eq!(output.status.code(), Some(2));
}
