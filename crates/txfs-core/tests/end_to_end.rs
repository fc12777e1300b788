//! End-to-end scenarios against the public `Manager` surface.

use std::path::Path;

use txfs_core::{Manager, RunError, TxConfig};

fn manager_in(dir: &Path) -> Manager {
    let mut manager = Manager::new(&TxConfig::new(dir)).unwrap();
    manager.initialize().unwrap();
    manager
}

#[test]
fn basic_write_commits_and_cleans_up() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_in(temp.path());

    manager
        .run(|tx| -> Result<(), String> {
            tx.write("a.txt", b"hi").unwrap();
            Ok(())
        })
        .unwrap();

    assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"hi");
    assert!(read_dir_empty(&temp.path().join(".tx/journal")));
    assert!(read_dir_empty(&temp.path().join(".tx/staging")));
}

#[test]
fn rollback_on_scope_error_leaves_base_untouched() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("a.txt"), b"one").unwrap();
    let manager = manager_in(temp.path());

    let result = manager.run(|tx| -> Result<(), &'static str> {
        tx.write("a.txt", b"two").unwrap();
        Err("E")
    });

    assert!(matches!(result, Err(RunError::Scope("E"))));
    assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"one");
    assert!(read_dir_empty(&temp.path().join(".tx/journal")));
    assert!(read_dir_empty(&temp.path().join(".tx/staging")));
}

#[test]
fn overwrite_rename_rolled_back_restores_both_sides() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("src"), b"s").unwrap();
    std::fs::write(temp.path().join("dst"), b"d").unwrap();
    let manager = manager_in(temp.path());

    let result = manager.run(|tx| -> Result<(), &'static str> {
        tx.rename("src", "dst").unwrap();
        Err("E")
    });

    assert!(result.is_err());
    assert_eq!(std::fs::read(temp.path().join("src")).unwrap(), b"s");
    assert_eq!(std::fs::read(temp.path().join("dst")).unwrap(), b"d");
}

#[test]
fn write_then_read_sees_uncommitted_content_in_same_tx() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_in(temp.path());

    manager
        .run(|tx| -> Result<(), String> {
            tx.write("a.txt", b"x").unwrap();
            let content = tx.read("a.txt").unwrap();
            assert_eq!(content, b"x");
            Ok(())
        })
        .unwrap();
}

#[test]
fn second_write_in_same_tx_does_not_duplicate_journal_entry() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_in(temp.path());

    manager
        .run(|tx| -> Result<(), String> {
            tx.write("a.txt", b"x").unwrap();
            tx.write("a.txt", b"y").unwrap();
            Ok(())
        })
        .unwrap();

    assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"y");
}

#[test]
fn mkdir_twice_is_a_no_op_after_the_first() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_in(temp.path());

    manager
        .run(|tx| -> Result<(), String> {
            tx.mkdir("a", false).unwrap();
            tx.mkdir("a", false).unwrap();
            Ok(())
        })
        .unwrap();

    assert!(temp.path().join("a").is_dir());
}

#[test]
fn remove_twice_is_a_no_op_after_the_first() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("a.txt"), b"x").unwrap();
    let manager = manager_in(temp.path());

    manager
        .run(|tx| -> Result<(), String> {
            tx.remove("a.txt").unwrap();
            tx.remove("a.txt").unwrap();
            Ok(())
        })
        .unwrap();

    assert!(!temp.path().join("a.txt").exists());
}

#[test]
fn initialize_twice_has_same_effect_as_once() {
    let temp = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&TxConfig::new(temp.path())).unwrap();
    manager.initialize().unwrap();
    manager.initialize().unwrap();

    manager
        .run(|tx| -> Result<(), String> {
            tx.write("a.txt", b"hi").unwrap();
            Ok(())
        })
        .unwrap();
    assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"hi");
}

#[test]
fn path_escaping_base_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_in(temp.path());

    let result = manager.run(|tx| -> Result<(), String> {
        tx.write("../escape.txt", b"x")
            .map_err(|e| e.to_string())?;
        Ok(())
    });
    assert!(result.is_err());
}

fn read_dir_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut it| it.next().is_none()).unwrap_or(true)
}
