//! Concurrent-transaction scenarios: non-conflicting writers proceed in
//! parallel, conflicting writers serialize under the per-resource lock.

use std::sync::{Arc, Barrier};

use txfs_core::{Manager, TxConfig};

#[test]
fn concurrent_non_conflicting_writes_both_commit() {
    let temp = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&TxConfig::new(temp.path())).unwrap();
    manager.initialize().unwrap();
    let manager = Arc::new(manager);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [("a.txt", "alpha"), ("b.txt", "beta")]
        .into_iter()
        .map(|(name, content)| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                manager
                    .run(|tx| -> Result<(), String> {
                        tx.write(name, content.as_bytes()).unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(temp.path().join("b.txt")).unwrap(), b"beta");
}

#[test]
fn concurrent_conflicting_writes_serialize_with_no_interleaving() {
    let temp = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&TxConfig::new(temp.path())).unwrap();
    manager.initialize().unwrap();
    let manager = Arc::new(manager);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["first-writer-payload", "second-writer-payload"]
        .into_iter()
        .map(|content| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                manager
                    .run(|tx| -> Result<(), String> {
                        tx.write("c.txt", content.as_bytes()).unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let final_content = std::fs::read_to_string(temp.path().join("c.txt")).unwrap();
    assert!(
        final_content == "first-writer-payload" || final_content == "second-writer-payload",
        "final content must be exactly one writer's payload, got {final_content:?}"
    );
}
