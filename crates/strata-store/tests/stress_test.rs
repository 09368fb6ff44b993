use std::time::Instant;

use strata_store::{BlockConfig, BlockStorage};
use tempfile::TempDir;

#[test]
fn stress_test_concurrent_writers() {
    // Quick stress test for CI (8 threads x 25 keys)
    const THREADS: usize = 8;
    const KEYS_PER_THREAD: usize = 25;

    let temp = TempDir::new().unwrap();
    let cfg = BlockConfig::default().with_block_size(1024);
    let store = BlockStorage::open(temp.path(), cfg).unwrap();

    // Alternating content to test dedup (50% shared)
    let value_for = |t: usize, i: usize| -> Vec<u8> {
        if i % 2 == 0 {
            format!("unique content {} {} ", t, i).repeat(200).into_bytes()
        } else {
            "shared content ".repeat(200).into_bytes()
        }
    };

    let start = Instant::now();
    std::thread::scope(|s| {
        for t in 0..THREADS {
            let store = &store;
            s.spawn(move || {
                for i in 0..KEYS_PER_THREAD {
                    store
                        .write_bytes(&format!("t{}-k{}", t, i), &value_for(t, i))
                        .unwrap();
                }
            });
        }
    });
    let duration = start.elapsed();
    println!(
        "Wrote {} keys in {:?} ({:.2} keys/sec)",
        THREADS * KEYS_PER_THREAD,
        duration,
        (THREADS * KEYS_PER_THREAD) as f64 / duration.as_secs_f64()
    );

    for t in 0..THREADS {
        for i in 0..KEYS_PER_THREAD {
            let key = format!("t{}-k{}", t, i);
            assert_eq!(store.read_bytes(&key).unwrap(), value_for(t, i), "{}", key);
        }
    }

    let stats = store.stats().unwrap();
    println!("Store Stats: {:?}", stats);
    assert_eq!(stats.node_count as usize, THREADS * KEYS_PER_THREAD);

    // Racing writers of shared blocks must not leave temp files or orphans
    let cleaned = store.clean().unwrap();
    assert_eq!(cleaned.removed_temp, 0);
    assert_eq!(cleaned.removed_blocks, 0);
}

#[test]
fn stress_test_concurrent_writers_same_key() {
    const THREADS: usize = 8;

    let temp = TempDir::new().unwrap();
    let cfg = BlockConfig::default().with_block_size(64);
    let store = BlockStorage::open(temp.path(), cfg).unwrap();

    let results: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = &store;
                s.spawn(move || {
                    let value = vec![t as u8; 500];
                    match store.write_bytes("contended", &value) {
                        Ok(()) => true,
                        Err(e) if e.is_already_exists() => false,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Exactly one writer wins the node
    assert_eq!(results.iter().filter(|&&won| won).count(), 1);
    let winner = results.iter().position(|&won| won).unwrap();
    assert_eq!(store.read_bytes("contended").unwrap(), vec![winner as u8; 500]);
}
