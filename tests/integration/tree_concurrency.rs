use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;

use bpdict::{BPlusTree, CachePolicy, LockStrategy, Result, TreeConfig, TreeError, TreeOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("bpdict=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn open_tree(
    order: usize,
    policy: CachePolicy,
    node_locking: LockStrategy,
) -> Result<Arc<BPlusTree<u64, u64>>> {
    let mut config = TreeConfig::default();
    config.set_btree_order(order)?;
    config.set_cache_policy(policy);
    config.set_node_locking(node_locking);
    config.set_lock_timeout_ms(10_000)?;
    Ok(Arc::new(BPlusTree::open(TreeOptions::new(config))?))
}

fn join<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| TreeError::Protocol("worker thread panicked"))?
}

/// Each writer owns a disjoint key stripe, so the final content is known exactly.
fn run_disjoint_writers(
    tree: Arc<BPlusTree<u64, u64>>,
    writers: u64,
    per_writer: u64,
) -> Result<()> {
    let mut handles = Vec::new();
    for writer in 0..writers {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || -> Result<()> {
            let mut rng = ChaCha8Rng::seed_from_u64(writer);
            for n in 0..per_writer {
                let key = n * writers + writer;
                tree.insert(key, key * 3)?;
                if rng.gen_bool(0.3) {
                    let victim = rng.gen_range(0..=n) * writers + writer;
                    tree.remove(&victim)?;
                    tree.add(victim, victim * 3)?;
                }
            }
            for n in (0..per_writer).filter(|n| n % 2 == 1) {
                let key = n * writers + writer;
                if tree.remove(&key)? != Some(key * 3) {
                    return Err(TreeError::Corruption("stripe lost a key"));
                }
            }
            Ok(())
        }));
    }
    for handle in handles {
        join(handle)?;
    }

    let report = tree.validate()?;
    assert_eq!(report.entries, writers * per_writer.div_ceil(2));
    for key in 0..writers * per_writer {
        let expected = ((key / writers) % 2 == 0).then_some(key * 3);
        assert_eq!(tree.try_get(&key)?, expected, "key {key}");
    }
    Ok(())
}

#[test]
fn concurrent_writers_on_disjoint_keys() -> Result<()> {
    run_disjoint_writers(open_tree(4, CachePolicy::All, LockStrategy::WriterOnly)?, 4, 400)?;
    run_disjoint_writers(open_tree(16, CachePolicy::Recent, LockStrategy::WriterOnly)?, 6, 300)?;
    run_disjoint_writers(open_tree(8, CachePolicy::None, LockStrategy::ReadWrite)?, 4, 200)
}

/// Writers churn odd keys while readers and a scanner check the even ones.
fn run_stable_readers(tree: Arc<BPlusTree<u64, u64>>) -> Result<()> {
    // Even keys are never touched by writers; odd keys come and go.
    for key in (0u64..2_000).step_by(2) {
        tree.insert(key, key)?;
    }
    let stop = Arc::new(AtomicBool::new(false));

    let mut writers = Vec::new();
    for seed in 0..3u64 {
        let tree = Arc::clone(&tree);
        let stop = Arc::clone(&stop);
        writers.push(thread::spawn(move || -> Result<u64> {
            let mut rng = ChaCha8Rng::seed_from_u64(100 + seed);
            let mut ops = 0;
            while !stop.load(Ordering::Relaxed) && ops < 20_000 {
                let key = rng.gen_range(0u64..1_000) * 2 + 1;
                if rng.gen_bool(0.5) {
                    tree.add(key, key)?;
                } else {
                    tree.remove(&key)?;
                }
                ops += 1;
            }
            Ok(ops)
        }));
    }

    let mut readers = Vec::new();
    for seed in 0..3u64 {
        let tree = Arc::clone(&tree);
        readers.push(thread::spawn(move || -> Result<()> {
            let mut rng = ChaCha8Rng::seed_from_u64(200 + seed);
            for _ in 0..5_000 {
                let key = rng.gen_range(0u64..1_000) * 2;
                if tree.try_get(&key)? != Some(key) {
                    return Err(TreeError::Corruption("stable key missing"));
                }
            }
            Ok(())
        }));
    }

    let scanner = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || -> Result<()> {
            for _ in 0..5 {
                let mut evens = 0;
                let mut last = None;
                for item in tree.iter() {
                    let (key, value) = item?;
                    if key != value || last.is_some_and(|prev| prev >= key) {
                        return Err(TreeError::Corruption("cursor yielded out of order"));
                    }
                    last = Some(key);
                    if key % 2 == 0 {
                        evens += 1;
                    }
                }
                if evens != 1_000 {
                    return Err(TreeError::Corruption("cursor skipped a stable key"));
                }
            }
            Ok(())
        })
    };

    for reader in readers {
        join(reader)?;
    }
    join(scanner)?;
    stop.store(true, Ordering::Relaxed);
    let mut total = 0;
    for writer in writers {
        total += join(writer)?;
    }
    assert!(total > 0);

    tree.validate()?;
    for key in (0u64..2_000).step_by(2) {
        assert_eq!(tree.try_get(&key)?, Some(key));
    }
    Ok(())
}

#[test]
fn readers_see_stable_keys_while_writers_churn() -> Result<()> {
    init_tracing();
    run_stable_readers(open_tree(4, CachePolicy::Recent, LockStrategy::WriterOnly)?)?;
    run_stable_readers(open_tree(4, CachePolicy::All, LockStrategy::WriterOnly)?)?;
    run_stable_readers(open_tree(6, CachePolicy::Recent, LockStrategy::ReadWrite)?)?;
    run_stable_readers(open_tree(8, CachePolicy::None, LockStrategy::WriterOnly)?)
}

#[test]
fn exclusive_call_locking_serializes_everything() -> Result<()> {
    let mut config = TreeConfig::default();
    config.set_btree_order(4)?;
    config.set_call_level_locking(LockStrategy::Exclusive);
    config.set_node_locking(LockStrategy::Ignore);
    let tree: Arc<BPlusTree<u64, u64>> = Arc::new(BPlusTree::open(TreeOptions::new(config))?);
    tree.enable_count()?;

    let handles: Vec<_> = (0..4u64)
        .map(|worker| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || -> Result<()> {
                for n in 0..250u64 {
                    tree.insert(n * 4 + worker, n)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        join(handle)?;
    }
    assert_eq!(tree.count(), Some(1_000));
    assert_eq!(tree.validate()?.entries, 1_000);
    Ok(())
}
