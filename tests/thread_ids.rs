//! Concurrency tests for the managed thread id dispenser.
//!
//! Many workers allocate and recycle ids against one dispenser at the same time; the tests
//! check that no id is ever live twice and that the id space stays compact.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use eeruntime::{
    prelude::*,
    runtime::threadid::{ID_MAIN_THREAD, ID_NONE},
};
use rayon::prelude::*;

/// Concurrent allocations never hand out the same id twice.
#[test]
fn test_parallel_allocation_is_unique() -> Result<()> {
    let dispenser = ManagedThreadIdDispenser::new();

    let ids: Vec<u32> = (0..512)
        .into_par_iter()
        .map(|_| dispenser.allocate_id())
        .collect::<Result<_>>()?;

    let unique: HashSet<u32> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(!unique.contains(&ID_NONE));
    assert_eq!(dispenser.live_ids()?, 512);

    // 513 tracked ids (the reserved one included) fit below the capacity.
    assert!(dispenser.capacity()? > 512);
    assert!(ids.iter().all(|&id| id < dispenser.capacity().unwrap_or(0)));
    Ok(())
}

/// Interleaved allocate and recycle cycles leave no id behind.
#[test]
fn test_parallel_churn() -> Result<()> {
    let dispenser = ManagedThreadIdDispenser::new();
    let live = Mutex::new(HashSet::new());

    (0..64).into_par_iter().try_for_each(|_| -> Result<()> {
        for _ in 0..32 {
            let handle = ManagedThreadId::new(&dispenser)?;
            let inserted = live
                .lock()
                .map(|mut live| live.insert(handle.id()))
                .unwrap_or(false);
            assert!(inserted, "id {} handed out while live", handle.id());

            let removed = live
                .lock()
                .map(|mut live| live.remove(&handle.id()))
                .unwrap_or(false);
            assert!(removed);
        }
        Ok(())
    })?;

    assert_eq!(dispenser.live_ids()?, 0);
    // At most 64 ids are live at once, so the tree never grows far.
    assert!(dispenser.capacity()? <= 224);
    Ok(())
}

/// Ids released by finished workers are handed out again.
#[test]
fn test_ids_are_reused_after_recycling() -> Result<()> {
    let dispenser = ManagedThreadIdDispenser::new();

    let first: Vec<u32> = (0..100)
        .into_par_iter()
        .map(|_| dispenser.allocate_id())
        .collect::<Result<_>>()?;
    let capacity = dispenser.capacity()?;

    first
        .par_iter()
        .try_for_each(|&id| dispenser.recycle_id(id))?;
    assert_eq!(dispenser.live_ids()?, 0);

    let second: HashSet<u32> = (0..100)
        .into_par_iter()
        .map(|_| dispenser.allocate_id())
        .collect::<Result<_>>()?;
    // Recycled slots are enough, the tree does not grow again.
    assert_eq!(second.len(), 100);
    assert_eq!(dispenser.capacity()?, capacity);
    assert!(second.iter().all(|&id| id != ID_NONE && id < capacity));
    Ok(())
}

/// The calling thread keeps one id for its lifetime; other threads get their own.
#[test]
fn test_current_thread_ids() -> Result<()> {
    let mine = current_managed_thread_id()?;
    assert_ne!(mine, ID_NONE);
    assert_eq!(current_managed_thread_id()?, mine);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let seen = Arc::clone(&seen);
            std::thread::spawn(move || -> Result<()> {
                let id = current_managed_thread_id()?;
                assert_eq!(current_managed_thread_id()?, id);
                if let Ok(mut seen) = seen.lock() {
                    seen.push(id);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle
            .join()
            .map_err(|_| Error::NotSupported("worker panicked".to_string()))??;
    }

    let seen = seen.lock().map(|seen| seen.clone()).unwrap_or_default();
    assert_eq!(seen.len(), 4);
    assert!(!seen.contains(&mine));
    assert!(global_dispenser().live_ids()? >= 1);
    assert!(mine >= ID_MAIN_THREAD);
    Ok(())
}
