use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use casfs::fs::fence::{FenceGuard, RemountFence};

#[test]
fn enter_leave_balances_the_counter() {
    let fence = RemountFence::new();
    fence.enter();
    fence.enter();
    assert_eq!(fence.readers(), 2);
    fence.leave();
    fence.leave();
    assert_eq!(fence.readers(), 0);
}

#[test]
fn guard_leaves_on_drop() {
    let fence = RemountFence::new();
    {
        let _guard = FenceGuard::new(&fence);
        assert_eq!(fence.readers(), 1);
    }
    assert_eq!(fence.readers(), 0);
}

#[test]
fn block_waits_for_readers_to_drain() {
    let fence = Arc::new(RemountFence::new());
    fence.enter();

    let blocked = Arc::new(AtomicBool::new(false));
    let writer = {
        let fence = Arc::clone(&fence);
        let blocked = Arc::clone(&blocked);
        std::thread::spawn(move || {
            fence.block();
            blocked.store(true, Ordering::SeqCst);
            fence.unblock();
        })
    };

    // The writer cannot pass while we are inside.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!blocked.load(Ordering::SeqCst));
    assert!(fence.is_blocking());

    fence.leave();
    writer.join().expect("writer thread");
    assert!(blocked.load(Ordering::SeqCst));
    assert!(!fence.is_blocking());
}

#[test]
fn no_reader_holds_the_fence_while_blocked() {
    let fence = Arc::new(RemountFence::new());
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let fence = Arc::clone(&fence);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    fence.enter();
                    std::thread::sleep(Duration::from_micros(50));
                    fence.leave();
                }
            })
        })
        .collect();

    for _ in 0..10 {
        fence.block();
        // Exclusion: while blocked, nobody is inside.
        assert_eq!(fence.readers(), 0);
        fence.unblock();
        std::thread::sleep(Duration::from_millis(1));
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().expect("reader thread");
    }
}
