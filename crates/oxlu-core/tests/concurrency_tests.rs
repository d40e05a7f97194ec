//! Object cache and lock server under concurrent callers.

mod common;

use common::{SizeClient, TestStack, connect_client, init_tracing};
use oxlu_core::dlm::{EnqueueRequest, EnqueueStatus, Extent, LockMode};
use oxlu_core::{Env, Fid};
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;

#[test]
fn test_concurrent_find_caches_one_object() {
    init_tracing();
    let stack = TestStack::running("OST0000");
    let fid = Fid::new(0x100000400, 0x99, 0);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let dev = Arc::clone(&stack.dev);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut env = Env::new();
                barrier.wait();
                let obj = dev.object_find(&mut env, fid).unwrap();
                std::ptr::from_ref(obj.header()) as usize
            })
        })
        .collect();
    let headers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(headers.windows(2).all(|w| w[0] == w[1]));
    let stats = stack.dev.site().stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.cached, 1);
    assert_eq!(
        stats.created + stats.cache_hits + stats.cache_races,
        THREADS as u64
    );
    // Copies built by losing racers are gone, only the cached one is live.
    assert_eq!(stack.osd.live_objects(), 1);
}

#[test]
fn test_parallel_glimpses_agree_on_size() {
    init_tracing();
    let stack = TestStack::running("OST0000");
    let fid = Fid::new(0x100000400, 0x9a, 0);
    stack.osd.write(fid, 10, 1);

    let writers: Vec<_> = (0..4u64)
        .map(|i| {
            let client = SizeClient::with_size(1000 * (i + 1));
            let export = connect_client(&stack.dev, i + 1, &client);
            let reply = stack
                .dev
                .lock_enqueue(
                    EnqueueRequest::new(fid, export, LockMode::Cw)
                        .extent(Extent::new(i * 100, i * 100 + 4095)),
                )
                .unwrap();
            assert_eq!(reply.status, EnqueueStatus::Granted);
            client
        })
        .collect();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS as u64)
        .map(|i| {
            let dev = Arc::clone(&stack.dev);
            let barrier = Arc::clone(&barrier);
            let reader = SizeClient::with_size(0);
            let export = connect_client(&dev, 100 + i, &reader);
            thread::spawn(move || {
                barrier.wait();
                dev.lock_enqueue(EnqueueRequest::new(fid, export, LockMode::Pr).glimpse_intent())
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        let reply = handle.join().unwrap();
        assert_eq!(reply.status, EnqueueStatus::Aborted);
        assert_eq!(reply.lvb.unwrap().size, 4000);
    }

    // Only the writer with the greatest start is ever asked.
    assert_eq!(writers[3].calls() as usize, THREADS);
    assert!(writers[..3].iter().all(|w| w.calls() == 0));
    assert_eq!(stack.dev.namespace().unwrap().lock_count(), 4);
    assert_eq!(stack.dev.stats().snapshot().intent_aborted, THREADS as u64);
}

#[test]
fn test_concurrent_enqueue_and_cancel() {
    init_tracing();
    let stack = TestStack::running("OST0000");
    let fid = Fid::new(0x100000400, 0x9b, 0);

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|i| {
            let dev = Arc::clone(&stack.dev);
            let export = connect_client(&dev, i + 1, &SizeClient::with_size(0));
            thread::spawn(move || {
                for round in 0..16u64 {
                    let start = (i * 16 + round) * 4096;
                    let reply = dev
                        .lock_enqueue(
                            EnqueueRequest::new(fid, Arc::clone(&export), LockMode::Pw)
                                .extent(Extent::new(start, start + 4095)),
                        )
                        .unwrap();
                    assert_eq!(reply.status, EnqueueStatus::Granted);
                    let lock = reply.lock.unwrap();
                    dev.lock_cancel(lock.handle()).unwrap();
                    assert!(lock.is_destroyed());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let ns = stack.dev.namespace().unwrap();
    assert_eq!(ns.lock_count(), 0);
    let res = ns.resource_get(&fid, false).unwrap().unwrap();
    assert_eq!(res.lock().granted_count(), 0);
}
