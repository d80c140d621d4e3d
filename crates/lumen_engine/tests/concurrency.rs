//! Registries used from several threads at once

mod common;

use ash::vk::{self, Handle};
use common::{CountingDestroyer, HostAllocator};
use lumen_engine::render::backends::vulkan::{FrameResources, FreeQueue};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn concurrent_free_runs_every_action_once() {
    const PER_THREAD: usize = 1000;
    let queue = Arc::new(FreeQueue::new(2));
    let counter = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..PER_THREAD {
                    let counter = Arc::clone(&counter);
                    queue.free(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    queue.flush();
    assert_eq!(counter.load(Ordering::SeqCst), 2 * PER_THREAD);
    assert_eq!(queue.pending_count(), 0);

    queue.flush();
    assert_eq!(counter.load(Ordering::SeqCst), 2 * PER_THREAD);
}

#[test]
fn concurrent_collect_destroys_every_handle_once() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 250;
    let destroyer = Arc::new(CountingDestroyer::default());
    let resources = Arc::new(FrameResources::new(destroyer.clone(), Arc::new(HostAllocator::default()), 2));
    resources.begin_slot(0);

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let resources = Arc::clone(&resources);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    resources.garbage.collect(vk::CommandBuffer::from_raw(1 + t * PER_THREAD + i));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    resources.begin_slot(1);
    assert!(destroyer.destroyed().is_empty());
    resources.begin_slot(0);

    let destroyed = destroyer.destroyed();
    assert_eq!(destroyed.len() as u64, THREADS * PER_THREAD);
    assert_eq!(destroyer.destroyed_set().len(), destroyed.len());
}

#[test]
fn concurrent_staging_requests_get_distinct_buffers() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 50;
    let allocator = Arc::new(HostAllocator::default());
    let resources = Arc::new(FrameResources::new(
        Arc::new(CountingDestroyer::default()),
        allocator.clone(),
        2,
    ));
    resources.begin_slot(0);

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let resources = Arc::clone(&resources);
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| {
                        let buffer = resources.staging.get_buffer(((t * PER_THREAD + i) % 300 + 1) as u64).unwrap();
                        buffer.write(&[t as u8; 1]).unwrap();
                        buffer.handle().as_raw()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut handles = HashSet::new();
    for worker in workers {
        for handle in worker.join().unwrap() {
            assert!(handles.insert(handle), "buffer {handle} handed out twice in one frame");
        }
    }
    assert_eq!(resources.staging.in_use_count(0), THREADS * PER_THREAD);

    resources.begin_slot(1);
    resources.begin_slot(0);
    assert_eq!(resources.staging.in_use_count(0), 0);
    assert_eq!(resources.staging.free_count(0), THREADS * PER_THREAD);
    assert_eq!(allocator.buffers_created(), THREADS * PER_THREAD);
}

#[test]
fn collect_from_workers_while_frames_advance() {
    const FRAMES: usize = 3;
    let destroyer = Arc::new(CountingDestroyer::default());
    let resources = Arc::new(FrameResources::new(destroyer.clone(), Arc::new(HostAllocator::default()), FRAMES));
    let submitted = Arc::new(AtomicUsize::new(0));

    let worker = {
        let resources = Arc::clone(&resources);
        let submitted = Arc::clone(&submitted);
        thread::spawn(move || {
            for raw in 1..=500u64 {
                resources.garbage.collect(vk::CommandBuffer::from_raw(raw));
                let submitted = Arc::clone(&submitted);
                resources.free_queue.free(move || {
                    submitted.fetch_add(1, Ordering::SeqCst);
                });
            }
        })
    };

    for frame in 0..200 {
        resources.begin_slot(frame % FRAMES);
    }
    worker.join().unwrap();
    resources.release_all();

    assert_eq!(destroyer.destroyed().len(), 500);
    assert_eq!(destroyer.destroyed_set().len(), 500);
    assert_eq!(submitted.load(Ordering::SeqCst), 500);
}
