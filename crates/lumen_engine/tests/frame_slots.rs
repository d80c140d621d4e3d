//! Frame-slot reclamation through the public resource registries

mod common;

use ash::vk::{self, Handle};
use common::{CountingDestroyer, HostAllocator};
use lumen_engine::render::backends::vulkan::{AllocationHandle, FrameResources, ImageGarbage, VulkanError};
use slotmap::SlotMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn resources(frames: usize) -> (Arc<CountingDestroyer>, Arc<HostAllocator>, FrameResources) {
    let destroyer = Arc::new(CountingDestroyer::default());
    let allocator = Arc::new(HostAllocator::default());
    let resources = FrameResources::new(destroyer.clone(), allocator.clone(), frames);
    (destroyer, allocator, resources)
}

#[test]
fn retired_handles_survive_until_their_slot_returns() {
    const FRAMES: usize = 3;
    let (destroyer, _allocator, resources) = resources(FRAMES);

    resources.begin_slot(0);
    resources.garbage.collect(vk::CommandBuffer::from_raw(42));

    for slot in 1..FRAMES {
        resources.begin_slot(slot);
        assert!(destroyer.destroyed().is_empty(), "destroyed before slot 0 came round again");
    }

    resources.begin_slot(0);
    assert_eq!(destroyer.destroyed(), vec![42]);

    resources.begin_slot(1);
    resources.begin_slot(2);
    resources.begin_slot(0);
    assert_eq!(destroyer.destroyed(), vec![42], "handles are destroyed exactly once");
}

#[test]
fn image_parts_are_destroyed_sampler_view_image() {
    let (destroyer, _allocator, resources) = resources(2);
    let mut allocations = SlotMap::<AllocationHandle, ()>::with_key();
    let allocation = allocations.insert(());

    resources.begin_slot(0);
    resources.garbage.collect(ImageGarbage {
        image: vk::Image::from_raw(10),
        allocation: Some(allocation),
        view: vk::ImageView::from_raw(11),
        sampler: vk::Sampler::from_raw(12),
    });
    resources.garbage.collect(ImageGarbage {
        image: vk::Image::from_raw(20),
        allocation: None,
        view: vk::ImageView::from_raw(21),
        sampler: vk::Sampler::null(),
    });

    resources.begin_slot(1);
    resources.begin_slot(0);
    assert_eq!(destroyer.destroyed(), vec![12, 11, 10, 21]);
}

#[test]
fn free_actions_wait_for_their_slot() {
    let (_destroyer, _allocator, resources) = resources(2);
    let order = Arc::new(Mutex::new(Vec::new()));

    resources.begin_slot(0);
    for i in 0..3 {
        let order = Arc::clone(&order);
        resources.free_queue.free(move || order.lock().unwrap().push(i));
    }
    resources.begin_slot(1);
    assert!(order.lock().unwrap().is_empty());

    resources.begin_slot(0);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn staging_buffers_are_reused_after_a_full_cycle() {
    const FRAMES: usize = 2;
    let (_destroyer, allocator, resources) = resources(FRAMES);

    resources.begin_slot(0);
    let first = resources.staging.get_buffer(100).unwrap();
    assert_eq!(first.size(), 128);
    first.write(&[7; 100]).unwrap();

    resources.begin_slot(1);
    let other = resources.staging.get_buffer(100).unwrap();
    assert_ne!(other.handle(), first.handle(), "slot 0 buffer is still owned by in-flight work");

    resources.begin_slot(0);
    let reused = resources.staging.get_buffer(128).unwrap();
    assert_eq!(reused.handle(), first.handle());
    assert_eq!(allocator.buffers_created(), 2);
}

#[test]
fn distinct_buffers_within_one_frame() {
    let (_destroyer, _allocator, resources) = resources(1);
    resources.begin_slot(0);

    let a = resources.staging.get_buffer(64).unwrap();
    let b = resources.staging.get_buffer(64).unwrap();
    let c = resources.staging.get_buffer(65).unwrap();
    assert_ne!(a.handle(), b.handle());
    assert_eq!(c.size(), 128);
    assert_eq!(resources.staging.in_use_count(0), 3);
}

#[test]
fn staging_size_limits() {
    let (_destroyer, _allocator, resources) = resources(1);
    assert!(matches!(resources.staging.get_buffer(0), Err(VulkanError::InvalidArgument { .. })));
    assert!(matches!(
        resources.staging.get_buffer((1 << 34) + 1),
        Err(VulkanError::OutOfMemory { .. })
    ));
}

#[test]
fn release_all_drains_every_slot() {
    let (destroyer, _allocator, resources) = resources(3);
    let ran = Arc::new(AtomicUsize::new(0));

    for slot in 0..3 {
        resources.begin_slot(slot);
        resources.garbage.collect(vk::CommandBuffer::from_raw(100 + slot as u64));
        let ran = Arc::clone(&ran);
        resources.free_queue.free(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    resources.release_all();
    assert_eq!(destroyer.destroyed().len(), 3);
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(resources.garbage.pending_count(), 0);
    assert_eq!(resources.free_queue.pending_count(), 0);
}

#[test]
fn dropping_the_registries_releases_staging_memory() {
    let (_destroyer, allocator, resources) = resources(2);
    resources.begin_slot(0);
    resources.staging.get_buffer(4096).unwrap();
    resources.begin_slot(1);
    resources.staging.get_buffer(1).unwrap();
    assert_eq!(allocator.live_allocations(), 2);

    drop(resources);
    assert_eq!(allocator.live_allocations(), 0);
}
