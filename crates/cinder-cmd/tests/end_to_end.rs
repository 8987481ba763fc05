//! Allocation, command building, submission and buffer lifetime together.

use std::sync::Arc;
use std::thread;

use cinder_cmd::{CmdStream, Gpu, Pipe, Reloc};
use cinder_core::{BoFlags, PipeId, RelocFlags, SubmitReloc};
use cinder_mem::{Bo, Device};
use cinder_test_framework::MockTransport;

fn open(mock: &MockTransport) -> (Device<MockTransport>, Pipe<MockTransport>) {
    let dev = Device::open(mock.clone());
    let gpu = Gpu::new(&dev, 0).unwrap();
    let pipe = Pipe::new(&gpu, PipeId::ThreeD);
    (dev, pipe)
}

#[test]
fn test_relocate_and_finish() {
    let mock = MockTransport::new();
    let (dev, pipe) = open(&mock);
    let bo = Bo::new(&dev, 4096, BoFlags::UNCACHED).unwrap();
    let mut stream = CmdStream::new(&pipe, 1024, None).unwrap();

    stream.reserve(4);
    stream.reloc(&Reloc { bo: &bo, offset: 0, flags: RelocFlags::READ });
    stream.emit(0x0801_0e03);
    stream.reloc(&Reloc { bo: &bo, offset: 0x100, flags: RelocFlags::WRITE });
    stream.finish().unwrap();

    assert!(!stream.timestamp().is_none());

    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0].bos.len(), 1);
    assert_eq!(submits[0].relocs[0], SubmitReloc::new(0, 0, 0));
    assert_eq!(submits[0].relocs[1], SubmitReloc::new(8, 0, 0x100));

    let found = dev.lookup_handle(bo.handle()).unwrap();
    assert_eq!(found, bo);
    drop(found);
    assert_eq!(bo.refcount(), 1);
}

#[test]
fn test_released_buffers_come_back_from_cache() {
    let mock = MockTransport::new();
    let (dev, pipe) = open(&mock);
    let mut stream = CmdStream::new(&pipe, 256, None).unwrap();

    for _ in 0..4 {
        let bo = Bo::new(&dev, 64 * 1024, BoFlags::WC).unwrap();
        stream.reloc(&Reloc { bo: &bo, offset: 0, flags: RelocFlags::READ });
        drop(bo);
        stream.finish().unwrap();
    }

    assert_eq!(mock.counts().bo_new, 1);
    assert_eq!(dev.stats().cache_hits, 3);
}

#[test]
fn test_busy_buffers_are_not_recycled() {
    let mock = MockTransport::new();
    mock.set_auto_retire(false);
    let (dev, pipe) = open(&mock);
    let mut stream = CmdStream::new(&pipe, 256, None).unwrap();

    let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
    let handle = bo.handle();
    stream.reloc(&Reloc { bo: &bo, offset: 0, flags: RelocFlags::READ });
    drop(bo);
    stream.flush();

    // Still in flight: a new allocation must not get it.
    let next = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
    assert_ne!(next.handle(), handle);

    mock.retire_all();
    let again = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
    assert_eq!(again.handle(), handle);
}

#[test]
fn test_threads_share_a_device() {
    let mock = MockTransport::new();
    let (dev, pipe) = open(&mock);
    let shared = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
    let shared = Arc::new(shared);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let dev = dev.clone();
            let pipe = pipe.clone();
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut stream = CmdStream::new(&pipe, 128, None).unwrap();
                for _ in 0..50 {
                    let bo = Bo::new(&dev, 8192, BoFlags::WC).unwrap();
                    stream.reserve(4);
                    stream.reloc(&Reloc { bo: &bo, offset: 0, flags: RelocFlags::WRITE });
                    stream.reloc(&Reloc { bo: &shared, offset: 0, flags: RelocFlags::READ });
                    assert!(stream.bos().len() <= 2 * 128);
                }
                stream.flush();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(shared.refcount(), 1);
    let handles_in_use = mock.open_handles();
    assert_eq!(handles_in_use, 1 + dev.cached_count());
}
