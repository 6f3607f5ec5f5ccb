//! Drive the memory model and stack the way an evaluator would

use std::ptr::NonNull;

use slabheap::{Allocator, GcPhase, MemoryError, MemoryModel, MemorySettings, StackAllocator};

/// A growable byte vector over any allocator
struct ByteVec {
    ptr: Option<NonNull<u8>>,
    len: usize,
    capacity: usize,
}

impl ByteVec {
    fn new() -> Self {
        ByteVec {
            ptr: None,
            len: 0,
            capacity: 0,
        }
    }

    fn push<A: Allocator>(&mut self, heap: &mut A, byte: u8) {
        if self.len == self.capacity {
            let capacity = (self.capacity * 2).max(8);
            let fresh = heap.allocate(capacity).unwrap();
            if let Some(old) = self.ptr {
                unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), self.len) };
                heap.deallocate(old, self.capacity);
            }
            self.ptr = Some(fresh);
            self.capacity = capacity;
        }
        if let Some(ptr) = self.ptr {
            unsafe { ptr.as_ptr().add(self.len).write(byte) };
        }
        self.len += 1;
    }

    fn as_slice(&self) -> &[u8] {
        match self.ptr {
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    fn mark<A: Allocator>(&self, heap: &mut A) {
        if let Some(ptr) = self.ptr {
            heap.mark(ptr, self.capacity);
        }
    }

    fn free<A: Allocator>(self, heap: &mut A) {
        if let Some(ptr) = self.ptr {
            heap.deallocate(ptr, self.capacity);
        }
    }
}

fn sanitizing() -> MemoryModel {
    MemoryModel::new(MemorySettings {
        sanitize: true,
        ..Default::default()
    })
    .unwrap()
}

#[test]
pub fn test_vector_growth_crosses_big_threshold() {
    let mut heap = sanitizing();
    let mut v = ByteVec::new();
    for i in 0..1000 {
        v.push(&mut heap, (i % 251) as u8);
    }
    assert!(v.as_slice().iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));

    // only the current buffer is live
    assert_eq!(heap.used_memory(), 1024);
    assert_eq!(heap.leaks().len(), 1);

    v.free(&mut heap);
    assert_eq!(heap.used_memory(), 0);
    assert!(heap.leaks().is_empty());
    assert!(heap.peak_memory() >= 1024 + 512);
}

#[test]
pub fn test_epochs_keep_reachable_vectors() {
    let mut heap = MemoryModel::default();
    let mut roots: Vec<ByteVec> = vec![];
    for n in [3, 30, 300, 3000] {
        let mut v = ByteVec::new();
        for i in 0..n {
            v.push(&mut heap, i as u8);
        }
        roots.push(v);
    }
    let mut garbage = ByteVec::new();
    for i in 0..100 {
        garbage.push(&mut heap, i);
    }
    let used_before = heap.used_memory();

    for epoch in 0..3 {
        heap.prepare_for_gc();
        assert_eq!(heap.phase(), GcPhase::Marking);
        for root in &roots {
            root.mark(&mut heap);
        }
        heap.sweep();
        assert_eq!(heap.stats().collections.collections, epoch + 1);
    }

    assert_eq!(heap.used_memory(), used_before - 128);
    for (root, n) in roots.iter().zip([3, 30, 300, 3000]) {
        assert_eq!(root.as_slice().len(), n);
        assert!(root.as_slice().iter().enumerate().all(|(i, b)| *b == i as u8));
    }
}

#[test]
pub fn test_stack_frames_for_calls() {
    let settings = MemorySettings {
        stack_size: 4096,
        ..Default::default()
    };
    let mut stack = StackAllocator::with_settings(&settings).unwrap();

    // recursive calls until the stack is exhausted
    let mut frames = vec![];
    let overflow = loop {
        match stack.push(96) {
            Ok(state) => frames.push(state),
            Err(e) => break e,
        }
    };
    assert_eq!(frames.len(), 4096 / 96);
    assert!(matches!(overflow, MemoryError::StackOverflow { .. }));

    while let Some(state) = frames.pop() {
        stack.pop(state);
    }
    assert_eq!(stack.used(), 0);
    assert_eq!(stack.usable(), 4096);
}

#[test]
pub fn test_stack_shared_between_evaluators() {
    let mut main = StackAllocator::new(1024).unwrap();
    let outer = main.push(128).unwrap();

    let mut nested = StackAllocator::shared_with(&main);
    let frame = nested.push_invoke(64, 1000).unwrap();
    assert_eq!(nested.used(), 192);
    nested.pop(frame);
    nested.fade();

    main.pop(outer);
    main.destroy();
    assert_eq!(main.size(), 0);
}

#[test]
pub fn test_settings_reject_bad_policy() {
    let result = MemoryModel::new(MemorySettings {
        granularity: 48,
        ..Default::default()
    });
    assert!(matches!(result, Err(MemoryError::BadSettings(_))));
}

#[test]
pub fn test_smaller_granularity() {
    let mut heap = MemoryModel::new(MemorySettings {
        granularity: 8,
        big_threshold: 128,
        ..Default::default()
    })
    .unwrap();
    let a = heap.allocate(3).unwrap();
    let b = heap.allocate(3).unwrap();
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 8);
    assert_eq!(heap.used_memory(), 16);

    heap.allocate(128).unwrap();
    assert_eq!(heap.stats().big_allocations, 1);
}
