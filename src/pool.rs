//! Fence-synchronized GPU ring pools.
//!
//! A pool suballocates transient ranges out of a set of persistently mapped
//! heaps. Every range is tagged with the fence value of the submission that
//! consumes it; ranges are strictly FIFO in fence order, so the head of each
//! heap advances modulo its size and completed ranges return their capacity
//! without any coalescing. When no heap has enough linear space after
//! alignment padding, a new heap is created at twice the larger of the
//! request and the previous heap size.
//!
//! `begin_usage` binds the fence value of the upcoming submission;
//! `end_usage` reclaims every range whose fence has completed. The fence
//! itself is signaled by the submission that owns it.

use crate::backend::{GpuBackend, HeapCreation, MappedPtr, NativeId, NativeObject};
use crate::error::Result;
use crate::sync::FenceTimeline;
use std::collections::VecDeque;
use std::sync::Arc;

pub fn align_byte(value: u64, alignment: u64) -> u64 {
    ((value + alignment - 1) / alignment) * alignment
}

/// Heap and range arithmetic plugged into `GpuRingPool`.
pub trait RingAllocator {
    type Desc;
    type Alloc;
    type Heap;

    /// Creates a heap able to serve `desc`, returning it with its size.
    fn create_heap(&mut self, desc: &Self::Desc) -> Result<(Self::Heap, u64)>;
    /// Aligned `(offset, size)` for `desc` when placed at `input_offset`.
    fn get_range(&self, desc: &Self::Desc, input_offset: u64) -> (u64, u64);
    fn allocate_handle(&self, desc: &Self::Desc, heap_offset: u64, heap: &Self::Heap)
        -> Self::Alloc;
    fn destroy_heap(&mut self, heap: Self::Heap);
}

struct Range {
    fence_value: u64,
    size: u64,
}

struct HeapSlot<H> {
    ranges: VecDeque<Range>,
    capacity: u64,
    size: u64,
    offset: u64,
    heap: H,
}

pub struct GpuRingPool<A: RingAllocator> {
    heaps: Vec<HeapSlot<A::Heap>>,
    allocator: A,
    timeline: Arc<FenceTimeline>,
    current_fence: u64,
}

impl<A: RingAllocator> GpuRingPool<A> {
    pub fn new(allocator: A, timeline: Arc<FenceTimeline>) -> GpuRingPool<A> {
        GpuRingPool {
            heaps: Vec::new(),
            allocator,
            timeline,
            current_fence: 0,
        }
    }

    /// Binds the fence value the next submission will signal; every range
    /// allocated until `end_usage` belongs to it.
    pub fn begin_usage(&mut self, fence_value: u64) {
        self.current_fence = fence_value;
    }

    /// Reclaims the capacity of every range whose fence completed.
    pub fn end_usage(&mut self) {
        for slot in &mut self.heaps {
            while let Some(front) = slot.ranges.front() {
                if !self.timeline.is_complete(front.fence_value) {
                    break;
                }
                let range = slot.ranges.pop_front().unwrap();
                slot.capacity += range.size;
                if slot.ranges.is_empty() {
                    debug_assert_eq!(slot.capacity, slot.size);
                    slot.offset = 0;
                }
            }
        }
    }

    pub fn allocate(&mut self, desc: &A::Desc) -> Result<A::Alloc> {
        if let Some(alloc) = self.find_alloc(desc) {
            return Ok(alloc);
        }
        self.create_new(desc)
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Waits for outstanding ranges and destroys every heap.
    pub fn teardown(&mut self) {
        for mut slot in self.heaps.drain(..) {
            if let Some(front) = slot.ranges.front() {
                self.timeline.wait_cpu(front.fence_value, -1);
            }
            slot.ranges.clear();
            self.allocator.destroy_heap(slot.heap);
        }
    }

    //----------------------------------------------------------------------------------------------

    fn calculate_range(&self, desc: &A::Desc, slot: &HeapSlot<A::Heap>) -> Option<(u64, Range)> {
        let (mut offset, size) = self.allocator.get_range(desc, slot.offset);
        if offset >= slot.size {
            return None;
        }

        debug_assert!(offset >= slot.offset);
        let mut padding = offset - slot.offset;
        let size_left = slot.size - offset;

        if size > size_left {
            // wrap to the start of the heap
            padding += size_left;
            offset = 0;
        }

        if size + padding > slot.capacity {
            return None;
        }

        Some((
            offset,
            Range {
                fence_value: self.current_fence,
                size: size + padding,
            },
        ))
    }

    fn commit_range(slot: &mut HeapSlot<A::Heap>, range: Range, current_fence: u64) {
        debug_assert!(range.size <= slot.capacity);
        slot.capacity -= range.size;
        slot.offset = (slot.offset + range.size) % slot.size;

        match slot.ranges.back_mut() {
            Some(back) if back.fence_value == current_fence => back.size += range.size,
            _ => slot.ranges.push_back(range),
        }
    }

    fn find_alloc(&mut self, desc: &A::Desc) -> Option<A::Alloc> {
        for i in 0..self.heaps.len() {
            if self.heaps[i].capacity == 0 {
                continue;
            }
            if let Some((offset, range)) = self.calculate_range(desc, &self.heaps[i]) {
                let alloc = self
                    .allocator
                    .allocate_handle(desc, offset, &self.heaps[i].heap);
                Self::commit_range(&mut self.heaps[i], range, self.current_fence);
                return Some(alloc);
            }
        }
        None
    }

    fn create_new(&mut self, desc: &A::Desc) -> Result<A::Alloc> {
        let (heap, size) = self.allocator.create_heap(desc)?;
        self.heaps.push(HeapSlot {
            ranges: VecDeque::new(),
            capacity: size,
            size,
            offset: 0,
            heap,
        });

        let slot_index = self.heaps.len() - 1;
        let (offset, range) = self
            .calculate_range(desc, &self.heaps[slot_index])
            .expect("fresh heap must serve the allocation it was sized for");
        let alloc = self
            .allocator
            .allocate_handle(desc, offset, &self.heaps[slot_index].heap);
        Self::commit_range(&mut self.heaps[slot_index], range, self.current_fence);
        Ok(alloc)
    }
}

//--------------------------------------------------------------------------------------------------
// Staging pools: upload and readback memory.

#[derive(Copy, Clone, Debug)]
pub struct StagingDesc {
    pub size: u64,
}

/// A suballocated staging range. The pointer already includes the offset.
#[derive(Copy, Clone, Debug)]
pub struct StagingBlock {
    pub heap: NativeId,
    pub offset: u64,
    pub size: u64,
    pub ptr: MappedPtr,
    pub gpu_va: u64,
}

impl StagingBlock {
    /// Copies `data` into the mapped range.
    pub fn write(&self, data: &[u8]) {
        debug_assert!(data.len() as u64 <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
        }
    }

    /// Reads the mapped range back out.
    pub fn read(&self, out: &mut [u8]) {
        debug_assert!(out.len() as u64 <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr(), out.len());
        }
    }
}

pub struct StagingAllocator {
    backend: Arc<dyn GpuBackend>,
    readback: bool,
    alignment: u64,
    next_heap_size: u64,
}

impl StagingAllocator {
    pub fn new(backend: Arc<dyn GpuBackend>, readback: bool, initial_heap_size: u64) -> Self {
        let limits = backend.limits();
        let alignment = if readback {
            limits.readback_alignment
        } else {
            limits.constant_buffer_alignment
        };
        StagingAllocator {
            backend,
            readback,
            alignment,
            next_heap_size: initial_heap_size,
        }
    }
}

impl RingAllocator for StagingAllocator {
    type Desc = StagingDesc;
    type Alloc = StagingBlock;
    type Heap = HeapCreation;

    fn create_heap(&mut self, desc: &StagingDesc) -> Result<(HeapCreation, u64)> {
        let target = (2 * desc.size).max(self.next_heap_size);
        self.next_heap_size = (2 * desc.size).max(2 * self.next_heap_size);
        let heap = self.backend.create_staging_heap(target, self.readback)?;
        let size = heap.size;
        Ok((heap, size))
    }

    fn get_range(&self, desc: &StagingDesc, input_offset: u64) -> (u64, u64) {
        (
            align_byte(input_offset, self.alignment),
            align_byte(desc.size, self.alignment),
        )
    }

    fn allocate_handle(&self, desc: &StagingDesc, heap_offset: u64, heap: &HeapCreation)
        -> StagingBlock {
        debug_assert!(heap_offset + desc.size <= heap.size);
        debug_assert_eq!(heap_offset % self.alignment, 0);
        StagingBlock {
            heap: heap.id,
            offset: heap_offset,
            size: align_byte(desc.size, self.alignment),
            ptr: MappedPtr::new(heap.mapped.offset(heap_offset))
                .expect("staging heap mapping is never null"),
            gpu_va: heap.gpu_va + heap_offset,
        }
    }

    fn destroy_heap(&mut self, heap: HeapCreation) {
        self.backend.destroy(NativeObject::Heap(heap.id));
    }
}

/// Upload staging pool (CPU write, GPU read).
pub type UploadPool = GpuRingPool<StagingAllocator>;
/// Readback staging pool (GPU write, CPU read).
pub type ReadbackPool = GpuRingPool<StagingAllocator>;

#[cfg(test)]
mod tests {
    use super::*;

    // A CPU-side allocator exercising the ring arithmetic without a backend.
    struct TestAllocator {
        alignment: u64,
        next_heap_size: u64,
        live_heaps: usize,
    }

    impl RingAllocator for TestAllocator {
        type Desc = u64;
        type Alloc = (usize, u64); // (heap ordinal, offset)
        type Heap = usize;

        fn create_heap(&mut self, desc: &u64) -> Result<(usize, u64)> {
            let size = (2 * desc).max(self.next_heap_size);
            self.next_heap_size = (2 * desc).max(2 * self.next_heap_size);
            self.live_heaps += 1;
            Ok((self.live_heaps - 1, size))
        }

        fn get_range(&self, desc: &u64, input_offset: u64) -> (u64, u64) {
            (
                align_byte(input_offset, self.alignment),
                align_byte(*desc, self.alignment),
            )
        }

        fn allocate_handle(&self, _desc: &u64, heap_offset: u64, heap: &usize) -> (usize, u64) {
            (*heap, heap_offset)
        }

        fn destroy_heap(&mut self, _heap: usize) {
            self.live_heaps -= 1;
        }
    }

    use crate::backend::software::SoftwareInstance;
    use crate::backend::GpuInstance;

    fn pool(initial: u64) -> GpuRingPool<TestAllocator> {
        let backend = SoftwareInstance::new()
            .create_device(0, false)
            .unwrap();
        let timeline = Arc::new(FenceTimeline::new(backend));
        GpuRingPool::new(
            TestAllocator {
                alignment: 256,
                next_heap_size: initial,
                live_heaps: 0,
            },
            timeline,
        )
    }

    #[test]
    fn allocations_advance_with_alignment_padding() {
        let mut p = pool(4096);
        p.begin_usage(1);
        let (h0, o0) = p.allocate(&100).unwrap();
        let (h1, o1) = p.allocate(&100).unwrap();
        assert_eq!(h0, 0);
        assert_eq!(h1, 0);
        assert_eq!(o0, 0);
        // 100 bytes rounds up to one 256-byte slot
        assert_eq!(o1, 256);
    }

    #[test]
    fn grows_a_new_heap_when_full() {
        let mut p = pool(1024);
        p.begin_usage(1);
        let (h0, _) = p.allocate(&512).unwrap(); // heap 0 sized max(2*512, 1024)
        let (h1, o1) = p.allocate(&512).unwrap();
        assert_eq!((h0, h1, o1), (0, 0, 512));
        assert_eq!(p.heap_count(), 1);
        // no capacity left, and the fence is not complete: a new heap appears
        let (h2, o2) = p.allocate(&512).unwrap();
        assert_eq!((h2, o2), (1, 0));
        assert_eq!(p.heap_count(), 2);
    }

    #[test]
    fn completed_ranges_are_reclaimed() {
        let backend = SoftwareInstance::new().create_device(0, false).unwrap();
        let timeline = Arc::new(FenceTimeline::new(backend.clone()));
        let mut p = GpuRingPool::new(
            TestAllocator {
                alignment: 256,
                next_heap_size: 1024,
                live_heaps: 0,
            },
            timeline.clone(),
        );

        let fence = timeline.allocate();
        p.begin_usage(fence);
        let _ = p.allocate(&1024).unwrap();
        assert_eq!(p.heap_count(), 1);

        // the software queue signals immediately
        backend.signal_fence(fence).unwrap();
        backend.wait_fence(fence, None);
        p.end_usage();

        p.begin_usage(timeline.allocate());
        let (h, o) = p.allocate(&1024).unwrap();
        assert_eq!(h, 0, "reclaimed heap should be reused");
        assert_eq!(o, 0);
        assert_eq!(p.heap_count(), 1);
    }

    #[test]
    fn wraps_to_heap_start_when_tail_is_too_small() {
        let backend = SoftwareInstance::new().create_device(0, false).unwrap();
        let timeline = Arc::new(FenceTimeline::new(backend.clone()));
        let mut p = GpuRingPool::new(
            TestAllocator {
                alignment: 256,
                next_heap_size: 1024,
                live_heaps: 0,
            },
            timeline.clone(),
        );

        let f1 = timeline.allocate();
        p.begin_usage(f1);
        let _ = p.allocate(&256).unwrap(); // 0..256

        let f2 = timeline.allocate();
        p.begin_usage(f2);
        let _ = p.allocate(&512).unwrap(); // 256..768

        // only f1 completes: the head range is reclaimed, the tail is live
        backend.signal_fence(f1).unwrap();
        backend.wait_fence(f1, None);
        p.end_usage();

        let f3 = timeline.allocate();
        p.begin_usage(f3);
        let (h0, a) = p.allocate(&256).unwrap();
        let (h1, b) = p.allocate(&256).unwrap();
        assert_eq!(h0, 0);
        assert_eq!(a, 768, "tail space serves the first allocation");
        assert_eq!(h1, 0);
        assert_eq!(b, 0, "next allocation wraps to the reclaimed head");
        assert_eq!(p.heap_count(), 1);
    }
}
