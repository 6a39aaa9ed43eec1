//! Fence timelines and pools of short-lived synchronization objects.
//!
//! A timeline is a monotonically increasing 64-bit counter per queue.
//! Signal operations in the GPU command stream raise the completed value;
//! the application waits for a specific value to know all work submitted
//! before the corresponding signal has finished. This is the D3D12 fence /
//! Vulkan timeline-semaphore model.

use crate::backend::GpuBackend;
use crate::error::Result;
use crate::handle::{EventHandle, FenceHandle, HandleContainer};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wait forever.
pub const WAIT_INFINITE: i64 = -1;
/// Poll once and return.
pub const WAIT_POLL: i64 = 0;

pub struct FenceTimeline {
    backend: Arc<dyn GpuBackend>,
    next_value: Mutex<u64>,
}

impl FenceTimeline {
    pub fn new(backend: Arc<dyn GpuBackend>) -> FenceTimeline {
        FenceTimeline {
            backend,
            next_value: Mutex::new(0),
        }
    }

    /// Reserves the next fence value without enqueueing a signal. The caller
    /// is responsible for submitting work that signals it.
    pub fn allocate(&self) -> u64 {
        let mut next = self.next_value.lock().unwrap();
        *next += 1;
        *next
    }

    /// Increments the timeline and enqueues a queue-side signal after all
    /// previously submitted work.
    pub fn signal(&self) -> Result<u64> {
        let mut next = self.next_value.lock().unwrap();
        *next += 1;
        self.backend.signal_fence(*next)?;
        Ok(*next)
    }

    /// Last value reserved on this timeline.
    pub fn value(&self) -> u64 {
        *self.next_value.lock().unwrap()
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.backend.completed_fence_value() >= value
    }

    /// Blocks until `value` completes. Negative `timeout_ms` waits forever,
    /// zero polls. Returns whether the value completed.
    pub fn wait_cpu(&self, value: u64, timeout_ms: i64) -> bool {
        if timeout_ms < 0 {
            self.backend.wait_fence(value, None)
        } else {
            self.backend
                .wait_fence(value, Some(Duration::from_millis(timeout_ms as u64)))
        }
    }

    /// Orders subsequent submissions on the queue after `value`. With a
    /// single queue submission order already guarantees this, so the wait
    /// only checks that the value was ever allocated.
    pub fn wait_gpu(&self, value: u64) -> bool {
        value <= self.value()
    }
}

//--------------------------------------------------------------------------------------------------

#[derive(Default)]
struct FenceSlot {
    fence_value: u64,
    ref_count: u32,
    signaled: bool,
}

/// Reference-counted bookkeeping for many short-lived fences.
///
/// Each allocation pins a fence value; `update_state` sweeps the completed
/// values in from the timeline so `is_signaled` is a cheap lookup.
pub struct FencePool {
    slots: Mutex<HandleContainer<FenceHandle, FenceSlot>>,
}

impl FencePool {
    pub fn new() -> FencePool {
        FencePool {
            slots: Mutex::new(HandleContainer::new()),
        }
    }

    pub fn allocate(&self, fence_value: u64) -> FenceHandle {
        let mut slots = self.slots.lock().unwrap();
        let (handle, slot) = slots.allocate();
        slot.fence_value = fence_value;
        slot.ref_count = 1;
        slot.signaled = false;
        handle
    }

    pub fn add_ref(&self, handle: FenceHandle) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(handle) {
            slot.ref_count += 1;
        }
    }

    /// Drops one reference; the slot is recycled when the count hits zero.
    pub fn free(&self, handle: FenceHandle) {
        let mut slots = self.slots.lock().unwrap();
        let remove = match slots.get_mut(handle) {
            Some(slot) => {
                slot.ref_count -= 1;
                slot.ref_count == 0
            }
            None => false,
        };
        if remove {
            slots.free(handle);
        }
    }

    pub fn fence_value(&self, handle: FenceHandle) -> Option<u64> {
        self.slots.lock().unwrap().get(handle).map(|s| s.fence_value)
    }

    /// Marks every slot whose value the timeline has completed.
    pub fn update_state(&self, timeline: &FenceTimeline) {
        let mut slots = self.slots.lock().unwrap();
        slots.for_each_mut(|_, slot| {
            if !slot.signaled && timeline.is_complete(slot.fence_value) {
                slot.signaled = true;
            }
        });
    }

    pub fn is_signaled(&self, handle: FenceHandle) -> bool {
        self.slots
            .lock()
            .unwrap()
            .get(handle)
            .map(|s| s.signaled)
            .unwrap_or(false)
    }
}

//--------------------------------------------------------------------------------------------------

#[derive(Default)]
struct EventSlot {
    in_flight: bool,
}

/// Pool of split-barrier events. A Begin barrier allocates an event, the
/// matching End consumes it; the slot is recycled when the owning work
/// bundle is released.
pub struct EventPool {
    slots: Mutex<HandleContainer<EventHandle, EventSlot>>,
}

impl EventPool {
    pub fn new() -> EventPool {
        EventPool {
            slots: Mutex::new(HandleContainer::new()),
        }
    }

    pub fn allocate(&self) -> EventHandle {
        let mut slots = self.slots.lock().unwrap();
        let (handle, slot) = slots.allocate();
        slot.in_flight = true;
        handle
    }

    pub fn free(&self, handle: EventHandle) {
        self.slots.lock().unwrap().free(handle);
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_pool_ref_counting() {
        let pool = FencePool::new();
        let h = pool.allocate(42);
        assert_eq!(pool.fence_value(h), Some(42));
        pool.add_ref(h);
        pool.free(h);
        // still alive, one reference left
        assert_eq!(pool.fence_value(h), Some(42));
        pool.free(h);
        assert_eq!(pool.fence_value(h), None);
    }

    #[test]
    fn event_pool_recycles() {
        let pool = EventPool::new();
        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(pool.in_flight_count(), 2);
        pool.free(a);
        pool.free(b);
        assert_eq!(pool.in_flight_count(), 0);
    }
}
