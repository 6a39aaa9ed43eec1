//! Shared pool of append/consume counters.
//!
//! Every append-consume buffer owns one 4-byte counter slot inside a single
//! GPU heap. Slots are placement-aligned: mainstream APIs require counter
//! offsets to sit `counter_alignment` bytes apart, which wastes most of each
//! slot but keeps the pool a single allocation.

use crate::backend::{GpuBackend, NativeId};
use crate::error::{Error, Result};
use crate::handle::{CounterHandle, HandleContainer};
use std::sync::Mutex;

pub const MAX_COUNTERS: u32 = 256;

#[derive(Default)]
struct CounterSlot {
    offset: u64,
}

pub struct CounterPool {
    heap: NativeId,
    alignment: u64,
    slots: Mutex<HandleContainer<CounterHandle, CounterSlot>>,
}

impl CounterPool {
    pub fn new(backend: &dyn GpuBackend) -> Result<CounterPool> {
        let alignment = backend.limits().counter_alignment;
        let heap = backend.create_counter_heap(MAX_COUNTERS)?;
        Ok(CounterPool {
            heap,
            alignment,
            slots: Mutex::new(HandleContainer::new()),
        })
    }

    /// The GPU heap every counter lives in.
    pub fn heap(&self) -> NativeId {
        self.heap
    }

    pub fn allocate(&self) -> Result<CounterHandle> {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() as u32 >= MAX_COUNTERS {
            return Err(Error::InvalidParameter(
                "append/consume counter pool exhausted".into(),
            ));
        }
        let alignment = self.alignment;
        let (handle, slot) = slots.allocate();
        slot.offset = slot_index(handle) * alignment;
        Ok(handle)
    }

    /// Byte offset of the counter inside the shared heap.
    pub fn offset(&self, handle: CounterHandle) -> Option<u64> {
        self.slots.lock().unwrap().get(handle).map(|s| s.offset)
    }

    pub fn free(&self, handle: CounterHandle) {
        self.slots.lock().unwrap().free(handle);
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

fn slot_index(handle: CounterHandle) -> u64 {
    use crate::handle::GpuHandle;
    handle.as_raw() & 0xffff_ffff
}
