//! Typed handles and the generational slot container backing every registry.
//!
//! A handle is a 64-bit value: 32 bits of slot index, 32 bits of generation.
//! It is valid only while the generation matches the slot's current one, so a
//! freed-and-recycled slot invalidates all outstanding copies of the old
//! handle. Handles are values, never addresses: the registry owns the object,
//! the holder owns the right to look it up.

use slotmap::{new_key_type, Key, KeyData, SlotMap};

new_key_type! {
    pub struct ResourceHandle;
    pub struct ResourceTableHandle;
    pub struct ShaderHandle;
    pub struct WorkHandle;
    pub struct FenceHandle;
    pub struct CounterHandle;
    pub struct EventHandle;
}

/// Raw 64-bit form of a handle, stable across the FFI/ABI boundary.
pub type RawHandle = u64;

/// Conversions shared by every typed handle.
pub trait GpuHandle: Key {
    fn from_raw(raw: RawHandle) -> Self {
        KeyData::from_ffi(raw).into()
    }

    fn as_raw(&self) -> RawHandle {
        self.data().as_ffi()
    }

    fn valid(&self) -> bool {
        !self.is_null()
    }
}

impl<K: Key> GpuHandle for K {}

/// Dense slot storage with a free list and generation checks.
///
/// All operations are O(1); iteration skips free slots. Not internally
/// synchronized: the enclosing registry guards it with its own lock.
#[derive(Debug)]
pub struct HandleContainer<K: Key, T> {
    slots: SlotMap<K, T>,
}

impl<K: Key, T: Default> HandleContainer<K, T> {
    pub fn new() -> Self {
        HandleContainer {
            slots: SlotMap::with_key(),
        }
    }

    /// Allocates a slot holding `T::default()` and returns the handle along
    /// with a reference for in-place initialization.
    pub fn allocate(&mut self) -> (K, &mut T) {
        let handle = self.slots.insert(T::default());
        (handle, self.slots.get_mut(handle).unwrap())
    }

    pub fn insert(&mut self, value: T) -> K {
        self.slots.insert(value)
    }

    pub fn contains(&self, handle: K) -> bool {
        self.slots.contains_key(handle)
    }

    pub fn get(&self, handle: K) -> Option<&T> {
        self.slots.get(handle)
    }

    pub fn get_mut(&mut self, handle: K) -> Option<&mut T> {
        self.slots.get_mut(handle)
    }

    /// Frees the slot, bumping its generation. Returns the stored value, or
    /// `None` if the handle was stale.
    pub fn free(&mut self, handle: K) -> Option<T> {
        self.slots.remove(handle)
    }

    pub fn for_each(&self, mut f: impl FnMut(K, &T)) {
        for (k, v) in self.slots.iter() {
            f(k, v);
        }
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(K, &mut T)) {
        for (k, v) in self.slots.iter_mut() {
            f(k, v);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear()
    }
}

impl<K: Key, T: Default> Default for HandleContainer<K, T> {
    fn default() -> Self {
        HandleContainer::new()
    }
}
