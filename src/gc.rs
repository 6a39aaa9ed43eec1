//! Deferred destruction of backend objects.
//!
//! Released objects are queued here instead of being destroyed, because the
//! GPU may still be reading them. Each collection cycle stamps the queued
//! objects with a fresh fence signal and destroys only those whose fence has
//! completed. Teardown flushes everything, blocking the CPU on each fence.

use crate::backend::{GpuBackend, NativeObject};
use crate::counters::CounterPool;
use crate::handle::CounterHandle;
use crate::sync::FenceTimeline;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_FREQUENCY_MS: u64 = 125;
const GATHER_QUOTA: usize = 128;

/// One release request: the native objects plus an optional append/consume
/// counter to return to the shared pool.
#[derive(Debug, Default)]
pub struct Garbage {
    pub objects: Vec<NativeObject>,
    pub counter: Option<CounterHandle>,
}

impl Garbage {
    pub fn object(object: NativeObject) -> Garbage {
        Garbage {
            objects: vec![object],
            counter: None,
        }
    }
}

struct StampedGarbage {
    fence_value: u64,
    garbage: Garbage,
}

struct GcShared {
    backend: Arc<dyn GpuBackend>,
    timeline: Arc<FenceTimeline>,
    counters: Arc<CounterPool>,
    pending: Mutex<VecDeque<Garbage>>,
    stamped: Mutex<Vec<StampedGarbage>>,
    active: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
}

impl GcShared {
    /// Moves up to `quota` queued items into the stamped list, fencing them
    /// behind all work submitted so far.
    fn gather(&self, quota: usize) {
        let drained: Vec<Garbage> = {
            let mut pending = self.pending.lock().unwrap();
            let n = pending.len().min(quota);
            pending.drain(..n).collect()
        };

        if drained.is_empty() {
            return;
        }

        let fence_value = match self.timeline.signal() {
            Ok(v) => v,
            Err(e) => {
                debug!("gc: fence signal failed, holding garbage: {}", e);
                self.pending.lock().unwrap().extend(drained);
                return;
            }
        };

        let mut stamped = self.stamped.lock().unwrap();
        for garbage in drained {
            stamped.push(StampedGarbage {
                fence_value,
                garbage,
            });
        }
    }

    fn flush_destroy(&self, wait_on_cpu: bool) {
        let mut stamped = self.stamped.lock().unwrap();
        if stamped.is_empty() {
            return;
        }

        let mut kept = Vec::with_capacity(stamped.len());
        for item in stamped.drain(..) {
            if wait_on_cpu {
                self.timeline.wait_cpu(item.fence_value, -1);
            }
            if self.timeline.is_complete(item.fence_value) {
                for object in item.garbage.objects {
                    self.backend.destroy(object);
                }
                if let Some(counter) = item.garbage.counter {
                    self.counters.free(counter);
                }
            } else {
                kept.push(item);
            }
        }
        *stamped = kept;
    }
}

pub struct GarbageCollector {
    shared: Arc<GcShared>,
    frequency: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        timeline: Arc<FenceTimeline>,
        counters: Arc<CounterPool>,
        frequency_ms: u64,
    ) -> GarbageCollector {
        GarbageCollector {
            shared: Arc::new(GcShared {
                backend,
                timeline,
                counters,
                pending: Mutex::new(VecDeque::new()),
                stamped: Mutex::new(Vec::new()),
                active: AtomicBool::new(false),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
            }),
            frequency: Duration::from_millis(frequency_ms),
            thread: Mutex::new(None),
        }
    }

    /// Queues objects for destruction once the GPU can no longer touch them.
    pub fn defer_release(&self, garbage: Garbage) {
        self.shared.pending.lock().unwrap().push_back(garbage);
    }

    pub fn start(&self) {
        let shared = self.shared.clone();
        let frequency = self.frequency;
        shared.active.store(true, Ordering::SeqCst);
        let handle = std::thread::Builder::new()
            .name("gpu-gc".into())
            .spawn(move || {
                debug!("gc: worker started");
                while shared.active.load(Ordering::SeqCst) {
                    shared.gather(GATHER_QUOTA);
                    shared.flush_destroy(false);

                    let guard = shared.wake_lock.lock().unwrap();
                    let _ = shared.wake.wait_timeout(guard, frequency).unwrap();
                }
                debug!("gc: worker stopped");
            })
            .expect("failed to spawn gc thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        let handle = {
            let mut thread = self.thread.lock().unwrap();
            thread.take()
        };
        if let Some(handle) = handle {
            self.shared.active.store(false, Ordering::SeqCst);
            self.shared.wake.notify_all();
            let _ = handle.join();
        }
    }

    /// Destroys everything queued so far, blocking the CPU on each fence.
    pub fn flush(&self) {
        self.shared.gather(usize::MAX);
        self.shared.flush_destroy(true);
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len() + self.shared.stamped.lock().unwrap().len()
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.stop();
        self.flush();
    }
}
