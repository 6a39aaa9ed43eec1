//! Software reference backend.
//!
//! Executes the submitted command stream on CPU memory: uploads, copies and
//! downloads move real bytes, fences progress through a queue worker thread,
//! and dispatches are accepted but do nothing (there is no CPU shader
//! interpreter). The worker can be given an artificial execution delay to
//! exercise the asynchronous fence paths the way a real GPU would.

use crate::backend::{
    AdapterInfo, BufferCreation, DescriptorWrite, DeviceLimits, GpuBackend, GpuInstance,
    HeapCreation, MappedPtr, NativeId, NativeObject, SubmitInfo, TextureCreation,
};
use crate::commands::{CommandWalker, ParsedCommand, WHOLE_SIZE};
use crate::error::{Error, Result};
use crate::pool::align_byte;
use crate::resource::{
    BufferDesc, ResourceMemoryInfo, ResourceSpecialFlags, SamplerDesc, TableKind, TextureDesc,
};
use crate::settings::ShaderModel;
use fxhash::FxHashMap;
use log::debug;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

//--------------------------------------------------------------------------------------------------

/// Raw zeroed allocation accessed only through its pointer.
struct RawAllocation {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for RawAllocation {}
unsafe impl Sync for RawAllocation {}

impl RawAllocation {
    fn new(size: usize) -> RawAllocation {
        let layout = Layout::array::<u8>(size.max(1)).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "staging allocation failed");
        RawAllocation { ptr, layout }
    }
}

impl Drop for RawAllocation {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

struct BufferStore {
    data: Vec<u8>,
}

struct TextureStore {
    width: u32,
    height: u32,
    depth: u32,
    bpp: u32,
    mip_levels: u32,
    array_slices: u32,
    /// Indexed `slice * mip_levels + mip`.
    subresources: Vec<Vec<u8>>,
}

impl TextureStore {
    fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        )
    }

    fn subresource(&self, mip: u32, slice: u32) -> Option<&Vec<u8>> {
        if mip >= self.mip_levels || slice >= self.array_slices {
            return None;
        }
        self.subresources
            .get((slice * self.mip_levels + mip) as usize)
    }

    fn subresource_mut(&mut self, mip: u32, slice: u32) -> Option<&mut Vec<u8>> {
        if mip >= self.mip_levels || slice >= self.array_slices {
            return None;
        }
        self.subresources
            .get_mut((slice * self.mip_levels + mip) as usize)
    }
}

struct HeapStore {
    memory: RawAllocation,
    size: u64,
}

#[derive(Default)]
struct Storage {
    buffers: FxHashMap<u64, BufferStore>,
    textures: FxHashMap<u64, TextureStore>,
    samplers: FxHashMap<u64, SamplerDesc>,
    tables: FxHashMap<u64, Vec<DescriptorWrite>>,
    pipelines: FxHashMap<u64, String>,
    heaps: FxHashMap<u64, HeapStore>,
}

//--------------------------------------------------------------------------------------------------
// queue worker

enum QueueJob {
    Execute { ops: Vec<CmdOp>, signal: u64 },
    Signal(u64),
}

enum CmdOp {
    WriteBuffer {
        dst: u64,
        dst_offset: u64,
        data: Vec<u8>,
    },
    WriteTexture {
        dst: u64,
        mip: u32,
        origin: (u32, u32, u32),
        data: Vec<u8>,
    },
    CopyBuffer {
        src: u64,
        src_offset: u64,
        dst: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyTexture {
        src: u64,
        dst: u64,
    },
    ReadBuffer {
        src: u64,
        dst_heap: u64,
        dst_offset: u64,
        size: u64,
    },
    ReadTexture {
        src: u64,
        mip: u32,
        slice: u32,
        dst_heap: u64,
        dst_offset: u64,
        row_pitch: u64,
    },
    Dispatch,
}

struct QueueState {
    jobs: VecDeque<QueueJob>,
    completed: u64,
    active: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    wake: Condvar,
    done: Condvar,
    delay: Mutex<Option<Duration>>,
}

//--------------------------------------------------------------------------------------------------

pub struct SoftwareDevice {
    adapter: AdapterInfo,
    limits: DeviceLimits,
    next_id: AtomicU64,
    storage: Arc<Mutex<Storage>>,
    queue: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    debug_layer: AtomicBool,
}

impl SoftwareDevice {
    pub fn new(adapter: AdapterInfo, enable_debug: bool) -> Arc<SoftwareDevice> {
        let queue = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                completed: 0,
                active: true,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
            delay: Mutex::new(None),
        });
        let storage: Arc<Mutex<Storage>> = Arc::new(Mutex::new(Storage::default()));

        let worker = {
            let queue = queue.clone();
            let storage = storage.clone();
            std::thread::Builder::new()
                .name("software-queue".into())
                .spawn(move || queue_worker(queue, storage))
                .expect("failed to spawn software queue")
        };

        Arc::new(SoftwareDevice {
            adapter,
            limits: DeviceLimits::default(),
            next_id: AtomicU64::new(1),
            storage,
            queue,
            worker: Mutex::new(Some(worker)),
            debug_layer: AtomicBool::new(enable_debug),
        })
    }

    /// Whether the debug layer was requested at creation.
    pub fn validation_enabled(&self) -> bool {
        self.debug_layer.load(Ordering::Relaxed)
    }

    /// Artificial execution latency per submission, to exercise the
    /// asynchronous fence paths.
    pub fn set_execution_delay(&self, delay: Option<Duration>) {
        *self.queue.delay.lock().unwrap() = delay;
    }

    /// Direct read of a buffer's storage, for tests.
    pub fn buffer_bytes(&self, id: NativeId) -> Option<Vec<u8>> {
        self.storage
            .lock()
            .unwrap()
            .buffers
            .get(&id.0)
            .map(|b| b.data.clone())
    }

    pub fn live_object_count(&self) -> usize {
        let storage = self.storage.lock().unwrap();
        storage.buffers.len()
            + storage.textures.len()
            + storage.samplers.len()
            + storage.tables.len()
            + storage.pipelines.len()
            + storage.heaps.len()
    }

    fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, job: QueueJob) {
        let mut state = self.queue.state.lock().unwrap();
        state.jobs.push_back(job);
        self.queue.wake.notify_one();
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        {
            let mut state = self.queue.state.lock().unwrap();
            state.active = false;
            self.queue.wake.notify_all();
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn queue_worker(queue: Arc<QueueShared>, storage: Arc<Mutex<Storage>>) {
    loop {
        let job = {
            let mut state = queue.state.lock().unwrap();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if !state.active {
                    return;
                }
                state = queue.wake.wait(state).unwrap();
            }
        };

        let delay = *queue.delay.lock().unwrap();

        match job {
            QueueJob::Signal(value) => {
                let mut state = queue.state.lock().unwrap();
                state.completed = state.completed.max(value);
                queue.done.notify_all();
            }
            QueueJob::Execute { ops, signal } => {
                if let Some(delay) = delay {
                    std::thread::sleep(delay);
                }
                {
                    let mut storage = storage.lock().unwrap();
                    for op in ops {
                        execute_op(&mut storage, op);
                    }
                }
                let mut state = queue.state.lock().unwrap();
                state.completed = state.completed.max(signal);
                queue.done.notify_all();
            }
        }
    }
}

fn execute_op(storage: &mut Storage, op: CmdOp) {
    match op {
        CmdOp::WriteBuffer {
            dst,
            dst_offset,
            data,
        } => {
            if let Some(buffer) = storage.buffers.get_mut(&dst) {
                let begin = dst_offset as usize;
                let end = (begin + data.len()).min(buffer.data.len());
                if begin < end {
                    buffer.data[begin..end].copy_from_slice(&data[..end - begin]);
                }
            }
        }
        CmdOp::WriteTexture {
            dst,
            mip,
            origin,
            data,
        } => {
            if let Some(texture) = storage.textures.get_mut(&dst) {
                let (w, h, _) = texture.mip_extent(mip);
                let bpp = texture.bpp;
                if let Some(sub) = texture.subresource_mut(mip, 0) {
                    // tightly packed rows at the requested origin
                    let row_bytes = (w - origin.0.min(w)) as usize * bpp as usize;
                    let mut src = 0usize;
                    for row in origin.1..h {
                        let dst_off =
                            ((row * w + origin.0) * bpp) as usize;
                        if src >= data.len() || dst_off >= sub.len() {
                            break;
                        }
                        let n = row_bytes.min(data.len() - src).min(sub.len() - dst_off);
                        sub[dst_off..dst_off + n].copy_from_slice(&data[src..src + n]);
                        src += n;
                    }
                }
            }
        }
        CmdOp::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => {
            let bytes = match storage.buffers.get(&src) {
                Some(buffer) => {
                    let begin = src_offset as usize;
                    let len = if size == WHOLE_SIZE {
                        buffer.data.len().saturating_sub(begin)
                    } else {
                        size as usize
                    };
                    let end = (begin + len).min(buffer.data.len());
                    buffer.data[begin.min(end)..end].to_vec()
                }
                None => return,
            };
            execute_op(
                storage,
                CmdOp::WriteBuffer {
                    dst,
                    dst_offset,
                    data: bytes,
                },
            );
        }
        CmdOp::CopyTexture { src, dst } => {
            let subresources = match storage.textures.get(&src) {
                Some(t) => t.subresources.clone(),
                None => return,
            };
            if let Some(t) = storage.textures.get_mut(&dst) {
                for (i, sub) in subresources.into_iter().enumerate() {
                    if let Some(dst_sub) = t.subresources.get_mut(i) {
                        let n = sub.len().min(dst_sub.len());
                        dst_sub[..n].copy_from_slice(&sub[..n]);
                    }
                }
            }
        }
        CmdOp::ReadBuffer {
            src,
            dst_heap,
            dst_offset,
            size,
        } => {
            let bytes = match storage.buffers.get(&src) {
                Some(buffer) => {
                    let n = (size as usize).min(buffer.data.len());
                    buffer.data[..n].to_vec()
                }
                None => return,
            };
            if let Some(heap) = storage.heaps.get(&dst_heap) {
                let n = bytes.len().min((heap.size - dst_offset) as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        heap.memory.ptr.add(dst_offset as usize),
                        n,
                    );
                }
            }
        }
        CmdOp::ReadTexture {
            src,
            mip,
            slice,
            dst_heap,
            dst_offset,
            row_pitch,
        } => {
            let (rows, row_bytes, data) = match storage.textures.get(&src) {
                Some(t) => {
                    let (w, h, d) = t.mip_extent(mip);
                    match t.subresource(mip, slice) {
                        Some(sub) => ((h * d) as usize, (w * t.bpp) as usize, sub.clone()),
                        None => return,
                    }
                }
                None => return,
            };
            if let Some(heap) = storage.heaps.get(&dst_heap) {
                for row in 0..rows {
                    let src_off = row * row_bytes;
                    let dst_off = dst_offset as usize + row * row_pitch as usize;
                    if src_off + row_bytes > data.len()
                        || dst_off + row_bytes > heap.size as usize
                    {
                        break;
                    }
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            data.as_ptr().add(src_off),
                            heap.memory.ptr.add(dst_off),
                            row_bytes,
                        );
                    }
                }
            }
        }
        CmdOp::Dispatch => {}
    }
}

//--------------------------------------------------------------------------------------------------

impl GpuBackend for SoftwareDevice {
    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferCreation> {
        let byte_size = desc.byte_size();
        if byte_size == 0 {
            return Err(Error::InvalidParameter("zero-sized buffer".into()));
        }

        let id = self.new_id();
        let cpu_visible = desc
            .special_flags
            .intersects(ResourceSpecialFlags::CPU_UPLOAD | ResourceSpecialFlags::CPU_READBACK);
        let mut store = BufferStore {
            data: vec![0u8; byte_size],
        };
        let mapped = if cpu_visible {
            MappedPtr::new(store.data.as_mut_ptr())
        } else {
            None
        };
        self.storage.lock().unwrap().buffers.insert(id, store);

        Ok(BufferCreation {
            id: NativeId(id),
            memory: ResourceMemoryInfo {
                byte_size: byte_size as u64,
                alignment: self.limits.constant_buffer_alignment,
                row_pitch: 0,
            },
            mapped,
        })
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureCreation> {
        let bpp = desc.format.byte_size() as u32;
        let mut subresources = Vec::new();
        let mut total = 0u64;
        for _slice in 0..desc.array_slices {
            for mip in 0..desc.mip_levels {
                let w = (desc.width >> mip).max(1) as u64;
                let h = (desc.height >> mip).max(1) as u64;
                let d = (desc.depth >> mip).max(1) as u64;
                let bytes = w * h * d * bpp as u64;
                total += bytes;
                subresources.push(vec![0u8; bytes as usize]);
            }
        }

        let id = self.new_id();
        self.storage.lock().unwrap().textures.insert(
            id,
            TextureStore {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
                bpp,
                mip_levels: desc.mip_levels,
                array_slices: desc.array_slices,
                subresources,
            },
        );

        Ok(TextureCreation {
            id: NativeId(id),
            memory: ResourceMemoryInfo {
                byte_size: total,
                alignment: 0,
                row_pitch: align_byte(
                    desc.width as u64 * bpp as u64,
                    self.limits.readback_alignment,
                ),
            },
        })
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<NativeId> {
        let id = self.new_id();
        self.storage.lock().unwrap().samplers.insert(id, desc.clone());
        Ok(NativeId(id))
    }

    fn create_counter_heap(&self, slots: u32) -> Result<NativeId> {
        let byte_size = slots as u64 * self.limits.counter_alignment;
        let id = self.new_id();
        self.storage.lock().unwrap().buffers.insert(
            id,
            BufferStore {
                data: vec![0u8; byte_size as usize],
            },
        );
        Ok(NativeId(id))
    }

    fn create_staging_heap(&self, size: u64, _readback: bool) -> Result<HeapCreation> {
        let id = self.new_id();
        let memory = RawAllocation::new(size as usize);
        let mapped = MappedPtr::new(memory.ptr)
            .ok_or_else(|| Error::InternalApiFailure("staging map failed".into()))?;
        self.storage
            .lock()
            .unwrap()
            .heaps
            .insert(id, HeapStore { memory, size });
        Ok(HeapCreation {
            id: NativeId(id),
            size,
            mapped,
            gpu_va: id << 32,
        })
    }

    fn create_descriptor_table(
        &self,
        _kind: TableKind,
        writes: &[DescriptorWrite],
    ) -> Result<NativeId> {
        let mut storage = self.storage.lock().unwrap();
        for write in writes {
            let ok = match write {
                DescriptorWrite::BufferView { buffer, .. }
                | DescriptorWrite::CounterView { buffer, .. } => {
                    storage.buffers.contains_key(&buffer.0)
                }
                DescriptorWrite::TextureView { texture, .. } => {
                    storage.textures.contains_key(&texture.0)
                }
                DescriptorWrite::SamplerView { sampler } => {
                    storage.samplers.contains_key(&sampler.0)
                }
            };
            if !ok {
                return Err(Error::InternalApiFailure(
                    "descriptor write references a destroyed object".into(),
                ));
            }
        }
        let id = self.new_id();
        storage.tables.insert(id, writes.to_vec());
        Ok(NativeId(id))
    }

    fn create_compute_pipeline(&self, spirv: &[u32], name: &str) -> Result<NativeId> {
        if spirv.is_empty() {
            return Err(Error::InternalApiFailure("empty shader blob".into()));
        }
        let id = self.new_id();
        self.storage
            .lock()
            .unwrap()
            .pipelines
            .insert(id, name.to_string());
        debug!("software pipeline '{}' -> {}", name, id);
        Ok(NativeId(id))
    }

    fn submit(&self, submit: SubmitInfo<'_>) -> Result<()> {
        if self.debug_layer.load(Ordering::Relaxed) {
            validate_barriers(&submit)?;
        }
        let ops = encode(&submit)?;
        self.enqueue(QueueJob::Execute {
            ops,
            signal: submit.signal_value,
        });
        Ok(())
    }

    fn signal_fence(&self, value: u64) -> Result<()> {
        self.enqueue(QueueJob::Signal(value));
        Ok(())
    }

    fn completed_fence_value(&self) -> u64 {
        self.queue.state.lock().unwrap().completed
    }

    fn wait_fence(&self, value: u64, timeout: Option<Duration>) -> bool {
        let mut state = self.queue.state.lock().unwrap();
        match timeout {
            None => {
                while state.completed < value {
                    state = self.queue.done.wait(state).unwrap();
                }
                true
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while state.completed < value {
                    let left = match deadline.checked_duration_since(std::time::Instant::now()) {
                        Some(left) if !left.is_zero() => left,
                        _ => return state.completed >= value,
                    };
                    let (next, result) = self.queue.done.wait_timeout(state, left).unwrap();
                    state = next;
                    if result.timed_out() && state.completed < value {
                        return false;
                    }
                }
                true
            }
        }
    }

    fn map_readback(&self, heap: NativeId, offset: u64, size: u64) -> Result<MappedPtr> {
        let storage = self.storage.lock().unwrap();
        let heap = storage
            .heaps
            .get(&heap.0)
            .ok_or(Error::InvalidHandle)?;
        if offset + size > heap.size {
            return Err(Error::InvalidParameter("readback range out of bounds".into()));
        }
        MappedPtr::new(unsafe { heap.memory.ptr.add(offset as usize) })
            .ok_or_else(|| Error::InternalApiFailure("null mapping".into()))
    }

    fn destroy(&self, object: NativeObject) {
        let mut storage = self.storage.lock().unwrap();
        match object {
            NativeObject::Buffer(id) => {
                storage.buffers.remove(&id.0);
            }
            NativeObject::Texture(id) => {
                storage.textures.remove(&id.0);
            }
            NativeObject::Sampler(id) => {
                storage.samplers.remove(&id.0);
            }
            NativeObject::DescriptorTable(id) => {
                storage.tables.remove(&id.0);
            }
            NativeObject::Pipeline(id) => {
                storage.pipelines.remove(&id.0);
            }
            NativeObject::Heap(id) => {
                storage.heaps.remove(&id.0);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// debug layer: replay the planned barriers against each command's state
// requirements, the way a native validation layer would

fn validate_barriers(submit: &SubmitInfo<'_>) -> Result<()> {
    use crate::handle::{EventHandle, GpuHandle, ResourceHandle};
    use crate::schedule::{BarrierType, ResourceGpuState};
    use fxhash::FxHashSet;

    let mut tracked: FxHashMap<ResourceHandle, ResourceGpuState> = FxHashMap::default();
    let mut open_events: FxHashSet<EventHandle> = FxHashSet::default();

    let require = |tracked: &mut FxHashMap<ResourceHandle, ResourceGpuState>,
                       resource: ResourceHandle,
                       state: ResourceGpuState|
     -> Result<()> {
        match tracked.get(&resource) {
            // the persistent state carried over unchanged
            None => {
                tracked.insert(resource, state);
                Ok(())
            }
            Some(current) if *current == state => Ok(()),
            Some(current) => Err(Error::InternalApiFailure(format!(
                "validation: resource {:?} is in {:?} but the command needs {:?}",
                resource, current, state
            ))),
        }
    };

    for list in &submit.lists {
        let mut walker = CommandWalker::new(list.data)?;
        let mut command_index = 0usize;
        while let Some(parsed) = walker.next()? {
            let info = &list.processed.commands[command_index];

            for barrier in &info.pre_barriers {
                if let Some(current) = tracked.get(&barrier.resource) {
                    if *current != barrier.prev_state && !barrier.is_uav {
                        return Err(Error::InternalApiFailure(format!(
                            "validation: barrier expects {:?} but resource {:?} is in {:?}",
                            barrier.prev_state, barrier.resource, current
                        )));
                    }
                }
                match barrier.barrier_type {
                    BarrierType::Immediate => {
                        tracked.insert(barrier.resource, barrier.post_state);
                    }
                    BarrierType::End => {
                        let event = barrier.event.ok_or_else(|| {
                            Error::InternalApiFailure(
                                "validation: split End barrier without an event".into(),
                            )
                        })?;
                        if !open_events.remove(&event) {
                            return Err(Error::InternalApiFailure(
                                "validation: End barrier without a matching Begin".into(),
                            ));
                        }
                        tracked.insert(barrier.resource, barrier.post_state);
                    }
                    BarrierType::Begin => {
                        return Err(Error::InternalApiFailure(
                            "validation: Begin barrier scheduled before a command".into(),
                        ));
                    }
                }
            }

            match &parsed {
                ParsedCommand::Compute(view) => {
                    for table in view.in_tables() {
                        let t = submit.resolved.tables.get(&table).ok_or_else(|| {
                            Error::InternalApiFailure("validation: unresolved table".into())
                        })?;
                        for r in &t.resources {
                            require(&mut tracked, *r, ResourceGpuState::Srv)?;
                        }
                    }
                    for table in view.out_tables() {
                        let t = submit.resolved.tables.get(&table).ok_or_else(|| {
                            Error::InternalApiFailure("validation: unresolved table".into())
                        })?;
                        for r in &t.resources {
                            require(&mut tracked, *r, ResourceGpuState::Uav)?;
                        }
                    }
                    for cbv in view.constants() {
                        require(&mut tracked, cbv, ResourceGpuState::Cbv)?;
                    }
                    if let Some(indirect) = view.indirect_buffer() {
                        require(&mut tracked, indirect, ResourceGpuState::IndirectArgs)?;
                    }
                }
                ParsedCommand::Copy(cmd) => {
                    require(
                        &mut tracked,
                        ResourceHandle::from_raw(cmd.source),
                        ResourceGpuState::CopySrc,
                    )?;
                    require(
                        &mut tracked,
                        ResourceHandle::from_raw(cmd.destination),
                        ResourceGpuState::CopyDst,
                    )?;
                }
                ParsedCommand::Upload(view) => {
                    require(&mut tracked, view.destination(), ResourceGpuState::CopyDst)?;
                }
                ParsedCommand::Download(cmd) => {
                    require(
                        &mut tracked,
                        ResourceHandle::from_raw(cmd.source),
                        ResourceGpuState::CopySrc,
                    )?;
                }
                ParsedCommand::BeginMarker(_) | ParsedCommand::EndMarker => {}
            }

            for barrier in &info.post_barriers {
                match barrier.barrier_type {
                    BarrierType::Begin => {
                        let event = barrier.event.ok_or_else(|| {
                            Error::InternalApiFailure(
                                "validation: split Begin barrier without an event".into(),
                            )
                        })?;
                        open_events.insert(event);
                    }
                    _ => {
                        return Err(Error::InternalApiFailure(
                            "validation: only Begin barriers may follow a command".into(),
                        ));
                    }
                }
            }

            command_index += 1;
        }
    }

    if !open_events.is_empty() {
        return Err(Error::InternalApiFailure(format!(
            "validation: {} Begin barrier(s) were never ended",
            open_events.len()
        )));
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// encoding: ABI stream + processed list -> executable ops

fn encode(submit: &SubmitInfo<'_>) -> Result<Vec<CmdOp>> {
    let mut ops = Vec::new();
    for list in &submit.lists {
        let mut walker = CommandWalker::new(list.data)?;
        while let Some(parsed) = walker.next()? {
            match parsed {
                ParsedCommand::Compute(view) => {
                    let shader = view.shader();
                    if !submit.resolved.pipelines.contains_key(&shader) {
                        return Err(Error::InternalApiFailure(format!(
                            "dispatch references an unresolved shader {:?}",
                            shader
                        )));
                    }
                    ops.push(CmdOp::Dispatch);
                }
                ParsedCommand::Copy(cmd) => {
                    use crate::handle::GpuHandle;
                    let src = crate::handle::ResourceHandle::from_raw(cmd.source);
                    let dst = crate::handle::ResourceHandle::from_raw(cmd.destination);
                    let src_res = resolve(submit, src)?;
                    let dst_res = resolve(submit, dst)?;
                    if src_res.is_buffer {
                        ops.push(CmdOp::CopyBuffer {
                            src: src_res.id.0,
                            src_offset: cmd.source_offset,
                            dst: dst_res.id.0,
                            dst_offset: cmd.destination_offset,
                            size: cmd.byte_size,
                        });
                    } else {
                        ops.push(CmdOp::CopyTexture {
                            src: src_res.id.0,
                            dst: dst_res.id.0,
                        });
                    }
                }
                ParsedCommand::Upload(view) => {
                    let dst = resolve(submit, view.destination())?;
                    let data = view.source_bytes().to_vec();
                    if dst.is_buffer {
                        ops.push(CmdOp::WriteBuffer {
                            dst: dst.id.0,
                            dst_offset: 0,
                            data,
                        });
                    } else {
                        ops.push(CmdOp::WriteTexture {
                            dst: dst.id.0,
                            mip: view.cmd.mip_level,
                            origin: (view.cmd.dest_x, view.cmd.dest_y, view.cmd.dest_z),
                            data,
                        });
                    }
                }
                ParsedCommand::Download(cmd) => {
                    use crate::handle::GpuHandle;
                    let src = crate::handle::ResourceHandle::from_raw(cmd.source);
                    let src_res = resolve(submit, src)?;
                    let key = crate::schedule::DownloadKey {
                        resource: src,
                        mip_level: cmd.mip_level,
                        array_slice: cmd.array_slice,
                    };
                    let state = submit.downloads.get(&key).ok_or_else(|| {
                        Error::InternalApiFailure("download range was not staged".into())
                    })?;
                    let block = state.block.as_ref().ok_or_else(|| {
                        Error::InternalApiFailure("download range was not staged".into())
                    })?;
                    if src_res.is_buffer {
                        ops.push(CmdOp::ReadBuffer {
                            src: src_res.id.0,
                            dst_heap: block.heap.0,
                            dst_offset: block.offset,
                            size: state.byte_size,
                        });
                    } else {
                        ops.push(CmdOp::ReadTexture {
                            src: src_res.id.0,
                            mip: cmd.mip_level,
                            slice: cmd.array_slice,
                            dst_heap: block.heap.0,
                            dst_offset: block.offset,
                            row_pitch: state.row_pitch,
                        });
                    }
                }
                ParsedCommand::BeginMarker(_) | ParsedCommand::EndMarker => {}
            }
        }
    }
    Ok(ops)
}

fn resolve<'a>(
    submit: &'a SubmitInfo<'_>,
    handle: crate::handle::ResourceHandle,
) -> Result<&'a crate::backend::ResolvedResource> {
    submit
        .resolved
        .resources
        .get(&handle)
        .ok_or(Error::InvalidHandle)
}

//--------------------------------------------------------------------------------------------------

pub struct SoftwareInstance;

impl SoftwareInstance {
    pub fn new() -> SoftwareInstance {
        SoftwareInstance
    }

    pub fn adapters() -> Vec<AdapterInfo> {
        vec![AdapterInfo {
            index: 0,
            name: "Software Device".to_string(),
            vendor: "ember".to_string(),
            highest_shader_model: ShaderModel::Sm6_5,
        }]
    }

    pub fn create_software_device(
        &self,
        adapter_index: usize,
        enable_debug: bool,
    ) -> Result<Arc<SoftwareDevice>> {
        let adapters = Self::adapters();
        let adapter = adapters
            .get(adapter_index)
            .cloned()
            .ok_or_else(|| Error::InvalidParameter("adapter index out of range".into()))?;
        Ok(SoftwareDevice::new(adapter, enable_debug))
    }
}

impl Default for SoftwareInstance {
    fn default() -> Self {
        SoftwareInstance::new()
    }
}

impl GpuInstance for SoftwareInstance {
    fn enumerate_adapters(&self) -> Vec<AdapterInfo> {
        Self::adapters()
    }

    fn create_device(
        &self,
        adapter_index: usize,
        enable_debug: bool,
    ) -> Result<Arc<dyn GpuBackend>> {
        let device = self.create_software_device(adapter_index, enable_debug)?;
        Ok(device as Arc<dyn GpuBackend>)
    }
}
