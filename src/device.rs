//! The device facade.
//!
//! A `Device` owns the registry, the scheduler database, the staging pools,
//! the fence timeline, the garbage collector and the backend handle, and is
//! the single object clients talk to. `schedule` runs the full pipeline:
//! build barriers, resolve shader payloads, stage upload/readback memory,
//! submit to the backend and commit the resource state map.

use crate::backend::{
    AdapterInfo, GpuBackend, GpuInstance, MappedPtr, ResolvedHandles, SubmitInfo, SubmitList,
};
use crate::commands::{CommandList, CommandWalker, ParsedCommand};
use crate::counters::CounterPool;
use crate::error::{Error, Result, ScheduleErrorType};
use crate::gc::{GarbageCollector, DEFAULT_FREQUENCY_MS};
use crate::handle::{ResourceHandle, ResourceTableHandle, WorkHandle};
use crate::pool::{ReadbackPool, StagingAllocator, StagingDesc, UploadPool};
use crate::registry::ResourceRegistry;
use crate::resource::{
    BufferDesc, ResourceMemoryInfo, ResourceTableDesc, SamplerDesc, TextureDesc,
};
use crate::schedule::{
    DownloadKey, DownloadState, ResourceGpuState, ScheduleFlags, ScheduleStatus, WorkDb,
};
use crate::settings::DeviceSettings;
use crate::shader::ShaderDb;
use crate::sync::{EventPool, FencePool, FenceTimeline};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const INITIAL_UPLOAD_HEAP_SIZE: u64 = 4 * 1024 * 1024;
const INITIAL_READBACK_HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// Device construction parameters.
pub struct DeviceConfig {
    pub settings: DeviceSettings,
    pub shader_db: Option<Arc<ShaderDb>>,
    pub gc_frequency_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            settings: DeviceSettings::default(),
            shader_db: None,
            gc_frequency_ms: DEFAULT_FREQUENCY_MS,
        }
    }
}

/// Outcome of a CPU-side wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitResult {
    Ok,
    NotReady,
    Invalid,
}

/// Readback readiness of one downloaded subresource.
#[derive(Clone, Debug)]
pub struct DownloadStatus {
    pub result: WaitResult,
    pub ptr: Option<MappedPtr>,
    pub byte_size: u64,
    pub row_pitch: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl DownloadStatus {
    fn not_ready(result: WaitResult) -> DownloadStatus {
        DownloadStatus {
            result,
            ptr: None,
            byte_size: 0,
            row_pitch: 0,
            width: 0,
            height: 0,
            depth: 0,
        }
    }
}

pub struct Device {
    backend: Arc<dyn GpuBackend>,
    settings: DeviceSettings,
    shader_db: Option<Arc<ShaderDb>>,
    counters: Arc<CounterPool>,
    gc: Arc<GarbageCollector>,
    timeline: Arc<FenceTimeline>,
    registry: Arc<ResourceRegistry>,
    work_db: WorkDb,
    fence_pool: FencePool,
    event_pool: EventPool,
    upload_pool: Mutex<UploadPool>,
    readback_pool: Mutex<ReadbackPool>,
    submit_lock: Mutex<()>,
    dead: AtomicBool,
}

impl Device {
    /// Creates the device on the adapter selected by the settings.
    pub fn new(instance: &dyn GpuInstance, config: DeviceConfig) -> Result<Device> {
        let adapters = instance.enumerate_adapters();
        if adapters.is_empty() {
            return Err(Error::InternalApiFailure("no adapters found".into()));
        }
        let adapter_index = config.settings.adapter_index;
        if adapter_index >= adapters.len() {
            return Err(Error::InvalidParameter(format!(
                "adapter index {} out of range ({} adapters)",
                adapter_index,
                adapters.len()
            )));
        }

        let backend =
            instance.create_device(adapter_index, config.settings.enable_debug_device)?;
        Device::with_backend(backend, config)
    }

    /// Wraps an already-created backend.
    pub fn with_backend(backend: Arc<dyn GpuBackend>, config: DeviceConfig) -> Result<Device> {
        debug!("created device on adapter '{}'", backend.adapter().name);

        let timeline = Arc::new(FenceTimeline::new(backend.clone()));
        let counters = Arc::new(CounterPool::new(backend.as_ref())?);
        let gc = Arc::new(GarbageCollector::new(
            backend.clone(),
            timeline.clone(),
            counters.clone(),
            config.gc_frequency_ms,
        ));
        gc.start();

        let registry = Arc::new(ResourceRegistry::new(
            backend.clone(),
            gc.clone(),
            counters.clone(),
        ));

        let upload_pool = UploadPool::new(
            StagingAllocator::new(backend.clone(), false, INITIAL_UPLOAD_HEAP_SIZE),
            timeline.clone(),
        );
        let readback_pool = ReadbackPool::new(
            StagingAllocator::new(backend.clone(), true, INITIAL_READBACK_HEAP_SIZE),
            timeline.clone(),
        );

        if let Some(db) = &config.shader_db {
            db.set_parent_device(backend.clone(), gc.clone(), &config.settings);
        }

        Ok(Device {
            backend,
            settings: config.settings,
            shader_db: config.shader_db,
            counters,
            gc,
            timeline,
            registry,
            work_db: WorkDb::new(),
            fence_pool: FencePool::new(),
            event_pool: EventPool::new(),
            upload_pool: Mutex::new(upload_pool),
            readback_pool: Mutex::new(readback_pool),
            submit_lock: Mutex::new(()),
            dead: AtomicBool::new(false),
        })
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        self.backend.adapter()
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn shader_db(&self) -> Option<&Arc<ShaderDb>> {
        self.shader_db.as_ref()
    }

    //----------------------------------------------------------------------------------------------
    // resource creation and release

    pub fn create_buffer(&self, desc: BufferDesc) -> Result<ResourceHandle> {
        self.ensure_alive()?;
        let handle = self.registry.create_buffer(desc)?;
        self.register_state(handle);
        Ok(handle)
    }

    pub fn create_texture(&self, desc: TextureDesc) -> Result<ResourceHandle> {
        self.ensure_alive()?;
        let handle = self.registry.create_texture(desc)?;
        self.register_state(handle);
        Ok(handle)
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> Result<ResourceHandle> {
        self.ensure_alive()?;
        // samplers have no GPU state to track
        self.registry.create_sampler(desc)
    }

    pub fn create_in_table(&self, desc: ResourceTableDesc) -> Result<ResourceTableHandle> {
        self.ensure_alive()?;
        let name = desc.name.clone();
        let handle = self.registry.create_in_table(desc)?;
        self.register_table(handle, &name);
        Ok(handle)
    }

    pub fn create_out_table(&self, desc: ResourceTableDesc) -> Result<ResourceTableHandle> {
        self.ensure_alive()?;
        let name = desc.name.clone();
        let handle = self.registry.create_out_table(desc)?;
        self.register_table(handle, &name);
        Ok(handle)
    }

    pub fn create_sampler_table(&self, desc: ResourceTableDesc) -> Result<ResourceTableHandle> {
        self.ensure_alive()?;
        let name = desc.name.clone();
        let handle = self.registry.create_sampler_table(desc)?;
        self.register_table(handle, &name);
        Ok(handle)
    }

    /// Rebuilds a recreatable texture; tables tracking it are re-patched.
    pub fn recreate_texture(&self, handle: ResourceHandle, desc: TextureDesc) -> Result<()> {
        self.ensure_alive()?;
        self.registry.recreate_texture(handle, desc)?;
        // the replacement is a brand-new resource as far as states go
        self.work_db.unregister_resource(handle);
        self.register_state(handle);
        Ok(())
    }

    pub fn release_resource(&self, handle: ResourceHandle) -> Result<()> {
        self.registry.release_resource(handle)?;
        self.work_db.unregister_resource(handle);
        Ok(())
    }

    pub fn release_table(&self, handle: ResourceTableHandle) -> Result<()> {
        self.registry.release_table(handle)?;
        self.work_db.unregister_table(handle);
        Ok(())
    }

    pub fn resource_memory_info(&self, handle: ResourceHandle) -> Result<ResourceMemoryInfo> {
        self.registry.resource_memory_info(handle)
    }

    pub fn contains_resource(&self, handle: ResourceHandle) -> bool {
        self.registry.contains_resource(handle)
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    fn register_state(&self, handle: ResourceHandle) {
        if let Some(reg) = self.registry.state_registration(handle) {
            self.work_db.register_resource(
                handle,
                reg.mem_flags,
                ResourceGpuState::Default,
                reg.size,
                reg.mip_levels,
                reg.array_slices,
                reg.has_counter,
            );
        }
    }

    fn register_table(&self, handle: ResourceTableHandle, name: &str) {
        if let Some((kind, resources)) = self.registry.table_contents(handle) {
            self.work_db.register_table(handle, name, kind, resources);
        }
    }

    //----------------------------------------------------------------------------------------------
    // scheduling

    pub fn schedule(&self, lists: &[&CommandList], flags: ScheduleFlags) -> ScheduleStatus {
        if self.dead.load(Ordering::SeqCst) {
            return ScheduleStatus::error(
                ScheduleErrorType::InternalApiFailure,
                "device is dead after a previous backend failure",
            );
        }

        // step 1: barrier planning
        let registry = &self.registry;
        let mut status = self
            .work_db
            .build(lists, &self.event_pool, &|h| registry.contains_resource(h));
        if !status.success() {
            return status;
        }
        let handle = status.work_handle;

        // step 2: every referenced shader must hold a live payload
        if let Err(message) = self.resolve_shader_payloads(handle) {
            self.release_work(handle);
            return ScheduleStatus::error(ScheduleErrorType::InvalidHandle, message);
        }

        // step 3: staging, handle resolution and submission, serialized
        let submit_result = {
            let _guard = self.submit_lock.lock().unwrap();
            let fence_value = self.timeline.allocate();
            {
                self.upload_pool.lock().unwrap().begin_usage(fence_value);
                self.readback_pool.lock().unwrap().begin_usage(fence_value);
            }
            let result = self.stage_and_submit(lists, handle, fence_value);
            {
                self.upload_pool.lock().unwrap().end_usage();
                self.readback_pool.lock().unwrap().end_usage();
            }
            if result.is_err() {
                // keep the timeline monotonic even though the submit failed
                let _ = self.backend.signal_fence(fence_value);
            }
            result
        };

        if let Err(e) = submit_result {
            error!("backend submission failed, marking device dead: {}", e);
            self.dead.store(true, Ordering::SeqCst);
            self.release_work(handle);
            return ScheduleStatus::error(ScheduleErrorType::InternalApiFailure, e.to_string());
        }

        // step 4: commit resource states
        if !self.work_db.write_resource_states(handle) {
            self.release_work(handle);
            return ScheduleStatus::error(
                ScheduleErrorType::CommitResourceStateFail,
                "failed writing resource state after processing command lists",
            );
        }

        // step 5: drop the handle unless the caller asked for it
        if !flags.contains(ScheduleFlags::GET_WORK_HANDLE) {
            self.release_work(handle);
            status.work_handle = WorkHandle::default();
        }

        status
    }

    fn resolve_shader_payloads(&self, handle: WorkHandle) -> std::result::Result<(), String> {
        let shaders: Vec<_> = self
            .work_db
            .with_bundle(handle, |b| b.shaders.iter().copied().collect())
            .unwrap_or_default();
        if shaders.is_empty() {
            return Ok(());
        }

        let db = self
            .shader_db
            .as_ref()
            .ok_or_else(|| "dispatch recorded without a shader database".to_string())?;
        for shader in shaders {
            db.resolve(shader)
                .map_err(|e| format!("shader {:?}: {}", shader, e))?;
            if !db.is_valid(shader) {
                return Err(format!("shader {:?} failed compilation", shader));
            }
            if db.payload(shader).is_none() {
                return Err(format!("shader {:?} has no backend payload", shader));
            }
        }
        Ok(())
    }

    fn stage_and_submit(
        &self,
        lists: &[&CommandList],
        handle: WorkHandle,
        fence_value: u64,
    ) -> Result<()> {
        let result = self.work_db.with_bundle(handle, |bundle| -> Result<()> {
            bundle.fence_value = fence_value;
            bundle.fence = self.fence_pool.allocate(fence_value);

            // stage upload data and inline constants
            {
                let mut upload_pool = self.upload_pool.lock().unwrap();
                for (list_index, list) in lists.iter().enumerate() {
                    let mut walker = CommandWalker::new(list.data())?;
                    let mut command_index = 0usize;
                    while let Some(parsed) = walker.next()? {
                        let info =
                            &mut bundle.processed_lists[list_index].commands[command_index];
                        match parsed {
                            ParsedCommand::Upload(view) if info.upload_size > 0 => {
                                let block = upload_pool.allocate(&StagingDesc {
                                    size: info.upload_size,
                                })?;
                                block.write(view.source_bytes());
                                info.upload_block = Some(block);
                            }
                            ParsedCommand::Compute(view) if info.constant_size > 0 => {
                                let block = upload_pool.allocate(&StagingDesc {
                                    size: info.constant_size,
                                })?;
                                block.write(view.inline_constants());
                                info.constant_block = Some(block);
                            }
                            _ => {}
                        }
                        command_index += 1;
                    }
                }
            }

            // stage readback ranges
            {
                let mut readback_pool = self.readback_pool.lock().unwrap();
                let keys: Vec<DownloadKey> = bundle.downloads.keys().copied().collect();
                for key in keys {
                    let resolved = self
                        .registry
                        .resolved_resource(key.resource)
                        .ok_or(Error::InvalidHandle)?;
                    let state = if resolved.is_buffer {
                        let byte_size = resolved.byte_size;
                        DownloadState {
                            block: Some(readback_pool.allocate(&StagingDesc { size: byte_size })?),
                            fence_value,
                            byte_size,
                            row_pitch: byte_size,
                            width: resolved.width,
                            height: 1,
                            depth: 1,
                        }
                    } else {
                        let width = (resolved.width >> key.mip_level).max(1);
                        let height = (resolved.height >> key.mip_level).max(1);
                        let depth = (resolved.depth >> key.mip_level).max(1);
                        let row_pitch = crate::pool::align_byte(
                            width as u64 * resolved.format_byte_size as u64,
                            self.backend.limits().readback_alignment,
                        );
                        let byte_size = row_pitch * height as u64 * depth as u64;
                        DownloadState {
                            block: Some(readback_pool.allocate(&StagingDesc { size: byte_size })?),
                            fence_value,
                            byte_size,
                            row_pitch,
                            width,
                            height,
                            depth,
                        }
                    };
                    bundle.downloads.insert(key, state);
                }
            }

            // snapshot handle resolutions for the backend
            let mut resolved = ResolvedHandles::default();
            for resource in bundle.states.keys() {
                let r = self
                    .registry
                    .resolved_resource(*resource)
                    .ok_or(Error::InvalidHandle)?;
                resolved.resources.insert(*resource, r);
            }
            for table in bundle.table_allocations.keys() {
                let native = self.registry.table_native(*table).ok_or(Error::InvalidHandle)?;
                let (kind, resources) = self
                    .registry
                    .table_contents(*table)
                    .ok_or(Error::InvalidHandle)?;
                resolved.tables.insert(
                    *table,
                    crate::backend::ResolvedTable {
                        id: native,
                        kind,
                        resources,
                    },
                );
            }
            if let Some(db) = &self.shader_db {
                for shader in &bundle.shaders {
                    let payload = db.payload(*shader).ok_or(Error::InvalidHandle)?;
                    resolved.pipelines.insert(*shader, payload);
                }
            }
            bundle.resolved = resolved;

            // hand everything to the backend
            let submit = SubmitInfo {
                lists: lists
                    .iter()
                    .zip(bundle.processed_lists.iter())
                    .map(|(list, processed)| SubmitList {
                        data: list.data(),
                        processed,
                    })
                    .collect(),
                resolved: &bundle.resolved,
                downloads: &bundle.downloads,
                signal_value: fence_value,
            };
            self.backend.submit(submit)
        });

        match result {
            Some(r) => r,
            None => Err(Error::InvalidHandle),
        }
    }

    //----------------------------------------------------------------------------------------------
    // work observation

    /// Blocks until the work's fence completes. Negative timeout waits
    /// forever, zero polls.
    pub fn wait_on_cpu(&self, handle: WorkHandle, timeout_ms: i64) -> WaitResult {
        let fence_value = match self.work_db.with_bundle(handle, |b| b.fence_value) {
            Some(v) => v,
            None => return WaitResult::Invalid,
        };
        let completed = self.timeline.wait_cpu(fence_value, timeout_ms);
        self.fence_pool.update_state(&self.timeline);
        if completed {
            WaitResult::Ok
        } else {
            WaitResult::NotReady
        }
    }

    /// Readback state of a downloaded subresource.
    pub fn download_status(
        &self,
        handle: WorkHandle,
        resource: ResourceHandle,
        mip_level: u32,
        array_slice: u32,
    ) -> DownloadStatus {
        let key = DownloadKey {
            resource,
            mip_level,
            array_slice,
        };
        let found = self.work_db.with_bundle(handle, |bundle| {
            bundle.downloads.get(&key).map(|state| (
                state.fence_value,
                state.block,
                state.byte_size,
                state.row_pitch,
                (state.width, state.height, state.depth),
            ))
        });

        let (fence_value, block, byte_size, row_pitch, dims) = match found.flatten() {
            Some(s) => s,
            None => return DownloadStatus::not_ready(WaitResult::Invalid),
        };
        if !self.timeline.is_complete(fence_value) {
            return DownloadStatus::not_ready(WaitResult::NotReady);
        }

        DownloadStatus {
            result: WaitResult::Ok,
            ptr: block.map(|b| b.ptr),
            byte_size,
            row_pitch,
            width: dims.0,
            height: dims.1,
            depth: dims.2,
        }
    }

    /// Copies a completed download out into a fresh vector.
    pub fn download_bytes(
        &self,
        handle: WorkHandle,
        resource: ResourceHandle,
        mip_level: u32,
        array_slice: u32,
    ) -> Option<Vec<u8>> {
        let status = self.download_status(handle, resource, mip_level, array_slice);
        if status.result != WaitResult::Ok {
            return None;
        }
        let ptr = status.ptr?;
        let mut out = vec![0u8; status.byte_size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), out.as_mut_ptr(), out.len());
        }
        Some(out)
    }

    pub fn release_work(&self, handle: WorkHandle) {
        if let Some(bundle) = self.work_db.release(handle) {
            for event in bundle.events {
                self.event_pool.free(event);
            }
            use crate::handle::GpuHandle;
            if bundle.fence.valid() {
                self.fence_pool.free(bundle.fence);
            }
        } else {
            warn!("release of an unknown work handle {:?}", handle);
        }
    }

    pub fn live_work_count(&self) -> usize {
        self.work_db.live_work_count()
    }

    /// Fence value of a live work bundle.
    pub fn work_fence_value(&self, handle: WorkHandle) -> Option<u64> {
        self.work_db.with_bundle(handle, |b| b.fence_value)
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn counter_pool(&self) -> &Arc<CounterPool> {
        &self.counters
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::InternalApiFailure(
                "device is dead after a previous backend failure".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // drain the GPU before tearing anything down
        let last = self.timeline.value();
        if last > 0 {
            self.timeline.wait_cpu(last, -1);
        }
        self.gc.stop();
        self.gc.flush();
        self.upload_pool.lock().unwrap().teardown();
        self.readback_pool.lock().unwrap().teardown();
    }
}
