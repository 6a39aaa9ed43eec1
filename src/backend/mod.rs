//! The backend seam.
//!
//! The core is backend-agnostic: everything below `Device` talks to a
//! `GpuBackend` trait object. A backend owns the native API objects and
//! understands six families of operations: resource creation, descriptor
//! table creation, command encoding + submission, fence signaling/waiting,
//! readback mapping and object destruction. Pipeline creation is the
//! seventh: the shader database hands compiled SPIR-V here to build the
//! dispatchable payload.

pub mod software;

use crate::error::Result;
use crate::resource::{BufferDesc, ResourceMemoryInfo, SamplerDesc, TableKind, TextureDesc};
use crate::schedule::ProcessedList;
use crate::settings::ShaderModel;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// Opaque identifier of a native backend object.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct NativeId(pub u64);

/// A native object queued for destruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NativeObject {
    Buffer(NativeId),
    Texture(NativeId),
    Sampler(NativeId),
    DescriptorTable(NativeId),
    Pipeline(NativeId),
    Heap(NativeId),
}

/// Persistently mapped CPU pointer into backend-visible memory.
///
/// Staging heaps stay mapped for their whole lifetime; the pointer is handed
/// across threads together with the fence discipline that makes the access
/// exclusive.
#[derive(Copy, Clone)]
pub struct MappedPtr(NonNull<u8>);

unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: *mut u8) -> Option<MappedPtr> {
        NonNull::new(ptr).map(MappedPtr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `offset` bytes into the mapping.
    pub fn offset(self, offset: u64) -> *mut u8 {
        unsafe { self.0.as_ptr().add(offset as usize) }
    }
}

impl fmt::Debug for MappedPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MappedPtr({:p})", self.0.as_ptr())
    }
}

/// Physical adapter description reported by an instance.
#[derive(Clone, Debug)]
pub struct AdapterInfo {
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub highest_shader_model: ShaderModel,
}

/// Device limits the registry clamps against at creation time.
#[derive(Copy, Clone, Debug)]
pub struct DeviceLimits {
    pub max_texture_dim_1d: u32,
    pub max_texture_dim_2d: u32,
    pub max_texture_dim_3d: u32,
    pub max_array_slices: u32,
    /// Constant-buffer alignment; uploads align to this. 256 on mainstream APIs.
    pub constant_buffer_alignment: u64,
    /// Row alignment of readback ranges.
    pub readback_alignment: u64,
    /// Placement distance between counter slots in the shared counter heap.
    pub counter_alignment: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        DeviceLimits {
            max_texture_dim_1d: 16384,
            max_texture_dim_2d: 16384,
            max_texture_dim_3d: 2048,
            max_array_slices: 2048,
            constant_buffer_alignment: 256,
            readback_alignment: 512,
            counter_alignment: 4096,
        }
    }
}

/// Result of creating a buffer. CPU-visible buffers come back mapped.
#[derive(Clone, Debug)]
pub struct BufferCreation {
    pub id: NativeId,
    pub memory: ResourceMemoryInfo,
    pub mapped: Option<MappedPtr>,
}

#[derive(Clone, Debug)]
pub struct TextureCreation {
    pub id: NativeId,
    pub memory: ResourceMemoryInfo,
}

/// Result of creating a staging heap for the ring pools.
#[derive(Clone, Debug)]
pub struct HeapCreation {
    pub id: NativeId,
    pub size: u64,
    pub mapped: MappedPtr,
    pub gpu_va: u64,
}

/// One slot written into a descriptor table.
#[derive(Clone, Debug)]
pub enum DescriptorWrite {
    BufferView {
        buffer: NativeId,
        offset: u64,
        size: u64,
    },
    TextureView {
        texture: NativeId,
        /// `None` binds the whole mip chain.
        mip: Option<u32>,
    },
    SamplerView {
        sampler: NativeId,
    },
    /// Storage view of one 4-byte append/consume counter slot.
    CounterView {
        buffer: NativeId,
        offset: u64,
    },
}

/// How the scheduler resolved a resource handle for the backend.
#[derive(Clone, Debug)]
pub struct ResolvedResource {
    pub id: NativeId,
    pub is_buffer: bool,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format_byte_size: u32,
    /// Counter slot of append/consume buffers.
    pub counter: Option<(NativeId, u64)>,
}

/// Table snapshot: native set plus the membership the backend binds with.
#[derive(Clone, Debug)]
pub struct ResolvedTable {
    pub id: NativeId,
    pub kind: TableKind,
    pub resources: Vec<crate::handle::ResourceHandle>,
}

/// Handle-to-native snapshot taken at schedule time, valid for one submit.
#[derive(Clone, Debug, Default)]
pub struct ResolvedHandles {
    pub resources: fxhash::FxHashMap<crate::handle::ResourceHandle, ResolvedResource>,
    pub tables: fxhash::FxHashMap<crate::handle::ResourceTableHandle, ResolvedTable>,
    pub pipelines: fxhash::FxHashMap<crate::handle::ShaderHandle, NativeId>,
}

/// One command list ready for backend translation.
pub struct SubmitList<'a> {
    /// The finalized ABI stream.
    pub data: &'a [u8],
    /// Barriers and staging assignments, one entry per command.
    pub processed: &'a ProcessedList,
}

/// Everything the backend needs to encode and submit one schedule call.
pub struct SubmitInfo<'a> {
    pub lists: Vec<SubmitList<'a>>,
    pub resolved: &'a ResolvedHandles,
    /// Readback ranges keyed by downloaded subresource.
    pub downloads: &'a fxhash::FxHashMap<crate::schedule::DownloadKey, crate::schedule::DownloadState>,
    /// Fence value to signal once all lists have executed.
    pub signal_value: u64,
}

/// The abstract device consumed by the core.
///
/// Encoding happens synchronously inside `submit`; execution may complete
/// asynchronously, observed through the fence operations.
pub trait GpuBackend: Send + Sync {
    fn adapter(&self) -> &AdapterInfo;
    fn limits(&self) -> &DeviceLimits;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferCreation>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureCreation>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<NativeId>;
    /// The shared heap holding `slots` append/consume counters, one per
    /// `counter_alignment` bytes.
    fn create_counter_heap(&self, slots: u32) -> Result<NativeId>;
    fn create_staging_heap(&self, size: u64, readback: bool) -> Result<HeapCreation>;

    fn create_descriptor_table(
        &self,
        kind: TableKind,
        writes: &[DescriptorWrite],
    ) -> Result<NativeId>;

    fn create_compute_pipeline(&self, spirv: &[u32], name: &str) -> Result<NativeId>;

    fn submit(&self, submit: SubmitInfo<'_>) -> Result<()>;

    /// Enqueues a fence signal after all previously submitted work.
    fn signal_fence(&self, value: u64) -> Result<()>;
    fn completed_fence_value(&self) -> u64;
    /// Blocks until `value` completes; `None` waits forever. Returns whether
    /// the value completed.
    fn wait_fence(&self, value: u64, timeout: Option<Duration>) -> bool;

    fn map_readback(&self, heap: NativeId, offset: u64, size: u64) -> Result<MappedPtr>;

    fn destroy(&self, object: NativeObject);
}

/// Entry point for adapter discovery, owned explicitly by the caller.
pub trait GpuInstance {
    fn enumerate_adapters(&self) -> Vec<AdapterInfo>;
    fn create_device(&self, adapter_index: usize, enable_debug: bool)
        -> Result<Arc<dyn GpuBackend>>;
}
