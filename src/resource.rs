//! Resource descriptions: buffers, textures, samplers and resource tables.

use crate::format::Format;
use crate::handle::ResourceHandle;
use bitflags::bitflags;
use ordered_float::NotNan;

bitflags! {
    /// GPU-side access rights of a resource.
    pub struct MemFlags: u32 {
        const GPU_READ  = 0b01;
        const GPU_WRITE = 0b10;
    }
}

impl Default for MemFlags {
    fn default() -> Self {
        MemFlags::GPU_READ | MemFlags::GPU_WRITE
    }
}

bitflags! {
    /// Special resource behaviors.
    #[derive(Default)]
    pub struct ResourceSpecialFlags: u32 {
        /// CPU-writable staging memory, persistently mapped.
        const CPU_UPLOAD = 0b00001;
        /// CPU-readable memory for downloads.
        const CPU_READBACK = 0b00010;
        /// Destroy immediately on release instead of going through the GC.
        const NO_DEFER_DELETE = 0b00100;
        /// Record the tables referencing this resource so they can be
        /// re-patched when the resource is recreated.
        const TRACK_TABLES = 0b01000;
        /// Usable as a color attachment by an external presentation layer.
        const COLOR_ATTACHMENT = 0b10000;
    }
}

/// Storage classification of a buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferType {
    /// Untyped byte-addressed storage.
    Raw,
    /// Array of `stride`-sized records.
    Structured,
    /// Elements interpreted through `format`.
    Typed,
}

impl Default for BufferType {
    fn default() -> Self {
        BufferType::Typed
    }
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub name: String,
    pub buffer_type: BufferType,
    pub format: Format,
    /// Record size in bytes. Only meaningful for structured buffers.
    pub stride: u32,
    pub element_count: u32,
    /// Allocates a 4-byte counter slot in the shared counter pool.
    /// Requires `buffer_type == Structured`.
    pub is_append_consume: bool,
    pub mem_flags: MemFlags,
    pub special_flags: ResourceSpecialFlags,
}

impl Default for BufferDesc {
    fn default() -> Self {
        BufferDesc {
            name: String::new(),
            buffer_type: BufferType::Typed,
            format: Format::default(),
            stride: 0,
            element_count: 1,
            is_append_consume: false,
            mem_flags: MemFlags::default(),
            special_flags: ResourceSpecialFlags::empty(),
        }
    }
}

impl BufferDesc {
    /// Byte size of the whole buffer.
    pub fn byte_size(&self) -> usize {
        match self.buffer_type {
            BufferType::Raw => self.element_count as usize * 4,
            BufferType::Structured => self.element_count as usize * self.stride as usize,
            BufferType::Typed => self.element_count as usize * self.format.byte_size(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TextureType {
    K1d,
    K2d,
    K3d,
    K2dArray,
    CubeMap,
    CubeMapArray,
}

impl Default for TextureType {
    fn default() -> Self {
        TextureType::K2d
    }
}

#[derive(Clone, Debug)]
pub struct TextureDesc {
    pub name: String,
    pub texture_type: TextureType,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_slices: u32,
    /// Allows `recreate_texture` while tables still reference the handle.
    /// Implies `TRACK_TABLES`.
    pub recreatable: bool,
    pub mem_flags: MemFlags,
    pub special_flags: ResourceSpecialFlags,
}

impl Default for TextureDesc {
    fn default() -> Self {
        TextureDesc {
            name: String::new(),
            texture_type: TextureType::K2d,
            format: Format::default(),
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_slices: 1,
            recreatable: false,
            mem_flags: MemFlags::default(),
            special_flags: ResourceSpecialFlags::empty(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FilterType {
    Point,
    Linear,
    Anisotropic,
    Min,
    Max,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

/// Sampler description.
///
/// Float members are ordered floats so descriptions can key sampler caches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub name: String,
    pub filter: FilterType,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub border_color: [NotNan<f32>; 4],
    pub min_lod: NotNan<f32>,
    pub max_lod: NotNan<f32>,
    pub max_aniso_quality: u32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        let zero = NotNan::new(0.0f32).unwrap();
        SamplerDesc {
            name: String::new(),
            filter: FilterType::Linear,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            border_color: [zero; 4],
            min_lod: zero,
            max_lod: NotNan::new(1000.0f32).unwrap(),
            max_aniso_quality: 1,
        }
    }
}

/// What a table binds and how the scheduler transitions its contents.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableKind {
    /// Read-only views, bound to `t` registers. Contents transition to Srv.
    In,
    /// Read-write views, bound to `u` registers. Contents transition to Uav.
    Out,
    /// Sampler objects, bound to `s` registers.
    Sampler,
}

#[derive(Clone, Debug, Default)]
pub struct ResourceTableDesc {
    pub name: String,
    pub resources: Vec<ResourceHandle>,
    /// Optional per-slot mip selection; empty means whole-resource views.
    pub mips: Vec<u32>,
}

/// Placement information reported by the backend at creation time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceMemoryInfo {
    pub byte_size: u64,
    pub alignment: u64,
    pub row_pitch: u64,
}
