//! GPU compute abstraction layer.
//!
//! Applications describe work as command lists of compute dispatches,
//! resource uploads, downloads and copies, and submit them to a device
//! backed by an explicit graphics API. This crate is the middle layer
//! between that permissive description and the strict wire-level demands of
//! the API underneath: asynchronous shader compilation with hot reload,
//! resource and table lifetimes, per-dispatch barrier planning with split
//! barriers, ring-buffered staging memory and fence-keyed reclamation.
//!
//! The backend is a trait; see [`backend::GpuBackend`]. A software backend
//! that executes copies on CPU memory ships in [`backend::software`] as the
//! reference implementation.

pub mod backend;
pub mod commands;
pub mod counters;
pub mod device;
pub mod error;
pub mod format;
pub mod gc;
pub mod handle;
pub mod pool;
pub mod registry;
pub mod resource;
pub mod schedule;
pub mod settings;
pub mod shader;
pub mod sync;
pub mod tasks;
pub mod watcher;

pub use crate::commands::CommandList;
pub use crate::device::{Device, DeviceConfig, DownloadStatus, WaitResult};
pub use crate::error::{Error, Result, ScheduleErrorType};
pub use crate::format::Format;
pub use crate::handle::{
    CounterHandle, EventHandle, FenceHandle, GpuHandle, ResourceHandle, ResourceTableHandle,
    ShaderHandle, WorkHandle,
};
pub use crate::resource::{
    AddressMode, BufferDesc, BufferType, FilterType, MemFlags, ResourceSpecialFlags,
    ResourceTableDesc, SamplerDesc, TableKind, TextureDesc, TextureType,
};
pub use crate::schedule::{ResourceGpuState, ScheduleFlags, ScheduleStatus};
pub use crate::settings::{DeviceSettings, GraphicsApi, ShaderModel};
pub use crate::shader::{ShaderDb, ShaderDbDesc, ShaderDesc, ShaderInlineDesc};
pub use crate::watcher::FileWatcher;
