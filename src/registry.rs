//! Resource and table registry.
//!
//! Thread-safe ownership of every buffer, texture, sampler and resource
//! table. The registry validates descriptions, talks to the backend for the
//! native objects, wires append/consume buffers to the shared counter pool
//! and keeps the reverse table-tracking sets that make texture recreation
//! transparent to already-built tables.

use crate::backend::{
    DescriptorWrite, GpuBackend, MappedPtr, NativeId, NativeObject, ResolvedResource,
};
use crate::counters::CounterPool;
use crate::error::{Error, Result};
use crate::gc::{Garbage, GarbageCollector};
use crate::handle::{HandleContainer, ResourceHandle, ResourceTableHandle};
use crate::resource::{
    BufferDesc, BufferType, MemFlags, ResourceMemoryInfo, ResourceSpecialFlags,
    ResourceTableDesc, SamplerDesc, TableKind, TextureDesc,
};
use fxhash::FxHashSet;
use log::debug;
use std::sync::{Arc, RwLock};

/// What a resource slot holds.
pub enum ResourceVariant {
    Buffer(BufferDesc),
    Texture(TextureDesc),
    Sampler(SamplerDesc),
}

impl Default for ResourceVariant {
    fn default() -> Self {
        ResourceVariant::Buffer(BufferDesc::default())
    }
}

#[derive(Default)]
pub struct ResourceRecord {
    pub variant: ResourceVariant,
    pub native: NativeId,
    pub memory: ResourceMemoryInfo,
    pub mapped: Option<MappedPtr>,
    pub counter: Option<crate::handle::CounterHandle>,
    /// Tables currently referencing this resource.
    pub table_refs: u32,
    /// Populated only for `TRACK_TABLES` resources.
    pub tracked_tables: FxHashSet<ResourceTableHandle>,
}

impl ResourceRecord {
    pub fn special_flags(&self) -> ResourceSpecialFlags {
        match &self.variant {
            ResourceVariant::Buffer(d) => d.special_flags,
            ResourceVariant::Texture(d) => d.special_flags,
            ResourceVariant::Sampler(_) => ResourceSpecialFlags::empty(),
        }
    }

    pub fn mem_flags(&self) -> MemFlags {
        match &self.variant {
            ResourceVariant::Buffer(d) => d.mem_flags,
            ResourceVariant::Texture(d) => d.mem_flags,
            ResourceVariant::Sampler(_) => MemFlags::empty(),
        }
    }
}

#[derive(Default)]
pub struct TableRecord {
    pub kind: Option<TableKind>,
    pub desc: ResourceTableDesc,
    pub native: NativeId,
}

struct RegistryInner {
    resources: HandleContainer<ResourceHandle, ResourceRecord>,
    tables: HandleContainer<ResourceTableHandle, TableRecord>,
}

pub struct ResourceRegistry {
    backend: Arc<dyn GpuBackend>,
    gc: Arc<GarbageCollector>,
    counters: Arc<CounterPool>,
    inner: RwLock<RegistryInner>,
}

impl ResourceRegistry {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        gc: Arc<GarbageCollector>,
        counters: Arc<CounterPool>,
    ) -> ResourceRegistry {
        ResourceRegistry {
            backend,
            gc,
            counters,
            inner: RwLock::new(RegistryInner {
                resources: HandleContainer::new(),
                tables: HandleContainer::new(),
            }),
        }
    }

    //----------------------------------------------------------------------------------------------
    // creation

    pub fn create_buffer(&self, desc: BufferDesc) -> Result<ResourceHandle> {
        validate_mem_flags(desc.mem_flags, desc.special_flags)?;
        if desc.is_append_consume && desc.buffer_type != BufferType::Structured {
            return Err(Error::InvalidParameter(
                "append/consume requires a structured buffer".into(),
            ));
        }
        if desc.buffer_type == BufferType::Structured && desc.stride == 0 {
            return Err(Error::InvalidParameter(
                "structured buffer requires a non-zero stride".into(),
            ));
        }

        let counter = if desc.is_append_consume {
            Some(self.counters.allocate()?)
        } else {
            None
        };

        let creation = match self.backend.create_buffer(&desc) {
            Ok(c) => c,
            Err(e) => {
                if let Some(c) = counter {
                    self.counters.free(c);
                }
                return Err(e);
            }
        };

        let mut inner = self.inner.write().unwrap();
        let (handle, record) = inner.resources.allocate();
        record.variant = ResourceVariant::Buffer(desc);
        record.native = creation.id;
        record.memory = creation.memory;
        record.mapped = creation.mapped;
        record.counter = counter;
        Ok(handle)
    }

    pub fn create_texture(&self, desc: TextureDesc) -> Result<ResourceHandle> {
        let desc = self.sanitize_texture_desc(desc)?;
        let creation = self.backend.create_texture(&desc)?;

        let mut inner = self.inner.write().unwrap();
        let (handle, record) = inner.resources.allocate();
        record.variant = ResourceVariant::Texture(desc);
        record.native = creation.id;
        record.memory = creation.memory;
        Ok(handle)
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> Result<ResourceHandle> {
        let native = self.backend.create_sampler(&desc)?;
        let mut inner = self.inner.write().unwrap();
        let (handle, record) = inner.resources.allocate();
        record.variant = ResourceVariant::Sampler(desc);
        record.native = native;
        Ok(handle)
    }

    fn sanitize_texture_desc(&self, mut desc: TextureDesc) -> Result<TextureDesc> {
        validate_mem_flags(desc.mem_flags, desc.special_flags)?;
        if desc.recreatable {
            desc.special_flags |= ResourceSpecialFlags::TRACK_TABLES;
        }

        // clamp to device limits
        let limits = self.backend.limits();
        use crate::resource::TextureType::*;
        let max_dim = match desc.texture_type {
            K1d => limits.max_texture_dim_1d,
            K2d | K2dArray | CubeMap | CubeMapArray => limits.max_texture_dim_2d,
            K3d => limits.max_texture_dim_3d,
        };
        desc.width = desc.width.clamp(1, max_dim);
        desc.height = desc.height.clamp(1, max_dim);
        desc.depth = desc.depth.clamp(1, limits.max_texture_dim_3d);
        desc.array_slices = desc.array_slices.clamp(1, limits.max_array_slices);
        let full_chain = 32 - desc.width.max(desc.height).leading_zeros();
        desc.mip_levels = desc.mip_levels.clamp(1, full_chain.max(1));
        Ok(desc)
    }

    //----------------------------------------------------------------------------------------------
    // tables

    pub fn create_in_table(&self, desc: ResourceTableDesc) -> Result<ResourceTableHandle> {
        self.create_table(TableKind::In, desc)
    }

    pub fn create_out_table(&self, desc: ResourceTableDesc) -> Result<ResourceTableHandle> {
        self.create_table(TableKind::Out, desc)
    }

    pub fn create_sampler_table(&self, desc: ResourceTableDesc) -> Result<ResourceTableHandle> {
        self.create_table(TableKind::Sampler, desc)
    }

    fn create_table(&self, kind: TableKind, desc: ResourceTableDesc) -> Result<ResourceTableHandle> {
        if !desc.mips.is_empty() && desc.mips.len() != desc.resources.len() {
            return Err(Error::InvalidParameter(
                "per-slot mip list must match the resource list length".into(),
            ));
        }

        let mut inner = self.inner.write().unwrap();
        let writes = gather_table_writes(&inner.resources, &self.counters, kind, &desc)?;
        let native = self.backend.create_descriptor_table(kind, &writes)?;

        let (handle, record) = inner.tables.allocate();
        record.kind = Some(kind);
        record.native = native;
        record.desc = desc;

        // second pass: bump reference counts and tracking sets
        let members: Vec<ResourceHandle> = record.desc.resources.clone();
        for member in members {
            let res = inner.resources.get_mut(member).unwrap();
            res.table_refs += 1;
            if res.special_flags().contains(ResourceSpecialFlags::TRACK_TABLES) {
                res.tracked_tables.insert(handle);
            }
        }
        Ok(handle)
    }

    /// Rebuilds a texture in place. Every table tracking the handle is
    /// re-patched with the new view at the slot the texture occupied, so
    /// clients keep submitting the same lists untouched.
    pub fn recreate_texture(&self, handle: ResourceHandle, desc: TextureDesc) -> Result<()> {
        let desc = self.sanitize_texture_desc(desc)?;
        let creation = self.backend.create_texture(&desc)?;

        let mut inner = self.inner.write().unwrap();
        let (old_native, tracked) = {
            let record = match inner.resources.get_mut(handle) {
                Some(r) => r,
                None => {
                    self.backend.destroy(NativeObject::Texture(creation.id));
                    return Err(Error::InvalidHandle);
                }
            };
            match &record.variant {
                ResourceVariant::Texture(old) if old.recreatable => {}
                ResourceVariant::Texture(_) => {
                    self.backend.destroy(NativeObject::Texture(creation.id));
                    return Err(Error::InvalidParameter(
                        "texture was not created recreatable".into(),
                    ));
                }
                _ => {
                    self.backend.destroy(NativeObject::Texture(creation.id));
                    return Err(Error::InvalidParameter("not a texture".into()));
                }
            }
            let old_native = record.native;
            record.variant = ResourceVariant::Texture(desc);
            record.native = creation.id;
            record.memory = creation.memory;
            let tracked: Vec<ResourceTableHandle> = record.tracked_tables.iter().copied().collect();
            (old_native, tracked)
        };

        debug!(
            "recreate texture: re-patching {} tracked table(s)",
            tracked.len()
        );
        for table in tracked {
            let (kind, desc) = match inner.tables.get(table) {
                Some(t) => (t.kind.unwrap(), t.desc.clone()),
                None => continue,
            };
            let writes = gather_table_writes(&inner.resources, &self.counters, kind, &desc)?;
            let native = self.backend.create_descriptor_table(kind, &writes)?;
            let record = inner.tables.get_mut(table).unwrap();
            let old_table = record.native;
            record.native = native;
            self.gc
                .defer_release(Garbage::object(NativeObject::DescriptorTable(old_table)));
        }

        self.gc
            .defer_release(Garbage::object(NativeObject::Texture(old_native)));
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // release

    pub fn release_resource(&self, handle: ResourceHandle) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let record = match inner.resources.get(handle) {
            Some(r) => r,
            None => return Err(Error::InvalidHandle),
        };

        let flags = record.special_flags();
        if record.table_refs > 0 && !flags.contains(ResourceSpecialFlags::TRACK_TABLES) {
            return Err(Error::InvalidParameter(
                "resource is still referenced by a table".into(),
            ));
        }

        let record = inner.resources.free(handle).unwrap();
        let object = match &record.variant {
            ResourceVariant::Buffer(_) => NativeObject::Buffer(record.native),
            ResourceVariant::Texture(_) => NativeObject::Texture(record.native),
            ResourceVariant::Sampler(_) => NativeObject::Sampler(record.native),
        };

        if flags.contains(ResourceSpecialFlags::NO_DEFER_DELETE) {
            self.backend.destroy(object);
            if let Some(counter) = record.counter {
                self.counters.free(counter);
            }
        } else {
            self.gc.defer_release(Garbage {
                objects: vec![object],
                counter: record.counter,
            });
        }
        Ok(())
    }

    pub fn release_table(&self, handle: ResourceTableHandle) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let record = match inner.tables.free(handle) {
            Some(r) => r,
            None => return Err(Error::InvalidHandle),
        };

        for member in &record.desc.resources {
            if let Some(res) = inner.resources.get_mut(*member) {
                res.table_refs = res.table_refs.saturating_sub(1);
                res.tracked_tables.remove(&handle);
            }
        }

        self.gc
            .defer_release(Garbage::object(NativeObject::DescriptorTable(record.native)));
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // queries

    pub fn contains_resource(&self, handle: ResourceHandle) -> bool {
        self.inner.read().unwrap().resources.contains(handle)
    }

    pub fn contains_table(&self, handle: ResourceTableHandle) -> bool {
        self.inner.read().unwrap().tables.contains(handle)
    }

    pub fn resource_memory_info(&self, handle: ResourceHandle) -> Result<ResourceMemoryInfo> {
        self.inner
            .read()
            .unwrap()
            .resources
            .get(handle)
            .map(|r| r.memory)
            .ok_or(Error::InvalidHandle)
    }

    /// Table membership in slot order, for scheduler registration.
    pub fn table_contents(
        &self,
        handle: ResourceTableHandle,
    ) -> Option<(TableKind, Vec<ResourceHandle>)> {
        let inner = self.inner.read().unwrap();
        inner
            .tables
            .get(handle)
            .map(|t| (t.kind.unwrap(), t.desc.resources.clone()))
    }

    pub fn table_native(&self, handle: ResourceTableHandle) -> Option<NativeId> {
        self.inner.read().unwrap().tables.get(handle).map(|t| t.native)
    }

    /// Snapshot of a resource for one submit.
    pub fn resolved_resource(&self, handle: ResourceHandle) -> Option<ResolvedResource> {
        let inner = self.inner.read().unwrap();
        let record = inner.resources.get(handle)?;
        let counter = record
            .counter
            .and_then(|c| self.counters.offset(c).map(|o| (self.counters.heap(), o)));
        Some(match &record.variant {
            ResourceVariant::Buffer(d) => ResolvedResource {
                id: record.native,
                is_buffer: true,
                byte_size: d.byte_size() as u64,
                width: d.element_count,
                height: 1,
                depth: 1,
                format_byte_size: d.format.byte_size() as u32,
                counter,
            },
            ResourceVariant::Texture(d) => ResolvedResource {
                id: record.native,
                is_buffer: false,
                byte_size: record.memory.byte_size,
                width: d.width,
                height: d.height,
                depth: d.depth,
                format_byte_size: d.format.byte_size() as u32,
                counter: None,
            },
            ResourceVariant::Sampler(_) => ResolvedResource {
                id: record.native,
                is_buffer: false,
                byte_size: 0,
                width: 0,
                height: 0,
                depth: 0,
                format_byte_size: 0,
                counter: None,
            },
        })
    }

    /// Metadata the scheduler registers into its global state map.
    pub fn state_registration(&self, handle: ResourceHandle) -> Option<StateRegistration> {
        let inner = self.inner.read().unwrap();
        let record = inner.resources.get(handle)?;
        Some(match &record.variant {
            ResourceVariant::Buffer(d) => StateRegistration {
                mem_flags: d.mem_flags,
                size: (d.element_count, 1, 1),
                mip_levels: 1,
                array_slices: 1,
                has_counter: record.counter.is_some(),
            },
            ResourceVariant::Texture(d) => StateRegistration {
                mem_flags: d.mem_flags,
                size: (d.width, d.height, d.depth),
                mip_levels: d.mip_levels,
                array_slices: d.array_slices,
                has_counter: false,
            },
            ResourceVariant::Sampler(_) => StateRegistration {
                mem_flags: MemFlags::empty(),
                size: (0, 0, 0),
                mip_levels: 1,
                array_slices: 1,
                has_counter: false,
            },
        })
    }
}

/// Resource metadata mirrored into the scheduler.
#[derive(Copy, Clone, Debug)]
pub struct StateRegistration {
    pub mem_flags: MemFlags,
    pub size: (u32, u32, u32),
    pub mip_levels: u32,
    pub array_slices: u32,
    pub has_counter: bool,
}

fn validate_mem_flags(mem_flags: MemFlags, special: ResourceSpecialFlags) -> Result<()> {
    if special.contains(ResourceSpecialFlags::CPU_READBACK)
        && mem_flags.contains(MemFlags::GPU_READ | MemFlags::GPU_WRITE)
    {
        return Err(Error::InvalidParameter(
            "CPU_READBACK excludes simultaneous GPU_READ and GPU_WRITE".into(),
        ));
    }
    Ok(())
}

fn gather_table_writes(
    resources: &HandleContainer<ResourceHandle, ResourceRecord>,
    counters: &CounterPool,
    kind: TableKind,
    desc: &ResourceTableDesc,
) -> Result<Vec<DescriptorWrite>> {
    let mut writes = Vec::with_capacity(desc.resources.len());
    let mut counter_writes = Vec::new();

    for (slot, &member) in desc.resources.iter().enumerate() {
        let record = resources.get(member).ok_or(Error::InvalidHandle)?;
        let mip = desc.mips.get(slot).copied();

        match (&record.variant, kind) {
            (ResourceVariant::Sampler(_), TableKind::Sampler) => {
                writes.push(DescriptorWrite::SamplerView {
                    sampler: record.native,
                });
            }
            (ResourceVariant::Sampler(_), _) => {
                return Err(Error::InvalidParameter(
                    "samplers can only go into sampler tables".into(),
                ));
            }
            (_, TableKind::Sampler) => {
                return Err(Error::InvalidParameter(
                    "sampler tables only accept samplers".into(),
                ));
            }
            (ResourceVariant::Buffer(d), table_kind) => {
                check_table_access(d.mem_flags, table_kind)?;
                writes.push(DescriptorWrite::BufferView {
                    buffer: record.native,
                    offset: 0,
                    size: d.byte_size() as u64,
                });
                if table_kind == TableKind::Out {
                    if let Some(counter) = record.counter {
                        let offset = counters.offset(counter).ok_or(Error::InvalidHandle)?;
                        counter_writes.push(DescriptorWrite::CounterView {
                            buffer: counters.heap(),
                            offset,
                        });
                    }
                }
            }
            (ResourceVariant::Texture(d), table_kind) => {
                check_table_access(d.mem_flags, table_kind)?;
                writes.push(DescriptorWrite::TextureView {
                    texture: record.native,
                    mip,
                });
            }
        }
    }

    // Append/consume counters bind after the regular views, one storage slot
    // each, pointing at the 4-byte slot in the shared counter heap.
    writes.extend(counter_writes);
    Ok(writes)
}

fn check_table_access(mem_flags: MemFlags, kind: TableKind) -> Result<()> {
    match kind {
        TableKind::In if !mem_flags.contains(MemFlags::GPU_READ) => Err(Error::InvalidParameter(
            "input table requires GPU_READ resources".into(),
        )),
        TableKind::Out if !mem_flags.contains(MemFlags::GPU_WRITE) => Err(Error::InvalidParameter(
            "output table requires GPU_WRITE resources".into(),
        )),
        _ => Ok(()),
    }
}
