//! Work scheduling: command-list parsing and barrier planning.
//!
//! `WorkDb` owns the global resource state map and the registry of table
//! contents it needs to plan transitions. `build` walks every submitted
//! list, computes the `(resource, target_state)` pairs implied by each
//! command, and emits barriers against the per-schedule state map:
//! same-state touches emit nothing, near touches (the prior touch is at most
//! one command back in the same list) emit an Immediate barrier, and far
//! touches split into a Begin on the producer and an End on the consumer so
//! the backend can overlap the work in between. The per-schedule map merges
//! into the global one only after the backend accepted the submission.

use crate::commands::{CommandList, CommandWalker, MemOffset, ParsedCommand};
use crate::error::ScheduleErrorType;
use crate::handle::{
    EventHandle, FenceHandle, GpuHandle, HandleContainer, ResourceHandle, ResourceTableHandle,
    ShaderHandle, WorkHandle,
};
use crate::pool::StagingBlock;
use crate::resource::{MemFlags, TableKind};
use crate::sync::EventPool;
use bitflags::bitflags;
use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::Mutex;

bitflags! {
    pub struct ScheduleFlags: u32 {
        /// Keep the work handle alive for `wait_on_cpu`/`download_status`;
        /// without it the bundle is released as soon as it is submitted.
        const GET_WORK_HANDLE = 0b1;
    }
}

/// Outcome of a `schedule` call.
#[derive(Clone, Debug)]
pub struct ScheduleStatus {
    pub work_handle: WorkHandle,
    pub error: ScheduleErrorType,
    pub message: String,
}

impl ScheduleStatus {
    pub fn ok(work_handle: WorkHandle) -> ScheduleStatus {
        ScheduleStatus {
            work_handle,
            error: ScheduleErrorType::Ok,
            message: String::new(),
        }
    }

    pub fn error(error: ScheduleErrorType, message: impl Into<String>) -> ScheduleStatus {
        ScheduleStatus {
            work_handle: WorkHandle::default(),
            error,
            message: message.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_ok()
    }
}

/// GPU state a resource can occupy. Exactly one per resource in the global
/// state map.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResourceGpuState {
    Default,
    IndirectArgs,
    Srv,
    Uav,
    Cbv,
    Rtv,
    CopySrc,
    CopyDst,
    Present,
    Uninitialized,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BarrierType {
    Immediate,
    Begin,
    End,
}

/// Where a command sits inside one schedule call.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandLocation {
    pub list_index: usize,
    pub command_index: usize,
}

#[derive(Clone, Debug)]
pub struct ResourceBarrier {
    pub resource: ResourceHandle,
    /// Write-after-write dependency between dispatches; `prev == post`.
    pub is_uav: bool,
    pub src_location: CommandLocation,
    pub dst_location: CommandLocation,
    pub prev_state: ResourceGpuState,
    pub post_state: ResourceGpuState,
    pub barrier_type: BarrierType,
    /// Links the two halves of a split barrier.
    pub event: Option<EventHandle>,
}

/// Identifies one downloaded subresource inside a work bundle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DownloadKey {
    pub resource: ResourceHandle,
    pub mip_level: u32,
    pub array_slice: u32,
}

/// Scheduling data attached to one recorded command.
#[derive(Clone, Debug, Default)]
pub struct CommandInfo {
    pub sentinel: u32,
    pub command_offset: MemOffset,
    pub pre_barriers: SmallVec<[ResourceBarrier; 4]>,
    pub post_barriers: SmallVec<[ResourceBarrier; 4]>,
    /// Bytes this command stages through the upload ring.
    pub upload_size: u64,
    /// Inline constants staged and bound at `b0`.
    pub constant_size: u64,
    pub upload_block: Option<StagingBlock>,
    pub constant_block: Option<StagingBlock>,
    pub download_key: Option<DownloadKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ProcessedList {
    pub list_index: usize,
    pub compute_command_count: usize,
    pub download_command_count: usize,
    pub commands: Vec<CommandInfo>,
}

/// GPU descriptor slots a table occupies in a shader-visible heap.
#[derive(Copy, Clone, Debug, Default)]
pub struct TableAllocation {
    pub offset: u32,
    pub count: u32,
    pub is_sampler: bool,
}

/// Readback range of one downloaded subresource.
#[derive(Clone, Debug, Default)]
pub struct DownloadState {
    pub block: Option<StagingBlock>,
    pub fence_value: u64,
    pub byte_size: u64,
    pub row_pitch: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Everything produced by one `schedule` call.
#[derive(Default)]
pub struct WorkBundle {
    pub processed_lists: Vec<ProcessedList>,
    /// Per-schedule state deltas, merged into the global map on commit.
    pub states: FxHashMap<ResourceHandle, WorkResourceState>,
    pub table_allocations: FxHashMap<ResourceTableHandle, TableAllocation>,
    pub downloads: FxHashMap<DownloadKey, DownloadState>,
    pub shaders: FxHashSet<ShaderHandle>,
    pub events: Vec<EventHandle>,
    pub total_upload_size: u64,
    pub total_table_slots: u32,
    pub total_sampler_slots: u32,
    pub total_constant_buffers: u32,
    pub fence_value: u64,
    pub fence: FenceHandle,
    pub resolved: crate::backend::ResolvedHandles,
}

#[derive(Copy, Clone, Debug)]
pub struct WorkResourceState {
    pub list_index: usize,
    pub command_index: usize,
    pub state: ResourceGpuState,
}

/// Contents of a registered table, mirrored from the registry.
#[derive(Clone, Debug)]
struct TableInfo {
    kind: TableKind,
    name: String,
    resources: Vec<ResourceHandle>,
}

/// Persistent scheduling info of a registered resource.
#[derive(Clone, Debug)]
pub struct ResourceInfo {
    pub mem_flags: MemFlags,
    pub gpu_state: ResourceGpuState,
    pub size: (u32, u32, u32),
    pub mip_levels: u32,
    pub array_slices: u32,
    pub has_counter: bool,
}

#[derive(Default)]
struct WorkDbInfos {
    tables: FxHashMap<ResourceTableHandle, TableInfo>,
    resources: FxHashMap<ResourceHandle, ResourceInfo>,
}

/// The scheduler database: registered resources/tables, the global state
/// map and the live work bundles.
pub struct WorkDb {
    works: Mutex<HandleContainer<WorkHandle, WorkBundle>>,
    infos: Mutex<WorkDbInfos>,
}

impl WorkDb {
    pub fn new() -> WorkDb {
        WorkDb {
            works: Mutex::new(HandleContainer::new()),
            infos: Mutex::new(WorkDbInfos::default()),
        }
    }

    //----------------------------------------------------------------------------------------------
    // registration, driven by the registry through the device

    pub fn register_resource(
        &self,
        handle: ResourceHandle,
        mem_flags: MemFlags,
        initial_state: ResourceGpuState,
        size: (u32, u32, u32),
        mip_levels: u32,
        array_slices: u32,
        has_counter: bool,
    ) {
        self.infos.lock().unwrap().resources.insert(
            handle,
            ResourceInfo {
                mem_flags,
                gpu_state: initial_state,
                size,
                mip_levels,
                array_slices,
                has_counter,
            },
        );
    }

    pub fn unregister_resource(&self, handle: ResourceHandle) {
        self.infos.lock().unwrap().resources.remove(&handle);
    }

    pub fn register_table(
        &self,
        handle: ResourceTableHandle,
        name: &str,
        kind: TableKind,
        resources: Vec<ResourceHandle>,
    ) {
        self.infos.lock().unwrap().tables.insert(
            handle,
            TableInfo {
                kind,
                name: name.to_string(),
                resources,
            },
        );
    }

    pub fn unregister_table(&self, handle: ResourceTableHandle) {
        self.infos.lock().unwrap().tables.remove(&handle);
    }

    pub fn resource_state(&self, handle: ResourceHandle) -> Option<ResourceGpuState> {
        self.infos
            .lock()
            .unwrap()
            .resources
            .get(&handle)
            .map(|i| i.gpu_state)
    }

    pub fn resource_info(&self, handle: ResourceHandle) -> Option<ResourceInfo> {
        self.infos.lock().unwrap().resources.get(&handle).cloned()
    }

    //----------------------------------------------------------------------------------------------
    // build

    /// Parses the lists and plans barriers, staging sizes and table slots.
    /// On success the bundle is stored under a fresh work handle; parse
    /// failures allocate nothing.
    pub fn build(
        &self,
        lists: &[&CommandList],
        events: &EventPool,
        resource_valid: &dyn Fn(ResourceHandle) -> bool,
    ) -> ScheduleStatus {
        let infos = self.infos.lock().unwrap();
        let mut ctx = BuildContext {
            infos: &infos,
            events,
            resource_valid,
            location: CommandLocation::default(),
            states: FxHashMap::default(),
            processed: Vec::with_capacity(lists.len()),
            bundle_events: Vec::new(),
            table_allocations: FxHashMap::default(),
            shaders: FxHashSet::default(),
            total_upload_size: 0,
            total_table_slots: 0,
            total_sampler_slots: 0,
            total_constant_buffers: 0,
        };

        for (list_index, list) in lists.iter().enumerate() {
            if !list.is_closed() {
                for event in ctx.bundle_events {
                    events.free(event);
                }
                return ScheduleStatus::error(
                    ScheduleErrorType::CorruptedCommandListSentinel,
                    "command list was not finalized before submission",
                );
            }
            ctx.location.list_index = list_index;
            ctx.processed.push(ProcessedList {
                list_index,
                ..Default::default()
            });
            if let Err(status) = parse_command_list(list, &mut ctx) {
                for event in ctx.bundle_events {
                    events.free(event);
                }
                return status;
            }
        }

        let mut bundle = WorkBundle {
            processed_lists: ctx.processed,
            states: ctx.states,
            table_allocations: ctx.table_allocations,
            shaders: ctx.shaders,
            events: ctx.bundle_events,
            total_upload_size: ctx.total_upload_size,
            total_table_slots: ctx.total_table_slots,
            total_sampler_slots: ctx.total_sampler_slots,
            total_constant_buffers: ctx.total_constant_buffers,
            ..Default::default()
        };

        // download keys become bundle-level readback requests
        for list in &bundle.processed_lists {
            for cmd in &list.commands {
                if let Some(key) = cmd.download_key {
                    bundle.downloads.insert(key, DownloadState::default());
                }
            }
        }

        drop(infos);
        let mut works = self.works.lock().unwrap();
        let (handle, slot) = works.allocate();
        *slot = bundle;
        ScheduleStatus::ok(handle)
    }

    /// Merges the bundle's per-schedule states into the global map.
    pub fn write_resource_states(&self, handle: WorkHandle) -> bool {
        let works = self.works.lock().unwrap();
        let bundle = match works.get(handle) {
            Some(b) => b,
            None => return false,
        };

        let mut infos = self.infos.lock().unwrap();
        for (resource, state) in &bundle.states {
            match infos.resources.get_mut(resource) {
                Some(info) => info.gpu_state = state.state,
                None => return false,
            }
        }
        true
    }

    /// Runs `f` against a live bundle.
    pub fn with_bundle<R>(&self, handle: WorkHandle, f: impl FnOnce(&mut WorkBundle) -> R)
        -> Option<R> {
        let mut works = self.works.lock().unwrap();
        works.get_mut(handle).map(f)
    }

    pub fn contains(&self, handle: WorkHandle) -> bool {
        self.works.lock().unwrap().contains(handle)
    }

    /// Frees the bundle, returning it to the caller for event/fence cleanup.
    pub fn release(&self, handle: WorkHandle) -> Option<WorkBundle> {
        self.works.lock().unwrap().free(handle)
    }

    pub fn live_work_count(&self) -> usize {
        self.works.lock().unwrap().len()
    }
}

impl Default for WorkDb {
    fn default() -> Self {
        WorkDb::new()
    }
}

//--------------------------------------------------------------------------------------------------
// parse internals

struct BuildContext<'a> {
    infos: &'a WorkDbInfos,
    events: &'a EventPool,
    resource_valid: &'a dyn Fn(ResourceHandle) -> bool,
    location: CommandLocation,
    states: FxHashMap<ResourceHandle, WorkResourceState>,
    processed: Vec<ProcessedList>,
    bundle_events: Vec<EventHandle>,
    table_allocations: FxHashMap<ResourceTableHandle, TableAllocation>,
    shaders: FxHashSet<ShaderHandle>,
    total_upload_size: u64,
    total_table_slots: u32,
    total_sampler_slots: u32,
    total_constant_buffers: u32,
}

fn parse_command_list(list: &CommandList, ctx: &mut BuildContext) -> Result<(), ScheduleStatus> {
    let mut walker = CommandWalker::new(list.data()).map_err(|_| {
        ScheduleStatus::error(
            ScheduleErrorType::CorruptedCommandListSentinel,
            "buffer does not begin with a command list header",
        )
    })?;

    let mut command_index = 0usize;
    loop {
        let offset = walker.offset();
        let sentinel = walker.peek_sentinel();
        let parsed = match walker.next() {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(_) => {
                return Err(ScheduleStatus::error(
                    ScheduleErrorType::CorruptedCommandListSentinel,
                    format!("unrecognized command sentinel parsed: {}", sentinel),
                ));
            }
        };

        ctx.location.command_index = command_index;
        let list_index = ctx.location.list_index;
        ctx.processed[list_index].commands.push(CommandInfo {
            sentinel,
            command_offset: offset,
            ..Default::default()
        });

        match parsed {
            ParsedCommand::Compute(view) => {
                ctx.processed[list_index].compute_command_count += 1;
                ctx.shaders.insert(view.shader());

                for table in view.in_tables() {
                    transition_table(table, ctx)?;
                }
                for table in view.out_tables() {
                    transition_table(table, ctx)?;
                }
                for table in view.sampler_tables() {
                    allocate_table_slots(table, ctx)?;
                }
                for cbv in view.constants() {
                    transition_resource(cbv, ResourceGpuState::Cbv, false, ctx)?;
                    ctx.total_constant_buffers += 1;
                }
                if let Some(indirect) = view.indirect_buffer() {
                    transition_resource(indirect, ResourceGpuState::IndirectArgs, false, ctx)?;
                }

                let constant_size = view.cmd.inline_constant_size as u64;
                if constant_size > 0 {
                    ctx.total_upload_size += constant_size;
                    ctx.total_constant_buffers += 1;
                    current_command(ctx).constant_size = constant_size;
                }
            }
            ParsedCommand::Copy(cmd) => {
                let source = ResourceHandle::from_raw(cmd.source);
                let destination = ResourceHandle::from_raw(cmd.destination);
                transition_resource(source, ResourceGpuState::CopySrc, false, ctx)?;
                transition_resource(destination, ResourceGpuState::CopyDst, false, ctx)?;
            }
            ParsedCommand::Upload(view) => {
                transition_resource(view.destination(), ResourceGpuState::CopyDst, false, ctx)?;
                let size = view.cmd.source_size as u64;
                ctx.total_upload_size += size;
                current_command(ctx).upload_size = size;
            }
            ParsedCommand::Download(cmd) => {
                let source = ResourceHandle::from_raw(cmd.source);
                transition_resource(source, ResourceGpuState::CopySrc, false, ctx)?;
                ctx.processed[list_index].download_command_count += 1;
                current_command(ctx).download_key = Some(DownloadKey {
                    resource: source,
                    mip_level: cmd.mip_level,
                    array_slice: cmd.array_slice,
                });
            }
            ParsedCommand::BeginMarker(_) | ParsedCommand::EndMarker => {}
        }

        command_index += 1;
    }
    Ok(())
}

fn current_command<'c>(ctx: &'c mut BuildContext) -> &'c mut CommandInfo {
    let list = ctx.location.list_index;
    ctx.processed[list].commands.last_mut().unwrap()
}

fn allocate_table_slots(
    table: ResourceTableHandle,
    ctx: &mut BuildContext,
) -> Result<TableKind, ScheduleStatus> {
    let info = match ctx.infos.tables.get(&table) {
        Some(i) => i,
        None => {
            return Err(ScheduleStatus::error(
                ScheduleErrorType::BadTableInfo,
                format!("could not find table information for table id {:?}", table),
            ));
        }
    };

    if !ctx.table_allocations.contains_key(&table) {
        let count = info.resources.len() as u32;
        let is_sampler = info.kind == TableKind::Sampler;
        let offset = if is_sampler {
            let o = ctx.total_sampler_slots;
            ctx.total_sampler_slots += count;
            o
        } else {
            let o = ctx.total_table_slots;
            ctx.total_table_slots += count;
            o
        };
        ctx.table_allocations.insert(
            table,
            TableAllocation {
                offset,
                count,
                is_sampler,
            },
        );
    }
    Ok(info.kind)
}

fn transition_table(table: ResourceTableHandle, ctx: &mut BuildContext)
    -> Result<(), ScheduleStatus> {
    let kind = allocate_table_slots(table, ctx)?;
    let new_state = match kind {
        TableKind::Out => ResourceGpuState::Uav,
        _ => ResourceGpuState::Srv,
    };
    let resources = ctx.infos.tables.get(&table).unwrap().resources.clone();
    for resource in resources {
        transition_resource(resource, new_state, kind == TableKind::Out, ctx)?;
    }
    Ok(())
}

fn transition_resource(
    resource: ResourceHandle,
    new_state: ResourceGpuState,
    is_compute_storage: bool,
    ctx: &mut BuildContext,
) -> Result<(), ScheduleStatus> {
    if !(ctx.resource_valid)(resource) {
        return Err(ScheduleStatus::error(
            ScheduleErrorType::InvalidHandle,
            format!("command references a stale resource handle {:?}", resource),
        ));
    }

    let location = ctx.location;
    match ctx.states.get_mut(&resource) {
        Some(curr) => {
            let distance = location
                .command_index
                .wrapping_sub(curr.command_index);
            let can_split = curr.list_index != location.list_index || distance >= 2;

            if curr.state != new_state {
                if can_split {
                    let event = ctx.events.allocate();
                    ctx.bundle_events.push(event);
                    let begin = ResourceBarrier {
                        resource,
                        is_uav: false,
                        src_location: CommandLocation {
                            list_index: curr.list_index,
                            command_index: curr.command_index,
                        },
                        dst_location: location,
                        prev_state: curr.state,
                        post_state: new_state,
                        barrier_type: BarrierType::Begin,
                        event: Some(event),
                    };
                    let mut end = begin.clone();
                    end.barrier_type = BarrierType::End;

                    ctx.processed[curr.list_index].commands[curr.command_index]
                        .post_barriers
                        .push(begin);
                    ctx.processed[location.list_index].commands[location.command_index]
                        .pre_barriers
                        .push(end);
                } else {
                    let barrier = ResourceBarrier {
                        resource,
                        is_uav: false,
                        src_location: location,
                        dst_location: location,
                        prev_state: curr.state,
                        post_state: new_state,
                        barrier_type: BarrierType::Immediate,
                        event: None,
                    };
                    ctx.processed[location.list_index].commands[location.command_index]
                        .pre_barriers
                        .push(barrier);
                }
                curr.state = new_state;
            } else if new_state == ResourceGpuState::Uav
                && is_compute_storage
                && (curr.list_index != location.list_index
                    || curr.command_index != location.command_index)
            {
                // write-after-write between dispatches
                let barrier = ResourceBarrier {
                    resource,
                    is_uav: true,
                    src_location: CommandLocation {
                        list_index: curr.list_index,
                        command_index: curr.command_index,
                    },
                    dst_location: location,
                    prev_state: new_state,
                    post_state: new_state,
                    barrier_type: BarrierType::Immediate,
                    event: None,
                };
                ctx.processed[location.list_index].commands[location.command_index]
                    .pre_barriers
                    .push(barrier);
            }

            curr.list_index = location.list_index;
            curr.command_index = location.command_index;
        }
        None => {
            let prev_state = match ctx.infos.resources.get(&resource) {
                Some(info) => info.gpu_state,
                None => {
                    return Err(ScheduleStatus::error(
                        ScheduleErrorType::ResourceStateNotFound,
                        format!("could not find registered resource id {:?}", resource),
                    ));
                }
            };

            ctx.states.insert(
                resource,
                WorkResourceState {
                    list_index: location.list_index,
                    command_index: location.command_index,
                    state: new_state,
                },
            );

            if prev_state != new_state {
                let barrier = ResourceBarrier {
                    resource,
                    is_uav: false,
                    src_location: location,
                    dst_location: location,
                    prev_state,
                    post_state: new_state,
                    barrier_type: BarrierType::Immediate,
                    event: None,
                };
                ctx.processed[location.list_index].commands[location.command_index]
                    .pre_barriers
                    .push(barrier);
            }
        }
    }
    Ok(())
}
