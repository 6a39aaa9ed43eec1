//! Command lists.
//!
//! A command list is a contiguous, self-describing byte buffer: a header,
//! then a sequence of tagged fixed-size command records, then an end tag.
//! Variable-length payloads (resource arrays, inline constants, debug names)
//! are referenced from the fixed records as `(offset, count)` pairs; the
//! offsets stay unresolved while recording and are fixed up by `finalize`,
//! which appends every payload after the records and patches the pointer
//! slots with absolute positions. A finalized list is immutable and can be
//! submitted any number of times.

use crate::error::{Error, Result};
use crate::handle::{GpuHandle, RawHandle, ResourceHandle, ResourceTableHandle, ShaderHandle};
use bytemuck::{Pod, Zeroable};
use std::mem::{offset_of, size_of};

pub type MemOffset = u64;
pub type MemSize = u64;

/// Tag opening every list.
pub const LIST_SENTINEL: u32 = 0x434d_444c; // "CMDL"

/// Command tags. A list ends with `SENTINEL_END`.
pub const SENTINEL_END: u32 = 0;
pub const SENTINEL_COMPUTE: u32 = 1;
pub const SENTINEL_COPY: u32 = 2;
pub const SENTINEL_UPLOAD: u32 = 3;
pub const SENTINEL_DOWNLOAD: u32 = 4;
pub const SENTINEL_BEGIN_MARKER: u32 = 5;
pub const SENTINEL_END_MARKER: u32 = 6;

/// Whole-resource copy size marker.
pub const WHOLE_SIZE: u64 = u64::MAX;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct AbiListHeader {
    pub sentinel: u32,
    pub _pad0: u32,
    /// Total list size in bytes, written by `finalize`.
    pub list_size: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct AbiComputeCmd {
    pub sentinel: u32,
    pub _pad0: u32,
    pub shader: RawHandle,
    pub constants: MemOffset,
    pub constant_count: u32,
    pub in_table_count: u32,
    pub in_tables: MemOffset,
    pub out_tables: MemOffset,
    pub sampler_tables: MemOffset,
    pub out_table_count: u32,
    pub sampler_table_count: u32,
    pub dispatch_x: u32,
    pub dispatch_y: u32,
    pub dispatch_z: u32,
    pub inline_constant_size: u32,
    pub inline_constants: MemOffset,
    pub name: MemOffset,
    pub name_size: u32,
    pub _pad1: u32,
    /// Raw handle of the indirect-args buffer; zero means a direct dispatch.
    pub indirect_buffer: RawHandle,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct AbiCopyCmd {
    pub sentinel: u32,
    pub _pad0: u32,
    pub source: RawHandle,
    pub destination: RawHandle,
    pub source_offset: u64,
    pub destination_offset: u64,
    /// Bytes to copy for buffers; `WHOLE_SIZE` copies the whole resource.
    pub byte_size: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct AbiUploadCmd {
    pub sentinel: u32,
    pub _pad0: u32,
    pub destination: RawHandle,
    pub sources: MemOffset,
    pub source_size: u32,
    pub mip_level: u32,
    pub dest_x: u32,
    pub dest_y: u32,
    pub dest_z: u32,
    /// Non-zero when the source bytes sit directly behind this record
    /// (reserved by `upload_inline`); the parser skips over them.
    pub inline_payload: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct AbiDownloadCmd {
    pub sentinel: u32,
    pub _pad0: u32,
    pub source: RawHandle,
    pub mip_level: u32,
    pub array_slice: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct AbiBeginMarkerCmd {
    pub sentinel: u32,
    pub name_size: u32,
    pub name: MemOffset,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct AbiEndMarkerCmd {
    pub sentinel: u32,
    pub _pad0: u32,
}

//--------------------------------------------------------------------------------------------------

struct PendingMemory {
    /// Buffer offset of the `MemOffset` slot to patch.
    patch_offset: MemOffset,
    data: Vec<u8>,
}

/// Append-only recording buffer for GPU commands.
pub struct CommandList {
    buffer: Vec<u8>,
    pending: Vec<PendingMemory>,
    closed: bool,
}

impl CommandList {
    pub fn new() -> CommandList {
        let mut list = CommandList {
            buffer: Vec::with_capacity(256),
            pending: Vec::new(),
            closed: false,
        };
        list.append_pod(&AbiListHeader {
            sentinel: LIST_SENTINEL,
            ..Default::default()
        });
        list
    }

    /// Wraps an already-encoded stream, e.g. one received across a foreign
    /// function boundary. The list is closed; the bytes are trusted.
    pub fn from_raw_bytes(bytes: Vec<u8>) -> CommandList {
        CommandList {
            buffer: bytes,
            pending: Vec::new(),
            closed: true,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Resolves every pending payload, patches the pointer slots, writes the
    /// total size into the header and closes the list.
    pub fn finalize(&mut self) {
        if self.closed {
            return;
        }

        // The end tag goes in before payloads so parsing stops at it.
        self.append_pod(&AbiEndMarkerCmd {
            sentinel: SENTINEL_END,
            ..Default::default()
        });

        let pending = std::mem::replace(&mut self.pending, Vec::new());
        for entry in pending {
            let tail = self.buffer.len() as MemOffset;
            self.write_pod_at(entry.patch_offset as usize, &tail);
            self.buffer.extend_from_slice(&entry.data);
        }

        let total = self.buffer.len() as u64;
        let size_slot = offset_of!(AbiListHeader, list_size);
        self.write_pod_at(size_slot, &total);
        self.closed = true;
    }

    pub fn add_compute(&mut self) -> Result<ComputeCommandBuilder<'_>> {
        let offset = self.begin_command(&AbiComputeCmd {
            sentinel: SENTINEL_COMPUTE,
            ..Default::default()
        })?;
        Ok(ComputeCommandBuilder { list: self, offset })
    }

    pub fn add_copy(&mut self) -> Result<CopyCommandBuilder<'_>> {
        let offset = self.begin_command(&AbiCopyCmd {
            sentinel: SENTINEL_COPY,
            byte_size: WHOLE_SIZE,
            ..Default::default()
        })?;
        Ok(CopyCommandBuilder { list: self, offset })
    }

    pub fn add_upload(&mut self) -> Result<UploadCommandBuilder<'_>> {
        let offset = self.begin_command(&AbiUploadCmd {
            sentinel: SENTINEL_UPLOAD,
            ..Default::default()
        })?;
        Ok(UploadCommandBuilder { list: self, offset })
    }

    pub fn add_download(&mut self) -> Result<DownloadCommandBuilder<'_>> {
        let offset = self.begin_command(&AbiDownloadCmd {
            sentinel: SENTINEL_DOWNLOAD,
            ..Default::default()
        })?;
        Ok(DownloadCommandBuilder { list: self, offset })
    }

    pub fn begin_marker(&mut self, name: &str) -> Result<()> {
        let offset = self.begin_command(&AbiBeginMarkerCmd {
            sentinel: SENTINEL_BEGIN_MARKER,
            ..Default::default()
        })?;
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        self.patch_field(
            offset,
            offset_of!(AbiBeginMarkerCmd, name_size),
            bytes.len() as u32,
        );
        self.defer(offset + offset_of!(AbiBeginMarkerCmd, name) as u64, bytes);
        Ok(())
    }

    pub fn end_marker(&mut self) -> Result<()> {
        self.begin_command(&AbiEndMarkerCmd {
            sentinel: SENTINEL_END_MARKER,
            ..Default::default()
        })?;
        Ok(())
    }

    /// Reserves `size` zeroed bytes inside the list for in-place upload data.
    /// The returned offset can be written through `data_mut` until the list
    /// is finalized.
    pub fn upload_inline(&mut self, destination: ResourceHandle, size: u32) -> Result<MemOffset> {
        let mut upload = self.add_upload()?;
        upload.set_destination(destination);
        let cmd_offset = upload.offset;
        let data_offset = self.buffer.len() as MemOffset;
        self.buffer
            .resize(self.buffer.len() + align8(size as usize), 0);
        self.patch_field(cmd_offset, offset_of!(AbiUploadCmd, sources), data_offset);
        self.patch_field(cmd_offset, offset_of!(AbiUploadCmd, source_size), size);
        self.patch_field(cmd_offset, offset_of!(AbiUploadCmd, inline_payload), 1u32);
        Ok(data_offset)
    }

    /// Mutable view over a region previously reserved with `upload_inline`.
    pub fn data_mut(&mut self, offset: MemOffset, size: usize) -> Result<&mut [u8]> {
        if self.closed {
            return Err(Error::InvalidParameter(
                "command list has been finalized".into(),
            ));
        }
        let begin = offset as usize;
        let end = begin + size;
        if end > self.buffer.len() {
            return Err(Error::InvalidParameter("inline region out of range".into()));
        }
        Ok(&mut self.buffer[begin..end])
    }

    //----------------------------------------------------------------------------------------------

    fn begin_command<T: Pod>(&mut self, cmd: &T) -> Result<MemOffset> {
        if self.closed {
            return Err(Error::InvalidParameter(
                "command list has been finalized, mutability is not permitted anymore".into(),
            ));
        }
        Ok(self.append_pod(cmd))
    }

    fn append_pod<T: Pod>(&mut self, value: &T) -> MemOffset {
        let offset = self.buffer.len() as MemOffset;
        self.buffer.extend_from_slice(bytemuck::bytes_of(value));
        offset
    }

    fn write_pod_at<T: Pod>(&mut self, offset: usize, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        self.buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn patch_field<T: Pod>(&mut self, cmd_offset: MemOffset, field_offset: usize, value: T) {
        self.write_pod_at(cmd_offset as usize + field_offset, &value);
    }

    fn defer(&mut self, patch_offset: MemOffset, data: Vec<u8>) {
        self.pending.push(PendingMemory { patch_offset, data });
    }
}

impl Default for CommandList {
    fn default() -> Self {
        CommandList::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Builders. Each one borrows the list and writes into the fixed record it
// allocated; array parameters go through the pending-fixup path.

pub struct ComputeCommandBuilder<'a> {
    list: &'a mut CommandList,
    offset: MemOffset,
}

impl<'a> ComputeCommandBuilder<'a> {
    pub fn set_shader(&mut self, shader: ShaderHandle) {
        self.list
            .patch_field(self.offset, offset_of!(AbiComputeCmd, shader), shader.as_raw());
    }

    pub fn set_constants(&mut self, constants: &[ResourceHandle]) {
        let data = raw_handle_bytes(constants);
        self.list.patch_field(
            self.offset,
            offset_of!(AbiComputeCmd, constant_count),
            constants.len() as u32,
        );
        self.list
            .defer(self.offset + offset_of!(AbiComputeCmd, constants) as u64, data);
    }

    pub fn set_in_tables(&mut self, tables: &[ResourceTableHandle]) {
        let data = raw_handle_bytes(tables);
        self.list.patch_field(
            self.offset,
            offset_of!(AbiComputeCmd, in_table_count),
            tables.len() as u32,
        );
        self.list
            .defer(self.offset + offset_of!(AbiComputeCmd, in_tables) as u64, data);
    }

    pub fn set_out_tables(&mut self, tables: &[ResourceTableHandle]) {
        let data = raw_handle_bytes(tables);
        self.list.patch_field(
            self.offset,
            offset_of!(AbiComputeCmd, out_table_count),
            tables.len() as u32,
        );
        self.list
            .defer(self.offset + offset_of!(AbiComputeCmd, out_tables) as u64, data);
    }

    pub fn set_sampler_tables(&mut self, tables: &[ResourceTableHandle]) {
        let data = raw_handle_bytes(tables);
        self.list.patch_field(
            self.offset,
            offset_of!(AbiComputeCmd, sampler_table_count),
            tables.len() as u32,
        );
        self.list.defer(
            self.offset + offset_of!(AbiComputeCmd, sampler_tables) as u64,
            data,
        );
    }

    /// Copies raw constant data into the list; the scheduler stages it into
    /// an upload range bound as the `b0` constant buffer.
    pub fn set_inline_constants(&mut self, bytes: &[u8]) {
        self.list.patch_field(
            self.offset,
            offset_of!(AbiComputeCmd, inline_constant_size),
            bytes.len() as u32,
        );
        self.list.defer(
            self.offset + offset_of!(AbiComputeCmd, inline_constants) as u64,
            bytes.to_vec(),
        );
    }

    pub fn set_dispatch(&mut self, name: &str, x: u32, y: u32, z: u32) {
        self.list
            .patch_field(self.offset, offset_of!(AbiComputeCmd, dispatch_x), x);
        self.list
            .patch_field(self.offset, offset_of!(AbiComputeCmd, dispatch_y), y);
        self.list
            .patch_field(self.offset, offset_of!(AbiComputeCmd, dispatch_z), z);
        if !name.is_empty() {
            let mut bytes = name.as_bytes().to_vec();
            bytes.push(0);
            self.list.patch_field(
                self.offset,
                offset_of!(AbiComputeCmd, name_size),
                bytes.len() as u32,
            );
            self.list
                .defer(self.offset + offset_of!(AbiComputeCmd, name) as u64, bytes);
        }
    }

    /// Sources the dispatch dimensions from a GPU buffer holding
    /// `[x, y, z]: u32` args.
    pub fn set_indirect_dispatch(&mut self, name: &str, args: ResourceHandle) {
        self.set_dispatch(name, 0, 0, 0);
        self.list.patch_field(
            self.offset,
            offset_of!(AbiComputeCmd, indirect_buffer),
            args.as_raw(),
        );
    }
}

pub struct CopyCommandBuilder<'a> {
    list: &'a mut CommandList,
    offset: MemOffset,
}

impl<'a> CopyCommandBuilder<'a> {
    pub fn set_resources(&mut self, source: ResourceHandle, destination: ResourceHandle) {
        self.list
            .patch_field(self.offset, offset_of!(AbiCopyCmd, source), source.as_raw());
        self.list.patch_field(
            self.offset,
            offset_of!(AbiCopyCmd, destination),
            destination.as_raw(),
        );
    }

    /// Byte-range copy between buffers. `WHOLE_SIZE` copies everything.
    pub fn set_byte_range(&mut self, source_offset: u64, destination_offset: u64, size: u64) {
        self.list
            .patch_field(self.offset, offset_of!(AbiCopyCmd, source_offset), source_offset);
        self.list.patch_field(
            self.offset,
            offset_of!(AbiCopyCmd, destination_offset),
            destination_offset,
        );
        self.list
            .patch_field(self.offset, offset_of!(AbiCopyCmd, byte_size), size);
    }
}

pub struct UploadCommandBuilder<'a> {
    list: &'a mut CommandList,
    offset: MemOffset,
}

impl<'a> UploadCommandBuilder<'a> {
    pub fn set_destination(&mut self, destination: ResourceHandle) {
        self.list.patch_field(
            self.offset,
            offset_of!(AbiUploadCmd, destination),
            destination.as_raw(),
        );
    }

    pub fn set_data(&mut self, data: &[u8]) {
        self.list.patch_field(
            self.offset,
            offset_of!(AbiUploadCmd, source_size),
            data.len() as u32,
        );
        self.list
            .defer(self.offset + offset_of!(AbiUploadCmd, sources) as u64, data.to_vec());
    }

    /// Texture destination placement: target mip and texel offset.
    pub fn set_placement(&mut self, mip_level: u32, x: u32, y: u32, z: u32) {
        self.list
            .patch_field(self.offset, offset_of!(AbiUploadCmd, mip_level), mip_level);
        self.list
            .patch_field(self.offset, offset_of!(AbiUploadCmd, dest_x), x);
        self.list
            .patch_field(self.offset, offset_of!(AbiUploadCmd, dest_y), y);
        self.list
            .patch_field(self.offset, offset_of!(AbiUploadCmd, dest_z), z);
    }
}

pub struct DownloadCommandBuilder<'a> {
    list: &'a mut CommandList,
    offset: MemOffset,
}

impl<'a> DownloadCommandBuilder<'a> {
    pub fn set_source(&mut self, source: ResourceHandle) {
        self.list
            .patch_field(self.offset, offset_of!(AbiDownloadCmd, source), source.as_raw());
    }

    pub fn set_subresource(&mut self, mip_level: u32, array_slice: u32) {
        self.list
            .patch_field(self.offset, offset_of!(AbiDownloadCmd, mip_level), mip_level);
        self.list
            .patch_field(self.offset, offset_of!(AbiDownloadCmd, array_slice), array_slice);
    }
}

fn align8(size: usize) -> usize {
    (size + 7) & !7
}

fn raw_handle_bytes<K: GpuHandle>(handles: &[K]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(handles.len() * size_of::<RawHandle>());
    for h in handles {
        bytes.extend_from_slice(&h.as_raw().to_le_bytes());
    }
    bytes
}

//--------------------------------------------------------------------------------------------------
// Parsing. The scheduler and backends walk finalized lists through this view.

/// One decoded command, borrowing payloads from the list buffer.
pub enum ParsedCommand<'a> {
    Compute(ComputeView<'a>),
    Copy(AbiCopyCmd),
    Upload(UploadView<'a>),
    Download(AbiDownloadCmd),
    BeginMarker(MarkerView<'a>),
    EndMarker,
}

pub struct ComputeView<'a> {
    pub cmd: AbiComputeCmd,
    data: &'a [u8],
}

impl<'a> ComputeView<'a> {
    pub fn shader(&self) -> ShaderHandle {
        ShaderHandle::from_raw(self.cmd.shader)
    }

    pub fn in_tables(&self) -> Vec<ResourceTableHandle> {
        read_handles(self.data, self.cmd.in_tables, self.cmd.in_table_count)
    }

    pub fn out_tables(&self) -> Vec<ResourceTableHandle> {
        read_handles(self.data, self.cmd.out_tables, self.cmd.out_table_count)
    }

    pub fn sampler_tables(&self) -> Vec<ResourceTableHandle> {
        read_handles(self.data, self.cmd.sampler_tables, self.cmd.sampler_table_count)
    }

    pub fn constants(&self) -> Vec<ResourceHandle> {
        read_handles(self.data, self.cmd.constants, self.cmd.constant_count)
    }

    pub fn inline_constants(&self) -> &'a [u8] {
        let begin = self.cmd.inline_constants as usize;
        &self.data[begin..begin + self.cmd.inline_constant_size as usize]
    }

    pub fn indirect_buffer(&self) -> Option<ResourceHandle> {
        let h = ResourceHandle::from_raw(self.cmd.indirect_buffer);
        if h.valid() {
            Some(h)
        } else {
            None
        }
    }

    pub fn name(&self) -> Option<&'a str> {
        read_name(self.data, self.cmd.name, self.cmd.name_size)
    }
}

pub struct UploadView<'a> {
    pub cmd: AbiUploadCmd,
    data: &'a [u8],
}

impl<'a> UploadView<'a> {
    pub fn destination(&self) -> ResourceHandle {
        ResourceHandle::from_raw(self.cmd.destination)
    }

    pub fn source_bytes(&self) -> &'a [u8] {
        let begin = self.cmd.sources as usize;
        &self.data[begin..begin + self.cmd.source_size as usize]
    }
}

pub struct MarkerView<'a> {
    pub cmd: AbiBeginMarkerCmd,
    data: &'a [u8],
}

impl<'a> MarkerView<'a> {
    pub fn name(&self) -> Option<&'a str> {
        read_name(self.data, self.cmd.name, self.cmd.name_size)
    }
}

fn read_handles<K: GpuHandle>(data: &[u8], offset: MemOffset, count: u32) -> Vec<K> {
    let mut out = Vec::with_capacity(count as usize);
    let mut cursor = offset as usize;
    for _ in 0..count {
        let raw: RawHandle = bytemuck::pod_read_unaligned(&data[cursor..cursor + 8]);
        out.push(K::from_raw(raw));
        cursor += 8;
    }
    out
}

fn read_name(data: &[u8], offset: MemOffset, size: u32) -> Option<&str> {
    if size == 0 {
        return None;
    }
    let begin = offset as usize;
    // strip the trailing NUL
    let bytes = &data[begin..begin + size as usize - 1];
    std::str::from_utf8(bytes).ok()
}

/// Cursor over the commands of a finalized list.
pub struct CommandWalker<'a> {
    data: &'a [u8],
    cursor: usize,
    finished: bool,
}

impl<'a> CommandWalker<'a> {
    /// Fails when the buffer does not open with the list sentinel.
    pub fn new(data: &'a [u8]) -> Result<CommandWalker<'a>> {
        if data.len() < size_of::<AbiListHeader>() {
            return Err(Error::InvalidParameter("command list too small".into()));
        }
        let header: AbiListHeader = bytemuck::pod_read_unaligned(&data[..size_of::<AbiListHeader>()]);
        if header.sentinel != LIST_SENTINEL {
            return Err(Error::InvalidParameter(
                "buffer does not start with a command list header".into(),
            ));
        }
        Ok(CommandWalker {
            data,
            cursor: size_of::<AbiListHeader>(),
            finished: false,
        })
    }

    /// Current command tag without advancing.
    pub fn peek_sentinel(&self) -> u32 {
        bytemuck::pod_read_unaligned(&self.data[self.cursor..self.cursor + 4])
    }

    pub fn offset(&self) -> MemOffset {
        self.cursor as MemOffset
    }

    /// Decodes the command under the cursor and advances past it. `None`
    /// once the end tag is reached; unknown tags surface as `Err`.
    pub fn next(&mut self) -> Result<Option<ParsedCommand<'a>>> {
        if self.finished {
            return Ok(None);
        }
        let sentinel = self.peek_sentinel();
        let parsed = match sentinel {
            SENTINEL_END => {
                self.finished = true;
                return Ok(None);
            }
            SENTINEL_COMPUTE => {
                let cmd = self.read::<AbiComputeCmd>();
                ParsedCommand::Compute(ComputeView {
                    cmd,
                    data: self.data,
                })
            }
            SENTINEL_COPY => ParsedCommand::Copy(self.read::<AbiCopyCmd>()),
            SENTINEL_UPLOAD => {
                let cmd = self.read::<AbiUploadCmd>();
                if cmd.inline_payload != 0 {
                    // the source bytes follow the record in-stream
                    self.cursor += align8(cmd.source_size as usize);
                }
                ParsedCommand::Upload(UploadView {
                    cmd,
                    data: self.data,
                })
            }
            SENTINEL_DOWNLOAD => ParsedCommand::Download(self.read::<AbiDownloadCmd>()),
            SENTINEL_BEGIN_MARKER => {
                let cmd = self.read::<AbiBeginMarkerCmd>();
                ParsedCommand::BeginMarker(MarkerView {
                    cmd,
                    data: self.data,
                })
            }
            SENTINEL_END_MARKER => {
                self.read::<AbiEndMarkerCmd>();
                ParsedCommand::EndMarker
            }
            other => {
                return Err(Error::InvalidParameter(format!(
                    "unrecognized command sentinel parsed: {}",
                    other
                )));
            }
        };
        Ok(Some(parsed))
    }

    fn read<T: Pod>(&mut self) -> T {
        let value = bytemuck::pod_read_unaligned(&self.data[self.cursor..self.cursor + size_of::<T>()]);
        self.cursor += size_of::<T>();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleContainer;

    fn handles() -> (
        ResourceHandle,
        ResourceHandle,
        ResourceTableHandle,
        ShaderHandle,
    ) {
        let mut r: HandleContainer<ResourceHandle, ()> = HandleContainer::new();
        let mut t: HandleContainer<ResourceTableHandle, ()> = HandleContainer::new();
        let mut s: HandleContainer<ShaderHandle, ()> = HandleContainer::new();
        (r.insert(()), r.insert(()), t.insert(()), s.insert(()))
    }

    #[test]
    fn record_finalize_parse_round_trip() {
        let (buf_a, buf_b, table, shader) = handles();

        let mut list = CommandList::new();
        {
            let mut up = list.add_upload().unwrap();
            up.set_destination(buf_a);
            up.set_data(b"hello world");
        }
        {
            let mut cmd = list.add_compute().unwrap();
            cmd.set_shader(shader);
            cmd.set_constants(&[buf_b]);
            cmd.set_in_tables(&[table]);
            cmd.set_out_tables(&[table]);
            cmd.set_inline_constants(&[1, 2, 3, 4]);
            cmd.set_dispatch("test_dispatch", 8, 8, 1);
        }
        list.begin_marker("frame").unwrap();
        {
            let mut cp = list.add_copy().unwrap();
            cp.set_resources(buf_a, buf_b);
        }
        list.end_marker().unwrap();
        {
            let mut dl = list.add_download().unwrap();
            dl.set_source(buf_b);
            dl.set_subresource(2, 1);
        }
        list.finalize();
        assert!(list.is_closed());

        let mut walker = CommandWalker::new(list.data()).unwrap();
        let mut tags = Vec::new();
        loop {
            let cmd = walker.next().unwrap();
            let cmd = match cmd {
                Some(c) => c,
                None => break,
            };
            match cmd {
                ParsedCommand::Upload(up) => {
                    tags.push(SENTINEL_UPLOAD);
                    assert_eq!(up.destination(), buf_a);
                    assert_eq!(up.source_bytes(), b"hello world");
                }
                ParsedCommand::Compute(c) => {
                    tags.push(SENTINEL_COMPUTE);
                    assert_eq!(c.shader(), shader);
                    assert_eq!(c.constants(), vec![buf_b]);
                    assert_eq!(c.in_tables(), vec![table]);
                    assert_eq!(c.out_tables(), vec![table]);
                    assert_eq!(c.inline_constants(), &[1, 2, 3, 4]);
                    assert_eq!(c.name(), Some("test_dispatch"));
                    assert_eq!((c.cmd.dispatch_x, c.cmd.dispatch_y, c.cmd.dispatch_z), (8, 8, 1));
                    assert!(c.indirect_buffer().is_none());
                }
                ParsedCommand::Copy(c) => {
                    tags.push(SENTINEL_COPY);
                    assert_eq!(ResourceHandle::from_raw(c.source), buf_a);
                    assert_eq!(ResourceHandle::from_raw(c.destination), buf_b);
                    assert_eq!(c.byte_size, WHOLE_SIZE);
                }
                ParsedCommand::Download(d) => {
                    tags.push(SENTINEL_DOWNLOAD);
                    assert_eq!(ResourceHandle::from_raw(d.source), buf_b);
                    assert_eq!((d.mip_level, d.array_slice), (2, 1));
                }
                ParsedCommand::BeginMarker(m) => {
                    tags.push(SENTINEL_BEGIN_MARKER);
                    assert_eq!(m.name(), Some("frame"));
                }
                ParsedCommand::EndMarker => tags.push(SENTINEL_END_MARKER),
            }
        }
        assert_eq!(
            tags,
            vec![
                SENTINEL_UPLOAD,
                SENTINEL_COMPUTE,
                SENTINEL_BEGIN_MARKER,
                SENTINEL_COPY,
                SENTINEL_END_MARKER,
                SENTINEL_DOWNLOAD,
            ]
        );
    }

    #[test]
    fn closed_list_rejects_mutation() {
        let mut list = CommandList::new();
        list.finalize();
        assert!(list.add_compute().is_err());
        assert!(list.begin_marker("m").is_err());
        let size = list.size();
        list.finalize(); // idempotent
        assert_eq!(list.size(), size);
    }

    #[test]
    fn inline_upload_region_is_writable_and_skipped_by_parse() {
        let (buf_a, buf_b, ..) = handles();
        let mut list = CommandList::new();
        let region = list.upload_inline(buf_a, 11).unwrap();
        list.data_mut(region, 11)
            .unwrap()
            .copy_from_slice(&[9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 9]);
        // a trailing command must still parse cleanly past the raw payload
        {
            let mut dl = list.add_download().unwrap();
            dl.set_source(buf_b);
        }
        list.finalize();

        let mut walker = CommandWalker::new(list.data()).unwrap();
        match walker.next().unwrap() {
            Some(ParsedCommand::Upload(up)) => {
                assert_eq!(up.source_bytes(), &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 9]);
            }
            _ => panic!("expected upload command"),
        }
        match walker.next().unwrap() {
            Some(ParsedCommand::Download(dl)) => {
                assert_eq!(ResourceHandle::from_raw(dl.source), buf_b);
            }
            _ => panic!("expected download command"),
        }
        assert!(walker.next().unwrap().is_none());
    }

    #[test]
    fn header_records_total_size() {
        let mut list = CommandList::new();
        list.begin_marker("a").unwrap();
        list.end_marker().unwrap();
        list.finalize();
        let header: AbiListHeader =
            bytemuck::pod_read_unaligned(&list.data()[..size_of::<AbiListHeader>()]);
        assert_eq!(header.list_size as usize, list.size());
        assert_eq!(header.sentinel, LIST_SENTINEL);
    }

    #[test]
    fn corrupted_sentinel_is_detected() {
        let mut list = CommandList::new();
        list.end_marker().unwrap();
        list.finalize();
        let mut bytes = list.data().to_vec();
        // stomp the first command tag
        let at = size_of::<AbiListHeader>();
        bytes[at..at + 4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        let mut walker = CommandWalker::new(&bytes).unwrap();
        assert!(walker.next().is_err());
    }
}
