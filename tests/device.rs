//! Device-level tests against the software backend.

mod common;

use common::{software_device, software_device_with};
use ember::resource::ResourceSpecialFlags;
use ember::schedule::ScheduleFlags;
use ember::{
    BufferDesc, BufferType, CommandList, DeviceConfig, Format, GpuHandle, MemFlags,
    ResourceTableDesc, ScheduleErrorType, TextureDesc, WaitResult,
};
use std::time::Duration;

fn storage_buffer(name: &str, bytes: usize) -> BufferDesc {
    BufferDesc {
        name: name.to_string(),
        buffer_type: BufferType::Raw,
        element_count: (bytes / 4) as u32,
        mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
        ..Default::default()
    }
}

#[test]
fn create_and_release_buffer() {
    let (device, _) = software_device();
    let buffer = device
        .create_buffer(BufferDesc {
            name: "simple".into(),
            format: Format::R32G32B32A32_SINT,
            element_count: 20,
            ..Default::default()
        })
        .unwrap();
    assert!(buffer.valid());
    assert!(device.contains_resource(buffer));
    device.release_resource(buffer).unwrap();
    assert!(!device.contains_resource(buffer));
    // double release is an error, not a crash
    assert!(device.release_resource(buffer).is_err());
}

#[test]
fn create_and_release_texture_and_tables() {
    let (device, _) = software_device();

    let tex = TextureDesc {
        name: "tex".into(),
        format: Format::R32G32B32A32_SINT,
        width: 128,
        height: 128,
        mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
        ..Default::default()
    };
    let buf = BufferDesc {
        name: "buf".into(),
        format: Format::R32G32B32A32_SINT,
        element_count: 20,
        mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
        ..Default::default()
    };

    let mut handles = Vec::new();
    for i in 0..16 {
        let h = if i % 2 == 1 {
            device.create_texture(tex.clone()).unwrap()
        } else {
            device.create_buffer(buf.clone()).unwrap()
        };
        assert!(h.valid());
        handles.push(h);
    }

    let in_table = device
        .create_in_table(ResourceTableDesc {
            name: "in".into(),
            resources: handles.clone(),
            ..Default::default()
        })
        .unwrap();
    let out_table = device
        .create_out_table(ResourceTableDesc {
            name: "out".into(),
            resources: handles.clone(),
            ..Default::default()
        })
        .unwrap();

    // members are pinned by the tables
    assert!(device.release_resource(handles[0]).is_err());

    device.release_table(in_table).unwrap();
    device.release_table(out_table).unwrap();
    for h in handles {
        device.release_resource(h).unwrap();
    }
}

#[test]
fn table_access_validation() {
    let (device, _) = software_device();
    let read_only = device
        .create_buffer(BufferDesc {
            name: "ro".into(),
            element_count: 4,
            mem_flags: MemFlags::GPU_READ,
            ..Default::default()
        })
        .unwrap();

    let err = device.create_out_table(ResourceTableDesc {
        name: "bad".into(),
        resources: vec![read_only],
        ..Default::default()
    });
    assert!(err.is_err());
}

#[test]
fn readback_flag_validation() {
    let (device, _) = software_device();
    let err = device.create_buffer(BufferDesc {
        name: "bad".into(),
        element_count: 4,
        mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
        special_flags: ResourceSpecialFlags::CPU_READBACK,
        ..Default::default()
    });
    assert!(err.is_err());

    let append_on_typed = device.create_buffer(BufferDesc {
        name: "bad2".into(),
        element_count: 4,
        is_append_consume: true,
        ..Default::default()
    });
    assert!(append_on_typed.is_err());
}

#[test]
fn empty_list_schedules_and_signals() {
    let (device, _) = software_device();
    let mut list = CommandList::new();
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    assert_eq!(device.wait_on_cpu(status.work_handle, -1), WaitResult::Ok);
    device.release_work(status.work_handle);
    assert_eq!(device.live_work_count(), 0);
}

#[test]
fn upload_download_round_trip() {
    let (device, _) = software_device();
    let buffer = device.create_buffer(storage_buffer("roundtrip", 256)).unwrap();

    let payload: Vec<u8> = (0..=255u8).collect();
    let mut list = CommandList::new();
    {
        let mut up = list.add_upload().unwrap();
        up.set_destination(buffer);
        up.set_data(&payload);
    }
    {
        let mut dl = list.add_download().unwrap();
        dl.set_source(buffer);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    assert_eq!(device.wait_on_cpu(status.work_handle, -1), WaitResult::Ok);

    let bytes = device
        .download_bytes(status.work_handle, buffer, 0, 0)
        .expect("download must be ready after an infinite wait");
    assert_eq!(&bytes[..payload.len()], &payload[..]);
    device.release_work(status.work_handle);
}

#[test]
fn copy_between_buffers() {
    let (device, backend) = software_device();
    let src = device.create_buffer(storage_buffer("src", 64)).unwrap();
    let dst = device.create_buffer(storage_buffer("dst", 64)).unwrap();

    let payload = [7u8; 64];
    let mut list = CommandList::new();
    {
        let mut up = list.add_upload().unwrap();
        up.set_destination(src);
        up.set_data(&payload);
    }
    {
        let mut cp = list.add_copy().unwrap();
        cp.set_resources(src, dst);
    }
    {
        let mut dl = list.add_download().unwrap();
        dl.set_source(dst);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    assert_eq!(device.wait_on_cpu(status.work_handle, -1), WaitResult::Ok);
    let bytes = device.download_bytes(status.work_handle, dst, 0, 0).unwrap();
    assert_eq!(&bytes[..64], &payload[..]);
    device.release_work(status.work_handle);
    drop(device);
    drop(backend);
}

#[test]
fn upload_inline_region_round_trip() {
    let (device, _) = software_device();
    let buffer = device.create_buffer(storage_buffer("inline", 16)).unwrap();

    let mut list = CommandList::new();
    let region = list.upload_inline(buffer, 16).unwrap();
    list.data_mut(region, 16)
        .unwrap()
        .copy_from_slice(&[3u8; 16]);
    {
        let mut dl = list.add_download().unwrap();
        dl.set_source(buffer);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    device.wait_on_cpu(status.work_handle, -1);
    let bytes = device.download_bytes(status.work_handle, buffer, 0, 0).unwrap();
    assert_eq!(&bytes[..16], &[3u8; 16]);
    device.release_work(status.work_handle);
}

#[test]
fn fence_values_increase_across_schedules() {
    let (device, _) = software_device();
    let buffer = device.create_buffer(storage_buffer("fences", 16)).unwrap();

    let mut previous = 0u64;
    for round in 0..4 {
        let mut list = CommandList::new();
        {
            let mut up = list.add_upload().unwrap();
            up.set_destination(buffer);
            up.set_data(&[round as u8; 16]);
        }
        list.finalize();

        let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
        assert!(status.success());
        let fence = device
            .work_fence_value(status.work_handle)
            .expect("bundle must exist");
        assert!(fence > previous, "fence values must be strictly increasing");
        previous = fence;
        device.wait_on_cpu(status.work_handle, -1);
        device.release_work(status.work_handle);
    }
}

#[test]
fn schedule_without_work_handle_releases_immediately() {
    let (device, _) = software_device();
    let buffer = device.create_buffer(storage_buffer("fire", 16)).unwrap();

    let mut list = CommandList::new();
    {
        let mut up = list.add_upload().unwrap();
        up.set_destination(buffer);
        up.set_data(&[1u8; 16]);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::empty());
    assert!(status.success());
    assert!(!status.work_handle.valid());
    assert_eq!(device.live_work_count(), 0);
}

#[test]
fn stale_resource_in_list_fails() {
    let (device, _) = software_device();
    let buffer = device.create_buffer(storage_buffer("gone", 16)).unwrap();

    let mut list = CommandList::new();
    {
        let mut up = list.add_upload().unwrap();
        up.set_destination(buffer);
        up.set_data(&[0u8; 16]);
    }
    list.finalize();

    device.release_resource(buffer).unwrap();
    let status = device.schedule(&[&list], ScheduleFlags::empty());
    assert!(!status.success());
    assert_eq!(status.error, ScheduleErrorType::InvalidHandle);
    assert_eq!(device.live_work_count(), 0);
}

#[test]
fn timeout_wait_reports_not_ready_then_ok() {
    let (device, backend) = software_device();
    let buffer = device.create_buffer(storage_buffer("slow", 64)).unwrap();

    backend.set_execution_delay(Some(Duration::from_millis(300)));
    let mut list = CommandList::new();
    {
        let mut up = list.add_upload().unwrap();
        up.set_destination(buffer);
        up.set_data(&[9u8; 64]);
    }
    {
        let mut dl = list.add_download().unwrap();
        dl.set_source(buffer);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);

    // poll: the artificial latency keeps the fence unsignaled
    assert_eq!(device.wait_on_cpu(status.work_handle, 0), WaitResult::NotReady);
    let dl = device.download_status(status.work_handle, buffer, 0, 0);
    assert_eq!(dl.result, WaitResult::NotReady);

    backend.set_execution_delay(None);
    assert_eq!(device.wait_on_cpu(status.work_handle, -1), WaitResult::Ok);
    let dl = device.download_status(status.work_handle, buffer, 0, 0);
    assert_eq!(dl.result, WaitResult::Ok);
    assert!(dl.ptr.is_some());
    device.release_work(status.work_handle);
}

#[test]
fn wait_on_released_work_is_invalid() {
    let (device, _) = software_device();
    let buffer = device.create_buffer(storage_buffer("probe", 16)).unwrap();
    let mut list = CommandList::new();
    list.finalize();
    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    device.wait_on_cpu(status.work_handle, -1);
    device.release_work(status.work_handle);
    assert_eq!(device.wait_on_cpu(status.work_handle, -1), WaitResult::Invalid);
    let dl = device.download_status(status.work_handle, buffer, 0, 0);
    assert_eq!(dl.result, WaitResult::Invalid);
}

#[test]
fn recreate_texture_repatches_tables() {
    let (device, _) = software_device();

    let tex = device
        .create_texture(TextureDesc {
            name: "live".into(),
            width: 64,
            height: 64,
            recreatable: true,
            mem_flags: MemFlags::GPU_READ,
            ..Default::default()
        })
        .unwrap();

    let table_a = device
        .create_in_table(ResourceTableDesc {
            name: "a".into(),
            resources: vec![tex],
            ..Default::default()
        })
        .unwrap();
    let table_b = device
        .create_in_table(ResourceTableDesc {
            name: "b".into(),
            resources: vec![tex],
            ..Default::default()
        })
        .unwrap();

    let native_a = device.registry().table_native(table_a).unwrap();
    let native_b = device.registry().table_native(table_b).unwrap();

    device
        .recreate_texture(
            tex,
            TextureDesc {
                name: "live".into(),
                width: 128,
                height: 32,
                recreatable: true,
                mem_flags: MemFlags::GPU_READ,
                ..Default::default()
            },
        )
        .unwrap();

    // both tables were rewritten without the client touching them
    assert_ne!(device.registry().table_native(table_a).unwrap(), native_a);
    assert_ne!(device.registry().table_native(table_b).unwrap(), native_b);

    // the handle still schedules: download the texture and check new dims
    let mut list = CommandList::new();
    {
        let mut dl = list.add_download().unwrap();
        dl.set_source(tex);
    }
    list.finalize();
    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    device.wait_on_cpu(status.work_handle, -1);
    let dl = device.download_status(status.work_handle, tex, 0, 0);
    assert_eq!(dl.result, WaitResult::Ok);
    assert_eq!((dl.width, dl.height), (128, 32));
    device.release_work(status.work_handle);
}

#[test]
fn append_consume_buffers_take_counter_slots() {
    let (device, _) = software_device();
    assert_eq!(device.counter_pool().live_count(), 0);

    let buffer = device
        .create_buffer(BufferDesc {
            name: "append".into(),
            buffer_type: BufferType::Structured,
            stride: 16,
            element_count: 1024,
            is_append_consume: true,
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(device.counter_pool().live_count(), 1);

    // the counter returns to the pool once the GC runs the release
    device.release_resource(buffer).unwrap();
    device.gc().flush();
    assert_eq!(device.counter_pool().live_count(), 0);
}

#[test]
fn gc_reclaims_released_objects() {
    let (device, backend) = software_device_with(DeviceConfig {
        gc_frequency_ms: 10,
        ..Default::default()
    });

    let before = backend.live_object_count();
    let buffer = device.create_buffer(storage_buffer("temp", 64)).unwrap();
    assert_eq!(backend.live_object_count(), before + 1);

    device.release_resource(buffer).unwrap();
    device.gc().flush();
    assert_eq!(backend.live_object_count(), before);
}

#[test]
fn texture_dimensions_clamp_to_limits() {
    let (device, _) = software_device();
    let tex = device
        .create_texture(TextureDesc {
            name: "huge".into(),
            width: 1 << 30,
            height: 4,
            ..Default::default()
        })
        .unwrap();
    let info = device.resource_memory_info(tex).unwrap();
    // 16384 * 4 texels at 16 bytes each
    assert!(info.byte_size < (1u64 << 30));
}

#[test]
fn lists_schedule_in_order_within_one_call() {
    let (device, _) = software_device();
    let buffer = device.create_buffer(storage_buffer("order", 32)).unwrap();

    let mut first = CommandList::new();
    {
        let mut up = first.add_upload().unwrap();
        up.set_destination(buffer);
        up.set_data(&[1u8; 32]);
    }
    first.finalize();

    let mut second = CommandList::new();
    {
        let mut up = second.add_upload().unwrap();
        up.set_destination(buffer);
        up.set_data(&[2u8; 32]);
    }
    {
        let mut dl = second.add_download().unwrap();
        dl.set_source(buffer);
    }
    second.finalize();

    let status = device.schedule(&[&first, &second], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    device.wait_on_cpu(status.work_handle, -1);
    let bytes = device.download_bytes(status.work_handle, buffer, 0, 0).unwrap();
    assert_eq!(&bytes[..32], &[2u8; 32], "the second list runs after the first");
    device.release_work(status.work_handle);
}

#[test]
fn byte_range_copy_between_buffers() {
    let (device, _) = software_device();
    let src = device.create_buffer(storage_buffer("range_src", 64)).unwrap();
    let dst = device.create_buffer(storage_buffer("range_dst", 64)).unwrap();

    let mut payload = vec![0u8; 64];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = i as u8;
    }

    let mut list = CommandList::new();
    {
        let mut up = list.add_upload().unwrap();
        up.set_destination(src);
        up.set_data(&payload);
    }
    {
        // move bytes 16..48 of src into dst at offset 8
        let mut cp = list.add_copy().unwrap();
        cp.set_resources(src, dst);
        cp.set_byte_range(16, 8, 32);
    }
    {
        let mut dl = list.add_download().unwrap();
        dl.set_source(dst);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    device.wait_on_cpu(status.work_handle, -1);
    let bytes = device.download_bytes(status.work_handle, dst, 0, 0).unwrap();
    assert_eq!(&bytes[..8], &[0u8; 8]);
    assert_eq!(&bytes[8..40], &payload[16..48]);
    assert_eq!(&bytes[40..64], &[0u8; 24]);
    device.release_work(status.work_handle);
}

#[test]
fn sampler_tables_accept_only_samplers() {
    let (device, _) = software_device();
    let sampler = device.create_sampler(ember::SamplerDesc::default()).unwrap();
    let buffer = device.create_buffer(storage_buffer("not_a_sampler", 16)).unwrap();

    let table = device
        .create_sampler_table(ResourceTableDesc {
            name: "samplers".into(),
            resources: vec![sampler],
            ..Default::default()
        })
        .unwrap();

    // mixing in a buffer is rejected
    assert!(device
        .create_sampler_table(ResourceTableDesc {
            name: "mixed".into(),
            resources: vec![sampler, buffer],
            ..Default::default()
        })
        .is_err());
    // and samplers cannot land in an input table
    assert!(device
        .create_in_table(ResourceTableDesc {
            name: "wrong".into(),
            resources: vec![sampler],
            ..Default::default()
        })
        .is_err());

    device.release_table(table).unwrap();
    device.release_resource(sampler).unwrap();
    device.release_resource(buffer).unwrap();
}
