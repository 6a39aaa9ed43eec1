//! Shader database tests: real shaderc compilation, error reporting,
//! dependency-driven recompilation and dispatch scheduling.

mod common;

use common::software_device_with;
use ember::schedule::ScheduleFlags;
use ember::watcher::FileWatchListener;
use ember::{
    BufferDesc, BufferType, CommandList, DeviceConfig, MemFlags, ResourceTableDesc,
    ShaderDb, ShaderDbDesc, ShaderDesc, ShaderInlineDesc, WaitResult,
};
use fxhash::FxHashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const WRITE_NUMBERS: &str = r#"
RWBuffer<uint> output : register(u0);

[numthreads(64, 1, 1)]
void csMain(uint3 dti : SV_DispatchThreadID)
{
    output[dti.x] = dti.x;
}
"#;

const BROKEN: &str = r#"
RWBuffer<uint> output : register(u0);

[numthreads(64, 1, 1)]
void csMain(uint3 dti : SV_DispatchThreadID)
{
    output[dti.x] = undefined_symbol;
}
"#;

fn inline_desc(name: &str, source: &str) -> ShaderInlineDesc {
    ShaderInlineDesc {
        name: name.to_string(),
        entry_point: "csMain".to_string(),
        source: source.to_string(),
        defines: Vec::new(),
    }
}

/// Device config with the barrier-validation layer on, so dispatches that go
/// through `schedule()` have their planned transitions checked by the
/// backend.
fn debug_config(db: &std::sync::Arc<ShaderDb>) -> DeviceConfig {
    let mut config = DeviceConfig {
        shader_db: Some(db.clone()),
        ..Default::default()
    };
    config.settings.enable_debug_device = true;
    config
}

#[test]
fn inline_compile_resolves_valid() {
    let db = ShaderDb::new(ShaderDbDesc::default());
    let (_device, _) = software_device_with(DeviceConfig {
        shader_db: Some(db.clone()),
        ..Default::default()
    });

    let shader = db.request_compile_inline(inline_desc("write_numbers", WRITE_NUMBERS));
    db.resolve(shader).unwrap();
    assert!(db.is_valid(shader));
    assert!(db.payload(shader).is_some());

    let reflection = db.reflection(shader).unwrap();
    assert_eq!(reflection.workgroup_size, (64, 1, 1));
    // the `u` register class sits in its own binding range
    assert!(reflection.bindings.iter().any(|b| b.binding == 96));
}

#[test]
fn compile_error_reaches_callback_and_invalidates() {
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let db = ShaderDb::new(ShaderDbDesc {
        on_error: Some(Arc::new(move |_handle, name, message| {
            sink.lock()
                .unwrap()
                .push(format!("{}: {}", name, message));
        })),
        ..Default::default()
    });

    let shader = db.request_compile_inline(inline_desc("broken", BROKEN));
    db.resolve(shader).unwrap();
    assert!(!db.is_valid(shader));
    assert!(db.payload(shader).is_none());

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("broken:"));
    assert!(errors[0].contains("undefined_symbol"));
}

#[test]
fn missing_source_file_reports_io_error() {
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = hits.clone();
    let db = ShaderDb::new(ShaderDbDesc {
        on_error: Some(Arc::new(move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    });

    let shader = db.request_compile(ShaderDesc {
        name: "ghost".into(),
        entry_point: "csMain".into(),
        path: PathBuf::from("does_not_exist.hlsl"),
        defines: Vec::new(),
    });
    db.resolve(shader).unwrap();
    assert!(!db.is_valid(shader));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn file_change_recompiles_dependents() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("threads.hlsl"),
        "#define THREADS 64\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.hlsl"),
        r#"
#include "threads.hlsl"
RWBuffer<uint> output : register(u0);

[numthreads(THREADS, 1, 1)]
void csMain(uint3 dti : SV_DispatchThreadID)
{
    output[dti.x] = dti.x;
}
"#,
    )
    .unwrap();

    let db = ShaderDb::new(ShaderDbDesc::default());
    let (_device, _) = software_device_with(DeviceConfig {
        shader_db: Some(db.clone()),
        ..Default::default()
    });
    db.add_path(dir.path());

    let shader = db.request_compile(ShaderDesc {
        name: "threaded".into(),
        entry_point: "csMain".into(),
        path: PathBuf::from("main.hlsl"),
        defines: Vec::new(),
    });
    db.resolve(shader).unwrap();
    assert!(db.is_valid(shader));
    assert_eq!(db.reflection(shader).unwrap().workgroup_size.0, 64);
    let first_payload = db.payload(shader).unwrap();

    // edit the include and report the change, as the watcher would
    std::fs::write(
        dir.path().join("threads.hlsl"),
        "#define THREADS 32\n",
    )
    .unwrap();
    let mut changed = FxHashSet::default();
    changed.insert(dir.path().join("threads.hlsl"));
    db.on_files_changed(&changed);

    db.resolve(shader).unwrap();
    assert!(db.is_valid(shader));
    assert_eq!(
        db.reflection(shader).unwrap().workgroup_size.0,
        32,
        "recompile must pick up the edited include"
    );
    assert_ne!(
        db.payload(shader).unwrap(),
        first_payload,
        "the backend payload is replaced on recompile"
    );
}

#[test]
fn dispatch_schedules_with_compiled_shader() {
    let db = ShaderDb::new(ShaderDbDesc::default());
    let (device, _) = software_device_with(debug_config(&db));

    let buffer = device
        .create_buffer(BufferDesc {
            name: "numbers".into(),
            buffer_type: BufferType::Raw,
            element_count: 128,
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            ..Default::default()
        })
        .unwrap();
    let out_table = device
        .create_out_table(ResourceTableDesc {
            name: "out".into(),
            resources: vec![buffer],
            ..Default::default()
        })
        .unwrap();

    let shader = db.request_compile_inline(inline_desc("write_numbers", WRITE_NUMBERS));

    let mut list = CommandList::new();
    {
        let mut cmd = list.add_compute().unwrap();
        cmd.set_shader(shader);
        cmd.set_out_tables(&[out_table]);
        cmd.set_inline_constants(&[0u8; 16]);
        cmd.set_dispatch("write_numbers", 2, 1, 1);
    }
    list.finalize();

    // schedule resolves the in-flight compile before submitting
    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    assert_eq!(device.wait_on_cpu(status.work_handle, -1), WaitResult::Ok);
    device.release_work(status.work_handle);
}

#[test]
fn dispatch_with_broken_shader_fails_schedule() {
    let db = ShaderDb::new(ShaderDbDesc::default());
    let (device, _) = software_device_with(DeviceConfig {
        shader_db: Some(db.clone()),
        ..Default::default()
    });

    let buffer = device
        .create_buffer(BufferDesc {
            name: "sink".into(),
            buffer_type: BufferType::Raw,
            element_count: 8,
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            ..Default::default()
        })
        .unwrap();
    let out_table = device
        .create_out_table(ResourceTableDesc {
            name: "out".into(),
            resources: vec![buffer],
            ..Default::default()
        })
        .unwrap();

    let shader = db.request_compile_inline(inline_desc("broken", BROKEN));

    let mut list = CommandList::new();
    {
        let mut cmd = list.add_compute().unwrap();
        cmd.set_shader(shader);
        cmd.set_out_tables(&[out_table]);
        cmd.set_dispatch("broken", 1, 1, 1);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::empty());
    assert!(!status.success());
    assert_eq!(device.live_work_count(), 0);
}

#[test]
fn disassembly_dump_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let dump_dir = dir.path().join("pdb");
    let db = ShaderDb::new(ShaderDbDesc {
        dump_spirv_assembly: true,
        dump_dir: dump_dir.clone(),
        ..Default::default()
    });

    let shader = db.request_compile_inline(inline_desc("dumped", WRITE_NUMBERS));
    db.resolve(shader).unwrap();
    assert!(db.is_valid(shader));
    assert!(dump_dir.join("dumped.spvasm").exists());
}

#[test]
fn indirect_dispatch_transitions_args_buffer() {
    // validation requires the args buffer to reach IndirectArgs state, so
    // a missing transition fails the schedule instead of passing silently
    let db = ShaderDb::new(ShaderDbDesc::default());
    let (device, _) = software_device_with(debug_config(&db));

    let out = device
        .create_buffer(BufferDesc {
            name: "out".into(),
            buffer_type: BufferType::Raw,
            element_count: 64,
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            ..Default::default()
        })
        .unwrap();
    let args = device
        .create_buffer(BufferDesc {
            name: "args".into(),
            buffer_type: BufferType::Raw,
            element_count: 3,
            mem_flags: MemFlags::GPU_READ,
            ..Default::default()
        })
        .unwrap();
    let out_table = device
        .create_out_table(ResourceTableDesc {
            name: "out".into(),
            resources: vec![out],
            ..Default::default()
        })
        .unwrap();
    let sampler = device.create_sampler(ember::SamplerDesc::default()).unwrap();
    let samplers = device
        .create_sampler_table(ResourceTableDesc {
            name: "samplers".into(),
            resources: vec![sampler],
            ..Default::default()
        })
        .unwrap();

    let shader = db.request_compile_inline(inline_desc("write_numbers", WRITE_NUMBERS));

    let mut list = CommandList::new();
    {
        let mut up = list.add_upload().unwrap();
        up.set_destination(args);
        let mut bytes = Vec::new();
        for v in [2u32, 1, 1] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        up.set_data(&bytes);
    }
    {
        let mut cmd = list.add_compute().unwrap();
        cmd.set_shader(shader);
        cmd.set_out_tables(&[out_table]);
        cmd.set_sampler_tables(&[samplers]);
        cmd.set_indirect_dispatch("indirect", args);
    }
    list.finalize();

    let status = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE);
    assert!(status.success(), "{}", status.message);
    assert_eq!(device.wait_on_cpu(status.work_handle, -1), WaitResult::Ok);
    device.release_work(status.work_handle);
}

#[test]
fn device_settings_configure_bound_database() {
    use ember::ShaderModel;

    let dir = tempfile::tempdir().unwrap();
    let dump_dir = dir.path().join("pdb");

    // the database itself asks for nothing; the settings document is the
    // source of truth once the device binds it
    let db = ShaderDb::new(ShaderDbDesc {
        dump_dir: dump_dir.clone(),
        ..Default::default()
    });
    assert_eq!(db.shader_model(), ShaderModel::Sm6_5);

    let mut config = DeviceConfig {
        shader_db: Some(db.clone()),
        ..Default::default()
    };
    config.settings.shader_model = ShaderModel::Sm6_1;
    config.settings.dump_shader_pdbs = true;
    let (_device, _) = software_device_with(config);

    assert_eq!(db.shader_model(), ShaderModel::Sm6_1);

    let shader = db.request_compile_inline(inline_desc("configured", WRITE_NUMBERS));
    db.resolve(shader).unwrap();
    assert!(db.is_valid(shader));
    assert!(
        dump_dir.join("configured.spvasm").exists(),
        "settings document must enable the disassembly dump"
    );
}
