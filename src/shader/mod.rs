//! The shader database.
//!
//! Compilation is asynchronous and pipelined: `request_compile` returns a
//! handle immediately and schedules an IO job (read the main source) chained
//! into a compile job on the task pool. The finished blob and reflection
//! data are installed atomically on the shader slot; `resolve` joins the
//! in-flight compile and builds the backend pipeline payload. File
//! dependencies recorded during compilation feed the live-edit path: when
//! the watcher reports changes, every shader depending on a changed file is
//! recompiled, and the old payload is handed to the garbage collector.

pub mod compiler;
pub mod reflection;

use crate::backend::{GpuBackend, NativeId, NativeObject};
use crate::error::{Error, Result};
use crate::gc::{Garbage, GarbageCollector};
use crate::handle::{HandleContainer, ShaderHandle};
use crate::settings::{DeviceSettings, ShaderModel};
use crate::tasks::{Task, TaskSystem};
use crate::watcher::{FileWatchListener, FileWatcher};
use compiler::{CompileRequest, ShaderType};
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, warn};
use reflection::ReflectionData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

pub type ShaderErrorCallback = Arc<dyn Fn(ShaderHandle, &str, &str) + Send + Sync>;

/// Database configuration.
///
/// `shader_model` and `dump_spirv_assembly` are standalone defaults:
/// binding the database to a device takes the shader model from the
/// device's settings document, and turns dumping on when the settings
/// request it.
#[derive(Clone)]
pub struct ShaderDbDesc {
    pub compile_threads: usize,
    pub dump_spirv_assembly: bool,
    pub dump_dir: PathBuf,
    pub shader_model: ShaderModel,
    pub resolve_on_destruction: bool,
    pub on_error: Option<ShaderErrorCallback>,
}

impl Default for ShaderDbDesc {
    fn default() -> Self {
        ShaderDbDesc {
            compile_threads: 4,
            dump_spirv_assembly: false,
            dump_dir: PathBuf::from(".shader_pdb"),
            shader_model: ShaderModel::Sm6_5,
            resolve_on_destruction: true,
            on_error: None,
        }
    }
}

/// Compile request for a shader stored on disk.
#[derive(Clone, Debug)]
pub struct ShaderDesc {
    pub name: String,
    pub entry_point: String,
    pub path: PathBuf,
    pub defines: Vec<(String, Option<String>)>,
}

/// Compile request for inline source.
#[derive(Clone, Debug)]
pub struct ShaderInlineDesc {
    pub name: String,
    pub entry_point: String,
    pub source: String,
    pub defines: Vec<(String, Option<String>)>,
}

#[derive(Clone)]
enum RecipeSource {
    File(PathBuf),
    Inline(String),
}

/// Everything needed to compile the shader again.
#[derive(Clone)]
struct ShaderRecipe {
    shader_type: ShaderType,
    name: String,
    entry_point: String,
    source: RecipeSource,
    defines: Vec<(String, Option<String>)>,
}

impl Default for ShaderRecipe {
    fn default() -> Self {
        ShaderRecipe {
            shader_type: ShaderType::Compute,
            name: String::new(),
            entry_point: String::new(),
            source: RecipeSource::Inline(String::new()),
            defines: Vec::new(),
        }
    }
}

struct CompileState {
    task: Task<bool>,
}

#[derive(Default)]
struct ShaderState {
    debug_name: String,
    recipe: ShaderRecipe,
    /// A compile has finished (possibly with errors).
    ready: bool,
    /// The last finished compile succeeded.
    success: bool,
    /// A compile is in flight or awaiting `resolve`.
    compiling: bool,
    compile: Option<CompileState>,
    spirv: Option<Arc<Vec<u32>>>,
    reflection: Option<Arc<ReflectionData>>,
    payload: Option<NativeId>,
}

#[derive(Default)]
struct DependencyMaps {
    file_to_shaders: FxHashMap<PathBuf, FxHashSet<ShaderHandle>>,
    shaders_to_files: FxHashMap<ShaderHandle, FxHashSet<PathBuf>>,
}

#[derive(Clone)]
struct DeviceLink {
    backend: Arc<dyn GpuBackend>,
    gc: Arc<GarbageCollector>,
}

type ShaderSlots = Arc<RwLock<HandleContainer<ShaderHandle, ShaderState>>>;

pub struct ShaderDb {
    desc: ShaderDbDesc,
    shader_model: Mutex<ShaderModel>,
    tasks: TaskSystem,
    shaders: ShaderSlots,
    deps: Arc<Mutex<DependencyMaps>>,
    search_roots: Arc<Mutex<Vec<PathBuf>>>,
    device: Mutex<Option<DeviceLink>>,
    watcher: Mutex<Option<(Arc<FileWatcher>, Weak<dyn FileWatchListener>)>>,
    dump_assembly: AtomicBool,
    dump_dir_ready: AtomicBool,
    destroying: AtomicBool,
}

impl ShaderDb {
    pub fn new(desc: ShaderDbDesc) -> Arc<ShaderDb> {
        Arc::new(ShaderDb {
            shader_model: Mutex::new(desc.shader_model),
            tasks: TaskSystem::new(desc.compile_threads),
            shaders: Arc::new(RwLock::new(HandleContainer::new())),
            deps: Arc::new(Mutex::new(DependencyMaps::default())),
            search_roots: Arc::new(Mutex::new(Vec::new())),
            device: Mutex::new(None),
            watcher: Mutex::new(None),
            dump_assembly: AtomicBool::new(desc.dump_spirv_assembly),
            dump_dir_ready: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            desc,
        })
    }

    /// Binds the database to a device, applying the device's settings
    /// document: the requested shader model (clamped to the adapter's
    /// highest supported one) and the debug-artifact dump toggle.
    pub fn set_parent_device(
        &self,
        backend: Arc<dyn GpuBackend>,
        gc: Arc<GarbageCollector>,
        settings: &DeviceSettings,
    ) {
        let highest = backend.adapter().highest_shader_model;
        {
            let mut model = self.shader_model.lock().unwrap();
            *model = settings.shader_model;
            if *model > highest {
                warn!(
                    "requested shader model {} but the adapter supports up to {}; clamping",
                    model.as_str(),
                    highest.as_str()
                );
                *model = highest;
            }
        }
        if settings.dump_shader_pdbs {
            self.dump_assembly.store(true, Ordering::SeqCst);
        }
        *self.device.lock().unwrap() = Some(DeviceLink { backend, gc });
    }

    /// The shader model compilation currently targets.
    pub fn shader_model(&self) -> ShaderModel {
        *self.shader_model.lock().unwrap()
    }

    /// Adds an include/source search root.
    pub fn add_path(&self, path: &Path) {
        self.search_roots.lock().unwrap().push(path.to_path_buf());
        if let Some((watcher, _)) = self.watcher.lock().unwrap().as_ref() {
            watcher.add_directory(path);
        }
    }

    /// Registers the database on a file watcher for live editing.
    pub fn enable_live_edit(db: &Arc<ShaderDb>, watcher: Arc<FileWatcher>) {
        for root in db.search_roots.lock().unwrap().iter() {
            watcher.add_directory(root);
        }
        let weak: Weak<dyn FileWatchListener> = Arc::downgrade(db);
        watcher.add_listener(weak.clone());
        *db.watcher.lock().unwrap() = Some((watcher, weak));
    }

    pub fn request_compile(&self, desc: ShaderDesc) -> ShaderHandle {
        let recipe = ShaderRecipe {
            shader_type: ShaderType::Compute,
            name: desc.name,
            entry_point: desc.entry_point,
            source: RecipeSource::File(desc.path),
            defines: desc.defines,
        };
        let handle = self.create_shader_state(recipe.clone());
        self.schedule_compile(handle, recipe);
        handle
    }

    pub fn request_compile_inline(&self, desc: ShaderInlineDesc) -> ShaderHandle {
        let recipe = ShaderRecipe {
            shader_type: ShaderType::Compute,
            name: desc.name,
            entry_point: desc.entry_point,
            source: RecipeSource::Inline(desc.source),
            defines: desc.defines,
        };
        let handle = self.create_shader_state(recipe.clone());
        self.schedule_compile(handle, recipe);
        handle
    }

    /// Schedules a recompile reusing the stored recipe. No-op while a
    /// previous compile is still unresolved.
    pub fn request_recompile(&self, handle: ShaderHandle) {
        let recipe = {
            let shaders = self.shaders.read().unwrap();
            let state = match shaders.get(handle) {
                Some(s) => s,
                None => return,
            };
            if state.compiling || state.compile.is_some() {
                return;
            }
            state.recipe.clone()
        };

        {
            let mut shaders = self.shaders.write().unwrap();
            if let Some(state) = shaders.get_mut(handle) {
                state.compiling = true;
            } else {
                return;
            }
        }
        debug!("recompiling shader {:?}", handle);
        self.schedule_compile(handle, recipe);
    }

    /// Blocks until the in-flight compile finishes and installs the backend
    /// pipeline payload. Loops because a recompile may land while resolving.
    pub fn resolve(&self, handle: ShaderHandle) -> Result<()> {
        loop {
            {
                let shaders = self.shaders.read().unwrap();
                let state = shaders.get(handle).ok_or(Error::InvalidHandle)?;
                if !state.compiling {
                    return Ok(());
                }
            }

            let compile = {
                let mut shaders = self.shaders.write().unwrap();
                let state = shaders.get_mut(handle).ok_or(Error::InvalidHandle)?;
                state.compile.take()
            };

            let compile = match compile {
                Some(c) => c,
                None => {
                    // another thread holds the compile state; let it finish
                    std::thread::yield_now();
                    continue;
                }
            };

            let success = compile.task.wait();
            let link = self.device.lock().unwrap().clone();
            let destroying = self.destroying.load(Ordering::SeqCst);

            let mut shaders = self.shaders.write().unwrap();
            let state = shaders.get_mut(handle).ok_or(Error::InvalidHandle)?;
            if success && !destroying {
                if let (Some(link), Some(spirv)) = (&link, state.spirv.clone()) {
                    match link.backend.create_compute_pipeline(&spirv, &state.debug_name) {
                        Ok(id) => {
                            if let Some(old) = state.payload.replace(id) {
                                link.gc
                                    .defer_release(Garbage::object(NativeObject::Pipeline(old)));
                            }
                        }
                        Err(e) => {
                            warn!("pipeline creation for '{}' failed: {}", state.debug_name, e);
                            state.success = false;
                            if let Some(cb) = &self.desc.on_error {
                                cb(handle, &state.debug_name, &e.to_string());
                            }
                        }
                    }
                }
            }
            state.compiling = false;
        }
    }

    /// A shader is valid once a compile finished successfully.
    pub fn is_valid(&self, handle: ShaderHandle) -> bool {
        let shaders = self.shaders.read().unwrap();
        shaders
            .get(handle)
            .map(|s| s.ready && s.success)
            .unwrap_or(false)
    }

    pub fn contains(&self, handle: ShaderHandle) -> bool {
        self.shaders.read().unwrap().contains(handle)
    }

    /// The backend pipeline payload, present after a successful `resolve`.
    pub fn payload(&self, handle: ShaderHandle) -> Option<NativeId> {
        self.shaders.read().unwrap().get(handle).and_then(|s| s.payload)
    }

    pub fn reflection(&self, handle: ShaderHandle) -> Option<Arc<ReflectionData>> {
        self.shaders
            .read()
            .unwrap()
            .get(handle)
            .and_then(|s| s.reflection.clone())
    }

    //----------------------------------------------------------------------------------------------

    fn create_shader_state(&self, recipe: ShaderRecipe) -> ShaderHandle {
        let mut shaders = self.shaders.write().unwrap();
        let (handle, state) = shaders.allocate();
        state.debug_name = recipe.name.clone();
        state.recipe = recipe;
        state.compiling = true;
        handle
    }

    fn ensure_dump_dir(&self) -> Option<PathBuf> {
        if !self.dump_assembly.load(Ordering::SeqCst) {
            return None;
        }
        if !self.dump_dir_ready.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::create_dir_all(&self.desc.dump_dir) {
                warn!("could not create dump dir {:?}: {}", self.desc.dump_dir, e);
                return None;
            }
            self.dump_dir_ready.store(true, Ordering::SeqCst);
        }
        Some(self.desc.dump_dir.clone())
    }

    fn schedule_compile(&self, handle: ShaderHandle, recipe: ShaderRecipe) {
        let roots = self.search_roots.lock().unwrap().clone();
        let shader_model = *self.shader_model.lock().unwrap();
        let dump_dir = self.ensure_dump_dir();
        let on_error = self.desc.on_error.clone();
        let shaders = self.shaders.clone();
        let deps = self.deps.clone();

        // IO step: read the main source, or pass the inline text through.
        let io_name = recipe.name.clone();
        let io_source = recipe.source.clone();
        let io_roots = roots.clone();
        let io_task: Task<std::result::Result<(String, String, Option<PathBuf>), String>> =
            self.tasks.spawn(move || match io_source {
                RecipeSource::Inline(text) => Ok((text, format!("{}.hlsl", io_name), None)),
                RecipeSource::File(path) => {
                    let resolved = resolve_source_path(&path, &io_roots)
                        .ok_or_else(|| format!("could not find shader source {:?}", path))?;
                    let text = std::fs::read_to_string(&resolved).map_err(|e| {
                        format!("failed reading {:?}: {}", resolved, e)
                    })?;
                    let canonical = resolved.canonicalize().unwrap_or(resolved.clone());
                    Ok((text, resolved.to_string_lossy().into_owned(), Some(canonical)))
                }
            });

        // Compile step: waits on IO, runs the compiler, installs the result.
        let name = recipe.name.clone();
        let entry_point = recipe.entry_point.clone();
        let shader_type = recipe.shader_type;
        let defines = recipe.defines.clone();
        let task = self.tasks.spawn(move || {
            let (source, source_name, main_file) = match io_task.wait() {
                Ok(triple) => triple,
                Err(message) => {
                    let mut slots = shaders.write().unwrap();
                    if let Some(state) = slots.get_mut(handle) {
                        state.ready = true;
                        state.success = false;
                    }
                    drop(slots);
                    if let Some(cb) = &on_error {
                        cb(handle, &name, &message);
                    }
                    return false;
                }
            };

            let request = CompileRequest {
                shader_type,
                name: name.clone(),
                entry_point,
                source,
                source_name,
                defines,
                include_roots: roots,
                shader_model,
                dump_dir,
            };

            match compiler::compile(&request) {
                Ok(output) => {
                    if let Some(warnings) = &output.warnings {
                        debug!("shader '{}' warnings: {}", name, warnings);
                    }
                    {
                        // replace the dependency set wholesale; files no
                        // longer included must stop triggering recompiles
                        let mut deps = deps.lock().unwrap();
                        if let Some(old) = deps.shaders_to_files.remove(&handle) {
                            for file in old {
                                if let Some(set) = deps.file_to_shaders.get_mut(&file) {
                                    set.remove(&handle);
                                }
                            }
                        }
                        let files = output
                            .included_files
                            .iter()
                            .cloned()
                            .chain(main_file.clone());
                        for file in files {
                            deps.file_to_shaders
                                .entry(file.clone())
                                .or_default()
                                .insert(handle);
                            deps.shaders_to_files
                                .entry(handle)
                                .or_default()
                                .insert(file);
                        }
                    }
                    let mut slots = shaders.write().unwrap();
                    if let Some(state) = slots.get_mut(handle) {
                        state.spirv = Some(Arc::new(output.spirv));
                        state.reflection = Some(Arc::new(output.reflection));
                        state.ready = true;
                        state.success = true;
                    }
                    true
                }
                Err(failure) => {
                    {
                        let mut slots = shaders.write().unwrap();
                        if let Some(state) = slots.get_mut(handle) {
                            state.ready = true;
                            state.success = false;
                        }
                    }
                    if let Some(cb) = &on_error {
                        cb(handle, &name, &failure.message);
                    }
                    false
                }
            }
        });

        let mut slots = self.shaders.write().unwrap();
        if let Some(state) = slots.get_mut(handle) {
            state.compile = Some(CompileState { task });
        }
    }
}

impl FileWatchListener for ShaderDb {
    fn on_files_changed(&self, files: &FxHashSet<PathBuf>) {
        let mut to_recompile: FxHashSet<ShaderHandle> = FxHashSet::default();
        {
            let deps = self.deps.lock().unwrap();
            for file in files {
                let canonical = file.canonicalize().unwrap_or_else(|_| file.clone());
                if let Some(shaders) = deps.file_to_shaders.get(&canonical) {
                    to_recompile.extend(shaders.iter().copied());
                }
            }
        }
        for handle in to_recompile {
            self.request_recompile(handle);
        }
    }
}

impl Drop for ShaderDb {
    fn drop(&mut self) {
        self.destroying.store(true, Ordering::SeqCst);

        if let Some((watcher, weak)) = self.watcher.lock().unwrap().take() {
            watcher.remove_listener(&weak);
        }

        if self.desc.resolve_on_destruction {
            let handles: Vec<ShaderHandle> = {
                let shaders = self.shaders.read().unwrap();
                let mut out = Vec::with_capacity(shaders.len());
                shaders.for_each(|h, _| out.push(h));
                out
            };
            for handle in handles {
                let _ = self.resolve(handle);
            }
        }
    }
}

fn resolve_source_path(path: &Path, roots: &[PathBuf]) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    if path.is_absolute() {
        return None;
    }
    roots.iter().map(|r| r.join(path)).find(|c| c.exists())
}
