//! Shader compilation through shaderc.
//!
//! HLSL source goes in, SPIR-V comes out. The include callback resolves
//! against the database's search roots and records every file it touched so
//! live editing can map files back to shaders. Each HLSL register class is
//! shifted into its own binding range so reflection and descriptor-set
//! binding indices agree across backends.

use crate::settings::ShaderModel;
use fxhash::FxHashSet;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::reflection::{reflect_spirv, ReflectionData};

/// Distance between the binding ranges of the HLSL register classes
/// (`b`, `t`, `s`, `u`), in binding slots per register space.
pub const REGISTER_CLASS_STRIDE: u32 = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShaderType {
    Compute,
}

/// One compile invocation.
pub struct CompileRequest {
    pub shader_type: ShaderType,
    pub name: String,
    pub entry_point: String,
    /// Main source text, already read by the IO step.
    pub source: String,
    /// File name used in diagnostics; synthetic for inline source.
    pub source_name: String,
    pub defines: Vec<(String, Option<String>)>,
    pub include_roots: Vec<PathBuf>,
    pub shader_model: ShaderModel,
    /// Directory receiving the SPIR-V disassembly dump, when enabled.
    pub dump_dir: Option<PathBuf>,
}

pub struct CompileOutput {
    pub spirv: Vec<u32>,
    pub reflection: ReflectionData,
    pub warnings: Option<String>,
    /// Every include the compiler resolved.
    pub included_files: FxHashSet<PathBuf>,
}

/// One parsed diagnostic line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub message: String,
}

pub struct CompileFailure {
    pub message: String,
    pub diagnostics: Vec<Diagnostic>,
}

lazy_static! {
    // shaderc diagnostics look like "path:12: error: 'x' : unknown variable"
    static ref RE_DIAGNOSTIC: Regex =
        Regex::new(r"(?m)^(?P<file>[^:\n]+):(?P<line>\d+): (?:error|warning): (?P<msg>.*)$")
            .unwrap();
}

pub fn parse_diagnostics(message: &str) -> Vec<Diagnostic> {
    RE_DIAGNOSTIC
        .captures_iter(message)
        .map(|c| Diagnostic {
            file: c["file"].to_string(),
            line: c["line"].parse().unwrap_or(0),
            message: c["msg"].to_string(),
        })
        .collect()
}

fn target_spirv(model: ShaderModel) -> shaderc::SpirvVersion {
    match model {
        ShaderModel::Sm6_0 | ShaderModel::Sm6_1 => shaderc::SpirvVersion::V1_3,
        ShaderModel::Sm6_2 | ShaderModel::Sm6_3 => shaderc::SpirvVersion::V1_4,
        ShaderModel::Sm6_4 | ShaderModel::Sm6_5 => shaderc::SpirvVersion::V1_5,
    }
}

/// Resolves an include name against the including file's directory and the
/// configured search roots.
fn resolve_include(name: &str, requesting_source: &str, roots: &[PathBuf]) -> Option<PathBuf> {
    let requested = Path::new(name);
    if requested.is_absolute() {
        return requested.exists().then(|| requested.to_path_buf());
    }

    if let Some(parent) = Path::new(requesting_source).parent() {
        let candidate = parent.join(requested);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    for root in roots {
        let candidate = root.join(requested);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

thread_local! {
    // Compiler construction is not free; each worker thread keeps its
    // instance across invocations. Never shared between threads.
    static COMPILER: RefCell<Option<shaderc::Compiler>> = RefCell::new(None);
}

/// Runs the compiler on the current thread.
pub fn compile(request: &CompileRequest) -> Result<CompileOutput, CompileFailure> {
    COMPILER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = shaderc::Compiler::new();
        }
        let compiler = slot.as_mut().ok_or_else(|| CompileFailure {
            message: "could not initialize the shader compiler".to_string(),
            diagnostics: Vec::new(),
        })?;
        compile_with(compiler, request)
    })
}

fn compile_with(
    compiler: &mut shaderc::Compiler,
    request: &CompileRequest,
) -> Result<CompileOutput, CompileFailure> {
    let included = Mutex::new(FxHashSet::default());
    let roots = request.include_roots.clone();

    let mut options = shaderc::CompileOptions::new().ok_or_else(|| CompileFailure {
        message: "could not create compile options".to_string(),
        diagnostics: Vec::new(),
    })?;

    options.set_source_language(shaderc::SourceLanguage::HLSL);
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_1 as u32,
    );
    options.set_target_spirv(target_spirv(request.shader_model));
    options.set_auto_bind_uniforms(true);

    // disjoint binding ranges per register class: b, t, s, u
    options.set_binding_base(shaderc::ResourceKind::Buffer, 0);
    options.set_binding_base(shaderc::ResourceKind::Texture, REGISTER_CLASS_STRIDE);
    options.set_binding_base(shaderc::ResourceKind::Sampler, 2 * REGISTER_CLASS_STRIDE);
    options.set_binding_base(
        shaderc::ResourceKind::UnorderedAccessView,
        3 * REGISTER_CLASS_STRIDE,
    );

    for (define, value) in &request.defines {
        options.add_macro_definition(define, value.as_deref());
    }

    options.set_include_callback(|name, _ty, requesting_source, _depth| {
        let path = resolve_include(name, requesting_source, &roots).ok_or_else(|| {
            format!("unable to open include file {:?}", name)
        })?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("unable to read include file {:?}: {}", path, e))?;
        included
            .lock()
            .unwrap()
            .insert(path.canonicalize().unwrap_or(path.clone()));
        Ok(shaderc::ResolvedInclude {
            resolved_name: path.to_string_lossy().into_owned(),
            content,
        })
    });

    let kind = match request.shader_type {
        ShaderType::Compute => shaderc::ShaderKind::Compute,
    };

    let artifact = compiler
        .compile_into_spirv(
            &request.source,
            kind,
            &request.source_name,
            &request.entry_point,
            Some(&options),
        )
        .map_err(|e| {
            let message = e.to_string();
            let diagnostics = parse_diagnostics(&message);
            CompileFailure {
                message,
                diagnostics,
            }
        })?;

    let warnings = if artifact.get_num_warnings() > 0 {
        Some(artifact.get_warning_messages())
    } else {
        None
    };

    let spirv = artifact.as_binary().to_vec();
    let reflection = reflect_spirv(&spirv);

    if let Some(dump_dir) = &request.dump_dir {
        dump_disassembly(compiler, request, &options, dump_dir);
    }

    debug!(
        "compiled shader '{}' ({} words, {} bindings)",
        request.name,
        spirv.len(),
        reflection.bindings.len()
    );

    Ok(CompileOutput {
        spirv,
        reflection,
        warnings,
        included_files: included.into_inner().unwrap(),
    })
}

fn dump_disassembly(
    compiler: &mut shaderc::Compiler,
    request: &CompileRequest,
    options: &shaderc::CompileOptions,
    dump_dir: &Path,
) {
    let kind = match request.shader_type {
        ShaderType::Compute => shaderc::ShaderKind::Compute,
    };
    match compiler.compile_into_spirv_assembly(
        &request.source,
        kind,
        &request.source_name,
        &request.entry_point,
        Some(options),
    ) {
        Ok(asm) => {
            let path = dump_dir.join(format!("{}.spvasm", request.name));
            if let Err(e) = std::fs::write(&path, asm.as_text()) {
                warn!("failed to write shader disassembly {:?}: {}", path, e);
            }
        }
        Err(e) => warn!("disassembly of '{}' failed: {}", request.name, e),
    }
}
