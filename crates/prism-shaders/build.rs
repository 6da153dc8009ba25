//! Build script to compile GLSL shaders to SPIR-V.

use shaderc::{Compiler, IncludeType, ResolvedInclude, ShaderKind};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Raster and IBL shaders, always built.
const RASTER_SHADERS: &[(&str, ShaderKind)] = &[
    ("forward.vert", ShaderKind::Vertex),
    ("forward.frag", ShaderKind::Fragment),
    ("forward_point.frag", ShaderKind::Fragment),
    ("fullscreen.vert", ShaderKind::Vertex),
    ("sky.frag", ShaderKind::Fragment),
    ("post.frag", ShaderKind::Fragment),
    ("gizmo.vert", ShaderKind::Vertex),
    ("gizmo.frag", ShaderKind::Fragment),
    ("equirect_to_cube.frag", ShaderKind::Fragment),
    ("irradiance.frag", ShaderKind::Fragment),
    ("prefilter.frag", ShaderKind::Fragment),
    ("brdf_lut.frag", ShaderKind::Fragment),
];

/// Path tracing stages, built with the `ray_tracing` feature.
#[cfg(feature = "ray_tracing")]
const RAY_TRACING_SHADERS: &[(&str, ShaderKind)] = &[
    ("path.rgen", ShaderKind::RayGeneration),
    ("path.rmiss", ShaderKind::Miss),
    ("shadow.rmiss", ShaderKind::Miss),
    ("path.rchit", ShaderKind::ClosestHit),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let shader_dir = Path::new("shaders");

    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for &(name, kind) in RASTER_SHADERS {
        compile_shader(&compiler, shader_dir, name, &out_dir, kind);
    }

    #[cfg(feature = "ray_tracing")]
    for &(name, kind) in RAY_TRACING_SHADERS {
        compile_shader(&compiler, shader_dir, name, &out_dir, kind);
    }
}

/// Output file name: `forward.frag` becomes `forward_frag.spv`.
fn spirv_name(name: &str) -> String {
    format!("{}.spv", name.replace('.', "_"))
}

fn compile_shader(
    compiler: &Compiler,
    shader_dir: &Path,
    name: &str,
    out_dir: &Path,
    kind: ShaderKind,
) {
    let input_path = shader_dir.join(name);
    let output_path = out_dir.join(spirv_name(name));

    let source = fs::read_to_string(&input_path)
        .unwrap_or_else(|e| panic!("Failed to read shader {input_path:?}: {e}"));

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_6);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let include_root = shader_dir.to_path_buf();
    options.set_include_callback(move |requested, include_type, _requester, _depth| {
        if include_type != IncludeType::Relative {
            return Err(format!("only relative includes are supported: {requested}"));
        }
        let path = include_root.join(requested);
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read include {path:?}: {e}"))?;
        Ok(ResolvedInclude {
            resolved_name: path.to_string_lossy().into_owned(),
            content,
        })
    });

    let result = compiler
        .compile_into_spirv(&source, kind, name, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {input_path:?}: {e}"));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {input_path:?}: {}",
            result.get_warning_messages()
        );
    }

    fs::write(
        &output_path,
        bytemuck::cast_slice::<u32, u8>(result.as_binary()),
    )
    .unwrap_or_else(|e| panic!("Failed to write shader {output_path:?}: {e}"));
}
