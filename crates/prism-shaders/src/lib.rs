//! SPIR-V for the Prism renderers.
//!
//! GLSL sources live in `shaders/` and are compiled at build time using
//! shaderc. Each getter converts the embedded bytes to aligned words once.

use std::sync::OnceLock;

/// Embedded SPIR-V bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    macro_rules! spirv {
        ($name:ident, $file:literal) => {
            pub static $name: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/", $file));
        };
    }

    spirv!(FORWARD_VERT, "forward_vert.spv");
    spirv!(FORWARD_FRAG, "forward_frag.spv");
    spirv!(FORWARD_POINT_FRAG, "forward_point_frag.spv");
    spirv!(FULLSCREEN_VERT, "fullscreen_vert.spv");
    spirv!(SKY_FRAG, "sky_frag.spv");
    spirv!(POST_FRAG, "post_frag.spv");
    spirv!(GIZMO_VERT, "gizmo_vert.spv");
    spirv!(GIZMO_FRAG, "gizmo_frag.spv");
    spirv!(EQUIRECT_TO_CUBE_FRAG, "equirect_to_cube_frag.spv");
    spirv!(IRRADIANCE_FRAG, "irradiance_frag.spv");
    spirv!(PREFILTER_FRAG, "prefilter_frag.spv");
    spirv!(BRDF_LUT_FRAG, "brdf_lut_frag.spv");

    #[cfg(feature = "ray_tracing")]
    spirv!(PATH_RGEN, "path_rgen.spv");
    #[cfg(feature = "ray_tracing")]
    spirv!(PATH_RMISS, "path_rmiss.spv");
    #[cfg(feature = "ray_tracing")]
    spirv!(SHADOW_RMISS, "shadow_rmiss.spv");
    #[cfg(feature = "ray_tracing")]
    spirv!(PATH_RCHIT, "path_rchit.spv");
}

/// Convert byte slice to aligned u32 words (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    debug_assert!(bytes.len() % 4 == 0, "SPIR-V bytecode must be 4-byte aligned");
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

macro_rules! shader_getter {
    ($(#[$meta:meta])* $fn_name:ident, $bytes:ident) => {
        $(#[$meta])*
        pub fn $fn_name() -> &'static [u32] {
            static WORDS: OnceLock<Vec<u32>> = OnceLock::new();
            WORDS.get_or_init(|| bytes_to_spirv(spirv_bytes::$bytes))
        }
    };
}

shader_getter!(
    /// Forward pass vertex stage.
    forward_vert, FORWARD_VERT);
shader_getter!(
    /// Base forward sub-pass, specialized per material kind.
    forward_frag, FORWARD_FRAG);
shader_getter!(
    /// Additive point-light sub-pass, specialized per material kind.
    forward_point_frag, FORWARD_POINT_FRAG);
shader_getter!(
    /// Fullscreen triangle used by sky, post and the IBL bakes.
    fullscreen_vert, FULLSCREEN_VERT);
shader_getter!(sky_frag, SKY_FRAG);
shader_getter!(
    /// Tone map and selection outline composite.
    post_frag, POST_FRAG);
shader_getter!(gizmo_vert, GIZMO_VERT);
shader_getter!(gizmo_frag, GIZMO_FRAG);
shader_getter!(equirect_to_cube_frag, EQUIRECT_TO_CUBE_FRAG);
shader_getter!(irradiance_frag, IRRADIANCE_FRAG);
shader_getter!(prefilter_frag, PREFILTER_FRAG);
shader_getter!(brdf_lut_frag, BRDF_LUT_FRAG);

#[cfg(feature = "ray_tracing")]
shader_getter!(
    /// Path integrator ray generation stage.
    path_rgen, PATH_RGEN);
#[cfg(feature = "ray_tracing")]
shader_getter!(
    /// Radiance miss; the ray generation stage samples the environment.
    path_rmiss, PATH_RMISS);
#[cfg(feature = "ray_tracing")]
shader_getter!(shadow_rmiss, SHADOW_RMISS);
#[cfg(feature = "ray_tracing")]
shader_getter!(path_rchit, PATH_RCHIT);

/// Fragment specialization constant id selecting the material kind.
pub const MATERIAL_KIND_CONSTANT_ID: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn raster_shaders_load() {
        for shader in [
            forward_vert(),
            forward_frag(),
            forward_point_frag(),
            fullscreen_vert(),
            sky_frag(),
            post_frag(),
            gizmo_vert(),
            gizmo_frag(),
        ] {
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
        }
    }

    #[test]
    fn ibl_shaders_load() {
        for shader in [
            equirect_to_cube_frag(),
            irradiance_frag(),
            prefilter_frag(),
            brdf_lut_frag(),
        ] {
            assert_eq!(shader[0], SPIRV_MAGIC);
            assert!(shader.len() > 50, "Shader too small");
        }
    }

    #[cfg(feature = "ray_tracing")]
    #[test]
    fn ray_tracing_shaders_load() {
        for shader in [path_rgen(), path_rmiss(), shadow_rmiss(), path_rchit()] {
            assert_eq!(shader[0], SPIRV_MAGIC);
        }
    }
}
