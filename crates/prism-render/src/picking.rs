//! Selection attachment read-back.

use ash::vk;
use prism_core::selection;
use prism_core::PickResult;

use crate::targets::RenderTargetSet;

/// Bytes per selection texel (`R32G32B32A32_SFLOAT`).
const TEXEL_SIZE: u64 = 16;

/// Decode one `[id, selected, marker]` texel.
pub fn decode_texel(texel: &[f32; 3]) -> PickResult {
    selection::decode_texel(*texel)
}

/// Read the first three channels at (`x`, `y`) from a mapped linear image.
///
/// Returns `None` when the coordinate or the row falls outside `bytes`.
pub fn read_texel(
    bytes: &[u8],
    layout: &vk::SubresourceLayout,
    extent: vk::Extent2D,
    x: u32,
    y: u32,
) -> Option<[f32; 3]> {
    if x >= extent.width || y >= extent.height {
        return None;
    }
    let start = layout.offset + u64::from(y) * layout.row_pitch + u64::from(x) * TEXEL_SIZE;
    let start = usize::try_from(start).ok()?;
    let texel = bytes.get(start..start + 12)?;
    let mut out = [0.0_f32; 3];
    for (value, chunk) in out.iter_mut().zip(texel.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(out)
}

/// Pick from a target set whose staging copy has completed.
pub fn pick_from_targets(
    targets: &RenderTargetSet,
    x: u32,
    y: u32,
) -> prism_gpu::Result<PickResult> {
    let bytes = targets.staging.mapped_bytes()?;
    Ok(read_texel(bytes, &targets.staging_layout, targets.extent, x, y)
        .map_or(PickResult::Nothing, |texel| decode_texel(&texel)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::selection::GIZMO_AXIS_IDS;
    use prism_core::{Axis, ObjectId};

    fn image(width: u32, height: u32, row_pitch: u64, texels: &[(u32, u32, [f32; 4])]) -> Vec<u8> {
        let mut bytes = vec![0u8; (row_pitch * u64::from(height)) as usize];
        for &(x, y, texel) in texels {
            let start = (u64::from(y) * row_pitch + u64::from(x) * TEXEL_SIZE) as usize;
            let raw: &[u8] = bytemuck::cast_slice(&texel);
            bytes[start..start + 16].copy_from_slice(raw);
        }
        assert!(u64::from(width) * TEXEL_SIZE <= row_pitch);
        bytes
    }

    fn layout(row_pitch: u64, height: u32) -> vk::SubresourceLayout {
        vk::SubresourceLayout {
            offset: 0,
            size: row_pitch * u64::from(height),
            row_pitch,
            array_pitch: 0,
            depth_pitch: 0,
        }
    }

    #[test]
    fn honours_padded_row_pitch() {
        let extent = vk::Extent2D {
            width: 3,
            height: 2,
        };
        // Rows padded to 64 bytes instead of 48
        let bytes = image(3, 2, 64, &[(2, 1, [5.0, 1.0, 1.0, 0.0])]);
        let texel = read_texel(&bytes, &layout(64, 2), extent, 2, 1);
        assert_eq!(texel, Some([5.0, 1.0, 1.0]));
        assert_eq!(
            decode_texel(&[5.0, 1.0, 1.0]),
            PickResult::Object {
                id: ObjectId(4),
                selected: true
            }
        );
    }

    #[test]
    fn out_of_bounds_reads_nothing() {
        let extent = vk::Extent2D {
            width: 2,
            height: 2,
        };
        let bytes = image(2, 2, 32, &[]);
        assert_eq!(read_texel(&bytes, &layout(32, 2), extent, 2, 0), None);
        assert_eq!(read_texel(&bytes, &layout(32, 2), extent, 0, 5), None);
        assert_eq!(read_texel(&bytes[..40], &layout(32, 2), extent, 1, 1), None);
    }

    #[test]
    fn background_and_gizmo_texels() {
        assert_eq!(decode_texel(&[0.0, 0.0, 0.0]), PickResult::Nothing);
        assert_eq!(
            decode_texel(&[GIZMO_AXIS_IDS[1] as f32, 0.0, 1.0]),
            PickResult::GizmoAxis(Axis::Y)
        );
    }
}
