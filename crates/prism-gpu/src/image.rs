//! Image view and sampler helpers.

use crate::error::Result;
use ash::vk;

/// Create an image view.
///
/// # Safety
/// The device and image must be valid.
pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(range);
    Ok(device.create_image_view(&info, None)?)
}

/// Sampler addressing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerKind {
    /// Trilinear, repeating. Material textures.
    Repeat,
    /// Trilinear, clamped. Cubemaps and lookup tables.
    Clamp,
    /// Point sampling, clamped. Id and attachment reads.
    Nearest,
}

/// Create a sampler covering `max_lod` mip levels.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_sampler(
    device: &ash::Device,
    kind: SamplerKind,
    max_lod: f32,
) -> Result<vk::Sampler> {
    let (filter, mipmap, address) = match kind {
        SamplerKind::Repeat => (
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
            vk::SamplerAddressMode::REPEAT,
        ),
        SamplerKind::Clamp => (
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
        ),
        SamplerKind::Nearest => (
            vk::Filter::NEAREST,
            vk::SamplerMipmapMode::NEAREST,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
        ),
    };
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap)
        .address_mode_u(address)
        .address_mode_v(address)
        .address_mode_w(address)
        .min_lod(0.0)
        .max_lod(max_lod)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
    Ok(device.create_sampler(&info, None)?)
}

/// Bytes per texel of the formats the renderers allocate.
pub const fn texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::R16G16_SFLOAT
        | vk::Format::D32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_format_is_four_floats() {
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::R16G16_SFLOAT), Some(4));
        assert_eq!(texel_size(vk::Format::UNDEFINED), None);
    }
}
