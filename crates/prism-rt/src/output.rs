//! Still image encoding for the integrator's linear RGBA32F output.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::hdr::HdrEncoder;
use image::{ImageBuffer, Rgb, Rgba};
use prism_core::OutputFormat;
use rayon::prelude::*;

use crate::error::Result;

const GAMMA: f32 = 2.2;

/// Reinhard tonemap followed by gamma encoding, per channel.
pub fn tonemap(linear: f32) -> f32 {
    let c = linear.max(0.0);
    (c / (1.0 + c)).powf(1.0 / GAMMA)
}

/// Tonemapped 8-bit RGBA from linear RGBA floats. Alpha is clamped, not
/// tonemapped.
pub fn to_rgba8(pixels: &[f32]) -> Vec<u8> {
    pixels
        .par_chunks_exact(4)
        .flat_map_iter(|p| {
            [
                tonemap(p[0]),
                tonemap(p[1]),
                tonemap(p[2]),
                p[3].clamp(0.0, 1.0),
            ]
            .map(|c| (c * 255.0).round() as u8)
        })
        .collect()
}

/// Write `pixels` (width * height RGBA floats) to `path`.
pub fn write_image(
    pixels: &[f32],
    width: u32,
    height: u32,
    format: OutputFormat,
    path: &Path,
) -> Result<()> {
    let expected = width as usize * height as usize * 4;
    if pixels.len() != expected {
        return Err(prism_core::Error::InvalidData(format!(
            "Output has {} floats, expected {expected}",
            pixels.len()
        ))
        .into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    match format {
        OutputFormat::Png => {
            let buffer: ImageBuffer<Rgba<u8>, _> =
                ImageBuffer::from_raw(width, height, to_rgba8(pixels)).ok_or_else(|| {
                    prism_core::Error::InvalidData("Output buffer size mismatch".to_string())
                })?;
            buffer.save_with_format(path, image::ImageFormat::Png)?;
        }
        OutputFormat::Hdr => {
            let rgb: Vec<Rgb<f32>> = pixels
                .par_chunks_exact(4)
                .map(|p| Rgb([p[0].max(0.0), p[1].max(0.0), p[2].max(0.0)]))
                .collect();
            let writer = BufWriter::new(File::create(path)?);
            HdrEncoder::new(writer).encode(&rgb, width as usize, height as usize)?;
        }
    }
    tracing::info!("Wrote {width}x{height} {format:?} image to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn tonemap_is_monotonic_and_bounded() {
        assert_relative_eq!(tonemap(0.0), 0.0);
        assert_relative_eq!(tonemap(1.0), 0.5_f32.powf(1.0 / 2.2));
        assert!(tonemap(1000.0) < 1.0);
        assert!(tonemap(2.0) > tonemap(1.0));
        assert_relative_eq!(tonemap(-3.0), 0.0);
    }

    #[test]
    fn rgba8_keeps_pixel_order() {
        let bytes = to_rgba8(&[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 255]);
        assert!(bytes[4] > 150 && bytes[5] == 0);
    }

    #[test]
    fn png_round_trips_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        write_image(&vec![0.5; 3 * 2 * 4], 3, 2, OutputFormat::Png, &path).unwrap();
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    #[test]
    fn hdr_keeps_float_radiance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("still.hdr");
        let mut pixels = vec![0.0; 4 * 4 * 4];
        pixels[0] = 8.0;
        write_image(&pixels, 4, 4, OutputFormat::Hdr, &path).unwrap();
        let decoded = image::open(&path).unwrap().into_rgb32f();
        assert_eq!(decoded.dimensions(), (4, 4));
        assert_relative_eq!(decoded.get_pixel(0, 0)[0], 8.0, epsilon = 0.1);
    }

    #[test]
    fn rejects_short_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        assert!(write_image(&[0.0; 4], 2, 2, OutputFormat::Png, &path).is_err());
        assert!(!path.exists());
    }
}
