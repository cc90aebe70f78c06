//! PNG export of read-back textures.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use image::RgbaImage;

/// 8-bit RGBA bytes of float texels, clamped to `[0, 1]`.
pub fn texels_to_rgba8(texels: &[[f32; 4]]) -> Vec<u8> {
    texels
        .iter()
        .flat_map(|t| t.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8))
        .collect()
}

pub fn to_image(width: u32, height: u32, texels: &[[f32; 4]]) -> Result<RgbaImage> {
    let expected = width as usize * height as usize;
    if texels.len() != expected {
        bail!(
            "texture has {} texels, expected {width}x{height} = {expected}",
            texels.len()
        );
    }
    RgbaImage::from_raw(width, height, texels_to_rgba8(texels))
        .ok_or_else(|| anyhow!("failed to assemble a {width}x{height} image"))
}

pub fn save_png(path: impl AsRef<Path>, width: u32, height: u32, texels: &[[f32; 4]]) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    to_image(width, height, texels)?
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texels_are_clamped_to_bytes() {
        let bytes = texels_to_rgba8(&[[2.0, -1.0, 0.5, 1.0]]);
        assert_eq!(bytes, vec![255, 0, 128, 255]);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let err = to_image(2, 2, &[[0.0; 4]; 3]).unwrap_err();
        assert!(err.to_string().contains("3 texels"));
    }

    #[test]
    fn png_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("sdf-forge-export-{}", std::process::id()));
        let path = dir.join("out.png");
        save_png(&path, 2, 1, &[[1.0, 0.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]]).unwrap();
        let img = image::open(&path).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(1, 0).0, [0, 0, 255, 255]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
