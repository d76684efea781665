//! Decode and encode helpers for callers that hold encoded bytes.

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, ImageReader, RgbImage};
use panomerge_core::{MergeError, MergeResult, RasterImage, ResourceLimits};
use tracing::debug;

/// Decode PNG, JPEG or BMP bytes into an RGB raster.
///
/// The encoded-size ceiling is checked before any decoding happens.
pub fn decode(bytes: &[u8], index: usize, limits: &ResourceLimits) -> MergeResult<RasterImage> {
    if bytes.len() > limits.max_encoded_bytes {
        return Err(MergeError::InvalidImage {
            index,
            reason: format!(
                "encoded size of {} bytes exceeds the ceiling of {} bytes",
                bytes.len(),
                limits.max_encoded_bytes
            ),
        });
    }

    let invalid = |reason: String| MergeError::InvalidImage { index, reason };
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| invalid(e.to_string()))?;
    let format = reader.format();
    if !matches!(format, Some(ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Bmp)) {
        return Err(invalid(format!("unsupported format {:?}", format)));
    }
    let decoded = reader.decode().map_err(|e| invalid(e.to_string()))?;
    debug!(index, width = decoded.width(), height = decoded.height(), ?format, "decoded image");

    from_rgb_image(decoded.into_rgb8(), index)
}

/// Read and decode an image file.
pub fn load(path: &Path, index: usize, limits: &ResourceLimits) -> MergeResult<RasterImage> {
    let bytes = std::fs::read(path).map_err(|e| MergeError::InvalidImage {
        index,
        reason: format!("{}: {}", path.display(), e),
    })?;
    decode(&bytes, index, limits)
}

pub fn from_rgb_image(img: RgbImage, index: usize) -> MergeResult<RasterImage> {
    let (w, h) = img.dimensions();
    RasterImage::new(w as usize, h as usize, img.into_raw(), index)
}

pub fn to_rgb_image(img: &RasterImage) -> MergeResult<RgbImage> {
    RgbImage::from_raw(img.width() as u32, img.height() as u32, img.data().to_vec()).ok_or_else(|| {
        MergeError::InvalidImage {
            index: img.source_index(),
            reason: "raster buffer does not match its dimensions".into(),
        }
    })
}

/// Encode a raster as PNG bytes.
pub fn encode_png(img: &RasterImage) -> MergeResult<Vec<u8>> {
    let rgb = to_rgb_image(img)?;
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Png).map_err(|e| MergeError::InvalidImage {
        index: img.source_index(),
        reason: format!("PNG encoding failed: {}", e),
    })?;
    Ok(out.into_inner())
}

pub fn save_png(img: &RasterImage, path: &Path) -> MergeResult<()> {
    let bytes = encode_png(img)?;
    std::fs::write(path, bytes).map_err(|e| MergeError::InvalidImage {
        index: img.source_index(),
        reason: format!("{}: {}", path.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use panomerge_core::synthetic::textured_scene;

    #[test]
    fn test_png_round_trip_keeps_pixels() {
        let img = textured_scene(40, 30, 1);
        let bytes = encode_png(&img).unwrap();
        let back = decode(&bytes, 0, &ResourceLimits::default()).unwrap();
        assert_eq!(back.dimensions(), (40, 30));
        assert_eq!(back.data(), img.data());
    }

    #[test]
    fn test_byte_ceiling_checked_before_decode() {
        let limits = ResourceLimits { max_encoded_bytes: 8, ..ResourceLimits::default() };
        let result = decode(&[0u8; 9], 3, &limits);
        assert!(matches!(result, Err(MergeError::InvalidImage { index: 3, .. })));
    }

    #[test]
    fn test_garbage_is_invalid_image() {
        let result = decode(b"definitely not an image", 1, &ResourceLimits::default());
        assert!(matches!(result, Err(MergeError::InvalidImage { index: 1, .. })));
    }
}
