//! Raster export of the rendered map canvas.
//!
//! The viewer captures the current frame as an [`egui::ColorImage`] through
//! egui's screenshot command; this module encodes that capture to the
//! requested raster format and writes the download file. Failures are
//! returned to the caller, never panicked.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, RgbaImage, codecs::jpeg::JpegEncoder};
use log::debug;

use crate::MapError;

/// Supported raster export formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportFormat {
    /// Lossless PNG.
    #[default]
    Png,
    /// Lossy JPEG; honors [`ExportOptions::quality`].
    Jpeg,
    /// Lossless WebP. The quality knob is ignored.
    WebP,
}

impl ExportFormat {
    /// The file extension for this format.
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::WebP => "webp",
        }
    }
}

/// Options for one export command.
#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// The output raster format.
    pub format: ExportFormat,
    /// JPEG quality, 1–100. Ignored by the lossless formats.
    pub quality: u8,
    /// Output file name, without extension.
    pub filename: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::default(),
            quality: 90,
            filename: "inspection-map".to_string(),
        }
    }
}

impl ExportOptions {
    /// The output path: the configured file name plus the format extension.
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.filename, self.format.extension()))
    }
}

/// Encodes a captured frame to the requested raster format.
pub fn encode_image(image: &egui::ColorImage, options: &ExportOptions) -> Result<Vec<u8>, MapError> {
    let [width, height] = image.size;
    let buffer = RgbaImage::from_raw(width as u32, height as u32, image.as_raw().to_vec())
        .ok_or_else(|| {
            MapError::ExportError("captured canvas pixel buffer has inconsistent size".to_string())
        })?;

    let mut bytes = Vec::new();
    match options.format {
        ExportFormat::Png => {
            DynamicImage::ImageRgba8(buffer).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        }
        ExportFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgba8(buffer).to_rgb8();
            let quality = options.quality.clamp(1, 100);
            let mut cursor = Cursor::new(&mut bytes);
            let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
            rgb.write_with_encoder(encoder)?;
        }
        ExportFormat::WebP => {
            DynamicImage::ImageRgba8(buffer)
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::WebP)?;
        }
    }
    Ok(bytes)
}

/// Encodes a captured frame and writes the download file.
///
/// Returns the written path. Map and tool state are not touched.
pub fn write_export(
    image: &egui::ColorImage,
    options: &ExportOptions,
    directory: &Path,
) -> Result<PathBuf, MapError> {
    let bytes = encode_image(image, options)?;
    let path = directory.join(options.output_path());
    std::fs::write(&path, bytes)?;
    debug!("Exported map canvas to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use egui::Color32;

    fn capture() -> egui::ColorImage {
        egui::ColorImage::filled([8, 4], Color32::from_rgb(200, 30, 30))
    }

    #[test]
    fn png_roundtrip_preserves_dimensions() {
        let bytes = encode_image(&capture(), &ExportOptions::default()).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 8);
        assert_eq!(decoded.height(), 4);
    }

    #[test]
    fn jpeg_and_webp_encode() {
        for format in [ExportFormat::Jpeg, ExportFormat::WebP] {
            let options = ExportOptions {
                format,
                ..ExportOptions::default()
            };
            let bytes = encode_image(&capture(), &options).unwrap();
            assert!(!bytes.is_empty());
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!(decoded.width(), 8);
        }
    }

    #[test]
    fn output_path_appends_extension() {
        let options = ExportOptions {
            format: ExportFormat::WebP,
            quality: 80,
            filename: "sector-7-survey".to_string(),
        };
        assert_eq!(options.output_path(), PathBuf::from("sector-7-survey.webp"));
    }

    #[test]
    fn write_export_creates_the_file() {
        let dir = std::env::temp_dir();
        let options = ExportOptions {
            filename: format!("egui-inspection-map-test-{}", std::process::id()),
            ..ExportOptions::default()
        };
        let path = write_export(&capture(), &options, &dir).unwrap();
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }
}
