//! Best-effort artifact compression
//!
//! Both passes are lossless and an artifact is swapped only when the result is
//! smaller:
//!
//! - PNG: the color type is reduced where no information is lost (opaque
//!   alpha dropped, gray RGB collapsed to luma), then every filter strategy is
//!   tried at the highest deflate level and the smallest encoding wins.
//! - JPEG: the Huffman tables are rebuilt from the image's own statistics (see
//!   [`crate::capture::jpeg`]) and the result must decode to the same pixels.
//!
//! Other formats pass through. Nothing here ever fails a capture.

use crate::capture::jpeg::optimize_huffman;
use crate::capture::options::ImageFormat;
use crate::error::{CompressError, JpegError};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageFormat as Codec, LumaA, Luma, Rgb, RgbImage,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Filter strategies tried for every PNG
const PNG_FILTERS: [FilterType; 6] = [
    FilterType::NoFilter,
    FilterType::Sub,
    FilterType::Up,
    FilterType::Avg,
    FilterType::Paeth,
    FilterType::Adaptive,
];

/// What the compressor did with an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    /// The artifact was replaced by a smaller encoding
    Replaced {
        /// Size before, in bytes
        before: u64,
        /// Size after, in bytes
        after: u64,
    },
    /// The artifact was left untouched
    Skipped(&'static str),
}

/// Compress `path` in place, logging instead of failing
#[instrument]
pub async fn compress(path: &Path, storage: &Path) {
    match compress_artifact(path.to_path_buf(), storage.to_path_buf()).await {
        Ok(Compression::Replaced { before, after }) => {
            info!("Compressed {}: {} -> {} bytes", path.display(), before, after);
        }
        Ok(Compression::Skipped(reason)) => {
            debug!("Compression skipped for {}: {}", path.display(), reason);
        }
        Err(e) => {
            warn!("Compression failed for {}: {}", path.display(), e);
        }
    }
}

/// Compress `path`, staging the new encoding in `storage`
pub async fn compress_artifact(
    path: PathBuf,
    storage: PathBuf,
) -> Result<Compression, CompressError> {
    tokio::task::spawn_blocking(move || recompress(&path, &storage))
        .await
        .map_err(|e| CompressError::Task(e.to_string()))?
}

fn recompress(path: &Path, storage: &Path) -> Result<Compression, CompressError> {
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ImageFormat::parse);

    let original = std::fs::read(path)?;
    let optimized = match format {
        Some(ImageFormat::Png) => optimize_png(&original)?,
        Some(ImageFormat::Jpeg) => match optimize_jpeg(&original) {
            Err(CompressError::Jpeg(JpegError::Unsupported(reason))) => {
                return Ok(Compression::Skipped(reason));
            }
            other => other?,
        },
        _ => return Ok(Compression::Skipped("no lossless optimizer for this format")),
    };

    let before = original.len() as u64;
    let after = optimized.len() as u64;
    if after >= before {
        return Ok(Compression::Skipped("already optimal"));
    }

    let mut staged = tempfile::NamedTempFile::new_in(storage)?;
    staged.write_all(&optimized)?;
    staged.flush()?;
    staged.persist(path)?;
    Ok(Compression::Replaced { before, after })
}

/// Smallest lossless PNG encoding of `data`
pub fn optimize_png(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let image = reduce_color_type(image::load_from_memory_with_format(data, Codec::Png)?);

    let mut best: Option<Vec<u8>> = None;
    for filter in PNG_FILTERS {
        let mut encoded = Vec::new();
        image.write_with_encoder(PngEncoder::new_with_quality(
            &mut encoded,
            CompressionType::Best,
            filter,
        ))?;
        if best.as_ref().map_or(true, |b| encoded.len() < b.len()) {
            best = Some(encoded);
        }
    }
    Ok(best.unwrap_or_else(|| data.to_vec()))
}

/// Rebuild the JPEG's Huffman tables and check the pixels survived
pub fn optimize_jpeg(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let optimized = optimize_huffman(data)?;
    let before = image::load_from_memory_with_format(data, Codec::Jpeg)?;
    let after = image::load_from_memory_with_format(&optimized, Codec::Jpeg)?;
    if before.as_bytes() != after.as_bytes() {
        return Err(CompressError::Mismatch);
    }
    Ok(optimized)
}

/// Drop channels that carry no information; 16-bit and float images are kept
fn reduce_color_type(image: DynamicImage) -> DynamicImage {
    let rgba = match &image {
        DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLuma8(_) => image.to_rgba8(),
        _ => return image,
    };

    let opaque = rgba.pixels().all(|p| p[3] == u8::MAX);
    let gray = rgba.pixels().all(|p| p[0] == p[1] && p[1] == p[2]);
    let (width, height) = rgba.dimensions();

    match (opaque, gray) {
        (true, true) => DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
            Luma([rgba.get_pixel(x, y)[0]])
        })),
        (true, false) => DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            let p = rgba.get_pixel(x, y);
            Rgb([p[0], p[1], p[2]])
        })),
        (false, true) => {
            DynamicImage::ImageLumaA8(GrayAlphaImage::from_fn(width, height, |x, y| {
                let p = rgba.get_pixel(x, y);
                LumaA([p[0], p[3]])
            }))
        }
        (false, false) => DynamicImage::ImageRgba8(rgba),
    }
}
