//! Image engine: decode once, produce downscaled originals and per-variant
//! renditions in the requested codecs.
//!
//! All work here is CPU-bound and synchronous; callers offload it with
//! `tokio::task::spawn_blocking`.

pub mod geometry;
pub mod memory;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;

use crate::config::EngineConfig;
use crate::db::models::ImageCodec;
use crate::error::{AppError, Result};
use crate::profiles::{FitMode, VariantDef};

pub const JPEG_DEFAULT_QUALITY: u8 = 82;
pub const ALT_DEFAULT_QUALITY: u8 = 80;

/// Quality used for a codec when the caller does not override it.
pub fn default_quality(codec: ImageCodec) -> u8 {
    match codec {
        ImageCodec::Jpeg => JPEG_DEFAULT_QUALITY,
        _ => ALT_DEFAULT_QUALITY,
    }
}

/// One encoded rendition.
#[derive(Debug)]
pub struct RenderResult {
    pub body: Bytes,
    pub width: u32,
    pub height: u32,
    pub content_type: &'static str,
}

/// The downscaled original in every requested codec the engine supports.
/// JPEG is always present.
#[derive(Debug)]
pub struct RenderedOriginal {
    pub jpeg: Bytes,
    pub webp: Option<Bytes>,
    pub avif: Option<Bytes>,
    pub png: Option<Bytes>,
    pub width: u32,
    pub height: u32,
}

impl RenderedOriginal {
    pub fn body_for(&self, codec: ImageCodec) -> Option<&Bytes> {
        match codec {
            ImageCodec::Jpeg => Some(&self.jpeg),
            ImageCodec::Webp => self.webp.as_ref(),
            ImageCodec::Avif => self.avif.as_ref(),
            ImageCodec::Png => self.png.as_ref(),
        }
    }
}

/// Stateless transcoder.
pub struct ImageEngine {
    memory_limit: Option<u64>,
}

impl ImageEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            memory_limit: config
                .memory_limit
                .as_deref()
                .and_then(memory::parse_memory_limit),
        }
    }

    /// Compiled codec support. JPEG and PNG are always available; WEBP and
    /// AVIF follow the cargo features this build carries.
    pub fn is_supported(&self, codec: ImageCodec) -> bool {
        match codec {
            ImageCodec::Jpeg | ImageCodec::Png => true,
            ImageCodec::Webp => cfg!(feature = "webp"),
            ImageCodec::Avif => cfg!(feature = "avif"),
        }
    }

    /// Downscale-only original: the longer edge is capped, the source is
    /// never enlarged. JPEG is always emitted; other codecs only when
    /// requested and supported.
    pub fn render_original(
        &self,
        bytes: &[u8],
        max_long_edge: u32,
        codecs: &[ImageCodec],
        jpeg_quality: u8,
        alt_quality: u8,
    ) -> Result<RenderedOriginal> {
        let img = self.decode(bytes)?;
        let (src_w, src_h) = img.dimensions();
        let (out_w, out_h) = geometry::original_fit(src_w, src_h, max_long_edge);
        let resized = if (out_w, out_h) == (src_w, src_h) {
            img
        } else {
            img.resize_exact(out_w, out_h, FilterType::Triangle)
        };

        let wants = |codec| codecs.contains(&codec) && self.is_supported(codec);
        Ok(RenderedOriginal {
            jpeg: encode_jpeg(&resized, jpeg_quality)?,
            webp: if wants(ImageCodec::Webp) {
                Some(encode_webp(&resized, alt_quality)?)
            } else {
                None
            },
            avif: if wants(ImageCodec::Avif) {
                Some(encode_avif(&resized, alt_quality)?)
            } else {
                None
            },
            png: if wants(ImageCodec::Png) {
                Some(encode_png(&resized, alt_quality)?)
            } else {
                None
            },
            width: out_w,
            height: out_h,
        })
    }

    /// One variant rendition. Target dimensions are clamped to the source
    /// before geometry, so nothing is ever upscaled.
    pub fn render_variant(
        &self,
        bytes: &[u8],
        def: &VariantDef,
        codec: ImageCodec,
        quality: u8,
    ) -> Result<RenderResult> {
        let img = self.decode(bytes)?;
        let (src_w, src_h) = img.dimensions();
        let (target_w, target_h) =
            geometry::clamp_no_upscale(src_w, src_h, def.width, def.height);

        let (rendered, out_w, out_h) = match def.fit {
            FitMode::Contain => {
                let (w, h) = geometry::contain(src_w, src_h, target_w, target_h);
                (img.resize_exact(w, h, FilterType::Triangle), w, h)
            }
            FitMode::Cover => {
                let plan = geometry::cover(src_w, src_h, target_w, target_h);
                let cropped = img.crop_imm(plan.crop_x, plan.crop_y, plan.crop_w, plan.crop_h);
                (
                    cropped.resize_exact(plan.out_w, plan.out_h, FilterType::Triangle),
                    plan.out_w,
                    plan.out_h,
                )
            }
        };

        let body = encode(&rendered, codec, quality)?;
        Ok(RenderResult {
            body,
            width: out_w,
            height: out_h,
            content_type: codec.content_type(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        let (width, height) = image::io::Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| AppError::ImageDecode(e.to_string()))?
            .into_dimensions()?;
        memory::check_decode_budget(width, height, self.memory_limit)?;
        Ok(image::load_from_memory(bytes)?)
    }
}

fn encode(img: &DynamicImage, codec: ImageCodec, quality: u8) -> Result<Bytes> {
    match codec {
        ImageCodec::Jpeg => encode_jpeg(img, quality),
        ImageCodec::Webp => encode_webp(img, quality),
        ImageCodec::Avif => encode_avif(img, quality),
        ImageCodec::Png => encode_png(img, quality),
    }
}

/// JPEG carries no alpha channel: composite onto solid white first.
fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Bytes> {
    let flattened = flatten_onto_white(img);
    let mut buf = Vec::new();
    flattened.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(quality))?;
    Ok(Bytes::from(buf))
}

fn flatten_onto_white(img: &DynamicImage) -> DynamicImage {
    if !img.color().has_alpha() {
        return img.clone();
    }
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut rgb = image::RgbImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        rgb.put_pixel(
            x,
            y,
            image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }
    DynamicImage::ImageRgb8(rgb)
}

/// PNG quality maps onto a 0..9 compression level: quality 100 is level 0
/// (fastest, largest), quality 0 is level 9.
pub fn png_compression_level(quality: u8) -> u8 {
    9 - ((quality.min(100) as f64 / 100.0 * 9.0).round() as u8)
}

fn encode_png(img: &DynamicImage, quality: u8) -> Result<Bytes> {
    use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
    use image::ImageEncoder;

    // The encoder exposes three compression tiers; bucket the level onto them.
    let compression = match png_compression_level(quality) {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    };

    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut buf = Vec::new();
    PngEncoder::new_with_quality(Cursor::new(&mut buf), compression, PngFilter::Adaptive)
        .write_image(rgba.as_raw(), width, height, image::ColorType::Rgba8)?;
    Ok(Bytes::from(buf))
}

/// Lossy WebP goes through the dedicated `webp` crate; the built-in encoder
/// is lossless-only and has no quality control. Alpha survives the VP8 path.
#[cfg(feature = "webp")]
fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Bytes> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let encoder = webp::Encoder::from_image(&rgba)
        .map_err(|e| AppError::ImageDecode(format!("webp encode failed: {e}")))?;
    let encoded = encoder.encode(quality as f32);
    Ok(Bytes::copy_from_slice(&encoded))
}

#[cfg(not(feature = "webp"))]
fn encode_webp(_img: &DynamicImage, _quality: u8) -> Result<Bytes> {
    Err(AppError::Internal(
        "webp codec not compiled into this build".to_string(),
    ))
}

#[cfg(feature = "avif")]
fn encode_avif(img: &DynamicImage, quality: u8) -> Result<Bytes> {
    use image::codecs::avif::AvifEncoder;
    use image::ImageEncoder;

    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut buf = Vec::new();
    AvifEncoder::new_with_speed_quality(Cursor::new(&mut buf), 6, quality).write_image(
        rgba.as_raw(),
        width,
        height,
        image::ColorType::Rgba8,
    )?;
    Ok(Bytes::from(buf))
}

#[cfg(not(feature = "avif"))]
fn encode_avif(_img: &DynamicImage, _quality: u8) -> Result<Bytes> {
    Err(AppError::Internal(
        "avif codec not compiled into this build".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ImageEngine {
        ImageEngine::new(&EngineConfig::default())
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([200, 40, 40]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn contain_variant_keeps_aspect() {
        let def = VariantDef {
            width: 100,
            height: 100,
            fit: FitMode::Contain,
        };
        let result = engine()
            .render_variant(&png_bytes(400, 200), &def, ImageCodec::Jpeg, 82)
            .unwrap();
        assert_eq!((result.width, result.height), (100, 50));
        assert_eq!(result.content_type, "image/jpeg");
        assert!(!result.body.is_empty());
    }

    #[test]
    fn cover_variant_never_upscales() {
        let def = VariantDef {
            width: 1000,
            height: 1000,
            fit: FitMode::Cover,
        };
        let result = engine()
            .render_variant(&png_bytes(500, 300), &def, ImageCodec::Jpeg, 82)
            .unwrap();
        assert_eq!((result.width, result.height), (500, 300));
    }

    #[test]
    fn original_render_keeps_small_sources() {
        let original = engine()
            .render_original(&png_bytes(40, 20), 1000, &[ImageCodec::Jpeg], 82, 80)
            .unwrap();
        assert_eq!((original.width, original.height), (40, 20));
        assert!(original.webp.is_none());
        assert!(original.png.is_none());
    }

    #[test]
    fn original_render_caps_long_edge() {
        let original = engine()
            .render_original(
                &png_bytes(400, 200),
                100,
                &[ImageCodec::Jpeg, ImageCodec::Png],
                82,
                80,
            )
            .unwrap();
        assert_eq!((original.width, original.height), (100, 50));
        assert!(original.png.is_some());
    }

    #[test]
    fn jpeg_flattens_alpha_onto_white() {
        // Fully transparent source must come back (nearly) white after the
        // lossy round trip.
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            8,
            8,
            image::Rgba([0, 0, 0, 0]),
        ));
        let body = encode_jpeg(&img, 95).unwrap();
        let decoded = image::load_from_memory(&body).unwrap().to_rgb8();
        let pixel = decoded.get_pixel(4, 4);
        assert!(pixel[0] > 240 && pixel[1] > 240 && pixel[2] > 240);
    }

    #[test]
    fn png_level_formula() {
        assert_eq!(png_compression_level(100), 0);
        assert_eq!(png_compression_level(0), 9);
        assert_eq!(png_compression_level(50), 4);
        assert_eq!(png_compression_level(80), 2);
    }

    #[test]
    fn jpeg_and_png_always_supported() {
        let engine = engine();
        assert!(engine.is_supported(ImageCodec::Jpeg));
        assert!(engine.is_supported(ImageCodec::Png));
    }

    #[test]
    fn default_qualities() {
        assert_eq!(default_quality(ImageCodec::Jpeg), 82);
        assert_eq!(default_quality(ImageCodec::Webp), 80);
        assert_eq!(default_quality(ImageCodec::Png), 80);
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        let def = VariantDef {
            width: 10,
            height: 10,
            fit: FitMode::Contain,
        };
        assert!(matches!(
            engine().render_variant(b"not an image", &def, ImageCodec::Jpeg, 82),
            Err(AppError::ImageDecode(_))
        ));
    }
}
