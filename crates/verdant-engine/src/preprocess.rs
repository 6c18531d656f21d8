use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageFormat, ImageReader, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;

/// Encodings the generative service accepts without conversion.
const SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Zero when the bytes could not be probed.
    pub width: u32,
    pub height: u32,
}

impl ImageData {
    /// Sniffs the encoding from the bytes; `mime_hint` is only used when
    /// sniffing fails.
    pub fn from_bytes(bytes: Vec<u8>, mime_hint: Option<&str>) -> Self {
        let sniffed = image::guess_format(&bytes)
            .ok()
            .map(|format| format.to_mime_type().to_string());
        let mime_type = sniffed
            .or_else(|| mime_hint.map(normalize_mime))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let (width, height) = probe_dimensions(&bytes).unwrap_or((0, 0));
        Self {
            bytes,
            mime_type,
            width,
            height,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Self::from_bytes(bytes, Some(mime_for_path(path))))
    }

    /// Parses `data:<mime>;base64,<payload>`. Whitespace inside the payload
    /// is ignored.
    pub fn from_data_url(raw: &str) -> Result<Self> {
        let Some(rest) = raw.trim().strip_prefix("data:") else {
            bail!("image data URL must start with 'data:'");
        };
        let Some((header, payload)) = rest.split_once(',') else {
            bail!("image data URL is missing its payload");
        };
        let Some(mime) = header.strip_suffix(";base64") else {
            bail!("image data URL must be base64 encoded");
        };
        let cleaned: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
        let bytes = BASE64
            .decode(cleaned.as_bytes())
            .context("image data URL base64 decode failed")?;
        Ok(Self::from_bytes(bytes, Some(mime)))
    }

    pub fn base64_payload(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_payload())
    }

    /// Short content fingerprint for event logs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(&hasher.finalize()[..8])
    }

    fn is_oversized(&self, max_dimension: u32) -> bool {
        self.width > max_dimension || self.height > max_dimension
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub image: ImageData,
    pub resized: bool,
    pub transcoded: bool,
    /// Non-fatal problems; the image is still usable.
    pub warnings: Vec<String>,
}

impl NormalizedImage {
    fn unchanged(image: &ImageData) -> Self {
        Self {
            image: image.clone(),
            resized: false,
            transcoded: false,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    max_dimension: u32,
    transcode_quality: u8,
    storage_max_dimension: u32,
    storage_quality: u8,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl ImagePreprocessor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            max_dimension: config.max_dimension,
            transcode_quality: config.transcode_quality,
            storage_max_dimension: config.storage_max_dimension,
            storage_quality: config.storage_quality,
        }
    }

    /// Never fails: anything that goes wrong yields the original image plus
    /// a warning.
    pub fn normalize(&self, image: &ImageData) -> NormalizedImage {
        match self.try_normalize(image) {
            Ok(normalized) => normalized,
            Err(err) => {
                let mut fallback = NormalizedImage::unchanged(image);
                fallback.warnings.push(format!(
                    "Image preprocessing failed; sending original ({err:#})."
                ));
                fallback
            }
        }
    }

    fn try_normalize(&self, image: &ImageData) -> Result<NormalizedImage> {
        let supported = is_supported_mime(&image.mime_type);
        let probed = image.width > 0 && image.height > 0;
        if supported && probed && !image.is_oversized(self.max_dimension) {
            return Ok(NormalizedImage::unchanged(image));
        }

        let decoded = image::load_from_memory(&image.bytes)
            .with_context(|| format!("failed decoding {} image", image.mime_type))?;
        let oversized =
            decoded.width() > self.max_dimension || decoded.height() > self.max_dimension;
        if supported && !oversized {
            let mut unchanged = NormalizedImage::unchanged(image);
            unchanged.image.width = decoded.width();
            unchanged.image.height = decoded.height();
            return Ok(unchanged);
        }

        let output = if oversized {
            decoded.resize(self.max_dimension, self.max_dimension, FilterType::Triangle)
        } else {
            decoded
        };
        let (bytes, mime_type) = if image.mime_type == "image/png" {
            (encode_png(&output)?, "image/png".to_string())
        } else {
            (
                encode_jpeg(&output, self.transcode_quality)?,
                "image/jpeg".to_string(),
            )
        };

        Ok(NormalizedImage {
            image: ImageData {
                bytes,
                mime_type,
                width: output.width(),
                height: output.height(),
            },
            resized: oversized,
            transcoded: !supported,
            warnings: Vec::new(),
        })
    }

    /// Smaller, lossier copy for embedding in stored results.
    pub fn compress_for_storage(&self, image: &ImageData) -> Result<ImageData> {
        let decoded = image::load_from_memory(&image.bytes)
            .context("failed decoding image for storage compression")?;
        let output = if decoded.width() > self.storage_max_dimension
            || decoded.height() > self.storage_max_dimension
        {
            decoded.resize(
                self.storage_max_dimension,
                self.storage_max_dimension,
                FilterType::Triangle,
            )
        } else {
            decoded
        };
        Ok(ImageData {
            bytes: encode_jpeg(&output, self.storage_quality)?,
            mime_type: "image/jpeg".to_string(),
            width: output.width(),
            height: output.height(),
        })
    }
}

pub fn is_supported_mime(mime_type: &str) -> bool {
    let normalized = normalize_mime(mime_type);
    SUPPORTED_MIME_TYPES
        .iter()
        .any(|supported| *supported == normalized)
}

fn normalize_mime(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => lowered,
    }
}

fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "heic" | "heif" => "image/heic",
        _ => "image/png",
    }
}

/// Flattens transparency onto white; JPEG has no alpha channel.
fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }
    flattened
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let flattened = flatten_onto_white(image);
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode(
            flattened.as_raw(),
            flattened.width(),
            flattened.height(),
            ExtendedColorType::Rgb8,
        )
        .context("jpeg encode failed")?;
    Ok(bytes)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("png encode failed")?;
    Ok(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    use super::{ImageData, ImagePreprocessor};

    pub(crate) fn encoded_image(width: u32, height: u32, format: ImageFormat) -> ImageData {
        let mut canvas = RgbImage::new(width, height);
        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 256) as u8, (y % 256) as u8, 90]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        ImageData::from_bytes(bytes, None)
    }

    #[test]
    fn from_bytes_sniffs_format_and_dimensions() {
        let image = encoded_image(40, 30, ImageFormat::Png);
        assert_eq!(image.mime_type, "image/png");
        assert_eq!((image.width, image.height), (40, 30));
    }

    #[test]
    fn small_supported_image_is_returned_unchanged() {
        let image = encoded_image(64, 48, ImageFormat::Jpeg);
        let normalized = ImagePreprocessor::default().normalize(&image);
        assert_eq!(normalized.image, image);
        assert!(!normalized.resized);
        assert!(!normalized.transcoded);
        assert!(normalized.warnings.is_empty());
    }

    #[test]
    fn oversized_image_is_downscaled_preserving_aspect_ratio() {
        let image = encoded_image(2048, 1024, ImageFormat::Png);
        let normalized = ImagePreprocessor::default().normalize(&image);
        assert!(normalized.resized);
        assert_eq!(normalized.image.mime_type, "image/png");
        assert_eq!((normalized.image.width, normalized.image.height), (1024, 512));

        let reread = ImageData::from_bytes(normalized.image.bytes.clone(), None);
        assert_eq!((reread.width, reread.height), (1024, 512));
    }

    #[test]
    fn portrait_image_is_bounded_by_height() {
        let image = encoded_image(600, 1500, ImageFormat::Jpeg);
        let normalized = ImagePreprocessor::default().normalize(&image);
        assert!(normalized.image.height <= 1024);
        assert!(normalized.image.width <= 1024);
        assert_eq!(normalized.image.height, 1024);
        assert!((normalized.image.width as i64 - 410).abs() <= 1);
    }

    #[test]
    fn unsupported_encoding_is_transcoded_to_jpeg() {
        let image = encoded_image(32, 32, ImageFormat::Bmp);
        assert_eq!(image.mime_type, "image/bmp");

        let normalized = ImagePreprocessor::default().normalize(&image);
        assert!(normalized.transcoded);
        assert_eq!(normalized.image.mime_type, "image/jpeg");
        assert_eq!(
            image::guess_format(&normalized.image.bytes).ok(),
            Some(ImageFormat::Jpeg)
        );
    }

    #[test]
    fn undecodable_bytes_fall_back_to_original_with_warning() {
        let image = ImageData::from_bytes(b"definitely not an image".to_vec(), Some("image/webp"));
        let normalized = ImagePreprocessor::default().normalize(&image);
        assert_eq!(normalized.image, image);
        assert_eq!(normalized.warnings.len(), 1);
        assert!(normalized.warnings[0].contains("Image preprocessing failed"));
    }

    #[test]
    fn storage_copy_is_smaller_jpeg() -> anyhow::Result<()> {
        let mut canvas = RgbaImage::new(1200, 900);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgba([10, 200, 30, 128]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(canvas).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        let image = ImageData::from_bytes(bytes, None);

        let stored = ImagePreprocessor::default().compress_for_storage(&image)?;
        assert_eq!(stored.mime_type, "image/jpeg");
        assert_eq!((stored.width, stored.height), (768, 576));
        Ok(())
    }

    #[test]
    fn data_url_round_trip_keeps_bytes() -> anyhow::Result<()> {
        let image = encoded_image(8, 8, ImageFormat::Png);
        let url = image.to_data_url();
        assert!(url.starts_with("data:image/png;base64,"));
        let parsed = ImageData::from_data_url(&format!("{}\n", url))?;
        assert_eq!(parsed, image);
        assert!(ImageData::from_data_url("not-a-data-url").is_err());
        assert_eq!(image.digest().len(), 16);
        Ok(())
    }
}
