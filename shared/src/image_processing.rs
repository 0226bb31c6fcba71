use std::io::Cursor;
use std::time::Instant;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, Limits, RgbImage};
use metrics::{counter, histogram};
use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::capture::ImageFormat;
use crate::config::PipelineConfig;

/// Gray fill for the letterbox padding, before normalization.
pub const PAD_VALUE: u8 = 114;

const MAX_DIMENSION: u32 = 15_000;
const MAX_ALLOC_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("failed to decode image: {reason}")]
    Decode { reason: String },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("preprocessing task aborted")]
    Aborted,
}

impl From<image::ImageError> for PreprocessError {
    fn from(e: image::ImageError) -> Self {
        PreprocessError::Decode {
            reason: e.to_string(),
        }
    }
}

/// Model input: `input_size x input_size x 3`, RGB interleaved per pixel,
/// row-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Array3<f32>,
}

impl Tensor {
    pub fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn filled(input_size: u32, value: f32) -> Self {
        let side = input_size as usize;
        Self {
            data: Array3::from_elem((side, side, 3), value),
        }
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Flat buffer in HWC order. Always available because the array is
    /// built in standard layout.
    pub fn as_slice(&self) -> Option<&[f32]> {
        self.data.as_slice()
    }

    pub fn pixel(&self, x: usize, y: usize) -> [f32; 3] {
        [
            self.data[[y, x, 0]],
            self.data[[y, x, 1]],
            self.data[[y, x, 2]],
        ]
    }

    /// `[1, 3, H, W]` copy for engines that take planar input.
    pub fn to_nchw(&self) -> Array4<f32> {
        self.data
            .view()
            .permuted_axes([2, 0, 1])
            .as_standard_layout()
            .into_owned()
            .insert_axis(Axis(0))
    }
}

/// Parameters of the letterbox transform, needed to map boxes back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LetterboxMeta {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub input_size: u32,
}

impl LetterboxMeta {
    pub fn compute(original_width: u32, original_height: u32, input_size: u32) -> Self {
        let width = original_width.max(1);
        let height = original_height.max(1);

        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);

        let resized_width = ((width as f32 * scale).round() as u32).clamp(1, input_size);
        let resized_height = ((height as f32 * scale).round() as u32).clamp(1, input_size);

        Self {
            scale,
            offset_x: (input_size - resized_width) / 2,
            offset_y: (input_size - resized_height) / 2,
            resized_width,
            resized_height,
            original_width: width,
            original_height: height,
            input_size,
        }
    }

    /// Effective horizontal scale after rounding the resized width.
    pub fn scale_x(&self) -> f32 {
        self.resized_width as f32 / self.original_width as f32
    }

    /// Effective vertical scale after rounding the resized height.
    pub fn scale_y(&self) -> f32 {
        self.resized_height as f32 / self.original_height as f32
    }
}

/// Decodes an image and letterboxes it into the model input tensor.
///
/// Resizing uses bilinear filtering (`FilterType::Triangle`). The resized
/// image is centered on a gray canvas; odd padding puts the extra pixel on
/// the right/bottom edge.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    input_size: u32,
    max_input_bytes: usize,
    max_image_pixels: u64,
}

impl ImagePreprocessor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            input_size: config.input_size,
            max_input_bytes: config.max_input_bytes,
            max_image_pixels: config.max_image_pixels,
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Decodes encoded bytes and prepares the tensor on the blocking pool.
    #[instrument(skip(self, data), fields(input_size = data.len()))]
    pub async fn prepare_async(
        &self,
        data: Bytes,
    ) -> Result<(Tensor, LetterboxMeta), PreprocessError> {
        let start = Instant::now();
        let this = self.clone();

        let result = tokio::task::spawn_blocking(move || this.prepare(&data))
            .await
            .map_err(|_| PreprocessError::Aborted)?;

        histogram!("preprocess.duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &result {
            counter!("preprocess.errors").increment(1);
            warn!(error = %e, "preprocessing failed");
        }

        result
    }

    pub fn prepare(&self, data: &[u8]) -> Result<(Tensor, LetterboxMeta), PreprocessError> {
        let img = self.decode(data)?;
        Ok(self.prepare_image(&img.to_rgb8()))
    }

    /// Letterboxes an already decoded RGB image.
    pub fn prepare_image(&self, rgb: &RgbImage) -> (Tensor, LetterboxMeta) {
        let (orig_w, orig_h) = rgb.dimensions();
        let meta = LetterboxMeta::compute(orig_w, orig_h, self.input_size);

        let resized;
        let source = if meta.resized_width == orig_w && meta.resized_height == orig_h {
            rgb
        } else {
            resized = image::imageops::resize(
                rgb,
                meta.resized_width,
                meta.resized_height,
                FilterType::Triangle,
            );
            &resized
        };

        let side = self.input_size as usize;
        let mut canvas =
            Array3::<f32>::from_elem((side, side, 3), f32::from(PAD_VALUE) / 255.0);

        let offset_x = meta.offset_x as usize;
        let offset_y = meta.offset_y as usize;
        let src_w = source.width() as usize;
        let raw = source.as_raw();

        for y in 0..source.height() as usize {
            for x in 0..src_w {
                let src_idx = (y * src_w + x) * 3;
                for c in 0..3 {
                    canvas[[offset_y + y, offset_x + x, c]] = f32::from(raw[src_idx + c]) / 255.0;
                }
            }
        }

        debug!(
            orig_w,
            orig_h,
            scale = meta.scale,
            offset_x = meta.offset_x,
            offset_y = meta.offset_y,
            "letterboxed image"
        );

        (Tensor::from_array(canvas), meta)
    }

    fn decode(&self, data: &[u8]) -> Result<DynamicImage, PreprocessError> {
        if data.is_empty() {
            return Err(PreprocessError::EmptyInput);
        }

        if data.len() > self.max_input_bytes {
            return Err(PreprocessError::InputTooLarge {
                size: data.len(),
                max_size: self.max_input_bytes,
            });
        }

        let format = ImageFormat::from_magic_bytes(data)
            .and_then(ImageFormat::to_image_format)
            .ok_or(PreprocessError::UnsupportedFormat)?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_DIMENSION);
        limits.max_image_height = Some(MAX_DIMENSION);
        limits.max_alloc = Some(MAX_ALLOC_BYTES);

        let mut reader = ImageReader::with_format(Cursor::new(data), format);
        reader.limits(limits);

        let img = reader.decode()?;
        let (width, height) = img.dimensions();

        if width == 0 || height == 0 {
            return Err(PreprocessError::InvalidDimensions { width, height });
        }

        let pixels = u64::from(width) * u64::from(height);
        if pixels > self.max_image_pixels {
            return Err(PreprocessError::ImageTooLarge {
                width,
                height,
                pixels,
                max_pixels: self.max_image_pixels,
            });
        }

        Ok(img)
    }
}
