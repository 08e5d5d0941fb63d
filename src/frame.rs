//! Pixel buffers and timestamped frames handed between pipeline stages.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use thiserror::Error;

use crate::traits::{Format, FourCC};

/// Layout of the bytes in a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, `[Y0 U Y1 V]` per pixel pair.
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb24,
    /// 8-bit luma only.
    Gray8,
    /// One JPEG image per frame.
    Mjpeg,
}

impl PixelFormat {
    /// Map a negotiated device format onto a buffer layout.
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match fourcc {
            FourCC::YUYV => Some(Self::Yuyv),
            FourCC::RGB3 => Some(Self::Rgb24),
            FourCC::GREY => Some(Self::Gray8),
            FourCC::MJPG => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// Errors raised when interpreting a pixel buffer.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Buffer is shorter than its dimensions require.
    #[error("buffer holds {actual} bytes, {expected} needed for {width}x{height}")]
    Truncated {
        /// Frame width.
        width: u32,
        /// Frame height.
        height: u32,
        /// Bytes required.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },
    /// Compressed payload could not be decoded.
    #[error("failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

/// Immutable pixel data of one frame.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Byte layout.
    pub format: PixelFormat,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap device bytes captured with `format`.
    pub fn from_device(format: &Format, data: Vec<u8>) -> Option<Self> {
        Some(Self {
            width: format.width,
            height: format.height,
            format: PixelFormat::from_fourcc(format.fourcc)?,
            data,
        })
    }

    /// Uniform gray frame, mostly useful for synthetic sources.
    #[must_use]
    pub fn gray(width: u32, height: u32, level: u8) -> Self {
        let len = (width as usize) * (height as usize);
        Self {
            width,
            height,
            format: PixelFormat::Gray8,
            data: vec![level; len],
        }
    }

    fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    fn require(&self, expected: usize) -> Result<(), FrameError> {
        if self.data.len() < expected {
            return Err(FrameError::Truncated {
                width: self.width,
                height: self.height,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Mean of the grayscale-converted frame (0..=255).
    pub fn mean_luma(&self) -> Result<f64, FrameError> {
        let pixels = self.pixel_count();
        if pixels == 0 {
            return Ok(0.0);
        }

        let sum: u64 = match self.format {
            PixelFormat::Gray8 => {
                self.require(pixels)?;
                self.data.iter().take(pixels).map(|&y| u64::from(y)).sum()
            }
            PixelFormat::Yuyv => {
                self.require(pixels * 2)?;
                // Luma sits on every even byte
                self.data
                    .iter()
                    .take(pixels * 2)
                    .step_by(2)
                    .map(|&y| u64::from(y))
                    .sum()
            }
            PixelFormat::Rgb24 => {
                self.require(pixels * 3)?;
                self.data
                    .chunks_exact(3)
                    .take(pixels)
                    .map(|px| match px {
                        [r, g, b] => u64::from(rgb_luma(*r, *g, *b)),
                        _ => 0,
                    })
                    .sum()
            }
            PixelFormat::Mjpeg => {
                let decoded = image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)?;
                let luma = decoded.to_luma8();
                let count = luma.as_raw().len().max(1);
                let sum: u64 = luma.as_raw().iter().map(|&y| u64::from(y)).sum();
                #[allow(clippy::cast_precision_loss)]
                return Ok(sum as f64 / count as f64);
            }
        };

        #[allow(clippy::cast_precision_loss)]
        Ok(sum as f64 / pixels as f64)
    }

    /// Convert to an owned RGB image (a copy, the buffer itself is untouched).
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        let pixels = self.pixel_count();
        let rgb = match self.format {
            PixelFormat::Rgb24 => {
                self.require(pixels * 3)?;
                self.data.get(..pixels * 3).unwrap_or_default().to_vec()
            }
            PixelFormat::Gray8 => {
                self.require(pixels)?;
                self.data
                    .iter()
                    .take(pixels)
                    .flat_map(|&y| [y, y, y])
                    .collect()
            }
            PixelFormat::Yuyv => {
                self.require(pixels * 2)?;
                let mut out = Vec::with_capacity(pixels * 3);
                for quad in self.data.chunks_exact(4).take(pixels / 2) {
                    if let [y0, u, y1, v] = *quad {
                        let (r, g, b) = yuv_to_rgb(y0, u, v);
                        out.extend_from_slice(&[r, g, b]);
                        let (r, g, b) = yuv_to_rgb(y1, u, v);
                        out.extend_from_slice(&[r, g, b]);
                    }
                }
                out
            }
            PixelFormat::Mjpeg => {
                let decoded = image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)?;
                return Ok(decoded.to_rgb8());
            }
        };

        let expected = pixels * 3;
        let actual = rgb.len();
        RgbImage::from_raw(self.width, self.height, rgb).ok_or(FrameError::Truncated {
            width: self.width,
            height: self.height,
            expected,
            actual,
        })
    }
}

/// A frame tagged with its capture time and owning camera.
///
/// Cloning is cheap: the pixel data is shared between the live-view and
/// recorder consumers and never mutated after capture.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Logical name of the camera that produced the frame.
    pub camera: Arc<str>,
    /// Per-camera capture sequence number.
    pub sequence: u64,
    /// Monotonic capture time.
    pub captured_at: Instant,
    /// Wall-clock capture time.
    pub wall_clock: DateTime<Utc>,
    /// Pixel data.
    pub image: Arc<PixelBuffer>,
}

impl CapturedFrame {
    /// Tag `image` with the current time.
    pub fn now(camera: Arc<str>, sequence: u64, image: PixelBuffer) -> Self {
        Self::at(camera, sequence, image, Instant::now(), Utc::now())
    }

    /// Tag `image` with explicit timestamps.
    pub fn at(
        camera: Arc<str>,
        sequence: u64,
        image: PixelBuffer,
        captured_at: Instant,
        wall_clock: DateTime<Utc>,
    ) -> Self {
        Self {
            camera,
            sequence,
            captured_at,
            wall_clock,
            image: Arc::new(image),
        }
    }

    /// `(width, height)` of the pixel data.
    pub fn resolution(&self) -> (u32, u32) {
        (self.image.width, self.image.height)
    }
}

/// Rec. 601 luma of an RGB triple, matching the usual BGR-to-gray conversion.
fn rgb_luma(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.114f32.mul_add(f32::from(b), 0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)));
    clamp_channel(y)
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    (clamp_channel(r), clamp_channel(g), clamp_channel(b))
}

fn clamp_channel(val: f32) -> u8 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        val.round().clamp(0.0, 255.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuyv(width: u32, height: u32, y: u8) -> PixelBuffer {
        let mut data = Vec::new();
        for _ in 0..(width * height / 2) {
            data.extend_from_slice(&[y, 128, y, 128]);
        }
        PixelBuffer {
            width,
            height,
            format: PixelFormat::Yuyv,
            data,
        }
    }

    #[test]
    fn test_mean_luma_gray() {
        let buf = PixelBuffer::gray(8, 4, 100);
        let luma = buf.mean_luma().expect("luma");
        assert!((luma - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mean_luma_yuyv_ignores_chroma() {
        let buf = yuyv(16, 8, 60);
        let luma = buf.mean_luma().expect("luma");
        assert!((luma - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mean_luma_rgb_weights() {
        let buf = PixelBuffer {
            width: 2,
            height: 1,
            format: PixelFormat::Rgb24,
            data: vec![255, 255, 255, 0, 0, 0],
        };
        let luma = buf.mean_luma().expect("luma");
        assert!((luma - 127.5).abs() < 1.0);
    }

    #[test]
    fn test_truncated_buffer_is_an_error() {
        let mut buf = PixelBuffer::gray(8, 8, 10);
        buf.data.truncate(10);
        assert!(matches!(buf.mean_luma(), Err(FrameError::Truncated { .. })));
        assert!(buf.to_rgb().is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma() {
        let rgb = yuyv(4, 2, 128).to_rgb().expect("rgb");
        assert_eq!(rgb.dimensions(), (4, 2));
        assert_eq!(rgb.get_pixel(3, 1).0, [128, 128, 128]);
    }

    #[test]
    fn test_mjpeg_round_trips_through_decoder() {
        let source = RgbImage::from_pixel(16, 16, image::Rgb([200, 200, 200]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&source)
            .expect("encode");

        let buf = PixelBuffer {
            width: 16,
            height: 16,
            format: PixelFormat::Mjpeg,
            data: jpeg,
        };
        let luma = buf.mean_luma().expect("luma");
        assert!((luma - 200.0).abs() < 3.0, "luma was {luma}");
        assert_eq!(buf.to_rgb().expect("rgb").dimensions(), (16, 16));
    }

    #[test]
    fn test_corrupt_mjpeg_reports_decode_error() {
        let buf = PixelBuffer {
            width: 16,
            height: 16,
            format: PixelFormat::Mjpeg,
            data: vec![0xFF, 0xD8, 0x00],
        };
        assert!(matches!(buf.mean_luma(), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_yuv_to_rgb_white_and_black() {
        assert_eq!(yuv_to_rgb(255, 128, 128), (255, 255, 255));
        assert_eq!(yuv_to_rgb(0, 128, 128), (0, 0, 0));
    }
}
