//! Clip encoders.
//!
//! The recorder only needs "append a frame" and "finish": the default
//! [`MjpegEncoderFactory`] writes a Motion-JPEG elementary stream, one JPEG
//! per frame, which `ffplay -f mjpeg` and most players open directly.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// An open clip file accepting frames.
pub trait ClipEncoder: Send {
    /// Append one frame.
    fn write_frame(&mut self, frame: &RgbImage) -> io::Result<()>;

    /// Flush and close the file. Returns bytes written.
    fn finish(self: Box<Self>) -> io::Result<u64>;
}

/// Creates encoders for new clips.
pub trait EncoderFactory: Send + Sync {
    /// Codec identifier stored in clip metadata.
    fn codec(&self) -> &str;

    /// File extension of produced clips, without the dot.
    fn extension(&self) -> &str;

    /// Create a clip file at `path`.
    fn create(&self, path: &Path, width: u32, height: u32, fps: f64)
        -> io::Result<Box<dyn ClipEncoder>>;
}

/// Factory for Motion-JPEG stream clips.
#[derive(Debug, Clone, Copy)]
pub struct MjpegEncoderFactory {
    quality: u8,
}

impl Default for MjpegEncoderFactory {
    fn default() -> Self {
        Self::new(85)
    }
}

impl MjpegEncoderFactory {
    /// JPEG quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl EncoderFactory for MjpegEncoderFactory {
    fn codec(&self) -> &str {
        "MJPG"
    }

    fn extension(&self) -> &str {
        "mjpeg"
    }

    fn create(
        &self,
        path: &Path,
        _width: u32,
        _height: u32,
        _fps: f64,
    ) -> io::Result<Box<dyn ClipEncoder>> {
        let file = File::options().create_new(true).write(true).open(path)?;
        Ok(Box::new(MjpegClipEncoder {
            file: BufWriter::new(file),
            quality: self.quality,
            scratch: Vec::new(),
            bytes: 0,
        }))
    }
}

struct MjpegClipEncoder {
    file: BufWriter<File>,
    quality: u8,
    scratch: Vec<u8>,
    bytes: u64,
}

impl ClipEncoder for MjpegClipEncoder {
    fn write_frame(&mut self, frame: &RgbImage) -> io::Result<()> {
        self.scratch.clear();
        JpegEncoder::new_with_quality(&mut self.scratch, self.quality)
            .encode_image(frame)
            .map_err(io::Error::other)?;
        self.file.write_all(&self.scratch)?;
        self.bytes += self.scratch.len() as u64;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> io::Result<u64> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_mjpeg_clip_is_concatenated_jpegs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mjpeg");
        let factory = MjpegEncoderFactory::new(80);

        let mut encoder = factory.create(&path, 32, 24, 30.0).expect("create");
        let frame = RgbImage::from_pixel(32, 24, Rgb([10, 200, 30]));
        encoder.write_frame(&frame).expect("frame 1");
        encoder.write_frame(&frame).expect("frame 2");
        let bytes = encoder.finish().expect("finish");

        let data = std::fs::read(&path).expect("read clip");
        assert_eq!(data.len() as u64, bytes);
        let starts = data.windows(2).filter(|w| **w == [0xFF, 0xD8]).count();
        assert!(starts >= 2, "expected two SOI markers, found {starts}");
        assert_eq!(factory.codec(), "MJPG");
    }

    #[test]
    fn test_create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mjpeg");
        std::fs::write(&path, b"existing").expect("seed");

        let factory = MjpegEncoderFactory::default();
        assert!(factory.create(&path, 8, 8, 30.0).is_err());
    }
}
