//! Core traits and types for the camera device seam.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// GREY pixel format (8-bit luma).
    pub const GREY: Self = Self::new(b"GREY");

    /// Bytes per pixel for packed formats, `None` for compressed ones.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" => Some(2),
            b"RGB3" => Some(3),
            b"GREY" => Some(1),
            _ => None,
        }
    }

    /// Parse a four character code such as `"MJPG"`.
    pub fn parse(code: &str) -> Option<Self> {
        let bytes: [u8; 4] = code.as_bytes().try_into().ok()?;
        Some(Self(bytes.map(|b| b.to_ascii_uppercase())))
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride), zero for compressed formats.
    pub stride: u32,
    /// Total frame size in bytes (upper bound for compressed formats).
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let (stride, size) = match fourcc.bytes_per_pixel() {
            Some(bpp) => (width * bpp, width * bpp * height),
            // Compressed frames never exceed the packed 4:2:2 size in practice
            None => (0, width * 2 * height),
        };
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Metadata for a frame as delivered by the driver.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Driver timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A frame exactly as it came out of the device buffer.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Error type for camera device operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device with given path was not found.
    #[error("device {} not found", .0.display())]
    DeviceNotFound(PathBuf),
    /// Failed to open device.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// Reading a frame failed; recoverable by reopening the device.
    #[error("failed to read frame: {0}")]
    DeviceReadFailed(String),
    /// Requested format is not supported.
    #[error("format not supported: {0:?}")]
    FormatNotSupported(Format),
    /// Error during streaming setup.
    #[error("stream error: {0}")]
    StreamError(String),
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over camera device operations.
pub trait CameraDevice: Send {
    /// The stream type returned by `create_stream`.
    ///
    /// Streams own their buffers and do not borrow the device, so a device
    /// can be dropped while a read on one of its streams is still blocked.
    type Stream: CaptureStream + 'static;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Request a frame rate. Returns the rate the driver settled on.
    fn set_frame_rate(&mut self, fps: u32) -> Result<u32>;

    /// Create a capture stream with the specified number of buffers.
    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream>;
}

/// Abstraction over capture stream operations.
pub trait CaptureStream {
    /// Capture the next frame from the stream.
    ///
    /// Implementations must return within a bounded time so the capture
    /// loop can observe stop requests.
    fn next_frame(&mut self) -> Result<RawFrame>;
}

/// Opens devices by path. Used for the initial open and for every reopen
/// after a read failure.
pub trait DeviceOpener: Send + Sync + 'static {
    /// Concrete device type produced by this opener.
    type Device: CameraDevice + 'static;

    /// Open the device at `path`.
    fn open(&self, path: &Path) -> Result<Self::Device>;
}
