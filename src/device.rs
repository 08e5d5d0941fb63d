//! V4L2 device implementation using the v4l crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, DeviceOpener, Format, FourCC,
    FrameMetadata, RawFrame, Result,
};

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    path: PathBuf,
    capabilities: DeviceCapabilities,
    read_timeout: Duration,
}

impl V4L2Device {
    /// Open a V4L2 device by path (e.g. `/dev/video0` or a udev symlink).
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CameraError::DeviceNotFound(path.to_path_buf()));
        }

        let device = Device::with_path(path)
            .map_err(|err| CameraError::DeviceOpenFailed(format!("{}: {err}", path.display())))?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        if !capabilities.can_capture {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{} does not support video capture",
                path.display()
            )));
        }

        Ok(Self {
            device,
            path: path.to_path_buf(),
            capabilities,
            read_timeout: Duration::from_secs(2),
        })
    }

    /// Bound every blocking read on streams created from this device.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CameraDevice for V4L2Device {
    type Stream = V4L2Stream;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        let fmt = self
            .device
            .format()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        let actual = Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        };
        if actual.fourcc != format.fourcc {
            return Err(CameraError::FormatNotSupported(format.clone()));
        }
        Ok(actual)
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        let params = self
            .device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        let interval = params.interval;
        if interval.numerator == 0 {
            return Ok(fps);
        }
        Ok(interval.denominator / interval.numerator)
    }

    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream> {
        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, buffer_count)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        stream.set_timeout(self.read_timeout);

        debug!(device = %self.path.display(), buffer_count, "stream created");
        Ok(V4L2Stream { stream })
    }
}

/// V4L2 capture stream wrapping mmap-based streaming.
///
/// Holds its own reference to the file handle; the descriptor closes once
/// both the stream and its device are gone.
pub struct V4L2Stream {
    stream: Stream<'static>,
}

impl CaptureStream for V4L2Stream {
    fn next_frame(&mut self) -> Result<RawFrame> {
        let (buf, meta) = self.stream.next().map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                CameraError::Timeout
            } else {
                CameraError::DeviceReadFailed(err.to_string())
            }
        })?;

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        // Compressed payloads are shorter than the mapped buffer
        let used = usize::try_from(meta.bytesused).unwrap_or(buf.len());
        let data = buf.get(..used).unwrap_or(buf).to_vec();

        Ok(RawFrame {
            data,
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        })
    }
}

/// Opens [`V4L2Device`]s with a fixed read timeout.
#[derive(Debug, Clone)]
pub struct V4L2Opener {
    read_timeout: Duration,
}

impl V4L2Opener {
    /// Create an opener whose streams give up on a read after `read_timeout`.
    #[must_use]
    pub const fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for V4L2Opener {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl DeviceOpener for V4L2Opener {
    type Device = V4L2Device;

    fn open(&self, path: &Path) -> Result<Self::Device> {
        Ok(V4L2Device::open(path)?.with_read_timeout(self.read_timeout))
    }
}
