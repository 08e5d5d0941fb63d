//! Per-camera acquisition thread.
//!
//! Each camera gets one thread that reads frames at the device's native
//! rate and publishes them into its [`Camera`] aggregate. A failed read
//! closes the device and reopens it under a bounded [`RetryPolicy`]; once
//! the policy is exhausted the camera is marked disabled and the thread
//! exits, leaving every other camera untouched.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::camera::{Camera, CameraState};
use crate::frame::{CapturedFrame, PixelBuffer, PixelFormat};
use crate::shutdown::StopSignal;
use crate::traits::{CameraDevice, CameraError, CaptureStream, DeviceOpener, Format, FourCC};

/// Backoff schedule for reopening a device after a read failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Reopen attempts before the camera is disabled.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before the zero-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_backoff
        }
    }
}

/// How a camera is opened and read.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Requested resolution and pixel format.
    pub format: Format,
    /// Requested frame rate.
    pub fps: u32,
    /// Driver buffers to queue.
    pub buffer_count: u32,
    /// Consecutive read timeouts tolerated before the device counts as failed.
    pub stall_limit: u32,
    /// Reopen schedule after a read failure.
    pub retry: RetryPolicy,
    /// How long [`CaptureHandle::stop`] waits for the thread.
    pub stop_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            format: Format::new(1280, 720, FourCC::MJPG),
            fps: 30,
            buffer_count: 4,
            stall_limit: 5,
            retry: RetryPolicy::default(),
            stop_timeout: Duration::from_secs(3),
        }
    }
}

/// Open `camera`'s device and negotiate format and frame rate.
///
/// Fails if the driver settles on a pixel format frames cannot be decoded
/// from.
pub fn open<O: DeviceOpener>(
    opener: &O,
    camera: &Camera,
    settings: &CaptureSettings,
) -> Result<(O::Device, Format), CameraError> {
    let (device, format) = configure(opener, camera.device(), settings)?;
    camera.set_resolution((format.width, format.height));
    info!(
        camera = %camera.name(),
        device = %camera.device().display(),
        format = %format.fourcc,
        width = format.width,
        height = format.height,
        "camera opened"
    );
    Ok((device, format))
}

fn configure<O: DeviceOpener>(
    opener: &O,
    path: &Path,
    settings: &CaptureSettings,
) -> Result<(O::Device, Format), CameraError> {
    let mut device = opener.open(path)?;
    let format = device.set_format(&settings.format)?;
    if PixelFormat::from_fourcc(format.fourcc).is_none() {
        return Err(CameraError::FormatNotSupported(format));
    }

    match device.set_frame_rate(settings.fps) {
        Ok(actual) if actual != settings.fps => {
            info!(device = %path.display(), requested = settings.fps, actual, "frame rate adjusted by driver");
        }
        Ok(_) => {}
        Err(err) => {
            warn!(device = %path.display(), error = %err, "frame rate request ignored");
        }
    }
    Ok((device, format))
}

/// Open the device and start acquiring.
pub fn start<O: DeviceOpener>(
    camera: Arc<Camera>,
    opener: Arc<O>,
    settings: CaptureSettings,
) -> Result<CaptureHandle, CameraError> {
    let (device, format) = open(opener.as_ref(), &camera, &settings)?;
    Ok(spawn(camera, opener, device, format, settings)?)
}

/// Start acquiring from an already opened device.
pub fn spawn<O: DeviceOpener>(
    camera: Arc<Camera>,
    opener: Arc<O>,
    device: O::Device,
    format: Format,
    settings: CaptureSettings,
) -> io::Result<CaptureHandle> {
    let stop = StopSignal::new();
    let (exited_tx, exited) = bounded::<()>(0);
    let stop_timeout = settings.stop_timeout;
    let slot: DeviceSlot<O::Device> = Arc::new(Mutex::new(Some(device)));

    camera.set_state(CameraState::Running);
    let handle = thread::Builder::new()
        .name(format!("capture-{}", camera.name()))
        .spawn({
            let camera = Arc::clone(&camera);
            let stop = stop.clone();
            let slot = Arc::clone(&slot);
            move || {
                let _exited = exited_tx;
                run_capture(&camera, opener.as_ref(), &slot, format, &settings, &stop);
            }
        });

    let handle = match handle {
        Ok(handle) => handle,
        Err(err) => {
            camera.set_state(CameraState::Disabled(format!("capture thread: {err}")));
            return Err(err);
        }
    };

    Ok(CaptureHandle {
        camera,
        stop,
        exited,
        handle: Some(handle),
        stop_timeout,
        release: Box::new(move || slot.lock().take().is_some()),
    })
}

/// The open device of a capture thread, reachable from its handle so a stuck
/// thread's device can still be released.
type DeviceSlot<D> = Arc<Mutex<Option<D>>>;

/// Running acquisition thread of one camera.
pub struct CaptureHandle {
    camera: Arc<Camera>,
    stop: StopSignal,
    exited: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
    release: Box<dyn Fn() -> bool + Send + Sync>,
}

impl CaptureHandle {
    /// The camera being captured.
    pub fn camera(&self) -> &Arc<Camera> {
        &self.camera
    }

    /// Whether the thread has exited, on request or after being disabled.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the thread to stop and wait for it up to the configured timeout.
    ///
    /// Returns `false` if the thread was stuck. Its device is then dropped
    /// right away and the thread is abandoned; buffers held by the blocked
    /// stream go when its read returns. Calling this again after it returned
    /// is a no-op.
    pub fn stop(&mut self) -> bool {
        self.stop.trigger();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.exited.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!(camera = %self.camera.name(), "capture thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                let released = (self.release)();
                error!(
                    camera = %self.camera.name(),
                    timeout = ?self.stop_timeout,
                    released,
                    "capture thread did not stop in time, device released"
                );
                self.camera.set_state(CameraState::Stopped);
                false
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Reopen<D> {
    Ready(D, Format),
    Stopped,
    Exhausted(String),
}

fn run_capture<O: DeviceOpener>(
    camera: &Camera,
    opener: &O,
    slot: &DeviceSlot<O::Device>,
    mut format: Format,
    settings: &CaptureSettings,
    stop: &StopSignal,
) {
    debug!(camera = %camera.name(), "capture started");
    let mut sequence = 0u64;

    loop {
        let Err(err) = stream_frames(camera, slot, &format, settings, stop, &mut sequence) else {
            break;
        };

        warn!(camera = %camera.name(), error = %err, "capture failed, reopening device");
        camera.set_state(CameraState::Reopening);
        drop(slot.lock().take());

        match reopen(camera, opener, settings, stop) {
            Reopen::Ready(reopened, negotiated) => {
                if stop.is_triggered() {
                    break;
                }
                *slot.lock() = Some(reopened);
                format = negotiated;
                camera.set_resolution((format.width, format.height));
                camera.set_state(CameraState::Running);
            }
            Reopen::Stopped => break,
            Reopen::Exhausted(reason) => {
                error!(camera = %camera.name(), %reason, "camera disabled");
                camera.set_state(CameraState::Disabled(reason));
                return;
            }
        }
    }

    drop(slot.lock().take());
    camera.set_state(CameraState::Stopped);
    debug!(camera = %camera.name(), frames = sequence, "capture stopped");
}

/// Read until stopped (`Ok`) or until the device fails (`Err`).
///
/// The slot is only locked while the stream is created, never during reads.
fn stream_frames<D: CameraDevice>(
    camera: &Camera,
    slot: &DeviceSlot<D>,
    format: &Format,
    settings: &CaptureSettings,
    stop: &StopSignal,
    sequence: &mut u64,
) -> Result<(), CameraError> {
    let mut stream = {
        let mut guard = slot.lock();
        let Some(device) = guard.as_mut() else {
            // Released by a timed out stop
            return Ok(());
        };
        device.create_stream(settings.buffer_count)?
    };
    let mut stalled = 0u32;

    while !stop.is_triggered() {
        let raw = match stream.next_frame() {
            Ok(raw) => raw,
            Err(CameraError::Timeout) => {
                stalled += 1;
                debug!(camera = %camera.name(), stalled, "frame read timed out");
                if stalled >= settings.stall_limit {
                    return Err(CameraError::DeviceReadFailed(format!(
                        "no frame after {stalled} consecutive timeouts"
                    )));
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        stalled = 0;

        let image = PixelBuffer::from_device(format, raw.data)
            .ok_or_else(|| CameraError::FormatNotSupported(format.clone()))?;
        camera.publish(CapturedFrame::now(camera.name_arc(), *sequence, image));
        *sequence += 1;
    }

    Ok(())
}

fn reopen<O: DeviceOpener>(
    camera: &Camera,
    opener: &O,
    settings: &CaptureSettings,
    stop: &StopSignal,
) -> Reopen<O::Device> {
    let policy = &settings.retry;
    let mut last_error = String::from("no attempts allowed");

    for attempt in 0..policy.max_attempts {
        if stop.wait_timeout(policy.delay(attempt)) {
            return Reopen::Stopped;
        }
        match configure(opener, camera.device(), settings) {
            Ok((device, format)) => {
                info!(camera = %camera.name(), attempt = attempt + 1, "device reopened");
                return Reopen::Ready(device, format);
            }
            Err(err) => {
                warn!(camera = %camera.name(), attempt = attempt + 1, error = %err, "reopen failed");
                last_error = err.to_string();
            }
        }
    }

    Reopen::Exhausted(format!(
        "gave up after {} reopen attempts: {last_error}",
        policy.max_attempts
    ))
}
