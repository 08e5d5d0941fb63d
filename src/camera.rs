//! The per-camera aggregate: identity, queues, counters, control values and
//! the clip lock.
//!
//! Everything the pipeline knows about one camera lives in a single
//! [`Camera`]. The capture loop publishes into it, the clip writer and the
//! exposure controller consume from it, and the supervisor reads its stats.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::clip::{ClipContext, ClipRecorder, RecorderStats};
use crate::frame::CapturedFrame;

/// Identity of a camera: a logical name and a stable device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSpec {
    /// Logical name, used in clip names and logs.
    pub name: String,
    /// Device path, typically a udev symlink such as `/dev/camera_lr`.
    pub device: PathBuf,
}

impl CameraSpec {
    /// Create a spec from parts.
    pub fn new(name: impl Into<String>, device: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            device: device.into(),
        }
    }
}

impl FromStr for CameraSpec {
    type Err = String;

    /// Parse `NAME=DEVICE`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, device) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=DEVICE, got {s:?}"))?;
        let name = name.trim();
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(format!("invalid camera name {name:?}"));
        }
        if device.trim().is_empty() {
            return Err(format!("camera {name} has no device path"));
        }
        Ok(Self::new(name, device.trim()))
    }
}

/// Lifecycle of a camera's acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum CameraState {
    /// Not started yet.
    Idle,
    /// Capturing frames.
    Running,
    /// Read failed, trying to reopen the device.
    Reopening,
    /// Gave up after exhausting the retry policy.
    Disabled(String),
    /// Stopped on request.
    Stopped,
}

/// Rolling window of the last N capture instants.
///
/// FPS is derived from the span between the oldest and newest sample, which
/// smooths out per-frame jitter.
#[derive(Debug, Clone)]
pub struct FpsWindow {
    samples: VecDeque<Instant>,
    capacity: usize,
}

impl FpsWindow {
    /// Create a window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a capture instant, evicting the oldest when full.
    pub fn record(&mut self, at: Instant) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(at);
    }

    /// Frames per second over the window, zero with fewer than two samples.
    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if self.samples.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let intervals = (self.samples.len() - 1) as f64;
        intervals / span
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Bounded single-consumer frame queue that never blocks the producer.
pub struct FrameQueue {
    sender: Sender<CapturedFrame>,
    receiver: Receiver<CapturedFrame>,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. A full queue drops the frame and counts it.
    pub fn offer(&self, frame: CapturedFrame) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drain everything queued and return only the newest frame.
    pub fn latest(&self) -> Option<CapturedFrame> {
        self.receiver.try_iter().last()
    }

    /// Wait up to `timeout` for the next frame in FIFO order.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<CapturedFrame, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Maximum number of queued frames.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.dropped.store(0, Ordering::Relaxed);
        self.receiver.try_iter().for_each(drop);
    }
}

/// Last known value of each control on one camera.
#[derive(Debug, Default)]
pub struct ControlTable {
    values: Mutex<BTreeMap<String, i64>>,
}

impl ControlTable {
    /// Remember `value` for `control`.
    pub fn record(&self, control: &str, value: i64) {
        self.values.lock().insert(control.to_owned(), value);
    }

    /// Last known value of `control`.
    pub fn get(&self, control: &str) -> Option<i64> {
        self.values.lock().get(control).copied()
    }

    /// Copy of every known value.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values.lock().clone()
    }
}

/// Queue sizes and FPS window length for a camera.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Live-view queue depth.
    pub live_capacity: usize,
    /// Recorder queue depth.
    pub recorder_capacity: usize,
    /// Number of timestamps in the FPS window.
    pub fps_window: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            live_capacity: 30,
            recorder_capacity: 30,
            fps_window: 30,
        }
    }
}

/// Point-in-time statistics for one camera.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStats {
    /// Logical name.
    pub name: String,
    /// Acquisition state.
    pub state: CameraState,
    /// Frames read from the device.
    pub frame_count: u64,
    /// Frames the live-view consumer missed because its queue was full.
    pub dropped_live: u64,
    /// Frames the recorder missed because its queue was full.
    pub dropped_recorder: u64,
    /// Smoothed capture rate.
    pub fps: f64,
    /// Frames waiting in the live-view queue.
    pub live_queue_len: usize,
    /// Live-view queue capacity.
    pub live_queue_capacity: usize,
    /// Negotiated resolution, once known.
    pub resolution: Option<(u32, u32)>,
    /// Clip currently receiving frames.
    pub open_clip: Option<PathBuf>,
    /// Clip writer counters.
    pub recording: RecorderStats,
}

/// Everything the pipeline tracks for one camera.
pub struct Camera {
    name: Arc<str>,
    device: PathBuf,
    state: Mutex<CameraState>,
    resolution: Mutex<Option<(u32, u32)>>,
    frames: AtomicU64,
    fps: Mutex<FpsWindow>,
    live: FrameQueue,
    recorder_queue: FrameQueue,
    controls: ControlTable,
    clip: Mutex<ClipRecorder>,
}

impl Camera {
    /// Build the aggregate. `recorder` owns this camera's clip files.
    pub fn new(spec: CameraSpec, queues: QueueSettings, recorder: ClipRecorder) -> Self {
        Self {
            name: Arc::from(spec.name),
            device: spec.device,
            state: Mutex::new(CameraState::Idle),
            resolution: Mutex::new(None),
            frames: AtomicU64::new(0),
            fps: Mutex::new(FpsWindow::new(queues.fps_window)),
            live: FrameQueue::new(queues.live_capacity),
            recorder_queue: FrameQueue::new(queues.recorder_capacity),
            controls: ControlTable::default(),
            clip: Mutex::new(recorder),
        }
    }

    /// Logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the name, for tagging frames.
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Device path.
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Current acquisition state.
    pub fn state(&self) -> CameraState {
        self.state.lock().clone()
    }

    pub(crate) fn set_state(&self, state: CameraState) {
        *self.state.lock() = state;
    }

    /// Negotiated resolution.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        *self.resolution.lock()
    }

    pub(crate) fn set_resolution(&self, resolution: (u32, u32)) {
        *self.resolution.lock() = Some(resolution);
    }

    /// Fan a freshly captured frame out to both consumers.
    ///
    /// Each queue drops independently: a slow recorder never costs the live
    /// view a frame and vice versa.
    pub fn publish(&self, frame: CapturedFrame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.fps.lock().record(frame.captured_at);
        self.recorder_queue.offer(frame.clone());
        self.live.offer(frame);
    }

    /// Newest frame for live viewing, discarding any backlog.
    pub fn latest_frame(&self) -> Option<CapturedFrame> {
        self.live.latest()
    }

    /// Queue feeding this camera's clip writer.
    pub fn recorder_queue(&self) -> &FrameQueue {
        &self.recorder_queue
    }

    /// Frames read from the device since start or the last reset.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Smoothed capture rate.
    pub fn measured_fps(&self) -> f64 {
        self.fps.lock().fps()
    }

    /// Last known control values.
    pub fn controls(&self) -> &ControlTable {
        &self.controls
    }

    /// Lock this camera's clip state. Every clip transition goes through here.
    pub fn clip(&self) -> MutexGuard<'_, ClipRecorder> {
        self.clip.lock()
    }

    /// Video file currently receiving frames.
    pub fn open_clip(&self) -> Option<PathBuf> {
        self.clip.lock().open_clip().map(Path::to_path_buf)
    }

    /// Values recorded in a new clip's sidecar.
    pub fn clip_context(&self) -> ClipContext {
        ClipContext {
            measured_fps: self.measured_fps(),
            controls: self.controls.snapshot(),
        }
    }

    /// Zero the counters, clear the FPS window and drain the live queue.
    pub fn reset_counters(&self) {
        self.frames.store(0, Ordering::Relaxed);
        self.fps.lock().clear();
        self.live.reset();
        self.recorder_queue.dropped.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CameraStats {
        let (open_clip, recording) = {
            let clip = self.clip.lock();
            (clip.open_clip().map(Path::to_path_buf), clip.stats())
        };
        CameraStats {
            name: self.name.to_string(),
            state: self.state(),
            frame_count: self.frame_count(),
            dropped_live: self.live.dropped(),
            dropped_recorder: self.recorder_queue.dropped(),
            fps: self.measured_fps(),
            live_queue_len: self.live.len(),
            live_queue_capacity: self.live.capacity(),
            resolution: self.resolution(),
            open_clip,
            recording,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::RecordingSettings;
    use crate::encoder::MjpegEncoderFactory;
    use crate::frame::PixelBuffer;

    fn camera(capacity: usize) -> Camera {
        let dir = std::env::temp_dir().join("camera-aggregate-tests");
        let recorder = ClipRecorder::new(
            "cam_test",
            RecordingSettings::new(dir),
            Arc::new(MjpegEncoderFactory::default()),
        );
        Camera::new(
            CameraSpec::new("cam_test", "/dev/null"),
            QueueSettings {
                live_capacity: capacity,
                recorder_capacity: capacity,
                fps_window: 5,
            },
            recorder,
        )
    }

    fn frame(camera: &Camera, sequence: u64, at: Instant) -> CapturedFrame {
        CapturedFrame::at(
            camera.name_arc(),
            sequence,
            PixelBuffer::gray(4, 4, 0),
            at,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_camera_spec_parsing() {
        let spec: CameraSpec = "cam_lr=/dev/camera_lr".parse().expect("spec");
        assert_eq!(spec.name, "cam_lr");
        assert_eq!(spec.device, PathBuf::from("/dev/camera_lr"));

        assert!("no-separator".parse::<CameraSpec>().is_err());
        assert!("=/dev/video0".parse::<CameraSpec>().is_err());
        assert!("a/b=/dev/video0".parse::<CameraSpec>().is_err());
        assert!("cam.1=/dev/video0".parse::<CameraSpec>().is_err());
        assert!("cam=".parse::<CameraSpec>().is_err());
    }

    #[test]
    fn test_fps_window_uses_span_of_samples() {
        let start = Instant::now();
        let mut window = FpsWindow::new(4);
        assert!(window.fps().abs() < f64::EPSILON);

        for i in 0..10u64 {
            window.record(start + Duration::from_millis(i * 100));
        }
        // Last 4 samples span 300ms across 3 intervals
        assert!((window.fps() - 10.0).abs() < 1e-6);

        window.clear();
        assert!(window.fps().abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_queue_drops_for_that_consumer_only() {
        let camera = camera(2);
        let start = Instant::now();

        for i in 0..5 {
            camera.publish(frame(&camera, i, start + Duration::from_millis(i * 10)));
            // Live view keeps up, recorder does not
            let _ = camera.latest_frame();
        }

        assert_eq!(camera.frame_count(), 5);
        assert_eq!(camera.stats().dropped_live, 0);
        assert_eq!(camera.recorder_queue().dropped(), 3);
        assert_eq!(camera.recorder_queue().len(), 2);
    }

    #[test]
    fn test_latest_frame_discards_backlog() {
        let camera = camera(10);
        let start = Instant::now();
        for i in 0..4 {
            camera.publish(frame(&camera, i, start));
        }

        let latest = camera.latest_frame().expect("frame available");
        assert_eq!(latest.sequence, 3);
        assert!(camera.latest_frame().is_none());
        // Recorder still sees every frame in order
        let first = camera
            .recorder_queue()
            .recv_timeout(Duration::from_millis(10))
            .expect("recorder frame");
        assert_eq!(first.sequence, 0);
    }

    #[test]
    fn test_reset_counters() {
        let camera = camera(1);
        let start = Instant::now();
        for i in 0..3 {
            camera.publish(frame(&camera, i, start + Duration::from_millis(i)));
        }
        assert!(camera.stats().dropped_live > 0);

        camera.reset_counters();
        let stats = camera.stats();
        assert_eq!(stats.frame_count, 0);
        assert_eq!(stats.dropped_live, 0);
        assert_eq!(stats.dropped_recorder, 0);
        assert_eq!(stats.live_queue_len, 0);
        assert!(stats.fps.abs() < f64::EPSILON);
    }

    #[test]
    fn test_control_table_snapshot() {
        let camera = camera(1);
        camera.controls().record("gain", 4);
        camera.controls().record("gain", 9);
        camera.controls().record("brightness", 120);

        assert_eq!(camera.controls().get("gain"), Some(9));
        let context = camera.clip_context();
        assert_eq!(context.controls.len(), 2);
    }
}
