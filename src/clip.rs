//! Clip recording: sidecar metadata, the per-camera rotation state machine
//! and the writer thread that drains a camera's recorder queue.
//!
//! A clip moves through `Closed -> Opening -> Open -> Rotating -> Opening ->
//! Open ... -> Closed`. Rotation is driven by the capture timestamps of the
//! frames themselves, so a clip always spans exactly the frames captured
//! within its duration regardless of how far the writer lags behind.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::RecvTimeoutError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::{Camera, CameraState};
use crate::encoder::{ClipEncoder, EncoderFactory};
use crate::frame::{CapturedFrame, FrameError};
use crate::overlay::stamp_timestamp;
use crate::shutdown::StopSignal;
use crate::storage::{camera_dir, ClipPaths};

/// Errors from opening, writing or describing a clip.
#[derive(Debug, Error)]
pub enum ClipError {
    /// A new clip file could not be created.
    #[error("failed to open clip {}: {source}", path.display())]
    ClipOpenFailed {
        /// Clip video path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Appending to or finalising a clip failed.
    #[error("failed to write clip {}: {source}", path.display())]
    ClipWriteFailed {
        /// Clip video path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The sidecar could not be read or written.
    #[error("sidecar {}: {reason}", path.display())]
    Metadata {
        /// Sidecar path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
    /// The frame could not be converted for encoding.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Render a timestamp the way sidecars store it: ISO-8601 UTC, milliseconds.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Sidecar record describing one clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipMetadata {
    /// Camera that recorded the clip.
    pub camera_name: String,
    /// Wall-clock time of the first frame.
    pub timestamp_start: String,
    /// Wall-clock time the clip was closed, `None` while open.
    pub timestamp_end: Option<String>,
    /// Target duration while open, actual duration once closed.
    pub duration_minutes: f64,
    /// Measured capture rate at open, actual frame rate once closed.
    pub average_fps: f64,
    /// `WxH`.
    pub resolution: String,
    /// Codec identifier.
    pub codec: String,
    /// Control values when the clip was opened.
    #[serde(default)]
    pub camera_settings_at_start: BTreeMap<String, i64>,
    /// Frames appended.
    #[serde(default)]
    pub frame_count: u64,
}

impl ClipMetadata {
    /// Parsed start time.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp_start)
    }

    /// Parsed end time, if the clip was closed.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_end.as_deref().and_then(parse_timestamp)
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Read a sidecar file.
pub fn read_metadata(path: &Path) -> Result<ClipMetadata, ClipError> {
    let bytes = fs::read(path).map_err(|err| ClipError::Metadata {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|err| ClipError::Metadata {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Merge `metadata` into the sidecar at `path`.
///
/// Keys already present and not part of the record survive. A missing or
/// corrupt sidecar is replaced by a fresh record. The file is swapped in
/// with a rename so readers never observe a half-written record.
pub fn write_metadata(path: &Path, metadata: &ClipMetadata) -> Result<(), ClipError> {
    let metadata_error = |reason: String| ClipError::Metadata {
        path: path.to_path_buf(),
        reason,
    };

    let mut record = match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(record)) => record,
            Ok(_) | Err(_) => {
                warn!(sidecar = %path.display(), "sidecar is corrupt, rewriting from scratch");
                Map::new()
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
        Err(err) => return Err(metadata_error(err.to_string())),
    };

    match serde_json::to_value(metadata) {
        Ok(Value::Object(fields)) => record.extend(fields),
        Ok(_) => return Err(metadata_error("record is not an object".to_owned())),
        Err(err) => return Err(metadata_error(err.to_string())),
    }

    let bytes =
        serde_json::to_vec_pretty(&Value::Object(record)).map_err(|e| metadata_error(e.to_string()))?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, bytes).map_err(|e| metadata_error(e.to_string()))?;
    fs::rename(&staging, path).map_err(|e| metadata_error(e.to_string()))
}

/// Where and how long clips are recorded.
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    /// Recording root; each camera writes to `<root>/<camera>/`.
    pub root: PathBuf,
    /// Age at which a clip is rotated.
    pub clip_duration: Duration,
    /// Pause before retrying after a clip could not be opened.
    pub reopen_backoff: Duration,
    /// Burn the capture time into each recorded frame.
    pub overlay_timestamp: bool,
}

impl RecordingSettings {
    /// One-minute clips under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clip_duration: Duration::from_secs(60),
            reopen_backoff: Duration::from_secs(1),
            overlay_timestamp: true,
        }
    }

    /// Override the clip duration.
    #[must_use]
    pub const fn with_clip_duration(mut self, duration: Duration) -> Self {
        self.clip_duration = duration;
        self
    }
}

/// Values captured from the camera when a clip opens.
#[derive(Debug, Clone, Default)]
pub struct ClipContext {
    /// Smoothed capture rate.
    pub measured_fps: f64,
    /// Last known control values.
    pub controls: BTreeMap<String, i64>,
}

/// Defers building a [`ClipContext`] until a clip actually opens.
struct LazyContext<F> {
    make: Option<F>,
    value: Option<ClipContext>,
}

impl<F: FnOnce() -> ClipContext> LazyContext<F> {
    const fn new(make: F) -> Self {
        Self {
            make: Some(make),
            value: None,
        }
    }

    fn get(&mut self) -> &ClipContext {
        if let Some(make) = self.make.take() {
            self.value = Some(make());
        }
        self.value.get_or_insert_with(ClipContext::default)
    }
}

/// Position in the rotation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipPhase {
    /// No clip file is open.
    Closed,
    /// A clip file is being created.
    Opening,
    /// Frames are being appended.
    Open,
    /// The current clip is being finalised before the next one opens.
    Rotating,
}

/// Counters kept by a [`ClipRecorder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    /// Clips created.
    pub clips_opened: u64,
    /// Clips finalised.
    pub clips_closed: u64,
    /// Frames appended to clips.
    pub frames_written: u64,
    /// Frames discarded by the recorder itself.
    pub frames_dropped: u64,
    /// Failed appends that forced a rotation.
    pub write_failures: u64,
    /// Failed clip creations.
    pub open_failures: u64,
}

struct ActiveClip {
    paths: ClipPaths,
    encoder: Box<dyn ClipEncoder>,
    metadata: ClipMetadata,
    resolution: (u32, u32),
    started_at: Instant,
    last_frame: Option<(Instant, DateTime<Utc>)>,
}

/// One camera's clip state. Guarded by the camera's clip lock.
pub struct ClipRecorder {
    camera: String,
    settings: RecordingSettings,
    factory: Arc<dyn EncoderFactory>,
    phase: ClipPhase,
    active: Option<ActiveClip>,
    retry_after: Option<Instant>,
    stats: RecorderStats,
}

impl ClipRecorder {
    /// Recorder for `camera` writing with `factory`.
    pub fn new(
        camera: impl Into<String>,
        settings: RecordingSettings,
        factory: Arc<dyn EncoderFactory>,
    ) -> Self {
        Self {
            camera: camera.into(),
            settings,
            factory,
            phase: ClipPhase::Closed,
            active: None,
            retry_after: None,
            stats: RecorderStats::default(),
        }
    }

    /// Current state.
    pub const fn phase(&self) -> ClipPhase {
        self.phase
    }

    /// Counters since construction.
    pub const fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Recording settings.
    pub const fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    /// Video file currently receiving frames.
    pub fn open_clip(&self) -> Option<&Path> {
        self.active.as_ref().map(|clip| clip.paths.video.as_path())
    }

    /// Append `frame`, opening or rotating clips as needed.
    ///
    /// A clip rotates once its duration has elapsed or when the frame size
    /// changes. `context` is evaluated at most once, when a clip is opened.
    /// On error the frame has been dropped and counted; the recorder stays
    /// usable.
    pub fn write_frame(
        &mut self,
        frame: &CapturedFrame,
        context: impl FnOnce() -> ClipContext,
    ) -> Result<(), ClipError> {
        let mut context = LazyContext::new(context);
        let resolution = frame.resolution();
        let due = self.active.as_ref().is_some_and(|clip| {
            if clip.resolution != resolution {
                info!(
                    camera = %self.camera,
                    from = ?clip.resolution,
                    to = ?resolution,
                    "resolution changed, rotating clip"
                );
                return true;
            }
            frame.captured_at.saturating_duration_since(clip.started_at)
                >= self.settings.clip_duration
        });
        if due {
            self.phase = ClipPhase::Rotating;
            if let Err(err) = self.finish_active(frame.captured_at, frame.wall_clock) {
                warn!(camera = %self.camera, error = %err, "failed to finalise clip on rotation");
            }
        }

        let image = match self.prepare(frame) {
            Ok(image) => image,
            Err(err) => {
                self.stats.frames_dropped += 1;
                return Err(err);
            }
        };

        if self.active.is_none() {
            if self
                .retry_after
                .is_some_and(|retry_after| frame.captured_at < retry_after)
            {
                self.stats.frames_dropped += 1;
                return Ok(());
            }
            if let Err(err) = self.open(frame, context.get()) {
                self.stats.frames_dropped += 1;
                return Err(err);
            }
        }

        let Err(first) = self.append(&image, frame) else {
            return Ok(());
        };

        self.stats.write_failures += 1;
        warn!(camera = %self.camera, error = %first, "clip write failed, rotating");
        self.phase = ClipPhase::Rotating;
        if let Err(err) = self.finish_active(frame.captured_at, frame.wall_clock) {
            debug!(camera = %self.camera, error = %err, "best-effort close failed");
        }

        if let Err(err) = self.open(frame, context.get()) {
            self.stats.frames_dropped += 1;
            return Err(err);
        }
        let retried = self.append(&image, frame);
        if retried.is_err() {
            self.stats.frames_dropped += 1;
        }
        retried
    }

    /// Finalise the open clip, stamping its end at the last written frame.
    ///
    /// Returns the closed video path, or `None` if nothing was open.
    pub fn close(&mut self) -> Result<Option<PathBuf>, ClipError> {
        let Some((at, wall_clock)) = self.active.as_ref().map(|clip| {
            clip.last_frame
                .unwrap_or((clip.started_at, Utc::now()))
        }) else {
            self.phase = ClipPhase::Closed;
            return Ok(None);
        };
        self.finish_active(at, wall_clock)
    }

    fn prepare(&self, frame: &CapturedFrame) -> Result<RgbImage, ClipError> {
        let mut image = frame.image.to_rgb()?;
        if self.settings.overlay_timestamp {
            stamp_timestamp(&mut image, &frame.wall_clock);
        }
        Ok(image)
    }

    fn open(&mut self, frame: &CapturedFrame, context: &ClipContext) -> Result<(), ClipError> {
        self.phase = ClipPhase::Opening;
        match self.create(frame, context) {
            Ok(clip) => {
                info!(camera = %self.camera, clip = %clip.paths.video.display(), "opened clip");
                self.active = Some(clip);
                self.retry_after = None;
                self.phase = ClipPhase::Open;
                self.stats.clips_opened += 1;
                Ok(())
            }
            Err(err) => {
                warn!(camera = %self.camera, error = %err, "failed to open clip");
                self.retry_after = Some(frame.captured_at + self.settings.reopen_backoff);
                self.phase = ClipPhase::Closed;
                self.stats.open_failures += 1;
                Err(err)
            }
        }
    }

    fn create(&self, frame: &CapturedFrame, context: &ClipContext) -> Result<ActiveClip, ClipError> {
        let dir = camera_dir(&self.settings.root, &self.camera);
        fs::create_dir_all(&dir).map_err(|source| ClipError::ClipOpenFailed {
            path: dir.clone(),
            source,
        })?;

        let (started, paths) = self.unused_paths(frame.wall_clock);
        let (width, height) = frame.resolution();
        let fps = if context.measured_fps > 0.0 {
            context.measured_fps
        } else {
            30.0
        };

        let encoder = self
            .factory
            .create(&paths.video, width, height, fps)
            .map_err(|source| ClipError::ClipOpenFailed {
                path: paths.video.clone(),
                source,
            })?;

        let metadata = ClipMetadata {
            camera_name: self.camera.clone(),
            timestamp_start: format_timestamp(&started),
            timestamp_end: None,
            duration_minutes: self.settings.clip_duration.as_secs_f64() / 60.0,
            average_fps: context.measured_fps,
            resolution: format!("{width}x{height}"),
            codec: self.factory.codec().to_owned(),
            camera_settings_at_start: context.controls.clone(),
            frame_count: 0,
        };
        if let Err(err) = write_metadata(&paths.sidecar, &metadata) {
            warn!(camera = %self.camera, error = %err, "failed to write opening sidecar");
        }

        Ok(ActiveClip {
            paths,
            encoder,
            metadata,
            resolution: (width, height),
            started_at: frame.captured_at,
            last_frame: None,
        })
    }

    /// Clip names carry millisecond timestamps; step forward past any
    /// collision with a clip that started within the same millisecond.
    fn unused_paths(&self, started: DateTime<Utc>) -> (DateTime<Utc>, ClipPaths) {
        let extension = self.factory.extension();
        let mut candidate = started;
        for _ in 0..1000 {
            let paths = ClipPaths::new(&self.settings.root, &self.camera, &candidate, extension);
            if !paths.video.exists() && !paths.sidecar.exists() {
                return (candidate, paths);
            }
            candidate += chrono::Duration::milliseconds(1);
        }
        let paths = ClipPaths::new(&self.settings.root, &self.camera, &candidate, extension);
        (candidate, paths)
    }

    fn append(&mut self, image: &RgbImage, frame: &CapturedFrame) -> Result<(), ClipError> {
        let Some(clip) = self.active.as_mut() else {
            return Err(ClipError::ClipWriteFailed {
                path: PathBuf::new(),
                source: io::Error::new(io::ErrorKind::NotConnected, "no open clip"),
            });
        };
        clip.encoder
            .write_frame(image)
            .map_err(|source| ClipError::ClipWriteFailed {
                path: clip.paths.video.clone(),
                source,
            })?;
        clip.metadata.frame_count += 1;
        clip.last_frame = Some((frame.captured_at, frame.wall_clock));
        self.stats.frames_written += 1;
        Ok(())
    }

    fn finish_active(
        &mut self,
        at: Instant,
        wall_clock: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, ClipError> {
        let Some(clip) = self.active.take() else {
            self.phase = ClipPhase::Closed;
            return Ok(None);
        };
        self.phase = ClipPhase::Closed;
        self.stats.clips_closed += 1;

        let ActiveClip {
            paths,
            encoder,
            mut metadata,
            started_at,
            ..
        } = clip;

        let finished = encoder.finish();

        let elapsed = at.saturating_duration_since(started_at).as_secs_f64();
        metadata.timestamp_end = Some(format_timestamp(&wall_clock));
        metadata.duration_minutes = elapsed / 60.0;
        if elapsed > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let frames = metadata.frame_count as f64;
            metadata.average_fps = frames / elapsed;
        }

        let sidecar = write_metadata(&paths.sidecar, &metadata);
        info!(
            camera = %self.camera,
            clip = %paths.video.display(),
            frames = metadata.frame_count,
            "closed clip"
        );

        finished.map_err(|source| ClipError::ClipWriteFailed {
            path: paths.video.clone(),
            source,
        })?;
        sidecar?;
        Ok(Some(paths.video))
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Thread draining one camera's recorder queue into clips.
pub struct ClipWriter {
    camera: Arc<Camera>,
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl ClipWriter {
    /// Start writing clips for `camera`.
    pub fn spawn(camera: Arc<Camera>) -> io::Result<Self> {
        let stop = StopSignal::new();
        let handle = thread::Builder::new()
            .name(format!("clip-{}", camera.name()))
            .spawn({
                let camera = Arc::clone(&camera);
                let stop = stop.clone();
                move || run_writer(&camera, &stop)
            })?;
        Ok(Self {
            camera,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and finalise the open clip. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(camera = %self.camera.name(), "clip writer panicked");
            }
        }
        // The writer closes on exit; this covers a panicked writer.
        if let Err(err) = self.camera.clip().close() {
            warn!(camera = %self.camera.name(), error = %err, "failed to close clip");
        }
    }
}

impl Drop for ClipWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_writer(camera: &Camera, stop: &StopSignal) {
    debug!(camera = %camera.name(), "clip writer started");
    let queue = camera.recorder_queue();

    while !stop.is_triggered() {
        match queue.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => record(camera, &frame),
            Err(RecvTimeoutError::Timeout) => close_if_disabled(camera),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Flush what was already queued when the stop arrived.
    for _ in 0..queue.len() {
        match queue.recv_timeout(Duration::ZERO) {
            Ok(frame) => record(camera, &frame),
            Err(_) => break,
        }
    }

    match camera.clip().close() {
        Ok(Some(path)) => debug!(camera = %camera.name(), clip = %path.display(), "final clip closed"),
        Ok(None) => {}
        Err(err) => warn!(camera = %camera.name(), error = %err, "failed to close clip"),
    }
    debug!(camera = %camera.name(), "clip writer stopped");
}

/// A disabled camera publishes nothing more; finalise its clip once the
/// queue has drained instead of leaving it open until shutdown.
fn close_if_disabled(camera: &Camera) {
    if !matches!(camera.state(), CameraState::Disabled(_)) {
        return;
    }
    let mut clip = camera.clip();
    if clip.open_clip().is_none() {
        return;
    }
    match clip.close() {
        Ok(Some(path)) => info!(camera = %camera.name(), clip = %path.display(), "closed clip of disabled camera"),
        Ok(None) => {}
        Err(err) => warn!(camera = %camera.name(), error = %err, "failed to close clip"),
    }
}

fn record(camera: &Camera, frame: &CapturedFrame) {
    let mut clip = camera.clip();
    if let Err(err) = clip.write_frame(frame, || camera.clip_context()) {
        warn!(camera = %camera.name(), sequence = frame.sequence, error = %err, "frame not recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSpec, QueueSettings};
    use crate::encoder::MjpegEncoderFactory;
    use crate::frame::PixelBuffer;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn wall(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_715_934_605_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    fn frame(sequence: u64, base: Instant, offset: Duration) -> CapturedFrame {
        #[allow(clippy::cast_possible_truncation)]
        let ms = offset.as_millis() as i64;
        CapturedFrame::at(
            Arc::from("cam_lr"),
            sequence,
            PixelBuffer::gray(16, 12, 90),
            base + offset,
            wall(ms),
        )
    }

    fn recorder(root: &Path, duration: Duration) -> ClipRecorder {
        let mut settings = RecordingSettings::new(root).with_clip_duration(duration);
        settings.overlay_timestamp = false;
        ClipRecorder::new("cam_lr", settings, Arc::new(MjpegEncoderFactory::default()))
    }

    fn clip_files(root: &Path, extension: &str) -> Vec<PathBuf> {
        let mut files: Vec<_> = fs::read_dir(root.join("cam_lr"))
            .expect("camera dir")
            .map(|entry| entry.expect("entry").path())
            .filter(|path| path.extension().is_some_and(|ext| ext == extension))
            .collect();
        files.sort();
        files
    }

    /// Fails every write after the first `budget` frames.
    struct FlakyFactory {
        inner: MjpegEncoderFactory,
        budget: Arc<Mutex<u32>>,
    }

    struct FlakyEncoder {
        inner: Box<dyn ClipEncoder>,
        budget: Arc<Mutex<u32>>,
    }

    impl EncoderFactory for FlakyFactory {
        fn codec(&self) -> &str {
            "MJPG"
        }

        fn extension(&self) -> &str {
            "mjpeg"
        }

        fn create(
            &self,
            path: &Path,
            width: u32,
            height: u32,
            fps: f64,
        ) -> io::Result<Box<dyn ClipEncoder>> {
            Ok(Box::new(FlakyEncoder {
                inner: self.inner.create(path, width, height, fps)?,
                budget: Arc::clone(&self.budget),
            }))
        }
    }

    impl ClipEncoder for FlakyEncoder {
        fn write_frame(&mut self, frame: &RgbImage) -> io::Result<()> {
            let mut budget = self.budget.lock();
            if *budget == 0 {
                *budget = u32::MAX;
                return Err(io::Error::other("disk full"));
            }
            *budget -= 1;
            self.inner.write_frame(frame)
        }

        fn finish(self: Box<Self>) -> io::Result<u64> {
            self.inner.finish()
        }
    }

    #[test]
    fn test_first_frame_opens_clip_with_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path(), Duration::from_secs(60));
        assert_eq!(recorder.phase(), ClipPhase::Closed);

        let base = Instant::now();
        recorder
            .write_frame(&frame(0, base, Duration::ZERO), || ClipContext {
                measured_fps: 29.5,
                controls: BTreeMap::from([("gain".to_owned(), 12)]),
            })
            .expect("write");

        assert_eq!(recorder.phase(), ClipPhase::Open);
        let video = recorder.open_clip().expect("open clip").to_path_buf();
        assert!(video.ends_with("cam_lr/cam_lr_20240517_083005_000.mjpeg"));

        let metadata = read_metadata(&video.with_extension("json")).expect("sidecar");
        assert_eq!(metadata.camera_name, "cam_lr");
        assert_eq!(metadata.timestamp_start, "2024-05-17T08:30:05.000Z");
        assert_eq!(metadata.timestamp_end, None);
        assert!((metadata.duration_minutes - 1.0).abs() < 1e-9);
        assert_eq!(metadata.resolution, "16x12");
        assert_eq!(metadata.codec, "MJPG");
        assert_eq!(metadata.camera_settings_at_start.get("gain"), Some(&12));
    }

    #[test]
    fn test_rotation_follows_capture_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path(), Duration::from_secs(60));
        let base = Instant::now();

        // 125 seconds at 2 fps is enough to cross two rotation boundaries
        for i in 0..250u64 {
            let offset = Duration::from_millis(i * 500);
            recorder
                .write_frame(&frame(i, base, offset), ClipContext::default)
                .expect("write");
        }

        let sidecars = clip_files(dir.path(), "json");
        assert_eq!(sidecars.len(), 3);
        assert_eq!(clip_files(dir.path(), "mjpeg").len(), 3);

        for sidecar in &sidecars[..2] {
            let metadata = read_metadata(sidecar).expect("sidecar");
            assert!(metadata.timestamp_end.is_some());
            assert!((metadata.duration_minutes - 1.0).abs() < 0.01);
            assert_eq!(metadata.frame_count, 120);
            assert!((metadata.average_fps - 2.0).abs() < 0.05);
        }
        let open = read_metadata(&sidecars[2]).expect("sidecar");
        assert!(open.timestamp_end.is_none());
        assert_eq!(recorder.open_clip(), Some(sidecars[2].with_extension("mjpeg").as_path()));

        let closed = recorder.close().expect("close").expect("clip was open");
        assert_eq!(closed, sidecars[2].with_extension("mjpeg"));
        assert_eq!(recorder.phase(), ClipPhase::Closed);
        let last = read_metadata(&sidecars[2]).expect("sidecar");
        assert_eq!(last.timestamp_end.as_deref(), Some("2024-05-17T08:32:09.500Z"));
        assert_eq!(recorder.stats().clips_closed, 3);
    }

    #[test]
    fn test_write_failure_rotates_and_keeps_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = RecordingSettings::new(dir.path());
        settings.overlay_timestamp = false;
        let mut recorder = ClipRecorder::new(
            "cam_lr",
            settings,
            Arc::new(FlakyFactory {
                inner: MjpegEncoderFactory::default(),
                budget: Arc::new(Mutex::new(3)),
            }),
        );

        let base = Instant::now();
        for i in 0..6u64 {
            recorder
                .write_frame(&frame(i, base, Duration::from_millis(i * 100)), ClipContext::default)
                .expect("write recovers");
        }

        let stats = recorder.stats();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.clips_opened, 2);
        assert_eq!(stats.frames_written, 6);
        assert_eq!(stats.frames_dropped, 0);

        let sidecars = clip_files(dir.path(), "json");
        assert_eq!(sidecars.len(), 2);
        let first = read_metadata(&sidecars[0]).expect("sidecar");
        assert_eq!(first.frame_count, 3);
        assert!(first.timestamp_end.is_some());
    }

    #[test]
    fn test_open_failure_backs_off_and_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A regular file where the camera directory should go
        fs::write(dir.path().join("cam_lr"), b"in the way").expect("seed");
        let mut recorder = recorder(dir.path(), Duration::from_secs(60));
        let base = Instant::now();

        let first = recorder.write_frame(&frame(0, base, Duration::ZERO), ClipContext::default);
        assert!(matches!(first, Err(ClipError::ClipOpenFailed { .. })));

        // Inside the backoff window: dropped without another attempt
        recorder
            .write_frame(&frame(1, base, Duration::from_millis(200)), ClipContext::default)
            .expect("dropped quietly");
        assert_eq!(recorder.stats().open_failures, 1);
        assert_eq!(recorder.stats().frames_dropped, 2);

        fs::remove_file(dir.path().join("cam_lr")).expect("unblock");
        recorder
            .write_frame(&frame(2, base, Duration::from_secs(2)), ClipContext::default)
            .expect("reopened");
        assert_eq!(recorder.phase(), ClipPhase::Open);
        assert_eq!(recorder.stats().frames_written, 1);
    }

    #[test]
    fn test_metadata_merge_keeps_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.json");
        fs::write(&path, br#"{"operator_note": "lens cleaned"}"#).expect("seed");

        let metadata = ClipMetadata {
            camera_name: "cam_ur".to_owned(),
            timestamp_start: format_timestamp(&wall(0)),
            timestamp_end: None,
            duration_minutes: 1.0,
            average_fps: 30.0,
            resolution: "1280x720".to_owned(),
            codec: "MJPG".to_owned(),
            camera_settings_at_start: BTreeMap::new(),
            frame_count: 0,
        };
        write_metadata(&path, &metadata).expect("write");

        let raw: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(raw["operator_note"], "lens cleaned");
        assert_eq!(raw["camera_name"], "cam_ur");
        assert!(raw["timestamp_end"].is_null());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_sidecar_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.json");
        fs::write(&path, b"{not json").expect("seed");

        let mut metadata = ClipMetadata {
            camera_name: "cam_ur".to_owned(),
            timestamp_start: format_timestamp(&wall(0)),
            timestamp_end: Some(format_timestamp(&wall(60_000))),
            duration_minutes: 1.0,
            average_fps: 30.0,
            resolution: "640x480".to_owned(),
            codec: "MJPG".to_owned(),
            camera_settings_at_start: BTreeMap::new(),
            frame_count: 1800,
        };
        write_metadata(&path, &metadata).expect("write");
        let read = read_metadata(&path).expect("read");
        assert_eq!(read, metadata);
        assert_eq!(read.ended_at(), Some(wall(60_000)));

        metadata.frame_count = 1801;
        write_metadata(&path, &metadata).expect("rewrite");
        assert_eq!(read_metadata(&path).expect("read").frame_count, 1801);
    }

    #[test]
    fn test_writer_thread_closes_clip_on_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = Arc::new(Camera::new(
            CameraSpec::new("cam_lr", "/dev/null"),
            QueueSettings::default(),
            recorder(dir.path(), Duration::from_secs(60)),
        ));

        let mut writer = ClipWriter::spawn(Arc::clone(&camera)).expect("spawn");
        let base = Instant::now();
        for i in 0..5u64 {
            camera.publish(frame(i, base, Duration::from_millis(i * 33)));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while camera.clip().stats().frames_written < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        writer.stop();
        writer.stop();
        assert!(camera.open_clip().is_none());

        let sidecars = clip_files(dir.path(), "json");
        assert_eq!(sidecars.len(), 1);
        let metadata = read_metadata(&sidecars[0]).expect("sidecar");
        assert_eq!(metadata.frame_count, 5);
        assert!(metadata.timestamp_end.is_some());
    }

    #[test]
    fn test_replacement_clip_after_write_failure_keeps_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = RecordingSettings::new(dir.path());
        settings.overlay_timestamp = false;
        let mut recorder = ClipRecorder::new(
            "cam_lr",
            settings,
            Arc::new(FlakyFactory {
                inner: MjpegEncoderFactory::default(),
                budget: Arc::new(Mutex::new(2)),
            }),
        );
        let context = || ClipContext {
            measured_fps: 30.0,
            controls: BTreeMap::from([("gain".to_owned(), 12)]),
        };

        let base = Instant::now();
        for i in 0..4u64 {
            recorder
                .write_frame(&frame(i, base, Duration::from_millis(i * 100)), context)
                .expect("write recovers");
        }
        assert_eq!(recorder.stats().write_failures, 1);

        let sidecars = clip_files(dir.path(), "json");
        assert_eq!(sidecars.len(), 2);
        let replacement = read_metadata(&sidecars[1]).expect("sidecar");
        assert!(replacement.timestamp_end.is_none());
        assert_eq!(replacement.camera_settings_at_start.get("gain"), Some(&12));
        assert!((replacement.average_fps - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_resolution_change_rotates_clip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path(), Duration::from_secs(60));
        let base = Instant::now();

        for i in 0..4u64 {
            let offset = Duration::from_millis(i * 100);
            #[allow(clippy::cast_possible_truncation)]
            let ms = offset.as_millis() as i64;
            let image = if i < 2 {
                PixelBuffer::gray(16, 12, 90)
            } else {
                PixelBuffer::gray(32, 24, 90)
            };
            let frame = CapturedFrame::at(Arc::from("cam_lr"), i, image, base + offset, wall(ms));
            recorder
                .write_frame(&frame, ClipContext::default)
                .expect("write");
        }
        recorder.close().expect("close");

        let sidecars = clip_files(dir.path(), "json");
        assert_eq!(sidecars.len(), 2);
        let first = read_metadata(&sidecars[0]).expect("sidecar");
        let second = read_metadata(&sidecars[1]).expect("sidecar");
        assert_eq!(first.resolution, "16x12");
        assert_eq!(first.frame_count, 2);
        assert!(first.timestamp_end.is_some());
        assert_eq!(second.resolution, "32x24");
        assert_eq!(second.frame_count, 2);
    }

    #[test]
    fn test_writer_closes_clip_of_disabled_camera() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = Arc::new(Camera::new(
            CameraSpec::new("cam_lr", "/dev/null"),
            QueueSettings::default(),
            recorder(dir.path(), Duration::from_secs(60)),
        ));
        camera.set_state(CameraState::Running);

        let mut writer = ClipWriter::spawn(Arc::clone(&camera)).expect("spawn");
        let base = Instant::now();
        for i in 0..3u64 {
            camera.publish(frame(i, base, Duration::from_millis(i * 33)));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while camera.clip().stats().frames_written < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(camera.open_clip().is_some());

        camera.set_state(CameraState::Disabled("device unplugged".to_owned()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while camera.open_clip().is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(camera.open_clip().is_none());

        let sidecars = clip_files(dir.path(), "json");
        assert_eq!(sidecars.len(), 1);
        let metadata = read_metadata(&sidecars[0]).expect("sidecar");
        assert!(metadata.timestamp_end.is_some());
        assert_eq!(metadata.frame_count, 3);
        writer.stop();
    }
}
