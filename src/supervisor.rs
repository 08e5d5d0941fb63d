//! Pipeline supervisor: owns the camera set and every background thread.
//!
//! Start order is open cameras, capture loops, clip writers, disk monitor,
//! exposure controller. Shutdown runs in reverse and may be requested any
//! number of times from any thread.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::camera::{Camera, CameraSpec, CameraState, CameraStats, QueueSettings};
use crate::capture::{self, CaptureHandle, CaptureSettings};
use crate::clip::{ClipRecorder, ClipWriter, RecordingSettings};
use crate::control::{force_manual, ControlCatalog, ControlError, ControlPort, ControlSetting};
use crate::encoder::EncoderFactory;
use crate::exposure::{ExposureController, ExposureHandle, ExposurePolicy};
use crate::frame::{CapturedFrame, FrameError};
use crate::retention::{DiskEvictionMonitor, ProtectedClips, RetentionPolicy};
use crate::storage::{self, ClipListing};
use crate::traits::DeviceOpener;

/// Errors surfaced by the pipeline's public operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No configured camera could be opened.
    #[error("no camera could be opened")]
    NoCameras,
    /// The named camera is not part of the pipeline.
    #[error("unknown camera {0}")]
    UnknownCamera(String),
    /// Filesystem access failed.
    #[error("storage error: {0}")]
    Storage(#[from] io::Error),
    /// A control operation failed.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// A frame could not be converted.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// A snapshot could not be encoded.
    #[error("snapshot of {camera} failed: {reason}")]
    Snapshot {
        /// Camera name.
        camera: String,
        /// What went wrong.
        reason: String,
    },
}

/// A control to write right after a camera opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialControl {
    /// Control name.
    pub control: String,
    /// Value to write.
    pub value: i64,
}

impl InitialControl {
    /// Create an entry.
    pub fn new(control: impl Into<String>, value: i64) -> Self {
        Self {
            control: control.into(),
            value,
        }
    }
}

/// Everything needed to start a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Cameras to run.
    pub cameras: Vec<CameraSpec>,
    /// Clip location and duration.
    pub recording: RecordingSettings,
    /// Device format, frame rate and reopen policy.
    pub capture: CaptureSettings,
    /// Queue depths and FPS window.
    pub queues: QueueSettings,
    /// Disk quota.
    pub retention: RetentionPolicy,
    /// Exposure control loop.
    pub exposure: ExposurePolicy,
    /// Valid control ranges and auto-mode dependencies.
    pub catalog: ControlCatalog,
    /// Controls written after each camera opens, in order.
    pub initial_controls: Vec<InitialControl>,
}

impl PipelineConfig {
    /// Defaults for `cameras` recording under `root`.
    pub fn new(cameras: Vec<CameraSpec>, root: impl Into<PathBuf>) -> Self {
        Self {
            cameras,
            recording: RecordingSettings::new(root),
            capture: CaptureSettings::default(),
            queues: QueueSettings::default(),
            retention: RetentionPolicy {
                quota_bytes: 10 * 1024 * 1024 * 1024,
                margin: 0.1,
                check_interval: std::time::Duration::from_secs(60),
            },
            exposure: ExposurePolicy::default(),
            catalog: ControlCatalog::default(),
            initial_controls: vec![
                InitialControl::new("exposure_auto", 1),
                InitialControl::new("white_balance_temperature_auto", 0),
            ],
        }
    }
}

struct Services {
    exposure: Option<ExposureHandle>,
    writers: Vec<ClipWriter>,
    monitor: Option<DiskEvictionMonitor>,
    captures: Vec<CaptureHandle>,
}

/// The running capture-record-evict-control pipeline.
pub struct Pipeline {
    cameras: BTreeMap<String, Arc<Camera>>,
    root: PathBuf,
    port: Arc<dyn ControlPort>,
    catalog: Arc<ControlCatalog>,
    exposure: ExposurePolicy,
    services: Mutex<Option<Services>>,
}

impl Pipeline {
    /// Open the cameras and start every service.
    ///
    /// Cameras that fail to open are kept as disabled and logged; the
    /// pipeline only fails if none opened.
    pub fn start<O: DeviceOpener>(
        config: PipelineConfig,
        opener: Arc<O>,
        port: Arc<dyn ControlPort>,
        encoder: Arc<dyn EncoderFactory>,
    ) -> Result<Self, PipelineError> {
        let PipelineConfig {
            cameras: specs,
            recording,
            capture: capture_settings,
            queues,
            retention,
            exposure,
            catalog,
            initial_controls,
        } = config;

        fs::create_dir_all(&recording.root)?;
        let catalog = Arc::new(catalog);

        let mut cameras = BTreeMap::new();
        let mut opened = Vec::new();
        for spec in specs {
            let name = spec.name.clone();
            if cameras.contains_key(&name) {
                warn!(camera = %name, "duplicate camera name, ignoring");
                continue;
            }
            let recorder = ClipRecorder::new(&*name, recording.clone(), Arc::clone(&encoder));
            let camera = Arc::new(Camera::new(spec, queues, recorder));

            match capture::open(opener.as_ref(), &camera, &capture_settings) {
                Ok((device, format)) => {
                    apply_initial_controls(port.as_ref(), &camera, &initial_controls);
                    read_controls(port.as_ref(), &camera, &catalog);
                    opened.push((Arc::clone(&camera), device, format));
                }
                Err(err) => {
                    error!(camera = %name, device = %camera.device().display(), error = %err, "camera failed to open");
                    camera.set_state(CameraState::Disabled(err.to_string()));
                }
            }
            cameras.insert(name, camera);
        }

        if opened.is_empty() {
            return Err(PipelineError::NoCameras);
        }

        let mut services = Services {
            exposure: None,
            writers: Vec::new(),
            monitor: None,
            captures: Vec::new(),
        };

        for (camera, device, format) in opened {
            let handle = capture::spawn(
                camera,
                Arc::clone(&opener),
                device,
                format,
                capture_settings.clone(),
            )?;
            services.captures.push(handle);
        }

        let running: Vec<Arc<Camera>> = services
            .captures
            .iter()
            .map(|handle| Arc::clone(handle.camera()))
            .collect();

        for camera in &running {
            services.writers.push(ClipWriter::spawn(Arc::clone(camera))?);
        }

        let protected: Arc<dyn ProtectedClips> = Arc::new(running.clone());
        services.monitor = Some(DiskEvictionMonitor::spawn(
            recording.root.clone(),
            retention,
            protected,
        )?);

        let controller =
            ExposureController::new(Arc::clone(&port), Arc::clone(&catalog), exposure.clone());
        services.exposure = Some(controller.spawn(running)?);

        info!(
            cameras = cameras.len(),
            running = services.captures.len(),
            root = %recording.root.display(),
            "pipeline started"
        );

        Ok(Self {
            cameras,
            root: recording.root,
            port,
            catalog,
            exposure,
            services: Mutex::new(Some(services)),
        })
    }

    /// Stop every service in reverse start order. Idempotent.
    pub fn shutdown(&self) {
        let Some(mut services) = self.services.lock().take() else {
            return;
        };
        info!("pipeline shutting down");

        if let Some(mut exposure) = services.exposure.take() {
            exposure.stop();
        }
        for writer in &mut services.writers {
            writer.stop();
        }
        if let Some(mut monitor) = services.monitor.take() {
            monitor.stop();
        }
        for capture in &mut services.captures {
            capture.stop();
        }
        // Dropping the handles releases whatever they still own.
        drop(services);

        info!("pipeline stopped");
    }

    /// Whether [`Pipeline::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.services.lock().is_none()
    }

    /// Recording root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All cameras, including disabled ones.
    pub fn cameras(&self) -> impl Iterator<Item = &Arc<Camera>> {
        self.cameras.values()
    }

    /// Look up a camera by name.
    pub fn camera(&self, name: &str) -> Result<&Arc<Camera>, PipelineError> {
        self.cameras
            .get(name)
            .ok_or_else(|| PipelineError::UnknownCamera(name.to_owned()))
    }

    /// Newest frame of `camera`, discarding any live-view backlog.
    pub fn latest_frame(&self, camera: &str) -> Result<Option<CapturedFrame>, PipelineError> {
        Ok(self.camera(camera)?.latest_frame())
    }

    /// Recorded clips of `camera`, oldest first.
    pub fn list_clips(&self, camera: &str) -> Result<Vec<ClipListing>, PipelineError> {
        let camera = self.camera(camera)?;
        Ok(storage::list_clips(&self.root, camera.name())?)
    }

    /// Read `control` from the device.
    pub fn get_control(&self, camera: &str, control: &str) -> Result<i64, PipelineError> {
        let camera = self.camera(camera)?;
        let value = self.port.get(camera.device(), control)?;
        camera.controls().record(control, value);
        Ok(value)
    }

    /// Validate and write `control`, switching its auto mode to manual first
    /// when the control depends on one.
    pub fn set_control(&self, camera: &str, control: &str, value: i64) -> Result<(), PipelineError> {
        let camera = self.camera(camera)?;
        let spec = self.catalog.validate(control, value)?;

        if let Some(mode) = &spec.requires_manual {
            if force_manual(
                self.port.as_ref(),
                camera.device(),
                mode,
                self.exposure.mode_settle(),
            )? {
                camera.controls().record(&mode.control, mode.value);
            }
        }
        self.port.set(camera.device(), control, value)?;
        camera.controls().record(control, value);
        info!(camera = %camera.name(), control, value, "control set");
        Ok(())
    }

    /// Catalog controls of `camera` with their last known values.
    pub fn controls(&self, camera: &str) -> Result<Vec<ControlSetting>, PipelineError> {
        let camera = self.camera(camera)?;
        let known = camera.controls().snapshot();
        Ok(self
            .catalog
            .iter()
            .map(|(name, spec)| ControlSetting {
                name: name.to_owned(),
                value: known.get(name).copied(),
                range: spec.range.clone(),
            })
            .collect())
    }

    /// Statistics of every camera.
    pub fn stats(&self) -> Vec<CameraStats> {
        self.cameras.values().map(|camera| camera.stats()).collect()
    }

    /// Zero every camera's counters.
    pub fn reset_counters(&self) {
        for camera in self.cameras.values() {
            camera.reset_counters();
        }
        info!("counters reset");
    }

    /// Write the newest frame of every camera to `dir` as JPEG.
    ///
    /// Cameras without a frame are skipped. Returns the written paths.
    pub fn save_snapshots(&self, dir: &Path, quality: u8) -> Result<Vec<PathBuf>, PipelineError> {
        fs::create_dir_all(dir)?;
        let mut saved = Vec::new();

        for camera in self.cameras.values() {
            let Some(frame) = camera.latest_frame() else {
                warn!(camera = %camera.name(), "no frame available for snapshot");
                continue;
            };
            let image = frame.image.to_rgb()?;
            let path = dir.join(format!(
                "{}_{}.jpg",
                camera.name(),
                Utc::now().format("%Y%m%d_%H%M%S_%6f")
            ));

            let mut file = BufWriter::new(File::create(&path)?);
            JpegEncoder::new_with_quality(&mut file, quality.clamp(1, 100))
                .encode_image(&image)
                .map_err(|err| PipelineError::Snapshot {
                    camera: camera.name().to_owned(),
                    reason: err.to_string(),
                })?;
            file.flush()?;
            info!(camera = %camera.name(), path = %path.display(), "snapshot saved");
            saved.push(path);
        }

        Ok(saved)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_initial_controls(port: &dyn ControlPort, camera: &Camera, controls: &[InitialControl]) {
    for initial in controls {
        match port.set(camera.device(), &initial.control, initial.value) {
            Ok(()) => camera.controls().record(&initial.control, initial.value),
            Err(err) => warn!(
                camera = %camera.name(),
                control = %initial.control,
                error = %err,
                "initial control not applied"
            ),
        }
    }
}

fn read_controls(port: &dyn ControlPort, camera: &Camera, catalog: &ControlCatalog) {
    for (control, _) in catalog.iter() {
        match port.get(camera.device(), control) {
            Ok(value) => camera.controls().record(control, value),
            Err(err) => debug!(camera = %camera.name(), control, error = %err, "control unreadable"),
        }
    }
}
