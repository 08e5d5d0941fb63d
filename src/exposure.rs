//! Closed-loop exposure control.
//!
//! Every cycle measures the mean luma of each camera's newest frame and, if
//! it falls outside the target band, nudges exactly one control toward the
//! band. Controls are tried in priority order; a control already at its
//! limit passes the turn to the next one.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::{Camera, CameraState};
use crate::control::{force_manual, ControlCatalog, ControlError, ControlPort};
use crate::shutdown::StopSignal;

/// One control the controller may move, with its step rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunableSetting {
    /// Control name in the catalog.
    pub control: String,
    /// Smallest step applied.
    pub base_step: i64,
    /// Step per unit of luma deviation; larger deviations move faster.
    pub deviation_scale: f64,
}

impl TunableSetting {
    /// Create a setting rule.
    pub fn new(control: impl Into<String>, base_step: i64, deviation_scale: f64) -> Self {
        Self {
            control: control.into(),
            base_step,
            deviation_scale,
        }
    }

    /// `max(base_step, deviation * deviation_scale)`.
    pub fn step(&self, deviation: f64) -> i64 {
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (deviation * self.deviation_scale).round() as i64;
        self.base_step.max(scaled).max(1)
    }
}

/// Target band, cadence and step rules of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposurePolicy {
    /// Lower bound of acceptable mean luma.
    pub target_low: f64,
    /// Upper bound of acceptable mean luma.
    pub target_high: f64,
    /// Cycle period in milliseconds.
    pub interval_ms: u64,
    /// Wait after switching an auto mode before re-reading it.
    pub mode_settle_ms: u64,
    /// Controls in the order they are tried.
    pub priority: Vec<TunableSetting>,
}

impl Default for ExposurePolicy {
    fn default() -> Self {
        Self {
            target_low: 80.0,
            target_high: 120.0,
            interval_ms: 7000,
            mode_settle_ms: 50,
            priority: vec![
                TunableSetting::new("exposure_absolute", 50, 2.0),
                TunableSetting::new("brightness", 10, 0.5),
                TunableSetting::new("contrast", 10, 0.5),
                TunableSetting::new("gain", 5, 0.25),
            ],
        }
    }
}

impl ExposurePolicy {
    /// Cycle period.
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Auto-mode settle delay.
    pub const fn mode_settle(&self) -> Duration {
        Duration::from_millis(self.mode_settle_ms)
    }
}

/// What one cycle did for one camera.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No frame was available.
    NoFrame,
    /// Brightness already inside the band; nothing written.
    InBand {
        /// Measured mean luma.
        brightness: f64,
    },
    /// One control was moved.
    Adjusted {
        /// Measured mean luma.
        brightness: f64,
        /// Control written.
        control: String,
        /// Value before the write.
        from: i64,
        /// Value written.
        to: i64,
    },
    /// Every control is already at the limit in the needed direction.
    Saturated {
        /// Measured mean luma.
        brightness: f64,
    },
}

/// Decides and applies exposure adjustments through a [`ControlPort`].
pub struct ExposureController {
    port: Arc<dyn ControlPort>,
    catalog: Arc<ControlCatalog>,
    policy: ExposurePolicy,
}

impl ExposureController {
    /// Create a controller.
    pub fn new(
        port: Arc<dyn ControlPort>,
        catalog: Arc<ControlCatalog>,
        policy: ExposurePolicy,
    ) -> Self {
        Self {
            port,
            catalog,
            policy,
        }
    }

    /// Active policy.
    pub const fn policy(&self) -> &ExposurePolicy {
        &self.policy
    }

    /// Run one cycle for `camera` on its newest live frame.
    pub fn cycle(&self, camera: &Camera) -> Result<CycleOutcome, ControlError> {
        let Some(frame) = camera.latest_frame() else {
            return Ok(CycleOutcome::NoFrame);
        };
        let brightness = match frame.image.mean_luma() {
            Ok(brightness) => brightness,
            Err(err) => {
                warn!(camera = %camera.name(), error = %err, "cannot measure brightness");
                return Ok(CycleOutcome::NoFrame);
            }
        };
        self.adjust(camera, brightness)
    }

    /// Move one control of `camera` toward the band given a measured
    /// `brightness`.
    pub fn adjust(&self, camera: &Camera, brightness: f64) -> Result<CycleOutcome, ControlError> {
        let (low, high) = (self.policy.target_low, self.policy.target_high);
        if (low..=high).contains(&brightness) {
            return Ok(CycleOutcome::InBand { brightness });
        }

        let (direction, deviation) = if brightness < low {
            (1, low - brightness)
        } else {
            (-1, brightness - high)
        };

        for setting in &self.policy.priority {
            let Some(spec) = self.catalog.get(&setting.control) else {
                debug!(control = %setting.control, "not in catalog, skipping");
                continue;
            };
            let Some((min, max)) = spec.range.bounds() else {
                continue;
            };

            let current = self.port.get(camera.device(), &setting.control)?;
            camera.controls().record(&setting.control, current);

            let proposed = current
                .saturating_add(direction * setting.step(deviation))
                .clamp(min, max);
            if proposed == current {
                continue;
            }

            if let Some(mode) = &spec.requires_manual {
                if force_manual(
                    self.port.as_ref(),
                    camera.device(),
                    mode,
                    self.policy.mode_settle(),
                )? {
                    camera.controls().record(&mode.control, mode.value);
                }
            }

            self.port.set(camera.device(), &setting.control, proposed)?;
            camera.controls().record(&setting.control, proposed);
            return Ok(CycleOutcome::Adjusted {
                brightness,
                control: setting.control.clone(),
                from: current,
                to: proposed,
            });
        }

        Ok(CycleOutcome::Saturated { brightness })
    }

    /// Start the shared controller thread cycling over `cameras`.
    pub fn spawn(self, cameras: Vec<Arc<Camera>>) -> io::Result<ExposureHandle> {
        let stop = StopSignal::new();
        let handle = thread::Builder::new()
            .name("exposure".to_owned())
            .spawn({
                let stop = stop.clone();
                move || self.run(&cameras, &stop)
            })?;
        Ok(ExposureHandle {
            stop,
            handle: Some(handle),
        })
    }

    fn run(&self, cameras: &[Arc<Camera>], stop: &StopSignal) {
        info!(
            cameras = cameras.len(),
            interval = ?self.policy.interval(),
            "exposure control started"
        );
        while !stop.wait_timeout(self.policy.interval()) {
            for camera in cameras {
                if stop.is_triggered() {
                    break;
                }
                if camera.state() != CameraState::Running {
                    continue;
                }
                match self.cycle(camera) {
                    Ok(CycleOutcome::Adjusted {
                        brightness,
                        control,
                        from,
                        to,
                    }) => info!(
                        camera = %camera.name(),
                        brightness = format_args!("{brightness:.1}"),
                        %control,
                        from,
                        to,
                        "exposure adjusted"
                    ),
                    Ok(CycleOutcome::Saturated { brightness }) => warn!(
                        camera = %camera.name(),
                        brightness = format_args!("{brightness:.1}"),
                        "all exposure controls at their limits"
                    ),
                    Ok(outcome) => debug!(camera = %camera.name(), ?outcome, "exposure cycle"),
                    Err(err) => warn!(
                        camera = %camera.name(),
                        error = %err,
                        "exposure cycle abandoned"
                    ),
                }
            }
        }
        debug!("exposure control stopped");
    }
}

/// Running exposure controller thread.
pub struct ExposureHandle {
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl ExposureHandle {
    /// Stop the thread and wait for it. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("exposure controller panicked");
            }
        }
    }
}

impl Drop for ExposureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSpec, QueueSettings};
    use crate::clip::{ClipRecorder, RecordingSettings};
    use crate::encoder::MjpegEncoderFactory;
    use crate::frame::{CapturedFrame, PixelBuffer};
    use crate::mock::SimulatedControls;
    use std::path::Path;
    use std::time::Instant;

    fn camera(name: &str) -> Arc<Camera> {
        let recorder = ClipRecorder::new(
            name,
            RecordingSettings::new(std::env::temp_dir().join("exposure-tests")),
            Arc::new(MjpegEncoderFactory::default()),
        );
        Arc::new(Camera::new(
            CameraSpec::new(name, format!("/dev/{name}")),
            QueueSettings::default(),
            recorder,
        ))
    }

    fn controller(controls: &Arc<SimulatedControls>) -> ExposureController {
        let policy = ExposurePolicy {
            mode_settle_ms: 0,
            ..ExposurePolicy::default()
        };
        ExposureController::new(
            Arc::clone(controls) as Arc<dyn ControlPort>,
            Arc::new(ControlCatalog::default()),
            policy,
        )
    }

    #[test]
    fn test_step_grows_with_deviation() {
        let setting = TunableSetting::new("exposure_absolute", 50, 2.0);
        assert_eq!(setting.step(5.0), 50);
        assert_eq!(setting.step(40.0), 80);
    }

    #[test]
    fn test_in_band_makes_no_writes() {
        let controls = Arc::new(SimulatedControls::new());
        let controller = controller(&controls);
        let camera = camera("cam_lr");

        for _ in 0..5 {
            let outcome = controller.adjust(&camera, 100.0).expect("cycle");
            assert_eq!(outcome, CycleOutcome::InBand { brightness: 100.0 });
        }
        assert!(controls.writes().is_empty());
    }

    #[test]
    fn test_dark_scene_forces_manual_before_exposure() {
        let controls = Arc::new(SimulatedControls::new());
        let controller = controller(&controls);
        let camera = camera("cam_lr");

        let outcome = controller.adjust(&camera, 40.0).expect("cycle");
        assert_eq!(
            outcome,
            CycleOutcome::Adjusted {
                brightness: 40.0,
                control: "exposure_absolute".to_owned(),
                from: 156,
                to: 236,
            }
        );

        let writes: Vec<_> = controls
            .writes()
            .into_iter()
            .map(|w| (w.control, w.value, w.applied))
            .collect();
        assert_eq!(
            writes,
            vec![
                ("exposure_auto".to_owned(), 1, true),
                ("exposure_absolute".to_owned(), 236, true),
            ]
        );
        assert_eq!(camera.controls().get("exposure_absolute"), Some(236));
        assert_eq!(camera.controls().get("exposure_auto"), Some(1));
    }

    #[test]
    fn test_dark_scene_converges_monotonically() {
        let controls = Arc::new(SimulatedControls::new());
        let controller = controller(&controls);
        let camera = camera("cam_lr");
        let device = camera.device().to_path_buf();

        let mut exposures = vec![controls.value(&device, "exposure_absolute").expect("value")];
        for _ in 0..100 {
            match controller.adjust(&camera, 10.0).expect("cycle") {
                CycleOutcome::Adjusted { control, to, .. } if control == "exposure_absolute" => {
                    exposures.push(to);
                }
                CycleOutcome::Adjusted { .. } => break,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert!(exposures.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(exposures.last(), Some(&2047));
        // Once exposure is pinned the next knob takes over
        assert!(controls.value(&device, "brightness").expect("value") > 128);
    }

    #[test]
    fn test_bright_scene_lowers_exposure() {
        let controls = Arc::new(SimulatedControls::new());
        let controller = controller(&controls);
        let camera = camera("cam_lr");

        let outcome = controller.adjust(&camera, 125.0).expect("cycle");
        assert_eq!(
            outcome,
            CycleOutcome::Adjusted {
                brightness: 125.0,
                control: "exposure_absolute".to_owned(),
                from: 156,
                to: 106,
            }
        );
    }

    #[test]
    fn test_saturated_when_every_control_is_pinned() {
        let controls = Arc::new(
            SimulatedControls::new()
                .with_value("exposure_auto", 1)
                .with_value("exposure_absolute", 2047)
                .with_value("brightness", 255)
                .with_value("contrast", 255)
                .with_value("gain", 255),
        );
        let controller = controller(&controls);
        let camera = camera("cam_lr");

        let outcome = controller.adjust(&camera, 10.0).expect("cycle");
        assert_eq!(outcome, CycleOutcome::Saturated { brightness: 10.0 });
        assert!(controls.writes().is_empty());
    }

    #[test]
    fn test_mode_that_never_applies_abandons_cycle() {
        let controls = Arc::new(SimulatedControls::new());
        controls.lock_auto_modes(true);
        let controller = controller(&controls);
        let camera = camera("cam_lr");

        let result = controller.adjust(&camera, 40.0);
        assert!(matches!(result, Err(ControlError::ModeNotApplied { .. })));
        assert!(controls
            .writes()
            .iter()
            .all(|w| w.control != "exposure_absolute"));
    }

    #[test]
    fn test_read_failure_abandons_cycle() {
        let controls = Arc::new(SimulatedControls::new());
        controls.fail_reads("exposure_absolute");
        let controller = controller(&controls);
        let camera = camera("cam_lr");

        let result = controller.adjust(&camera, 40.0);
        assert!(matches!(result, Err(ControlError::ControlReadFailed { .. })));
        assert!(controls.writes().is_empty());
    }

    #[test]
    fn test_cycle_measures_latest_frame() {
        let controls = Arc::new(SimulatedControls::new());
        let controller = controller(&controls);
        let camera = camera("cam_lr");

        assert_eq!(controller.cycle(&camera).expect("cycle"), CycleOutcome::NoFrame);

        for level in [20, 100] {
            camera.publish(CapturedFrame::at(
                camera.name_arc(),
                u64::from(level),
                PixelBuffer::gray(8, 8, level),
                Instant::now(),
                chrono::Utc::now(),
            ));
        }
        // Only the newest frame counts
        assert_eq!(
            controller.cycle(&camera).expect("cycle"),
            CycleOutcome::InBand { brightness: 100.0 }
        );
    }

    #[test]
    fn test_thread_keeps_going_past_failing_camera() {
        let controls = Arc::new(SimulatedControls::new());
        let policy = ExposurePolicy {
            interval_ms: 10,
            mode_settle_ms: 0,
            ..ExposurePolicy::default()
        };
        let controller = ExposureController::new(
            Arc::clone(&controls) as Arc<dyn ControlPort>,
            Arc::new(ControlCatalog::default()),
            policy,
        );

        let broken = camera("cam_broken");
        let healthy = camera("cam_ur");
        for camera in [&broken, &healthy] {
            camera.set_state(CameraState::Running);
        }
        // The broken camera's mode switch fails; the healthy one is already manual
        controls.set(Path::new("/dev/cam_ur"), "exposure_auto", 1).expect("manual");
        controls.fail_writes("exposure_auto");

        let mut handle = controller
            .spawn(vec![Arc::clone(&broken), Arc::clone(&healthy)])
            .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline
            && controls
                .value(Path::new("/dev/cam_ur"), "exposure_absolute")
                .is_some_and(|v| v == 156)
        {
            for camera in [&broken, &healthy] {
                camera.publish(CapturedFrame::now(
                    camera.name_arc(),
                    0,
                    PixelBuffer::gray(8, 8, 30),
                ));
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        assert!(
            controls
                .value(Path::new("/dev/cam_ur"), "exposure_absolute")
                .expect("value")
                > 156
        );
        assert_eq!(controls.value(Path::new("/dev/cam_broken"), "exposure_absolute"), Some(156));
    }
}
