//! Command line and environment configuration.
//!
//! Every flag can also be given through an `MCR_` environment variable. The
//! optional control policy file overrides the control catalog and the
//! exposure policy.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::camera::CameraSpec;
use crate::control::ControlCatalog;
use crate::exposure::ExposurePolicy;
use crate::frame::PixelFormat;
use crate::supervisor::PipelineConfig;
use crate::traits::{Format, FourCC};

/// Parse a resolution in format "WIDTHxHEIGHT"
fn parse_resolution(s: &str) -> std::result::Result<(u32, u32), String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| "Resolution must be in format 'WIDTHxHEIGHT'".to_owned())?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|_| "Invalid width".to_owned())?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|_| "Invalid height".to_owned())?;
    if width == 0 || height == 0 {
        return Err("Resolution must be non-zero".to_owned());
    }
    Ok((width, height))
}

/// Parse a four character pixel format code the frame decoder understands
fn parse_pixel_format(s: &str) -> std::result::Result<FourCC, String> {
    let fourcc = FourCC::parse(s.trim()).ok_or_else(|| format!("Invalid FourCC {s:?}"))?;
    if PixelFormat::from_fourcc(fourcc).is_none() {
        return Err(format!("Unsupported pixel format {fourcc}"));
    }
    Ok(fourcc)
}

/// Parse a fraction in [0, 1)
fn parse_margin(s: &str) -> std::result::Result<f64, String> {
    let margin = s
        .trim()
        .parse::<f64>()
        .map_err(|_| "Invalid fraction".to_owned())?;
    if !(0.0..1.0).contains(&margin) {
        return Err("Margin must be at least 0 and below 1".to_owned());
    }
    Ok(margin)
}

/// How camera controls are read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlBackend {
    /// Run the `v4l2-ctl` utility.
    #[value(name = "v4l2-ctl")]
    V4l2Ctl,
    /// Issue control ioctls directly.
    Ioctl,
}

/// Record clips from several USB cameras with automatic exposure control
/// and a disk quota.
#[derive(Parser, Debug, Clone)]
#[command(name = "multi-cam-recorder", version)]
pub struct Cli {
    /// Camera as NAME=DEVICE, repeatable
    #[arg(long = "camera", env = "MCR_CAMERAS", value_delimiter = ',')]
    pub cameras: Vec<CameraSpec>,

    /// Recording root directory
    #[arg(long, env = "MCR_ROOT", default_value = "recordings")]
    pub root: PathBuf,

    /// Length of each clip in seconds
    #[arg(long, env = "MCR_CLIP_DURATION", default_value_t = 60)]
    pub clip_duration: u64,

    /// Disk quota for the recording root in bytes
    #[arg(long, env = "MCR_QUOTA_BYTES", default_value_t = 10_737_418_240)]
    pub quota_bytes: u64,

    /// Fraction of the quota freed below the limit on each eviction
    #[arg(long, env = "MCR_QUOTA_MARGIN", default_value = "0.1", value_parser = parse_margin)]
    pub quota_margin: f64,

    /// Seconds between disk usage checks
    #[arg(long, env = "MCR_QUOTA_INTERVAL", default_value_t = 60)]
    pub quota_interval: u64,

    /// Requested capture resolution (format: "WIDTHxHEIGHT")
    #[arg(long, env = "MCR_RESOLUTION", default_value = "1280x720", value_parser = parse_resolution)]
    pub resolution: (u32, u32),

    /// Requested frame rate
    #[arg(long, env = "MCR_FPS", default_value_t = 30)]
    pub fps: u32,

    /// Requested pixel format
    #[arg(long, env = "MCR_PIXEL_FORMAT", default_value = "MJPG", value_parser = parse_pixel_format)]
    pub pixel_format: FourCC,

    /// Lower edge of the target brightness band [default: 80]
    #[arg(long, env = "MCR_TARGET_LOW")]
    pub target_low: Option<f64>,

    /// Upper edge of the target brightness band [default: 120]
    #[arg(long, env = "MCR_TARGET_HIGH")]
    pub target_high: Option<f64>,

    /// Seconds between exposure adjustment cycles [default: 7]
    #[arg(long, env = "MCR_ADJUST_INTERVAL")]
    pub adjust_interval: Option<f64>,

    /// JSON file overriding the control catalog and exposure policy
    #[arg(long, env = "MCR_CONTROL_POLICY")]
    pub control_policy: Option<PathBuf>,

    /// Control backend
    #[arg(long, env = "MCR_CONTROL_BACKEND", value_enum, default_value_t = ControlBackend::V4l2Ctl)]
    pub control_backend: ControlBackend,

    /// Timeout for a single v4l2-ctl call in milliseconds
    #[arg(long, env = "MCR_CONTROL_TIMEOUT", default_value_t = 2000)]
    pub control_timeout: u64,

    /// JPEG quality of recorded frames
    #[arg(long, env = "MCR_JPEG_QUALITY", default_value_t = 85, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,

    /// Seconds between statistics log lines, 0 disables them
    #[arg(long, env = "MCR_STATS_INTERVAL", default_value_t = 30)]
    pub stats_interval: u64,

    /// Write a snapshot of every camera to this directory before exiting
    #[arg(long, env = "MCR_SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Stop after this many seconds instead of running until interrupted
    #[arg(long, env = "MCR_RUN_FOR")]
    pub run_for: Option<u64>,

    /// Use synthetic cameras and simulated control hardware
    #[arg(long, env = "MCR_SIMULATE", default_value_t = false)]
    pub simulate: bool,

    /// Scene brightness seen by simulated cameras at default settings
    #[arg(long, env = "MCR_SIMULATE_SCENE", default_value_t = 60.0)]
    pub simulate_scene: f64,
}

/// Contents of the `--control-policy` file. Both sections are optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlPolicyFile {
    /// Replacement control catalog.
    #[serde(default)]
    pub catalog: Option<ControlCatalog>,
    /// Replacement exposure policy; missing fields keep their defaults.
    #[serde(default)]
    pub exposure: Option<ExposurePolicy>,
}

/// Read and parse a control policy file.
pub fn load_control_policy(path: &Path) -> Result<ControlPolicyFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read control policy {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse control policy {}", path.display()))
}

/// Cameras used by `--simulate` when none are given.
fn simulated_cameras() -> Vec<CameraSpec> {
    vec![
        CameraSpec::new("sim_lr", "/dev/sim_lr"),
        CameraSpec::new("sim_ur", "/dev/sim_ur"),
    ]
}

impl Cli {
    /// Build the pipeline configuration, loading the control policy file if
    /// one was given.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let cameras = if self.cameras.is_empty() && self.simulate {
            simulated_cameras()
        } else {
            self.cameras.clone()
        };
        if cameras.is_empty() {
            bail!("no cameras configured, use --camera NAME=DEVICE");
        }
        for (index, camera) in cameras.iter().enumerate() {
            if cameras.iter().take(index).any(|other| other.name == camera.name) {
                bail!("camera name {} is used twice", camera.name);
            }
        }
        if self.clip_duration == 0 {
            bail!("--clip-duration must be positive");
        }

        let mut config = PipelineConfig::new(cameras, &self.root);
        config.recording.clip_duration = Duration::from_secs(self.clip_duration);
        config.capture.format = Format::new(self.resolution.0, self.resolution.1, self.pixel_format);
        config.capture.fps = self.fps;
        config.retention.quota_bytes = self.quota_bytes;
        config.retention.margin = self.quota_margin;
        config.retention.check_interval = Duration::from_secs(self.quota_interval.max(1));

        if let Some(path) = &self.control_policy {
            let policy = load_control_policy(path)?;
            if let Some(catalog) = policy.catalog {
                config.catalog = catalog;
            }
            if let Some(exposure) = policy.exposure {
                config.exposure = exposure;
            }
        }

        // Flags given explicitly win over the policy file
        if let Some(low) = self.target_low {
            config.exposure.target_low = low;
        }
        if let Some(high) = self.target_high {
            config.exposure.target_high = high;
        }
        if let Some(seconds) = self.adjust_interval {
            if seconds.is_nan() || seconds <= 0.0 {
                bail!("--adjust-interval must be positive");
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let interval_ms = (seconds * 1000.0).round() as u64;
            config.exposure.interval_ms = interval_ms.max(1);
        }

        if config.exposure.interval_ms == 0 {
            bail!("exposure interval must be positive");
        }
        if config.exposure.target_low >= config.exposure.target_high {
            bail!(
                "target band [{}, {}] is empty",
                config.exposure.target_low,
                config.exposure.target_high
            );
        }
        for setting in &config.exposure.priority {
            if config.catalog.get(&setting.control).is_none() {
                bail!(
                    "exposure priority names {} which is not in the control catalog",
                    setting.control
                );
            }
        }

        Ok(config)
    }

    /// Timeout for a single control tool call.
    pub const fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout)
    }

    /// Interval of the statistics log, if enabled.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}
