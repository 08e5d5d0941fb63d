//! Named integer camera controls and the ports that read and write them.
//!
//! A [`ControlPort`] is the only way the pipeline touches camera controls.
//! Two implementations ship with the crate: [`V4l2CtlPort`] shells out to the
//! `v4l2-ctl` utility, [`DeviceControlPort`] talks to the driver directly
//! through the v4l crate. Tests use `mock::SimulatedControls`.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use v4l::control::{Type as ControlType, Value as ControlValue};
use v4l::Device;

/// Errors from reading or writing a camera control.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The control could not be read.
    #[error("failed to read {control} on {}: {reason}", device.display())]
    ControlReadFailed {
        /// Device path.
        device: PathBuf,
        /// Control name.
        control: String,
        /// Underlying cause.
        reason: String,
    },
    /// The control could not be written.
    #[error("failed to set {control}={value} on {}: {reason}", device.display())]
    ControlWriteFailed {
        /// Device path.
        device: PathBuf,
        /// Control name.
        control: String,
        /// Value that was rejected.
        value: i64,
        /// Underlying cause.
        reason: String,
    },
    /// The control tool answered with something that is not an integer.
    #[error("unparsable value for {control}: {output:?}")]
    Unparsable {
        /// Control name.
        control: String,
        /// Raw output.
        output: String,
    },
    /// The control is not in the catalog.
    #[error("unknown control {0}")]
    UnknownControl(String),
    /// The value lies outside the control's valid range.
    #[error("{value} is outside the valid range of {control}")]
    OutOfRange {
        /// Control name.
        control: String,
        /// Offending value.
        value: i64,
    },
    /// An auto-mode control did not switch to manual after being written.
    #[error("{control} still reads {actual:?} after requesting {expected}")]
    ModeNotApplied {
        /// Auto-mode control name.
        control: String,
        /// Requested manual value.
        expected: i64,
        /// Value read back.
        actual: Option<i64>,
    },
    /// The control tool did not answer in time.
    #[error("control tool timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for control operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Typed access to named integer controls of a device.
pub trait ControlPort: Send + Sync {
    /// Read the current value of `control`.
    fn get(&self, device: &Path, control: &str) -> Result<i64>;

    /// Write `value` to `control`.
    fn set(&self, device: &Path, control: &str, value: i64) -> Result<()>;
}

/// Valid values of a control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingRange {
    /// Inclusive integer range.
    Bounds {
        /// Smallest accepted value.
        min: i64,
        /// Largest accepted value.
        max: i64,
    },
    /// Named menu entries.
    Options(BTreeMap<String, i64>),
}

impl SettingRange {
    /// Whether `value` is accepted.
    pub fn contains(&self, value: i64) -> bool {
        match self {
            Self::Bounds { min, max } => (*min..=*max).contains(&value),
            Self::Options(options) => options.values().any(|&v| v == value),
        }
    }

    /// `(min, max)` for numeric ranges.
    pub const fn bounds(&self) -> Option<(i64, i64)> {
        match self {
            Self::Bounds { min, max } => Some((*min, *max)),
            Self::Options(_) => None,
        }
    }
}

/// An auto-mode control that must hold `value` before a dependent control
/// is written, otherwise the hardware may silently ignore the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualMode {
    /// Auto-mode control name, e.g. `exposure_auto`.
    pub control: String,
    /// Value selecting manual operation.
    pub value: i64,
}

/// Static description of one control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingSpec {
    /// Accepted values.
    pub range: SettingRange,
    /// Mode that must be manual before writing this control.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_manual: Option<ManualMode>,
}

/// Range table for every control the pipeline knows about.
///
/// This is configuration, not something queried from the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlCatalog {
    settings: BTreeMap<String, SettingSpec>,
}

impl Default for ControlCatalog {
    fn default() -> Self {
        let bounds = |min, max| SettingSpec {
            range: SettingRange::Bounds { min, max },
            requires_manual: None,
        };
        let options = |entries: &[(&str, i64)]| SettingSpec {
            range: SettingRange::Options(
                entries
                    .iter()
                    .map(|(name, value)| ((*name).to_owned(), *value))
                    .collect(),
            ),
            requires_manual: None,
        };

        let mut settings = BTreeMap::new();
        settings.insert(
            "exposure_auto".to_owned(),
            options(&[("manual", 1), ("auto", 3)]),
        );
        settings.insert(
            "exposure_absolute".to_owned(),
            SettingSpec {
                requires_manual: Some(ManualMode {
                    control: "exposure_auto".to_owned(),
                    value: 1,
                }),
                ..bounds(10, 2047)
            },
        );
        settings.insert("brightness".to_owned(), bounds(0, 255));
        settings.insert("contrast".to_owned(), bounds(0, 255));
        settings.insert("gain".to_owned(), bounds(0, 255));
        settings.insert(
            "white_balance_temperature_auto".to_owned(),
            options(&[("off", 0), ("on", 1)]),
        );
        settings.insert(
            "white_balance_temperature".to_owned(),
            SettingSpec {
                requires_manual: Some(ManualMode {
                    control: "white_balance_temperature_auto".to_owned(),
                    value: 0,
                }),
                ..bounds(2800, 6500)
            },
        );

        Self { settings }
    }
}

impl ControlCatalog {
    /// Build a catalog from explicit entries.
    pub fn from_settings(settings: BTreeMap<String, SettingSpec>) -> Self {
        Self { settings }
    }

    /// Look up a control.
    pub fn get(&self, control: &str) -> Option<&SettingSpec> {
        self.settings.get(control)
    }

    /// Iterate over all known controls.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingSpec)> {
        self.settings.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Reject values outside the static range table.
    pub fn validate(&self, control: &str, value: i64) -> Result<&SettingSpec> {
        let spec = self
            .get(control)
            .ok_or_else(|| ControlError::UnknownControl(control.to_owned()))?;
        if !spec.range.contains(value) {
            return Err(ControlError::OutOfRange {
                control: control.to_owned(),
                value,
            });
        }
        Ok(spec)
    }
}

/// A control as seen by a camera: its last known value and valid range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlSetting {
    /// Control name.
    pub name: String,
    /// Last value read from or written to the device.
    pub value: Option<i64>,
    /// Accepted values.
    pub range: SettingRange,
}

/// Put `mode` into its manual value and confirm the device took it.
///
/// Returns `true` if a write was needed.
pub fn force_manual(
    port: &dyn ControlPort,
    device: &Path,
    mode: &ManualMode,
    settle: Duration,
) -> Result<bool> {
    if port.get(device, &mode.control)? == mode.value {
        return Ok(false);
    }

    port.set(device, &mode.control, mode.value)?;
    thread::sleep(settle);

    let actual = port.get(device, &mode.control).ok();
    if actual != Some(mode.value) {
        return Err(ControlError::ModeNotApplied {
            control: mode.control.clone(),
            expected: mode.value,
            actual,
        });
    }
    debug!(device = %device.display(), control = %mode.control, "switched to manual");
    Ok(true)
}

/// [`ControlPort`] backed by the `v4l2-ctl` command line utility.
#[derive(Debug, Clone)]
pub struct V4l2CtlPort {
    program: PathBuf,
    timeout: Duration,
}

impl Default for V4l2CtlPort {
    fn default() -> Self {
        Self::new("v4l2-ctl", Duration::from_secs(2))
    }
}

impl V4l2CtlPort {
    /// Use `program` with a per-invocation `timeout`.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Run the tool and return stdout, treating any non-zero exit as an error.
    fn run(&self, args: &[String]) -> std::result::Result<String, String> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("failed to run {}: {err}", self.program.display()))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ControlError::Timeout(self.timeout).to_string());
                }
                Ok(None) => thread::sleep(Duration::from_millis(5)),
                Err(err) => return Err(err.to_string()),
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout);
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }

        if status.success() {
            Ok(stdout)
        } else {
            Err(format!("{status}: {}", stderr.trim()))
        }
    }
}

/// Parse `"<name>: <value>"` as printed by `v4l2-ctl --get-ctrl`.
fn parse_get_ctrl(control: &str, output: &str) -> Result<i64> {
    output
        .lines()
        .find_map(|line| line.split_once(':'))
        .and_then(|(_, value)| value.trim().parse().ok())
        .ok_or_else(|| ControlError::Unparsable {
            control: control.to_owned(),
            output: output.trim().to_owned(),
        })
}

impl ControlPort for V4l2CtlPort {
    fn get(&self, device: &Path, control: &str) -> Result<i64> {
        let args = [
            "-d".to_owned(),
            device.display().to_string(),
            format!("--get-ctrl={control}"),
        ];
        let output = self
            .run(&args)
            .map_err(|reason| ControlError::ControlReadFailed {
                device: device.to_path_buf(),
                control: control.to_owned(),
                reason,
            })?;
        parse_get_ctrl(control, &output)
    }

    fn set(&self, device: &Path, control: &str, value: i64) -> Result<()> {
        let args = [
            "-d".to_owned(),
            device.display().to_string(),
            format!("--set-ctrl={control}={value}"),
        ];
        self.run(&args)
            .map(drop)
            .map_err(|reason| {
                warn!(device = %device.display(), control, value, %reason, "v4l2-ctl set failed");
                ControlError::ControlWriteFailed {
                    device: device.to_path_buf(),
                    control: control.to_owned(),
                    value,
                    reason,
                }
            })
    }
}

/// [`ControlPort`] that issues control ioctls through the v4l crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceControlPort;

/// Turn a driver label such as `"Exposure, Absolute"` into the
/// `exposure_absolute` style used by `v4l2-ctl`.
pub fn control_key(label: &str) -> String {
    let mut key = String::with_capacity(label.len());
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            key.push(ch.to_ascii_lowercase());
        } else if !key.is_empty() && !key.ends_with('_') {
            key.push('_');
        }
    }
    while key.ends_with('_') {
        key.pop();
    }
    key
}

impl DeviceControlPort {
    fn lookup(device: &Path, control: &str) -> std::io::Result<(Device, u32, ControlType)> {
        let handle = Device::with_path(device)?;
        let description = handle
            .query_controls()?
            .into_iter()
            .find(|desc| control_key(&desc.name) == control)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("device has no control named {control}"),
                )
            })?;
        Ok((handle, description.id, description.typ))
    }
}

impl ControlPort for DeviceControlPort {
    fn get(&self, device: &Path, control: &str) -> Result<i64> {
        let read_failed = |reason: String| ControlError::ControlReadFailed {
            device: device.to_path_buf(),
            control: control.to_owned(),
            reason,
        };

        let (handle, id, _) =
            Self::lookup(device, control).map_err(|err| read_failed(err.to_string()))?;
        let current = handle
            .control(id)
            .map_err(|err| read_failed(err.to_string()))?;

        match current.value {
            ControlValue::Integer(value) => Ok(value),
            ControlValue::Boolean(value) => Ok(i64::from(value)),
            other => Err(ControlError::Unparsable {
                control: control.to_owned(),
                output: format!("{other:?}"),
            }),
        }
    }

    fn set(&self, device: &Path, control: &str, value: i64) -> Result<()> {
        let write_failed = |reason: String| ControlError::ControlWriteFailed {
            device: device.to_path_buf(),
            control: control.to_owned(),
            value,
            reason,
        };

        let (handle, id, typ) =
            Self::lookup(device, control).map_err(|err| write_failed(err.to_string()))?;
        let value = match typ {
            ControlType::Boolean => ControlValue::Boolean(value != 0),
            _ => ControlValue::Integer(value),
        };

        handle
            .set_control(v4l::Control { id, value })
            .map_err(|err| write_failed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_ctrl_output() {
        assert_eq!(parse_get_ctrl("gain", "gain: 42\n").expect("parse"), 42);
        assert_eq!(
            parse_get_ctrl("exposure_absolute", "exposure_absolute: -3").expect("parse"),
            -3
        );
        assert!(matches!(
            parse_get_ctrl("gain", "garbage"),
            Err(ControlError::Unparsable { .. })
        ));
        assert!(parse_get_ctrl("gain", "gain: high").is_err());
    }

    #[test]
    fn test_control_key_normalisation() {
        assert_eq!(control_key("Exposure, Absolute"), "exposure_absolute");
        assert_eq!(
            control_key("White Balance Temperature, Auto"),
            "white_balance_temperature_auto"
        );
        assert_eq!(control_key("Gain"), "gain");
    }

    #[test]
    fn test_catalog_defaults_and_validation() {
        let catalog = ControlCatalog::default();
        assert!(catalog.validate("brightness", 128).is_ok());
        assert!(matches!(
            catalog.validate("brightness", 300),
            Err(ControlError::OutOfRange { .. })
        ));
        assert!(matches!(
            catalog.validate("zoom_absolute", 1),
            Err(ControlError::UnknownControl(_))
        ));

        let exposure = catalog.get("exposure_absolute").expect("exposure entry");
        assert_eq!(exposure.range.bounds(), Some((10, 2047)));
        assert_eq!(
            exposure.requires_manual.as_ref().map(|m| m.control.as_str()),
            Some("exposure_auto")
        );
        assert!(catalog.validate("exposure_auto", 1).is_ok());
        assert!(catalog.validate("exposure_auto", 2).is_err());
    }

    #[test]
    fn test_catalog_deserialises_both_range_shapes() {
        let json = r#"{
            "gain": { "range": { "min": 0, "max": 100 } },
            "exposure_auto": { "range": { "manual": 1, "auto": 3 } }
        }"#;
        let catalog: ControlCatalog = serde_json::from_str(json).expect("catalog json");
        assert_eq!(
            catalog.get("gain").map(|s| s.range.clone()),
            Some(SettingRange::Bounds { min: 0, max: 100 })
        );
        assert!(catalog.validate("exposure_auto", 3).is_ok());
    }

    #[test]
    fn test_missing_tool_is_a_read_failure() {
        let port = V4l2CtlPort::new("/nonexistent/v4l2-ctl", Duration::from_millis(200));
        let err = port
            .get(Path::new("/dev/video0"), "gain")
            .expect_err("tool is missing");
        assert!(matches!(err, ControlError::ControlReadFailed { .. }));

        let err = port
            .set(Path::new("/dev/video0"), "gain", 3)
            .expect_err("tool is missing");
        assert!(matches!(err, ControlError::ControlWriteFailed { .. }));
    }
}
