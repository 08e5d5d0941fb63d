//! Mock devices and simulated control hardware for running without cameras.
//!
//! [`MockOpener`] hands out [`MockDevice`]s that generate YUYV test patterns
//! at a fixed pace, with injectable open and read failures.
//! [`SimulatedControls`] is a [`ControlPort`] that behaves like a UVC camera:
//! values written to a dependent control while its auto mode is still active
//! are silently dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::control::{self, ControlCatalog, ControlError, ControlPort};
use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, DeviceOpener, Format, FourCC,
    FrameMetadata, RawFrame, Result,
};

/// Scene brightness for a device, used to drive [`TestPattern::Solid`] frames.
pub type LumaSource = Arc<dyn Fn(&Path) -> u8 + Send + Sync>;

/// Mock device for testing without hardware.
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: Format,
    native_fourcc: FourCC,
    path: PathBuf,
    frame_count: Arc<AtomicU32>,
    pattern: TestPattern,
    luma: Option<LumaSource>,
    frame_interval: Duration,
    faults: Option<Arc<MockFaults>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            native_fourcc: FourCC::YUYV,
            path: PathBuf::from("/dev/mock0"),
            frame_count: Arc::new(AtomicU32::new(0)),
            pattern: TestPattern::ColorBars,
            luma: None,
            frame_interval: Duration::ZERO,
            faults: None,
        }
    }

    /// Set the format for this mock device.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.native_fourcc = format.fourcc;
        self.format = format;
        self
    }

    /// Set the pattern every stream produces.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }
}

impl CameraDevice for MockDevice {
    type Stream = MockStream;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    /// Resolution is honoured; the pixel format is always the native one.
    fn set_format(&mut self, format: &Format) -> Result<Format> {
        self.format = Format::new(format.width, format.height, self.native_fourcc);
        Ok(self.format.clone())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        Ok(fps)
    }

    fn create_stream(&mut self, _buffer_count: u32) -> Result<Self::Stream> {
        Ok(MockStream {
            format: self.format.clone(),
            path: self.path.clone(),
            frame_count: Arc::clone(&self.frame_count),
            pattern: self.pattern,
            luma: self.luma.clone(),
            frame_interval: self.frame_interval,
            faults: self.faults.clone(),
        })
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Mock capture stream for testing.
///
/// Sequence numbers continue across streams of the same device.
pub struct MockStream {
    format: Format,
    path: PathBuf,
    frame_count: Arc<AtomicU32>,
    pattern: TestPattern,
    luma: Option<LumaSource>,
    frame_interval: Duration,
    faults: Option<Arc<MockFaults>>,
}

impl CaptureStream for MockStream {
    fn next_frame(&mut self) -> Result<RawFrame> {
        if !self.frame_interval.is_zero() {
            thread::sleep(self.frame_interval);
        }

        let seq = self.frame_count.load(Ordering::SeqCst);
        if let Some(faults) = &self.faults {
            let mut armed = faults.read_failure_after.lock();
            if armed.is_some_and(|after| seq >= after) {
                *armed = None;
                return Err(CameraError::DeviceReadFailed(
                    "injected read failure".to_owned(),
                ));
            }
        }

        let pattern = match &self.luma {
            Some(luma) => TestPattern::Solid(luma(&self.path), 128, 128),
            None => self.pattern,
        };
        let data = generate_test_frame(&self.format, pattern);
        self.frame_count.fetch_add(1, Ordering::SeqCst);

        Ok(RawFrame {
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: Duration::from_millis(u64::from(seq) * 33), // ~30fps
                bytes_used: u32::try_from(data.len()).unwrap_or(u32::MAX),
            },
            data,
        })
    }
}

#[derive(Default)]
struct MockFaults {
    opens: AtomicU32,
    failing_opens: AtomicU32,
    read_failure_after: Mutex<Option<u32>>,
}

/// Opens [`MockDevice`]s for any path.
///
/// Clones share their fault injection state and open counter.
#[derive(Clone)]
pub struct MockOpener {
    pattern: TestPattern,
    luma: Option<LumaSource>,
    native_fourcc: FourCC,
    frame_interval: Duration,
    open_limit: Option<u32>,
    faults: Arc<MockFaults>,
}

impl Default for MockOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOpener {
    /// Color bars in YUYV at roughly 30 fps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pattern: TestPattern::ColorBars,
            luma: None,
            native_fourcc: FourCC::YUYV,
            frame_interval: Duration::from_millis(33),
            open_limit: None,
            faults: Arc::new(MockFaults::default()),
        }
    }

    /// Pattern produced by every device.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Produce uniform frames whose brightness is asked from `luma` per frame.
    #[must_use]
    pub fn with_luma_source(mut self, luma: LumaSource) -> Self {
        self.luma = Some(luma);
        self
    }

    /// Pixel format the devices insist on, whatever is requested.
    #[must_use]
    pub const fn with_native_fourcc(mut self, fourcc: FourCC) -> Self {
        self.native_fourcc = fourcc;
        self
    }

    /// Sleep between frames.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Only the first `opens` open calls succeed.
    #[must_use]
    pub const fn with_open_limit(mut self, opens: u32) -> Self {
        self.open_limit = Some(opens);
        self
    }

    /// The next device read after `frames` frames fails once.
    #[must_use]
    pub fn fail_read_after(self, frames: u32) -> Self {
        *self.faults.read_failure_after.lock() = Some(frames);
        self
    }

    /// Make the next `count` open calls fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.faults.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Open calls so far, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.faults.opens.load(Ordering::SeqCst)
    }
}

impl DeviceOpener for MockOpener {
    type Device = MockDevice;

    fn open(&self, path: &Path) -> Result<Self::Device> {
        let attempt = self.faults.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let injected = self
            .faults
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.open_limit.is_some_and(|limit| attempt > limit) {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{}: injected open failure",
                path.display()
            )));
        }

        let mut device = MockDevice::new().with_pattern(self.pattern);
        device.native_fourcc = self.native_fourcc;
        device.format = Format::new(640, 480, self.native_fourcc);
        device.path = path.to_path_buf();
        device.luma = self.luma.clone();
        device.frame_interval = self.frame_interval;
        device.faults = Some(Arc::clone(&self.faults));
        device.capabilities.bus_info = format!("mock:{}", path.display());
        Ok(device)
    }
}

/// Generate test frame data based on pattern.
fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    if format.fourcc != FourCC::YUYV {
        return vec![0u8; format.size as usize];
    }

    let size = (format.width * format.height * 2) as usize; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, format.width, format.height);
        }
        TestPattern::Gradient => {
            generate_gradient(&mut data, format.width, format.height);
        }
        TestPattern::Solid(y, u, v) => {
            generate_solid(&mut data, y, u, v);
        }
    }

    data
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = bars[bar_idx];

            let offset = ((y * width + x) * 2) as usize;
            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = u_val;
                data[offset + 2] = y_val;
                data[offset + 3] = v_val;
            }
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = 128;
                data[offset + 2] = y_val;
                data[offset + 3] = 128;
            }
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for chunk in data.chunks_exact_mut(4) {
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}

/// One write seen by [`SimulatedControls`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlWrite {
    /// Device written to.
    pub device: PathBuf,
    /// Control name.
    pub control: String,
    /// Requested value.
    pub value: i64,
    /// Whether the simulated hardware took the value.
    pub applied: bool,
}

struct SimulatedState {
    defaults: BTreeMap<String, i64>,
    devices: BTreeMap<PathBuf, BTreeMap<String, i64>>,
    failing_reads: BTreeSet<String>,
    failing_writes: BTreeSet<String>,
    locked_modes: bool,
    writes: Vec<ControlWrite>,
}

impl SimulatedState {
    fn values(&mut self, device: &Path) -> &mut BTreeMap<String, i64> {
        let defaults = &self.defaults;
        self.devices
            .entry(device.to_path_buf())
            .or_insert_with(|| defaults.clone())
    }
}

/// In-memory [`ControlPort`] modelled on a UVC webcam.
pub struct SimulatedControls {
    catalog: ControlCatalog,
    state: Mutex<SimulatedState>,
}

impl Default for SimulatedControls {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedControls {
    /// Every device starts in aperture-priority auto exposure with mid-range
    /// picture controls.
    #[must_use]
    pub fn new() -> Self {
        let defaults = [
            ("exposure_auto", 3),
            ("exposure_absolute", 156),
            ("brightness", 128),
            ("contrast", 128),
            ("gain", 0),
            ("white_balance_temperature_auto", 1),
            ("white_balance_temperature", 4600),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_owned(), value))
        .collect();

        Self {
            catalog: ControlCatalog::default(),
            state: Mutex::new(SimulatedState {
                defaults,
                devices: BTreeMap::new(),
                failing_reads: BTreeSet::new(),
                failing_writes: BTreeSet::new(),
                locked_modes: false,
                writes: Vec::new(),
            }),
        }
    }

    /// Override the starting value of `control` on every device.
    #[must_use]
    pub fn with_value(self, control: &str, value: i64) -> Self {
        self.state.lock().defaults.insert(control.to_owned(), value);
        self
    }

    /// Current value of `control` on `device`.
    pub fn value(&self, device: &Path, control: &str) -> Option<i64> {
        self.state.lock().values(device).get(control).copied()
    }

    /// Make reads of `control` fail.
    pub fn fail_reads(&self, control: &str) {
        self.state.lock().failing_reads.insert(control.to_owned());
    }

    /// Make writes of `control` fail.
    pub fn fail_writes(&self, control: &str) {
        self.state.lock().failing_writes.insert(control.to_owned());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_reads.clear();
        state.failing_writes.clear();
    }

    /// Ignore writes to auto-mode controls, like firmware that refuses to
    /// leave automatic mode.
    pub fn lock_auto_modes(&self, locked: bool) {
        self.state.lock().locked_modes = locked;
    }

    /// Every write attempted so far, in order.
    pub fn writes(&self) -> Vec<ControlWrite> {
        self.state.lock().writes.clone()
    }

    /// Mean luma a scene of brightness `scene` would produce on `device`
    /// with its current settings.
    pub fn simulated_luma(&self, device: &Path, scene: f64) -> u8 {
        let mut state = self.state.lock();
        let values = state.values(device);
        #[allow(clippy::cast_precision_loss)]
        let value = |name: &str, default: i64| values.get(name).copied().unwrap_or(default) as f64;

        let exposure = value("exposure_absolute", 156) / 156.0;
        let gain = 1.0 + value("gain", 0) / 64.0;
        let luma = (scene * exposure * gain)
            + (value("brightness", 128) - 128.0) * 0.5
            + (value("contrast", 128) - 128.0) * 0.25;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let luma = luma.round().clamp(0.0, 255.0) as u8;
        luma
    }

    fn is_mode_control(&self, control: &str) -> bool {
        self.catalog.iter().any(|(_, spec)| {
            spec.requires_manual
                .as_ref()
                .is_some_and(|mode| mode.control == control)
        })
    }
}

impl ControlPort for SimulatedControls {
    fn get(&self, device: &Path, control: &str) -> control::Result<i64> {
        let mut state = self.state.lock();
        if state.failing_reads.contains(control) {
            return Err(ControlError::ControlReadFailed {
                device: device.to_path_buf(),
                control: control.to_owned(),
                reason: "injected read failure".to_owned(),
            });
        }
        state
            .values(device)
            .get(control)
            .copied()
            .ok_or_else(|| ControlError::ControlReadFailed {
                device: device.to_path_buf(),
                control: control.to_owned(),
                reason: "no such control".to_owned(),
            })
    }

    fn set(&self, device: &Path, control: &str, value: i64) -> control::Result<()> {
        let is_mode = self.is_mode_control(control);
        let required_mode = self
            .catalog
            .get(control)
            .and_then(|spec| spec.requires_manual.clone());

        let mut state = self.state.lock();
        let write_error = |reason: &str| ControlError::ControlWriteFailed {
            device: device.to_path_buf(),
            control: control.to_owned(),
            value,
            reason: reason.to_owned(),
        };
        if state.failing_writes.contains(control) {
            return Err(write_error("injected write failure"));
        }

        let locked = state.locked_modes;
        let values = state.values(device);
        if !values.contains_key(control) {
            return Err(write_error("no such control"));
        }

        let applied = if is_mode && locked {
            false
        } else if let Some(mode) = required_mode {
            values.get(&mode.control) == Some(&mode.value)
        } else {
            true
        };
        if applied {
            values.insert(control.to_owned(), value);
        }

        state.writes.push(ControlWrite {
            device: device.to_path_buf(),
            control: control.to_owned(),
            value,
            applied,
        });
        Ok(())
    }
}
